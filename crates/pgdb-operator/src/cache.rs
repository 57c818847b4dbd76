//! Local read view of Database resources
//!
//! The cache is a reflector store kept in sync by a watch on the API server.
//! Besides point lookups it turns raw watch events into the notifications the
//! controller consumes: `Added`, `Updated { old, new }` and `Deleted` carrying
//! the last snapshot (the object is already gone from the store by the time a
//! worker could look it up).

use crate::crd::Database;
use crate::key::ObjectKey;
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Change notification for a Database
#[derive(Debug, Clone)]
pub enum Notification {
    Added(Arc<Database>),
    Updated {
        old: Arc<Database>,
        new: Arc<Database>,
    },
    /// Last known state of a resource that no longer exists
    Deleted(Arc<Database>),
}

/// Read side of the cache as seen by the reconciler
#[async_trait]
pub trait ResourceCache: Send + Sync {
    /// Current snapshot for `key`, if the resource exists
    fn lookup(&self, key: &ObjectKey) -> Option<Arc<Database>>;

    /// Resolve once the first full list has been applied; `false` if it never will be
    async fn wait_for_initial_sync(&self) -> bool;
}

/// [`ResourceCache`] backed by a `kube` reflector store
#[derive(Clone)]
pub struct KubeResourceCache {
    store: Store<Database>,
}

impl KubeResourceCache {
    /// Start watching `api`
    ///
    /// Returns the cache, the notification stream and the handle of the task
    /// driving the watch. The task ends when the receiver is dropped.
    pub fn start(
        api: Api<Database>,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>, JoinHandle<()>) {
        let (store, writer) = reflector::store();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_watch(api, writer, store.clone(), tx));
        (Self { store }, rx, handle)
    }
}

#[async_trait]
impl ResourceCache for KubeResourceCache {
    fn lookup(&self, key: &ObjectKey) -> Option<Arc<Database>> {
        let mut obj_ref = ObjectRef::new(&key.name);
        if !key.namespace.is_empty() {
            obj_ref = obj_ref.within(&key.namespace);
        }
        self.store.get(&obj_ref)
    }

    async fn wait_for_initial_sync(&self) -> bool {
        self.store.wait_until_ready().await.is_ok()
    }
}

async fn run_watch(
    api: Api<Database>,
    mut writer: Writer<Database>,
    store: Store<Database>,
    tx: mpsc::UnboundedSender<Notification>,
) {
    info!("Starting Database watch");

    let mut stream = database_watch(api).boxed();
    let mut relist = RelistTracker::default();

    while let Some(result) = stream.next().await {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Database watch error");
                continue;
            }
        };

        let notifications = relist.translate(&store, &event);
        writer.apply_watcher_event(&event);

        for notification in notifications {
            if tx.send(notification).is_err() {
                debug!("Notification receiver dropped, stopping watch");
                return;
            }
        }
    }
}

fn database_watch(api: Api<Database>) -> impl futures::Stream<Item = watcher::Result<Event<Database>>> {
    watcher::watcher(api, watcher::Config::default()).default_backoff()
}

/// Turns watch events into notifications
///
/// A (re-)list is delivered as `Init`, `InitApply`*, `InitDone`. Objects that
/// were in the store before `Init` but are absent from the new list were
/// deleted while the watch was down; they are reported as `Deleted` with the
/// snapshot the store still held.
#[derive(Default)]
struct RelistTracker {
    before: Option<HashMap<ObjectRef<Database>, Arc<Database>>>,
    seen: HashSet<ObjectRef<Database>>,
}

impl RelistTracker {
    fn translate(&mut self, store: &Store<Database>, event: &Event<Database>) -> Vec<Notification> {
        match event {
            Event::Init => {
                self.before = Some(
                    store
                        .state()
                        .into_iter()
                        .map(|obj| (ObjectRef::from_obj(obj.as_ref()), obj))
                        .collect(),
                );
                self.seen.clear();
                vec![]
            }
            Event::InitApply(obj) => {
                let obj_ref = ObjectRef::from_obj(obj);
                self.seen.insert(obj_ref.clone());
                vec![applied(store.get(&obj_ref), obj)]
            }
            Event::InitDone => {
                let before = self.before.take().unwrap_or_default();
                let seen = std::mem::take(&mut self.seen);
                before
                    .into_iter()
                    .filter(|(obj_ref, _)| !seen.contains(obj_ref))
                    .map(|(_, obj)| Notification::Deleted(obj))
                    .collect()
            }
            Event::Apply(obj) => {
                let obj_ref = ObjectRef::from_obj(obj);
                vec![applied(store.get(&obj_ref), obj)]
            }
            Event::Delete(obj) => vec![Notification::Deleted(Arc::new(obj.clone()))],
        }
    }
}

fn applied(old: Option<Arc<Database>>, new: &Database) -> Notification {
    let new = Arc::new(new.clone());
    match old {
        Some(old) => Notification::Updated { old, new },
        None => Notification::Added(new),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_database;

    fn ready_store(objects: &[Database]) -> (Store<Database>, Writer<Database>) {
        let (store, mut writer) = reflector::store();
        writer.apply_watcher_event(&Event::Init);
        for obj in objects {
            writer.apply_watcher_event(&Event::InitApply(obj.clone()));
        }
        writer.apply_watcher_event(&Event::InitDone);
        (store, writer)
    }

    #[test]
    fn test_apply_new_object_is_added() {
        let (store, _writer) = ready_store(&[]);
        let mut tracker = RelistTracker::default();

        let out = tracker.translate(&store, &Event::Apply(test_database("default", "app1")));
        assert!(matches!(out.as_slice(), [Notification::Added(db)] if db.spec.database == "app1_db"));
    }

    #[test]
    fn test_apply_known_object_is_updated() {
        let original = test_database("default", "app1");
        let (store, _writer) = ready_store(&[original.clone()]);
        let mut tracker = RelistTracker::default();

        let mut changed = original;
        changed.spec.password = "rotated".to_string();
        let out = tracker.translate(&store, &Event::Apply(changed));

        match out.as_slice() {
            [Notification::Updated { old, new }] => {
                assert_eq!(old.spec.password, "x");
                assert_eq!(new.spec.password, "rotated");
            }
            other => panic!("unexpected notifications: {other:?}"),
        }
    }

    #[test]
    fn test_delete_carries_snapshot() {
        let db = test_database("default", "app1");
        let (store, _writer) = ready_store(&[db.clone()]);
        let mut tracker = RelistTracker::default();

        let out = tracker.translate(&store, &Event::Delete(db));
        assert!(matches!(out.as_slice(), [Notification::Deleted(d)] if d.spec.username == "app1_owner"));
    }

    #[test]
    fn test_relist_reports_missed_deletions() {
        let kept = test_database("default", "kept");
        let gone = test_database("default", "gone");
        let (store, mut writer) = ready_store(&[kept.clone(), gone]);
        let mut tracker = RelistTracker::default();

        let mut deleted = vec![];
        for event in [Event::Init, Event::InitApply(kept), Event::InitDone] {
            let out = tracker.translate(&store, &event);
            writer.apply_watcher_event(&event);
            for n in out {
                if let Notification::Deleted(db) = n {
                    deleted.push(db.metadata.name.clone().unwrap());
                }
            }
        }

        assert_eq!(deleted, vec!["gone".to_string()]);
        assert!(store
            .get(&ObjectRef::new("gone").within("default"))
            .is_none());
    }

    #[test]
    fn test_lookup_by_key() {
        let (store, _writer) = ready_store(&[test_database("default", "app1")]);
        let cache = KubeResourceCache { store };

        assert!(cache.lookup(&ObjectKey::new("default", "app1")).is_some());
        assert!(cache.lookup(&ObjectKey::new("other", "app1")).is_none());
    }

    #[tokio::test]
    async fn test_initial_sync() {
        let (store, _writer) = ready_store(&[]);
        let cache = KubeResourceCache { store };
        assert!(cache.wait_for_initial_sync().await);
    }
}
