//! In-memory fakes for the operator's external seams

use crate::cache::ResourceCache;
use crate::crd::{Database, DatabaseSpec, DatabaseState, DatabaseStatus};
use crate::error::{OperatorError, Result};
use crate::events::{EventSink, SyncEvent};
use crate::key::ObjectKey;
use crate::postgres::{SqlExecutor, Statement};
use crate::status::StatusWriter;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub fn test_database(namespace: &str, name: &str) -> Database {
    let mut db = Database::new(
        name,
        DatabaseSpec {
            username: format!("{}_owner", name),
            password: "x".to_string(),
            database: format!("{}_db", name),
        },
    );
    db.metadata.namespace = Some(namespace.to_string());
    db
}

pub fn with_state(db: Database, state: DatabaseState, message: &str) -> Database {
    db.with_status(DatabaseStatus::new(state, message))
}

pub struct FakeCache {
    objects: Mutex<HashMap<ObjectKey, Arc<Database>>>,
    synced: watch::Sender<bool>,
}

impl FakeCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            synced: watch::channel(true).0,
        })
    }

    pub fn unsynced() -> Arc<Self> {
        let cache = Self::new();
        cache.synced.send_replace(false);
        cache
    }

    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    pub fn insert(&self, db: Database) -> Arc<Database> {
        let key = ObjectKey::for_object(&db).unwrap();
        let db = Arc::new(db);
        self.objects.lock().insert(key, db.clone());
        db
    }
}

#[async_trait]
impl ResourceCache for FakeCache {
    fn lookup(&self, key: &ObjectKey) -> Option<Arc<Database>> {
        self.objects.lock().get(key).cloned()
    }

    async fn wait_for_initial_sync(&self) -> bool {
        let mut rx = self.synced.subscribe();
        let synced = rx.wait_for(|synced| *synced).await.is_ok();
        synced
    }
}

/// Records statements; fails those whose action is listed
#[derive(Default)]
pub struct RecordingExecutor {
    executed: Mutex<Vec<Statement>>,
    fail_on: Mutex<HashSet<&'static str>>,
    delay: Option<Duration>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight_same_database: AtomicUsize,
}

impl RecordingExecutor {
    pub fn failing_on(actions: &[&'static str]) -> Self {
        let executor = Self::default();
        executor.fail_on.lock().extend(actions.iter().copied());
        executor
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.executed.lock().clone()
    }

    pub fn sql(&self) -> Vec<String> {
        self.statements()
            .iter()
            .map(|s| s.to_sql().unwrap_or_else(|e| e.to_string()))
            .collect()
    }

    /// Highest number of concurrent statements seen for any one database
    pub fn max_concurrency_per_database(&self) -> usize {
        self.max_in_flight_same_database.load(Ordering::SeqCst)
    }
}

fn database_of(statement: &Statement) -> String {
    match statement {
        Statement::CreateUser { username, .. } | Statement::DropRole { username } => {
            username.trim_end_matches("_owner").to_string()
        }
        Statement::CreateDatabase { database, .. } | Statement::DropDatabase { database } => {
            database.trim_end_matches("_db").to_string()
        }
    }
}

#[async_trait]
impl SqlExecutor for RecordingExecutor {
    async fn execute(&self, statement: &Statement) -> Result<()> {
        let target = database_of(statement);
        {
            let mut in_flight = self.in_flight.lock();
            let n = in_flight.entry(target.clone()).or_insert(0);
            *n += 1;
            self.max_in_flight_same_database
                .fetch_max(*n, Ordering::SeqCst);
        }

        self.executed.lock().push(statement.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(n) = self.in_flight.lock().get_mut(&target) {
            *n -= 1;
        }

        statement.to_sql()?;
        if self.fail_on.lock().contains(statement.action()) {
            return Err(OperatorError::Postgres(format!(
                "{} \"{}\" already exists",
                match statement {
                    Statement::CreateUser { .. } | Statement::DropRole { .. } => "role",
                    _ => "database",
                },
                target
            )));
        }
        Ok(())
    }
}

/// Records status writes and mirrors them into a cache, like a watch would
#[derive(Default)]
pub struct RecordingStatusWriter {
    updates: Mutex<Vec<Database>>,
    cache: Option<Arc<FakeCache>>,
    fail_with: Option<u16>,
}

impl RecordingStatusWriter {
    pub fn with_cache(cache: Arc<FakeCache>) -> Self {
        Self {
            cache: Some(cache),
            ..Self::default()
        }
    }

    pub fn failing_with_conflict() -> Self {
        Self {
            fail_with: Some(409),
            ..Self::default()
        }
    }

    pub fn failing_with_not_found() -> Self {
        Self {
            fail_with: Some(404),
            ..Self::default()
        }
    }

    pub fn updates(&self) -> Vec<Database> {
        self.updates.lock().clone()
    }
}

pub fn api_error(code: u16) -> OperatorError {
    let (reason, message) = match code {
        409 => (
            "Conflict",
            "the object has been modified; please apply your changes to the latest version",
        ),
        404 => ("NotFound", "databases.postgresql.org not found"),
        _ => ("InternalError", "internal error"),
    };
    OperatorError::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

#[async_trait]
impl StatusWriter for RecordingStatusWriter {
    async fn update(&self, db: &Database) -> Result<()> {
        if let Some(code) = self.fail_with {
            return Err(api_error(code));
        }
        self.updates.lock().push(db.clone());
        if let Some(cache) = &self.cache {
            cache.insert(db.clone());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<(ObjectKey, SyncEvent)>>,
}

impl RecordingEventSink {
    pub fn events(&self) -> Vec<(ObjectKey, SyncEvent)> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn publish(&self, db: &Database, event: SyncEvent) {
        if let Ok(key) = ObjectKey::for_object(db) {
            self.events.lock().push((key, event));
        }
    }
}
