//! Kubernetes Events for reconciliation outcomes

use crate::crd::Database;
use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use tracing::warn;

/// Event reason for every terminal reconciliation outcome
pub const REASON_SYNCED: &str = "Synced";

/// Name the operator reports events under
pub const CONTROLLER_NAME: &str = "pgdb-operator";

/// Message used when a Database is synced successfully
pub const MESSAGE_SYNCED: &str = "Database synced successfully";

/// Severity of a [`SyncEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEventType {
    Normal,
    Warning,
}

/// Outcome notification attached to a Database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub event_type: SyncEventType,
    pub reason: String,
    pub message: String,
}

impl SyncEvent {
    pub fn synced(message: impl Into<String>) -> Self {
        Self {
            event_type: SyncEventType::Normal,
            reason: REASON_SYNCED.to_string(),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            event_type: SyncEventType::Warning,
            reason: REASON_SYNCED.to_string(),
            message: message.into(),
        }
    }
}

/// Audit sink for reconciliation outcomes
///
/// Publishing is fire-and-forget: a sink failure never fails a reconciliation.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, db: &Database, event: SyncEvent);
}

/// [`EventSink`] that records `events.k8s.io` Events
#[derive(Clone)]
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, db: &Database, event: SyncEvent) {
        let ev = Event {
            type_: match event.event_type {
                SyncEventType::Normal => EventType::Normal,
                SyncEventType::Warning => EventType::Warning,
            },
            reason: event.reason,
            note: Some(event.message),
            action: "Reconcile".to_string(),
            secondary: None,
        };

        if let Err(e) = self.recorder.publish(&ev, &db.object_ref(&())).await {
            warn!(name = %db.name_any(), error = %e, "Failed to publish event");
        }
    }
}
