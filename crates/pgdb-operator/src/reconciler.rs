//! Database reconciliation
//!
//! Given the identity of a Database, the reconciler reads the current snapshot
//! from the cache and drives the target server toward it:
//!
//! ```text
//! unprovisioned ──provision ok──▶ provisioned ──▶ (no-op)
//!       │
//!       └──────provision failed──▶ error ──▶ (no-op, or retry per policy)
//! ```
//!
//! The provisioning statements are not idempotent; re-running them against a
//! provisioned server fails. `status.state` is what keeps a provisioned
//! Database from being provisioned twice.

use crate::cache::ResourceCache;
use crate::crd::{Database, DatabaseState};
use crate::error::{OperatorError, Result};
use crate::events::{EventSink, SyncEvent, MESSAGE_SYNCED};
use crate::key::ObjectKey;
use crate::postgres::{execute_best_effort, SqlExecutor, Statement};
use crate::status::{report_status, StatusWriter};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Status message written after a successful provisioning run
pub const MESSAGE_PROVISIONED: &str = "successful";

/// What to do with a Database whose last provisioning attempt failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorStatePolicy {
    /// Leave it alone until its status is reset
    #[default]
    Hold,
    /// Provision again on the next reconciliation
    Retry,
}

impl FromStr for ErrorStatePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hold" => Ok(Self::Hold),
            "retry" => Ok(Self::Retry),
            other => Err(format!("unknown error policy '{}', expected hold or retry", other)),
        }
    }
}

impl fmt::Display for ErrorStatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hold => write!(f, "hold"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

/// Result of a reconciliation that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The resource was deleted after it was queued
    Gone,
    /// Already provisioned; nothing to do
    AlreadyProvisioned,
    /// Left in error state by [`ErrorStatePolicy::Hold`]
    HeldInError,
    /// Role and database created
    Provisioned,
}

/// Drives one Database at a time toward its declared state
pub struct Reconciler {
    cache: Arc<dyn ResourceCache>,
    executor: Arc<dyn SqlExecutor>,
    status: Arc<dyn StatusWriter>,
    events: Arc<dyn EventSink>,
    error_policy: ErrorStatePolicy,
}

impl Reconciler {
    pub fn new(
        cache: Arc<dyn ResourceCache>,
        executor: Arc<dyn SqlExecutor>,
        status: Arc<dyn StatusWriter>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            cache,
            executor,
            status,
            events,
            error_policy: ErrorStatePolicy::default(),
        }
    }

    pub fn with_error_policy(mut self, policy: ErrorStatePolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Reconcile the Database identified by `key`
    #[instrument(skip(self), fields(key = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let Some(db) = self.cache.lookup(key) else {
            debug!("Database in work queue no longer exists");
            return Ok(ReconcileOutcome::Gone);
        };

        let result = match db.state() {
            DatabaseState::Provisioned => {
                debug!(
                    username = %db.spec.username,
                    database = %db.spec.database,
                    "Already provisioned"
                );
                Ok(ReconcileOutcome::AlreadyProvisioned)
            }
            DatabaseState::Error if self.error_policy == ErrorStatePolicy::Hold => {
                debug!(error = %db.status_message(), "Holding database in error state");
                Ok(ReconcileOutcome::HeldInError)
            }
            DatabaseState::Error | DatabaseState::Unprovisioned => {
                match self.provision(&db).await {
                    Err(e) if e.is_not_found() => {
                        debug!("Database deleted during provisioning");
                        return Ok(ReconcileOutcome::Gone);
                    }
                    other => other,
                }
            }
        };

        let event = match &result {
            Ok(_) => SyncEvent::synced(MESSAGE_SYNCED),
            Err(e) => SyncEvent::failed(format!("Failed to sync database: {}", e)),
        };
        self.events.publish(&db, event).await;

        result
    }

    async fn provision(&self, db: &Database) -> Result<ReconcileOutcome> {
        let spec = &db.spec;
        info!(username = %spec.username, database = %spec.database, "Provisioning database");

        if let Err(message) = db.validate_spec() {
            warn!(errors = %message, "Database spec validation failed");
            report_status(self.status.as_ref(), db, DatabaseState::Error, &message).await?;
            return Err(OperatorError::ValidationError(message));
        }

        // Both statements run even if the first one fails.
        let report = execute_best_effort(
            self.executor.as_ref(),
            vec![
                Statement::CreateUser {
                    username: spec.username.clone(),
                    password: spec.password.clone(),
                },
                Statement::CreateDatabase {
                    database: spec.database.clone(),
                    owner: spec.username.clone(),
                },
            ],
        )
        .await;

        if !report.is_success() {
            let message = report.message();
            report_status(self.status.as_ref(), db, DatabaseState::Error, &message).await?;
            return Err(report
                .into_first_error()
                .unwrap_or_else(|| OperatorError::Internal(message)));
        }

        report_status(
            self.status.as_ref(),
            db,
            DatabaseState::Provisioned,
            MESSAGE_PROVISIONED,
        )
        .await?;
        info!(database = %spec.database, "Database provisioned");
        Ok(ReconcileOutcome::Provisioned)
    }
}
