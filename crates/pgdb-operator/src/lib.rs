//! # PostgreSQL Database Operator
//!
//! Kubernetes operator that turns `Database` custom resources into a role and
//! a database on one target PostgreSQL server.
//!
//! Each `Database` names a role, its password and a database. When the
//! resource appears the operator creates the role and a database owned by it,
//! then records the outcome in the resource's status. When the resource is
//! deleted the database and the role are dropped.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pgdb_operator::prelude::*;
//! use kube::{Api, Client};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     let executor = Arc::new(PgExecutor::connect("postgres://postgres@localhost/postgres", 16)?);
//!
//!     let (cache, notifications, _watch) = KubeResourceCache::start(Api::all(client.clone()));
//!     let controller = Controller::new(
//!         Arc::new(cache),
//!         executor,
//!         Arc::new(KubeStatusWriter::new(client.clone())),
//!         Arc::new(KubeEventSink::new(client)),
//!         &ControllerConfig::default(),
//!     );
//!
//!     controller
//!         .run(2, notifications, async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```
//!
//! ## Architecture
//!
//! The operator follows the level-triggered controller pattern:
//!
//! 1. **Watch**: a reflector keeps a local cache of `Database` resources and
//!    emits added/updated/deleted notifications
//! 2. **Queue**: added and updated resources are queued by identity; repeated
//!    changes collapse into one entry and one identity is never processed by
//!    two workers at once
//! 3. **Reconcile**: workers read the latest cached state and provision
//!    anything not yet provisioned
//! 4. **Status**: the outcome is written back to the resource and announced
//!    with a `Synced` event
//!
//! Failed reconciliations are requeued with per-item exponential backoff.
//! Deletions skip the queue and drop the database and role directly.
//!
//! ## Modules
//!
//! - [`crd`] - `Database` Custom Resource Definition with validation
//! - [`cache`] - Reflector-backed cache and change notifications
//! - [`workqueue`] - Deduplicating work queue
//! - [`rate_limiter`] - Requeue backoff policies
//! - [`controller`] - Worker pool and lifecycle
//! - [`reconciler`] - Provisioning state machine
//! - [`status`] - Copy-on-write status updates
//! - [`deletion`] - Cleanup on delete
//! - [`postgres`] - Statements and the pooled executor
//! - [`events`] - Kubernetes Events for outcomes
//! - [`error`] - Error types for operator operations
//!
//! ## Custom Resource Definition
//!
//! ```yaml
//! apiVersion: postgresql.org/v1
//! kind: Database
//! metadata:
//!   name: app1
//!   namespace: default
//! spec:
//!   username: app1_owner
//!   password: s3cret
//!   database: app1_db
//! ```
//!
//! After a successful run the status reads
//! `{state: provisioned, message: successful}`. A failed run records
//! `state: error` with the server's messages; such resources are left alone
//! unless the controller runs with [`ErrorStatePolicy::Retry`](reconciler::ErrorStatePolicy).
//!
//! ## Metrics
//!
//! The operator exposes Prometheus metrics:
//!
//! - `pgdb_operator_reconciliations_total` - Total reconciliation attempts
//! - `pgdb_operator_reconciliation_errors_total` - Reconciliation errors
//! - `pgdb_operator_reconciliation_duration_seconds` - Reconciliation latency
//! - `pgdb_operator_deletions_total` - Deletions handled
//! - `pgdb_operator_deletion_errors_total` - Deletions with a failed drop

pub mod cache;
pub mod controller;
pub mod crd;
pub mod deletion;
pub mod error;
pub mod events;
pub mod key;
pub mod postgres;
pub mod rate_limiter;
pub mod reconciler;
pub mod status;
pub mod workqueue;

#[cfg(test)]
mod testing;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::cache::{KubeResourceCache, Notification, ResourceCache};
    pub use crate::controller::{Controller, ControllerConfig, ControllerMetrics};
    pub use crate::crd::{Database, DatabaseSpec, DatabaseState, DatabaseStatus};
    pub use crate::deletion::DeletionHandler;
    pub use crate::error::{OperatorError, Result};
    pub use crate::events::{EventSink, KubeEventSink, SyncEvent, SyncEventType};
    pub use crate::key::ObjectKey;
    pub use crate::postgres::{PgExecutor, SqlExecutor, Statement};
    pub use crate::rate_limiter::{RateLimitConfig, RateLimiter};
    pub use crate::reconciler::{ErrorStatePolicy, ReconcileOutcome, Reconciler};
    pub use crate::status::{KubeStatusWriter, StatusWriter};
    pub use crate::workqueue::WorkQueue;
}
