//! Cleanup of server-side objects when a Database is deleted
//!
//! Deletion does not go through the work queue: by the time a worker could
//! look the key up the object is gone from the cache, so the handler works
//! from the last snapshot carried by the delete notification. Nothing is
//! retried; a failed drop is logged and left for an administrator.

use crate::crd::Database;
use crate::postgres::{execute_best_effort, BestEffortReport, SqlExecutor, Statement};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Drops the database and role owned by a deleted Database
#[derive(Clone)]
pub struct DeletionHandler {
    executor: Arc<dyn SqlExecutor>,
}

impl DeletionHandler {
    pub fn new(executor: Arc<dyn SqlExecutor>) -> Self {
        Self { executor }
    }

    /// Drop the database first, then the role that owned it
    ///
    /// Both drops are attempted independently. The report lists whichever
    /// failed.
    #[instrument(skip(self, db), fields(name = %db.name_any(), namespace = db.namespace()))]
    pub async fn handle(&self, db: &Database) -> BestEffortReport {
        let spec = &db.spec;
        info!(username = %spec.username, database = %spec.database, "Deleting database");

        let report = execute_best_effort(
            self.executor.as_ref(),
            vec![
                Statement::DropDatabase {
                    database: spec.database.clone(),
                },
                Statement::DropRole {
                    username: spec.username.clone(),
                },
            ],
        )
        .await;

        if report.is_success() {
            info!(database = %spec.database, "Database deleted");
        } else {
            warn!(errors = %report.message(), "Database cleanup incomplete");
        }
        report
    }
}
