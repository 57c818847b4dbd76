//! Status reporting
//!
//! Objects handed out by the resource cache are shared snapshots and must
//! never be modified. A status change is written by cloning the snapshot,
//! replacing its status and submitting the whole object. A full `replace`
//! is used instead of the status subresource so the operator works against
//! CRDs installed without `subresources.status`; the object's
//! resourceVersion rides along, so a concurrent edit fails with a conflict
//! instead of being overwritten.

use crate::crd::{Database, DatabaseState, DatabaseStatus};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

/// Writes a Database back to the declarative store
#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Full-object update of `db`
    async fn update(&self, db: &Database) -> Result<()>;
}

/// Write `state`/`message` for `snapshot` without touching the snapshot itself
///
/// Returns the object that was submitted. Store errors (including a stale
/// resourceVersion conflict) are returned unchanged.
pub async fn report_status(
    writer: &dyn StatusWriter,
    snapshot: &Database,
    state: DatabaseState,
    message: impl Into<String>,
) -> Result<Database> {
    let updated = snapshot.with_status(DatabaseStatus::new(state, message));
    debug!(
        name = %snapshot.name_any(),
        namespace = snapshot.namespace().as_deref().unwrap_or(""),
        state = %state,
        "Updating database status"
    );
    writer.update(&updated).await?;
    Ok(updated)
}

/// [`StatusWriter`] that replaces the object through the Kubernetes API
#[derive(Clone)]
pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn update(&self, db: &Database) -> Result<()> {
        let namespace = db
            .namespace()
            .ok_or_else(|| OperatorError::Internal("Database missing metadata.namespace".into()))?;
        let api: Api<Database> = Api::namespaced(self.client.clone(), &namespace);

        api.replace(&db.name_any(), &PostParams::default(), db)
            .await
            .map_err(OperatorError::from)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_database, RecordingStatusWriter};

    #[tokio::test]
    async fn test_report_status_copies_snapshot() {
        let writer = RecordingStatusWriter::default();
        let snapshot = test_database("default", "app1");

        let written = report_status(&writer, &snapshot, DatabaseState::Provisioned, "successful")
            .await
            .unwrap();

        assert!(snapshot.status.is_none(), "snapshot must not be mutated");
        assert_eq!(written.state(), DatabaseState::Provisioned);
        assert_eq!(written.spec.username, snapshot.spec.username);

        let updates = writer.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates[0].status,
            Some(DatabaseStatus::new(DatabaseState::Provisioned, "successful"))
        );
    }

    #[tokio::test]
    async fn test_report_status_returns_store_error() {
        let writer = RecordingStatusWriter::failing_with_conflict();
        let snapshot = test_database("default", "app1");

        let err = report_status(&writer, &snapshot, DatabaseState::Error, "boom")
            .await
            .unwrap_err();

        assert!(err.is_conflict());
    }
}
