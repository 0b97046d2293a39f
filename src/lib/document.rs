use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    conditional::UpsertReport,
    entity::EntityKey,
    error::{Result, StoreError},
    history::{AppendReceipt, HistoryLog, HistoryRecord},
    manifest::{ManifestProjector, project},
    object_store::SharedStore,
    retry::RetryPolicy,
    snapshot::{Snapshot, SnapshotMaterializer, SnapshotUpdate},
    timestamp,
};

#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub entity: EntityKey,
    pub history: AppendReceipt,
    pub snapshot: SnapshotUpdate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<UpsertReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_error: Option<String>,
}

#[derive(Clone)]
pub struct DocumentStore {
    history: HistoryLog,
    snapshots: SnapshotMaterializer,
    manifests: ManifestProjector,
}

impl DocumentStore {
    pub fn new(store: SharedStore, retry: RetryPolicy) -> Self {
        Self {
            history: HistoryLog::new(store.clone(), retry),
            snapshots: SnapshotMaterializer::new(store.clone(), retry),
            manifests: ManifestProjector::new(store, retry),
        }
    }

    /// Write path for one entity: history, then snapshot, then manifest.
    ///
    /// Records `payload` in history and, when it is newer than the stored
    /// snapshot, makes it current and refreshes the manifest. A failed
    /// manifest write is reported but does not fail the call; the next
    /// accepted write repairs it.
    pub async fn write(&self, key: &EntityKey, payload: &Value) -> Result<WriteOutcome> {
        // Nothing reaches history for a payload the snapshot would reject.
        if !payload.is_object() {
            return Err(StoreError::InvalidPayload(
                "payload must be a JSON object".into(),
            ));
        }
        timestamp::updated_at(payload)?;

        let history = self.history.append(key, payload).await?;
        let snapshot = self.snapshots.update(key, payload).await?;

        let mut outcome = WriteOutcome {
            entity: key.clone(),
            history,
            snapshot,
            manifest: None,
            manifest_error: None,
        };
        let Some(current) = outcome.snapshot.snapshot.as_ref() else {
            return Ok(outcome);
        };

        let manifest = project(current);
        match self.manifests.persist(key, &manifest).await {
            Ok(report) => outcome.manifest = Some(report),
            Err(err) => {
                warn!(entity = %key, error = %err, "manifest update failed");
                outcome.manifest_error = Some(err.to_string());
            }
        }
        info!(
            entity = %key,
            accepted = outcome.snapshot.accepted(),
            write_key = %outcome.history.write_key,
            "document written"
        );
        Ok(outcome)
    }

    pub async fn get(&self, key: &EntityKey) -> Result<Option<Snapshot>> {
        self.snapshots.read(key).await
    }

    pub async fn history(&self, key: &EntityKey) -> Result<Vec<HistoryRecord>> {
        self.history.read(key).await
    }
}
