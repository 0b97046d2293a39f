use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    conditional::upsert_newer,
    entity::{EntityKey, EntityType, Env},
    error::Result,
    events::ChangeNotification,
    object_store::SharedStore,
    observability, paths,
    retry::RetryPolicy,
    snapshot::{Snapshot, SnapshotMaterializer},
};

use super::planner::{Plan, plan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexOutcome {
    Indexed,
    Ignored,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub outcome: IndexOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub written: Vec<String>,
    pub stale: Vec<String>,
    pub deleted: Vec<String>,
    /// Times the plan was rebuilt because the snapshot advanced mid-run.
    pub replans: u32,
}

impl IndexReport {
    fn empty(outcome: IndexOutcome, entity: Option<EntityKey>, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            entity,
            reason: Some(reason.into()),
            written: Vec::new(),
            stale: Vec::new(),
            deleted: Vec::new(),
            replans: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReindexSummary {
    pub processed: usize,
    pub written: usize,
    pub deleted: usize,
    pub failed: Vec<String>,
}

/// Keeps index pointers in line with the current snapshots.
///
/// Every run derives its work from the snapshot as currently stored, never
/// from the event, so replays and out-of-order deliveries converge.
#[derive(Clone)]
pub struct IndexWriter {
    store: SharedStore,
    retry: RetryPolicy,
    snapshots: SnapshotMaterializer,
}

impl IndexWriter {
    pub fn new(store: SharedStore, retry: RetryPolicy) -> Self {
        let snapshots = SnapshotMaterializer::new(store.clone(), retry);
        Self {
            store,
            retry,
            snapshots,
        }
    }

    pub async fn handle(&self, notification: &ChangeNotification) -> Result<IndexReport> {
        if let Some(expected) = self.store.bucket() {
            if !notification.bucket.is_empty() && notification.bucket != expected {
                debug!(bucket = %notification.bucket, "ignoring change in another bucket");
                return Ok(IndexReport::empty(
                    IndexOutcome::Ignored,
                    None,
                    "foreign_bucket",
                ));
            }
        }
        let Some(key) = paths::parse_snapshot_path(&notification.name) else {
            debug!(object = %notification.name, "ignoring non-snapshot object");
            return Ok(IndexReport::empty(
                IndexOutcome::Ignored,
                None,
                "not_a_snapshot",
            ));
        };
        self.reindex(&key).await
    }

    pub async fn reindex(&self, key: &EntityKey) -> Result<IndexReport> {
        let mut snapshot = match self.snapshots.read(key).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(entity = %key, "snapshot no longer exists");
                return Ok(IndexReport::empty(
                    IndexOutcome::Skipped,
                    Some(key.clone()),
                    "snapshot_missing",
                ));
            }
            Err(err) => {
                warn!(entity = %key, error = %err, "failed to read snapshot for indexing");
                return Ok(IndexReport::empty(
                    IndexOutcome::Skipped,
                    Some(key.clone()),
                    "snapshot_unreadable",
                ));
            }
        };

        let mut report = IndexReport {
            outcome: IndexOutcome::Indexed,
            entity: Some(key.clone()),
            reason: None,
            written: Vec::new(),
            stale: Vec::new(),
            deleted: Vec::new(),
            replans: 0,
        };

        for attempt in self.retry.attempts() {
            let current = plan(&snapshot);
            self.upsert_pointers(&snapshot, &current, &mut report).await?;

            // A newer snapshot may have landed while pointers were written;
            // sweeping with this plan's keep-set could remove its pointers.
            match self.snapshots.read(key).await? {
                Some(latest) if latest.updated_at > snapshot.updated_at => {
                    debug!(entity = %key, attempt, "snapshot advanced during indexing; re-planning");
                    report.replans += 1;
                    snapshot = latest;
                    continue;
                }
                _ => {}
            }

            report.deleted = self.sweep(&current).await?;
            info!(
                entity = %key,
                written = report.written.len(),
                stale = report.stale.len(),
                deleted = report.deleted.len(),
                "index pointers reconciled"
            );
            return Ok(report);
        }

        warn!(entity = %key, "snapshot kept advancing; leaving the sweep to the next event");
        report.reason = Some("snapshot_advancing".into());
        Ok(report)
    }

    async fn upsert_pointers(
        &self,
        snapshot: &Snapshot,
        plan: &Plan,
        report: &mut IndexReport,
    ) -> Result<()> {
        for entry in &plan.entries {
            let pointer = serde_json::to_value(&entry.pointer)?;
            let outcome = upsert_newer(
                self.store.as_ref(),
                &self.retry,
                &entry.path,
                snapshot.updated_at,
                |_| Ok(pointer.clone()),
            )
            .await?;
            if outcome.skipped {
                observability::record_index_pointer(&entry.pointer.dimension, "stale");
                report.stale.push(entry.path.clone());
            } else {
                observability::record_index_pointer(&entry.pointer.dimension, "written");
                report.written.push(entry.path.clone());
            }
        }
        Ok(())
    }

    /// Deletes pointers for the planned id that sit under a swept prefix but
    /// outside the keep-set.
    async fn sweep(&self, plan: &Plan) -> Result<Vec<String>> {
        let keep = plan.keep_set();
        let mut deleted = Vec::new();
        for cleanup in plan.cleanups() {
            for object in self.store.list(&cleanup.prefix).await? {
                let Some((_, id)) = paths::split_pointer_name(&object.name, &cleanup.prefix) else {
                    continue;
                };
                if id != cleanup.id || keep.contains(&object.name) {
                    continue;
                }
                if self.store.delete(&object.name).await? {
                    observability::record_index_pointer(cleanup.dimension, "deleted");
                    debug!(path = %object.name, "removed superseded index pointer");
                    deleted.push(object.name);
                }
            }
        }
        Ok(deleted)
    }

    /// Re-runs indexing for every snapshot of an entity type.
    pub async fn reindex_all(&self, env: Env, entity_type: EntityType) -> Result<ReindexSummary> {
        let prefix = paths::snapshot_prefix(env, entity_type);
        let mut summary = ReindexSummary::default();
        for object in self.store.list(&prefix).await? {
            let Some(key) = paths::parse_snapshot_path(&object.name) else {
                continue;
            };
            summary.processed += 1;
            match self.reindex(&key).await {
                Ok(report) => {
                    summary.written += report.written.len();
                    summary.deleted += report.deleted.len();
                }
                Err(err) => {
                    warn!(entity = %key, error = %err, "reindex failed");
                    summary.failed.push(key.id.clone());
                }
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::object_store::{MemoryStore, ObjectStore, PutOptions};

    async fn put_snapshot(store: &MemoryStore, id: &str, document: serde_json::Value) {
        let path = format!("env/dev/snapshots/ideas/{id}.json");
        store
            .put(&path, serde_json::to_vec(&document).unwrap(), PutOptions::json(None))
            .await
            .unwrap();
    }

    fn notification(name: &str) -> ChangeNotification {
        ChangeNotification {
            bucket: String::new(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn ignores_objects_outside_the_snapshot_namespace() {
        let writer = IndexWriter::new(Arc::new(MemoryStore::new()), RetryPolicy::immediate(3));
        let report = writer
            .handle(&notification("env/dev/manifests/ideas/by-id/I1.json"))
            .await
            .unwrap();
        assert_eq!(report.outcome, IndexOutcome::Ignored);
    }

    #[tokio::test]
    async fn missing_snapshot_is_skipped() {
        let writer = IndexWriter::new(Arc::new(MemoryStore::new()), RetryPolicy::immediate(3));
        let report = writer
            .handle(&notification("env/dev/snapshots/ideas/I404.json"))
            .await
            .unwrap();
        assert_eq!(report.outcome, IndexOutcome::Skipped);
        assert_eq!(report.reason.as_deref(), Some("snapshot_missing"));
    }

    #[tokio::test]
    async fn clearing_a_field_sweeps_its_pointers() {
        let store = Arc::new(MemoryStore::new());
        let writer = IndexWriter::new(store.clone(), RetryPolicy::immediate(3));
        let event = notification("env/dev/snapshots/ideas/I1.json");

        put_snapshot(
            &store,
            "I1",
            json!({ "id": "I1", "owner": "ana", "tags": ["a", "b"], "updated_at": "2025-01-01T00:00:00Z" }),
        )
        .await;
        writer.handle(&event).await.unwrap();
        put_snapshot(
            &store,
            "I2",
            json!({ "id": "I2", "owner": "ana", "updated_at": "2025-01-01T00:00:00Z" }),
        )
        .await;
        writer
            .handle(&notification("env/dev/snapshots/ideas/I2.json"))
            .await
            .unwrap();

        put_snapshot(
            &store,
            "I1",
            json!({ "id": "I1", "tags": ["b"], "updated_at": "2025-01-02T00:00:00Z" }),
        )
        .await;
        let report = writer.handle(&event).await.unwrap();

        assert_eq!(
            report.deleted,
            vec![
                "env/dev/indices/ideas/by-owner/ana/I1.json".to_string(),
                "env/dev/indices/ideas/by-tag/a/I1.json".to_string(),
            ]
        );
        // Other ids in the swept buckets are untouched.
        assert!(
            store
                .stat("env/dev/indices/ideas/by-owner/ana/I2.json")
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            store
                .stat("env/dev/indices/ideas/by-tag/b/I1.json")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn reindex_all_walks_every_snapshot() {
        let store = Arc::new(MemoryStore::new());
        for id in ["I1", "I2", "I3"] {
            put_snapshot(
                &store,
                id,
                json!({ "id": id, "status": "New", "updated_at": "2025-01-01T00:00:00Z" }),
            )
            .await;
        }
        let writer = IndexWriter::new(store.clone(), RetryPolicy::immediate(3));
        let summary = writer.reindex_all(Env::Dev, EntityType::Idea).await.unwrap();
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.written, 3);
        assert!(summary.failed.is_empty());
        assert_eq!(
            store
                .list("env/dev/indices/ideas/by-status/new/")
                .await
                .unwrap()
                .len(),
            3
        );
    }
}
