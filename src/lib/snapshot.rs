use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::{
    conditional::{UpsertReport, upsert_newer},
    entity::EntityKey,
    error::{Result, StoreError},
    object_store::{SharedStore, read_json},
    observability, paths,
    retry::RetryPolicy,
    timestamp::{self, parse_timestamp},
};

/// Current state of one entity: the last accepted payload with `id`,
/// `created_at` and `updated_at` always present.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub key: EntityKey,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub document: Map<String, Value>,
}

impl Snapshot {
    pub fn from_document(key: EntityKey, document: Value) -> Result<Self> {
        let updated_at = timestamp::updated_at(&document)?;
        let Value::Object(document) = document else {
            return Err(StoreError::InvalidPayload(
                "snapshot must be a JSON object".into(),
            ));
        };
        let created_at = document
            .get("created_at")
            .and_then(parse_timestamp)
            .unwrap_or(updated_at);
        Ok(Self {
            key,
            created_at,
            updated_at,
            document,
        })
    }

    /// Resolves a dotted path such as `metrics.score`.
    pub fn field(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.document.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.document.clone())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotUpdate {
    #[serde(flatten)]
    pub report: UpsertReport,
    #[serde(skip)]
    pub snapshot: Option<Snapshot>,
}

impl SnapshotUpdate {
    pub fn accepted(&self) -> bool {
        self.report.written()
    }
}

#[derive(Clone)]
pub struct SnapshotMaterializer {
    store: SharedStore,
    retry: RetryPolicy,
}

impl SnapshotMaterializer {
    pub fn new(store: SharedStore, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Applies `payload` as the new current state unless the stored snapshot
    /// is at least as new.
    pub async fn update(&self, key: &EntityKey, payload: &Value) -> Result<SnapshotUpdate> {
        if !payload.is_object() {
            return Err(StoreError::InvalidPayload(
                "payload must be a JSON object".into(),
            ));
        }
        let updated_at = timestamp::updated_at(payload)?;
        let path = paths::snapshot_path(key);

        let report = upsert_newer(
            self.store.as_ref(),
            &self.retry,
            &path,
            updated_at,
            |existing| Ok(render_snapshot(key, payload, existing)),
        )
        .await?;

        let entity = key.entity_type.as_str();
        if report.skipped {
            observability::record_snapshot_update(entity, "stale");
            debug!(entity = %key, updated_at = %updated_at, "skipped stale snapshot write");
            return Ok(SnapshotUpdate {
                report,
                snapshot: None,
            });
        }

        observability::record_snapshot_update(entity, "written");
        info!(entity = %key, updated_at = %updated_at, generation = ?report.generation, "snapshot updated");
        let snapshot = match report.document.clone() {
            Some(document) => Some(Snapshot::from_document(key.clone(), document)?),
            None => None,
        };
        Ok(SnapshotUpdate { report, snapshot })
    }

    pub async fn read(&self, key: &EntityKey) -> Result<Option<Snapshot>> {
        let path = paths::snapshot_path(key);
        match read_json::<Value>(self.store.as_ref(), &path).await? {
            Some((document, _)) => Snapshot::from_document(key.clone(), document).map(Some),
            None => Ok(None),
        }
    }
}

fn render_snapshot(key: &EntityKey, payload: &Value, existing: Option<&Value>) -> Value {
    let mut document = payload.as_object().cloned().unwrap_or_default();
    document.insert("id".into(), Value::String(key.id.clone()));

    let carried = existing
        .and_then(|current| current.get("created_at"))
        .filter(|value| parse_timestamp(value).is_some())
        .cloned();
    let created_at = carried
        .or_else(|| {
            document
                .get("created_at")
                .filter(|value| parse_timestamp(value).is_some())
                .cloned()
        })
        .or_else(|| document.get("updated_at").cloned());
    if let Some(created_at) = created_at {
        document.insert("created_at".into(), created_at);
    }
    Value::Object(document)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{
        entity::{EntityType, Env},
        object_store::MemoryStore,
    };

    fn materializer() -> SnapshotMaterializer {
        SnapshotMaterializer::new(Arc::new(MemoryStore::new()), RetryPolicy::immediate(3))
    }

    fn key() -> EntityKey {
        EntityKey::new(Env::Dev, EntityType::Idea, "I1").unwrap()
    }

    #[tokio::test]
    async fn older_write_after_newer_is_skipped() {
        let snapshots = materializer();
        let newer = json!({ "status": "Approved", "updated_at": "2025-01-02T00:00:00Z" });
        let older = json!({ "status": "New", "updated_at": "2025-01-01T00:00:00Z" });

        assert!(snapshots.update(&key(), &newer).await.unwrap().accepted());
        let stale = snapshots.update(&key(), &older).await.unwrap();
        assert!(stale.report.skipped);
        assert_eq!(
            serde_json::to_value(&stale).unwrap(),
            json!({
                "path": "env/dev/snapshots/ideas/I1.json",
                "skipped": true,
                "reason": "stale"
            })
        );

        let current = snapshots.read(&key()).await.unwrap().unwrap();
        assert_eq!(current.document["status"], "Approved");
    }

    #[tokio::test]
    async fn any_delivery_order_converges_on_the_latest_payload() {
        let writes: Vec<Value> = (1..=5)
            .map(|day| json!({ "day": day, "updated_at": format!("2025-01-0{day}T00:00:00Z") }))
            .collect();
        let orders = [[0, 1, 2, 3, 4], [4, 3, 2, 1, 0], [2, 4, 0, 3, 1], [1, 1, 4, 4, 0]];
        for order in orders {
            let snapshots = materializer();
            for index in order {
                snapshots.update(&key(), &writes[index]).await.unwrap();
            }
            let current = snapshots.read(&key()).await.unwrap().unwrap();
            let max = order.iter().max().copied().unwrap();
            assert_eq!(current.document["day"], writes[max]["day"]);
            assert_eq!(current.document["updated_at"], writes[max]["updated_at"]);
        }
    }

    #[tokio::test]
    async fn created_at_is_carried_over() {
        let snapshots = materializer();
        snapshots
            .update(&key(), &json!({ "updated_at": "2025-01-01T00:00:00Z" }))
            .await
            .unwrap();
        snapshots
            .update(
                &key(),
                &json!({ "created_at": "2030-01-01T00:00:00Z", "updated_at": "2025-01-02T00:00:00Z" }),
            )
            .await
            .unwrap();

        let current = snapshots.read(&key()).await.unwrap().unwrap();
        assert_eq!(current.document["created_at"], "2025-01-01T00:00:00Z");
        assert_eq!(current.document["id"], "I1");
        assert_eq!(current.created_at, "2025-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[tokio::test]
    async fn payloads_without_timestamps_are_rejected() {
        let snapshots = materializer();
        let err = snapshots
            .update(&key(), &json!({ "status": "New" }))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPayload(_)));

        let err = snapshots.update(&key(), &json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidPayload(_)));
    }

    #[test]
    fn resolves_dotted_fields() {
        let snapshot = Snapshot::from_document(
            key(),
            json!({
                "updated_at": "2025-01-01T00:00:00Z",
                "metrics": { "score": 7.5, "history": [1, 2] }
            }),
        )
        .unwrap();
        assert_eq!(snapshot.field("metrics.score"), Some(&json!(7.5)));
        assert_eq!(snapshot.field("metrics.history.1"), Some(&json!(2)));
        assert_eq!(snapshot.field("metrics.missing"), None);
    }
}
