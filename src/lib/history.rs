use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    entity::{EntityKey, EntityType, Env},
    error::Result,
    object_store::{ObjectMeta, Precondition, SharedStore, read_json, write_json},
    paths,
    retry::RetryPolicy,
};

/// One immutable entry of an entity's write history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub env: Env,
    pub entity_type: EntityType,
    pub id: String,
    pub write_key: String,
    pub recorded_at: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppendReceipt {
    pub path: String,
    pub write_key: String,
    pub generation: i64,
}

#[derive(Clone)]
pub struct HistoryLog {
    store: SharedStore,
    retry: RetryPolicy,
}

/// Write keys sort by wall clock; the random suffix keeps concurrent writers
/// in the same microsecond apart.
pub fn next_write_key(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%dT%H%M%S%6fZ"), &suffix[..12])
}

impl HistoryLog {
    pub fn new(store: SharedStore, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Appends `payload` under a fresh write key. A create-only collision is
    /// never treated as "already recorded": the write moves to a new key.
    pub async fn append(&self, key: &EntityKey, payload: &Value) -> Result<AppendReceipt> {
        let mut last_path = paths::history_prefix(key);
        for attempt in self.retry.attempts() {
            let recorded_at = Utc::now();
            let write_key = next_write_key(recorded_at);
            let path = paths::history_path(key, &write_key);
            let record = HistoryRecord {
                env: key.env,
                entity_type: key.entity_type,
                id: key.id.clone(),
                write_key: write_key.clone(),
                recorded_at,
                payload: payload.clone(),
            };
            match write_json(
                self.store.as_ref(),
                &path,
                &record,
                Some(Precondition::DoesNotExist),
            )
            .await
            {
                Ok(meta) => {
                    debug!(entity = %key, path = %path, "appended history record");
                    return Ok(AppendReceipt {
                        path,
                        write_key,
                        generation: meta.generation,
                    });
                }
                Err(err) if err.is_precondition_failed() => {
                    warn!(entity = %key, path = %path, "history key collision; retrying under a new key");
                    self.retry.backoff(attempt, &path).await;
                    last_path = path;
                }
                Err(err) => return Err(err),
            }
        }
        Err(self.retry.exhausted(&last_path))
    }

    /// History objects for `key`, oldest generation first.
    pub async fn list(&self, key: &EntityKey) -> Result<Vec<ObjectMeta>> {
        let mut entries = self.store.list(&paths::history_prefix(key)).await?;
        entries.sort_by(|a, b| a.generation.cmp(&b.generation).then(a.name.cmp(&b.name)));
        Ok(entries)
    }

    pub async fn read(&self, key: &EntityKey) -> Result<Vec<HistoryRecord>> {
        let mut records = Vec::new();
        for entry in self.list(key).await? {
            match read_json::<HistoryRecord>(self.store.as_ref(), &entry.name).await? {
                Some((record, _)) => records.push(record),
                None => debug!(path = %entry.name, "history object vanished during read"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{
        error::StoreError,
        object_store::{MemoryStore, ObjectStore, PutOptions, StoredObject},
    };

    fn key() -> EntityKey {
        EntityKey::new(Env::Dev, EntityType::Idea, "I1").unwrap()
    }

    #[test]
    fn write_keys_sort_by_time() {
        let earlier = next_write_key("2025-01-01T00:00:00.000001Z".parse().unwrap());
        let later = next_write_key("2025-01-01T00:00:00.000002Z".parse().unwrap());
        assert!(earlier.starts_with("20250101T000000000001Z-"));
        assert!(earlier < later);
    }

    #[tokio::test]
    async fn appends_are_kept_in_generation_order() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let log = HistoryLog::new(store, RetryPolicy::immediate(3));
        for version in 1..=3 {
            log.append(&key(), &json!({ "version": version }))
                .await
                .unwrap();
        }

        let records = log.read(&key()).await.unwrap();
        let versions: Vec<_> = records
            .iter()
            .map(|record| record.payload["version"].as_i64().unwrap())
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert!(records.iter().all(|record| record.id == "I1"));
    }

    struct CollidesOnce {
        inner: MemoryStore,
        puts: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for CollidesOnce {
        fn name(&self) -> &'static str {
            "collides-once"
        }
        async fn get(&self, path: &str) -> Result<Option<StoredObject>> {
            self.inner.get(path).await
        }
        async fn put(&self, path: &str, body: Vec<u8>, options: PutOptions) -> Result<ObjectMeta> {
            if self.puts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(StoreError::PreconditionFailed {
                    path: path.to_string(),
                });
            }
            self.inner.put(path, body, options).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
            self.inner.list(prefix).await
        }
        async fn delete(&self, path: &str) -> Result<bool> {
            self.inner.delete(path).await
        }
        async fn stat(&self, path: &str) -> Result<Option<ObjectMeta>> {
            self.inner.stat(path).await
        }
    }

    #[tokio::test]
    async fn collision_moves_to_a_fresh_key() {
        let store = Arc::new(CollidesOnce {
            inner: MemoryStore::new(),
            puts: AtomicUsize::new(0),
        });
        let log = HistoryLog::new(store.clone(), RetryPolicy::immediate(3));
        let receipt = log.append(&key(), &json!({ "v": 1 })).await.unwrap();

        assert_eq!(store.puts.load(Ordering::SeqCst), 2);
        assert_eq!(log.list(&key()).await.unwrap().len(), 1);
        assert!(receipt.path.ends_with(&format!("{}.json", receipt.write_key)));
    }
}
