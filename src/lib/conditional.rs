use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::{
    error::Result,
    object_store::{ObjectStore, precondition_for, read_json, write_json},
    retry::RetryPolicy,
    timestamp::parse_timestamp,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The stored document is at least as new as the candidate.
    Stale,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertReport {
    pub path: String,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    /// The document now stored at `path` when this call wrote it.
    #[serde(skip)]
    pub document: Option<Value>,
}

impl UpsertReport {
    fn stale(path: &str) -> Self {
        Self {
            path: path.to_string(),
            skipped: true,
            reason: Some(SkipReason::Stale),
            generation: None,
            document: None,
        }
    }

    pub fn written(&self) -> bool {
        !self.skipped
    }
}

/// Writes the document produced by `render` unless the stored object carries
/// an `updated_at` at or after `updated_at`.
///
/// `render` receives the currently stored document (if any) so carried-over
/// fields can be preserved. First writes are create-only; overwrites are
/// guarded on the generation that was read. A lost race re-reads and tries
/// again within the retry budget.
pub async fn upsert_newer<F>(
    store: &dyn ObjectStore,
    retry: &RetryPolicy,
    path: &str,
    updated_at: DateTime<Utc>,
    render: F,
) -> Result<UpsertReport>
where
    F: Fn(Option<&Value>) -> Result<Value> + Send + Sync,
{
    for attempt in retry.attempts() {
        let existing = read_json::<Value>(store, path).await?;
        if let Some((current, _)) = &existing {
            let stored = current.get("updated_at").and_then(parse_timestamp);
            if stored.is_some_and(|stored| updated_at <= stored) {
                return Ok(UpsertReport::stale(path));
            }
        }

        let document = render(existing.as_ref().map(|(current, _)| current))?;
        let precondition = precondition_for(existing.as_ref().map(|(_, meta)| meta));
        match write_json(store, path, &document, Some(precondition)).await {
            Ok(meta) => {
                return Ok(UpsertReport {
                    path: path.to_string(),
                    skipped: false,
                    reason: None,
                    generation: Some(meta.generation),
                    document: Some(document),
                });
            }
            Err(err) if err.is_precondition_failed() => retry.backoff(attempt, path).await,
            Err(err) => return Err(err),
        }
    }
    Err(retry.exhausted(path))
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
        object_store::{MemoryStore, ObjectMeta, PutOptions, StoredObject},
    };

    fn ts(text: &str) -> DateTime<Utc> {
        text.parse().unwrap()
    }

    #[tokio::test]
    async fn skips_equal_or_older_writes() {
        let store = MemoryStore::new();
        let retry = RetryPolicy::immediate(3);
        let path = "doc.json";

        let first = upsert_newer(&store, &retry, path, ts("2025-01-02T00:00:00Z"), |_| {
            Ok(json!({ "updated_at": "2025-01-02T00:00:00Z", "v": 1 }))
        })
        .await
        .unwrap();
        assert!(first.written());

        for older in ["2025-01-02T00:00:00Z", "2025-01-01T00:00:00Z"] {
            let report = upsert_newer(&store, &retry, path, ts(older), |_| {
                Ok(json!({ "updated_at": older, "v": 0 }))
            })
            .await
            .unwrap();
            assert!(report.skipped);
            assert_eq!(report.reason, Some(SkipReason::Stale));
        }

        let (stored, _) = read_json::<Value>(&store, path).await.unwrap().unwrap();
        assert_eq!(stored["v"], 1);
    }

    /// Lets another writer slip in between the read and the first write.
    struct RacingStore {
        inner: MemoryStore,
        interfered: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for RacingStore {
        fn name(&self) -> &'static str {
            "racing"
        }

        async fn get(&self, path: &str) -> Result<Option<StoredObject>> {
            self.inner.get(path).await
        }

        async fn put(&self, path: &str, body: Vec<u8>, options: PutOptions) -> Result<ObjectMeta> {
            if self.interfered.fetch_add(1, Ordering::SeqCst) == 0 {
                self.inner
                    .put(
                        path,
                        serde_json::to_vec(&json!({ "updated_at": "2025-01-01T12:00:00Z" }))
                            .unwrap(),
                        PutOptions::json(None),
                    )
                    .await?;
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
    async fn lost_race_rereads_and_retries() {
        let store = RacingStore {
            inner: MemoryStore::new(),
            interfered: AtomicUsize::new(0),
        };
        let renders = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&renders);
        let report = upsert_newer(
            &store,
            &RetryPolicy::immediate(3),
            "doc.json",
            ts("2025-01-02T00:00:00Z"),
            move |current| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!({
                    "updated_at": "2025-01-02T00:00:00Z",
                    "saw_previous": current.is_some()
                }))
            },
        )
        .await
        .unwrap();

        assert!(report.written());
        assert_eq!(renders.load(Ordering::SeqCst), 2);
        assert_eq!(report.document.unwrap()["saw_previous"], true);
    }

    #[tokio::test]
    async fn exhausted_budget_is_a_conflict() {
        struct AlwaysLoses(MemoryStore);

        #[async_trait]
        impl ObjectStore for AlwaysLoses {
            fn name(&self) -> &'static str {
                "always-loses"
            }
            async fn get(&self, path: &str) -> Result<Option<StoredObject>> {
                self.0.get(path).await
            }
            async fn put(&self, path: &str, _: Vec<u8>, _: PutOptions) -> Result<ObjectMeta> {
                Err(StoreError::PreconditionFailed {
                    path: path.to_string(),
                })
            }
            async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
                self.0.list(prefix).await
            }
            async fn delete(&self, path: &str) -> Result<bool> {
                self.0.delete(path).await
            }
            async fn stat(&self, path: &str) -> Result<Option<ObjectMeta>> {
                self.0.stat(path).await
            }
        }

        let err = upsert_newer(
            &AlwaysLoses(MemoryStore::new()),
            &RetryPolicy::immediate(2),
            "doc.json",
            ts("2025-01-02T00:00:00Z"),
            |_| Ok(json!({})),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { attempts: 2, .. }));
    }
}
