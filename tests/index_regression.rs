use std::sync::Arc;

use bucketdb::{
    document::DocumentStore,
    entity::{EntityKey, EntityType, Env},
    events::ChangeNotification,
    index::{IndexOutcome, IndexWriter, read_bucket},
    object_store::{FsStore, MemoryStore, ObjectStore, SharedStore},
    retry::RetryPolicy,
};
use serde_json::{Value, json};
use tempfile::TempDir;

type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const SNAPSHOT: &str = "env/dev/snapshots/ideas/I1.json";

fn key() -> EntityKey {
    EntityKey::new(Env::Dev, EntityType::Idea, "I1").expect("valid key")
}

fn notification(name: &str) -> ChangeNotification {
    ChangeNotification {
        bucket: String::new(),
        name: name.to_string(),
    }
}

fn idea(status: &str, score: f64, updated_at: &str) -> Value {
    json!({
        "title": "Solar kiosks",
        "status": status,
        "owner": "ana@example.com",
        "score": score,
        "tags": ["energy", "retail"],
        "updated_at": updated_at,
    })
}

async fn names(store: &dyn ObjectStore, prefix: &str) -> TestResult<Vec<String>> {
    Ok(store
        .list(prefix)
        .await?
        .into_iter()
        .map(|meta| meta.name)
        .collect())
}

struct Harness {
    store: SharedStore,
    documents: DocumentStore,
    writer: IndexWriter,
}

impl Harness {
    fn new(store: SharedStore) -> Self {
        let retry = RetryPolicy::immediate(5);
        Self {
            documents: DocumentStore::new(store.clone(), retry),
            writer: IndexWriter::new(store.clone(), retry),
            store,
        }
    }

    async fn write_and_index(&self, payload: Value) -> TestResult<()> {
        self.documents.write(&key(), &payload).await?;
        self.writer.handle(&notification(SNAPSHOT)).await?;
        Ok(())
    }
}

#[tokio::test]
async fn status_change_moves_the_pointer() -> TestResult<()> {
    let harness = Harness::new(Arc::new(MemoryStore::new()));
    harness
        .write_and_index(idea("New", 7.2, "2025-03-01T10:00:00Z"))
        .await?;
    assert_eq!(
        names(harness.store.as_ref(), "env/dev/indices/ideas/by-status/").await?,
        vec!["env/dev/indices/ideas/by-status/new/I1.json"]
    );

    harness
        .write_and_index(idea("Approved", 8.9, "2025-03-02T10:00:00Z"))
        .await?;
    assert_eq!(
        names(harness.store.as_ref(), "env/dev/indices/ideas/by-status/").await?,
        vec!["env/dev/indices/ideas/by-status/approved/I1.json"]
    );
    assert_eq!(
        names(harness.store.as_ref(), "env/dev/indices/ideas/by-score/").await?,
        vec!["env/dev/indices/ideas/by-score/08/I1.json"]
    );

    let approved = read_bucket(
        harness.store.as_ref(),
        Env::Dev,
        EntityType::Idea,
        "status",
        "Approved",
    )
    .await?;
    assert_eq!(approved.len(), 1);
    assert_eq!(approved[0].manifest.status.as_deref(), Some("Approved"));
    assert_eq!(approved[0].manifest.title.as_deref(), Some("Solar kiosks"));
    Ok(())
}

#[tokio::test]
async fn duplicate_notification_changes_nothing() -> TestResult<()> {
    let harness = Harness::new(Arc::new(MemoryStore::new()));
    harness
        .write_and_index(idea("New", 7.2, "2025-03-01T10:00:00Z"))
        .await?;
    let before = names(harness.store.as_ref(), "env/dev/indices/").await?;

    let replay = harness.writer.handle(&notification(SNAPSHOT)).await?;
    assert_eq!(replay.outcome, IndexOutcome::Indexed);
    assert!(replay.written.is_empty());
    assert!(replay.deleted.is_empty());
    assert_eq!(replay.stale.len(), before.len());
    assert_eq!(names(harness.store.as_ref(), "env/dev/indices/").await?, before);
    Ok(())
}

#[tokio::test]
async fn stale_payload_leaves_snapshot_and_indices_alone() -> TestResult<()> {
    let harness = Harness::new(Arc::new(MemoryStore::new()));
    harness
        .write_and_index(idea("Approved", 8.9, "2025-03-02T10:00:00Z"))
        .await?;
    let before = names(harness.store.as_ref(), "env/dev/indices/").await?;

    let outcome = harness
        .documents
        .write(&key(), &idea("New", 1.0, "2025-03-01T10:00:00Z"))
        .await?;
    let reported = serde_json::to_value(&outcome.snapshot)?;
    assert_eq!(reported["skipped"], json!(true));
    assert_eq!(reported["reason"], json!("stale"));
    assert!(outcome.manifest.is_none());

    harness.writer.handle(&notification(SNAPSHOT)).await?;
    assert_eq!(names(harness.store.as_ref(), "env/dev/indices/").await?, before);

    let snapshot = harness.documents.get(&key()).await?.expect("snapshot exists");
    assert_eq!(snapshot.field("status"), Some(&json!("Approved")));
    // Both writes are still in the history.
    assert_eq!(harness.documents.history(&key()).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn out_of_order_delivery_converges_on_the_filesystem_backend() -> TestResult<()> {
    let dir = TempDir::new()?;
    let harness = Harness::new(Arc::new(FsStore::open(dir.path().to_path_buf())?));

    // The newer write lands first; the older one arrives late and is dropped.
    harness
        .write_and_index(idea("Approved", 9.5, "2025-03-02T10:00:00Z"))
        .await?;
    harness
        .write_and_index(idea("New", 3.0, "2025-03-01T10:00:00Z"))
        .await?;
    harness.writer.handle(&notification(SNAPSHOT)).await?;

    let all = names(harness.store.as_ref(), "env/dev/indices/ideas/").await?;
    assert_eq!(
        all,
        vec![
            "env/dev/indices/ideas/by-owner/ana@example.com/I1.json",
            "env/dev/indices/ideas/by-score/09/I1.json",
            "env/dev/indices/ideas/by-status/approved/I1.json",
            "env/dev/indices/ideas/by-tag/energy/I1.json",
            "env/dev/indices/ideas/by-tag/retail/I1.json",
        ]
    );
    Ok(())
}
