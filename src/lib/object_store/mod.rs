use std::{path::PathBuf, sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    config::GcpConfig,
    error::{Result, StoreError},
    gcp::TokenSource,
    observability::record_store_op,
};

mod fs;
mod gcs;
mod memory;

pub use fs::FsStore;
pub use gcs::GcsStore;
pub use memory::MemoryStore;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// `ifGenerationMatch=0`: the object must not exist yet.
    DoesNotExist,
    /// The live object must be at exactly this generation.
    GenerationMatch(i64),
    /// The live object's metadata must be at exactly this metageneration.
    MetagenerationMatch(i64),
}

#[derive(Debug, Clone)]
pub struct PutOptions {
    pub precondition: Option<Precondition>,
    pub content_type: &'static str,
}

impl PutOptions {
    pub fn json(precondition: Option<Precondition>) -> Self {
        Self {
            precondition,
            content_type: JSON_CONTENT_TYPE,
        }
    }

    pub fn ndjson(precondition: Option<Precondition>) -> Self {
        Self {
            precondition,
            content_type: NDJSON_CONTENT_TYPE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub name: String,
    pub generation: i64,
    pub metageneration: i64,
    pub size: u64,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub meta: ObjectMeta,
    pub body: Vec<u8>,
}

/// Prefix-listable blob storage with per-object preconditions. Nothing
/// spans more than one path.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bucket name for backends that receive change notifications.
    fn bucket(&self) -> Option<&str> {
        None
    }

    async fn get(&self, path: &str) -> Result<Option<StoredObject>>;

    /// Fails with [`StoreError::PreconditionFailed`] when the precondition
    /// does not hold.
    async fn put(&self, path: &str, body: Vec<u8>, options: PutOptions) -> Result<ObjectMeta>;

    /// Lists objects whose name starts with `prefix`, sorted by name.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Returns whether an object was removed.
    async fn delete(&self, path: &str) -> Result<bool>;

    async fn stat(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

pub type SharedStore = Arc<dyn ObjectStore>;

/// Opens the backend named by a bucket URL: `gs://name` (or a bare bucket
/// name), `file:///dir`, or `memory://`.
pub fn open_store(bucket: &str, gcp: &GcpConfig) -> Result<SharedStore> {
    let bucket = bucket.trim();
    if bucket.is_empty() {
        return Err(StoreError::Config("bucket cannot be empty".into()));
    }
    if let Some(dir) = bucket.strip_prefix("file://") {
        return Ok(Arc::new(FsStore::open(PathBuf::from(dir))?));
    }
    if bucket.starts_with("memory://") {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let name = bucket.strip_prefix("gs://").unwrap_or(bucket);
    let name = name.trim_end_matches('/');
    if name.contains('/') {
        return Err(StoreError::Config(format!(
            "bucket '{bucket}' must not contain a path"
        )));
    }
    let tokens = Arc::new(TokenSource::from_config(gcp));
    Ok(Arc::new(GcsStore::new(name, gcp, tokens)?))
}

/// Precondition for writing over `existing`: create-only when absent,
/// otherwise guarded on the generation that was read.
pub fn precondition_for(existing: Option<&ObjectMeta>) -> Precondition {
    match existing {
        Some(meta) => Precondition::GenerationMatch(meta.generation),
        None => Precondition::DoesNotExist,
    }
}

/// Shared precondition check for the in-process backends.
pub(crate) fn check_precondition(
    path: &str,
    current: Option<&ObjectMeta>,
    precondition: Option<Precondition>,
) -> Result<()> {
    let holds = match (precondition, current) {
        (None, _) => true,
        (Some(Precondition::DoesNotExist), current) => current.is_none(),
        (Some(Precondition::GenerationMatch(expected)), Some(meta)) => {
            meta.generation == expected
        }
        (Some(Precondition::MetagenerationMatch(expected)), Some(meta)) => {
            meta.metageneration == expected
        }
        (Some(_), None) => false,
    };
    if holds {
        Ok(())
    } else {
        Err(StoreError::PreconditionFailed {
            path: path.to_string(),
        })
    }
}

pub async fn read_json<T>(store: &dyn ObjectStore, path: &str) -> Result<Option<(T, ObjectMeta)>>
where
    T: DeserializeOwned,
{
    let started = Instant::now();
    let object = store.get(path).await;
    record_store_op(store.name(), "read", &object, started);
    match object? {
        Some(object) => {
            let value = serde_json::from_slice(&object.body).map_err(|err| {
                StoreError::Serialization(format!("failed to decode {path}: {err}"))
            })?;
            Ok(Some((value, object.meta)))
        }
        None => Ok(None),
    }
}

pub async fn write_json<T>(
    store: &dyn ObjectStore,
    path: &str,
    value: &T,
    precondition: Option<Precondition>,
) -> Result<ObjectMeta>
where
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(value)?;
    let started = Instant::now();
    let result = store
        .put(path, body, PutOptions::json(precondition))
        .await;
    record_store_op(store.name(), "write", &result, started);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(generation: i64, metageneration: i64) -> ObjectMeta {
        ObjectMeta {
            name: "a.json".into(),
            generation,
            metageneration,
            size: 0,
            updated: Utc::now(),
        }
    }

    #[test]
    fn precondition_matrix() {
        let current = meta(5, 2);
        assert!(check_precondition("a", None, Some(Precondition::DoesNotExist)).is_ok());
        assert!(check_precondition("a", Some(&current), Some(Precondition::DoesNotExist)).is_err());
        assert!(
            check_precondition("a", Some(&current), Some(Precondition::GenerationMatch(5))).is_ok()
        );
        assert!(
            check_precondition("a", Some(&current), Some(Precondition::GenerationMatch(4)))
                .unwrap_err()
                .is_precondition_failed()
        );
        assert!(
            check_precondition("a", Some(&current), Some(Precondition::MetagenerationMatch(2)))
                .is_ok()
        );
        assert!(check_precondition("a", None, Some(Precondition::GenerationMatch(1))).is_err());
        assert!(check_precondition("a", Some(&current), None).is_ok());
    }

    #[test]
    fn opens_backends_from_bucket_urls() {
        let gcp = GcpConfig::default();
        assert_eq!(open_store("memory://", &gcp).unwrap().name(), "memory");

        let dir = tempfile::tempdir().unwrap();
        let url = format!("file://{}", dir.path().display());
        assert_eq!(open_store(&url, &gcp).unwrap().name(), "fs");

        let gcs = open_store("gs://ventures-prod", &gcp).unwrap();
        assert_eq!(gcs.name(), "gcs");
        assert_eq!(gcs.bucket(), Some("ventures-prod"));

        assert!(open_store("gs://bucket/with/path", &gcp).is_err());
        assert!(open_store("  ", &gcp).is_err());
    }
}
