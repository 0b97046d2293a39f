use std::{
    fs, io,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

use super::{ObjectMeta, ObjectStore, PutOptions, StoredObject, check_precondition};

const OBJECTS_DIR: &str = "objects";
const META_DIR: &str = "meta";
const META_SUFFIX: &str = ".meta.json";

/// Directory-backed store for local runs. Object bodies live under
/// `objects/`, and a sidecar under `meta/` carries the version fields.
/// Safe for a single process only.
#[derive(Clone)]
pub struct FsStore {
    inner: Arc<FsInner>,
}

struct FsInner {
    root: PathBuf,
    last_generation: Mutex<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    generation: i64,
    metageneration: i64,
    updated: DateTime<Utc>,
}

impl FsStore {
    pub fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(root.join(OBJECTS_DIR))?;
        fs::create_dir_all(root.join(META_DIR))?;
        Ok(Self {
            inner: Arc::new(FsInner {
                root,
                last_generation: Mutex::new(0),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    async fn blocking<T, F>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&FsInner) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || task(&inner))
            .await
            .map_err(|err| StoreError::Storage(format!("filesystem task failed: {err}")))?
    }
}

impl FsInner {
    fn object_file(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(OBJECTS_DIR).join(name))
    }

    fn meta_file(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(META_DIR).join(format!("{name}{META_SUFFIX}")))
    }

    fn read_meta(&self, name: &str) -> Result<Option<ObjectMeta>> {
        let object = self.object_file(name)?;
        let size = match fs::metadata(&object) {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            Ok(_) => return Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let sidecar: Sidecar = match fs::read(self.meta_file(name)?) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::Storage(format!(
                    "object {name} has no metadata sidecar"
                )));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Some(ObjectMeta {
            name: name.to_string(),
            generation: sidecar.generation,
            metageneration: sidecar.metageneration,
            size,
            updated: sidecar.updated,
        }))
    }

    fn next_generation(&self, previous: Option<i64>) -> i64 {
        let mut last = self.last_generation.lock();
        let now = Utc::now().timestamp_micros();
        let floor = (*last).max(previous.unwrap_or(0));
        *last = now.max(floor + 1);
        *last
    }

    fn put(&self, name: &str, body: &[u8], options: &PutOptions) -> Result<ObjectMeta> {
        let current = self.read_meta(name)?;
        check_precondition(name, current.as_ref(), options.precondition)?;

        let generation = self.next_generation(current.as_ref().map(|meta| meta.generation));
        let updated = Utc::now();
        let object = self.object_file(name)?;
        let meta = self.meta_file(name)?;
        write_atomically(&object, body)?;
        let sidecar = Sidecar {
            generation,
            metageneration: 1,
            updated,
        };
        write_atomically(&meta, &serde_json::to_vec(&sidecar)?)?;

        Ok(ObjectMeta {
            name: name.to_string(),
            generation,
            metageneration: 1,
            size: body.len() as u64,
            updated,
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects_root = self.root.join(OBJECTS_DIR);
        let start_dir = match prefix.rfind('/') {
            Some(index) => {
                let dir = &prefix[..index];
                validate_name(dir)?;
                objects_root.join(dir)
            }
            None => objects_root.clone(),
        };

        let mut names = Vec::new();
        collect_files(&objects_root, &start_dir, &mut names)?;
        names.retain(|name| name.starts_with(prefix));
        names.sort();

        let mut listed = Vec::with_capacity(names.len());
        for name in names {
            if let Some(meta) = self.read_meta(&name)? {
                listed.push(meta);
            }
        }
        Ok(listed)
    }

    fn delete(&self, name: &str) -> Result<bool> {
        let removed = match fs::remove_file(self.object_file(name)?) {
            Ok(()) => true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(err) => return Err(err.into()),
        };
        match fs::remove_file(self.meta_file(name)?) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(removed)
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    fn name(&self) -> &'static str {
        "fs"
    }

    async fn get(&self, path: &str) -> Result<Option<StoredObject>> {
        let name = path.to_string();
        self.blocking(move |inner| {
            let _write = WRITE_LOCK.lock();
            let Some(meta) = inner.read_meta(&name)? else {
                return Ok(None);
            };
            let body = fs::read(inner.object_file(&name)?)?;
            Ok(Some(StoredObject { meta, body }))
        })
        .await
    }

    async fn put(&self, path: &str, body: Vec<u8>, options: PutOptions) -> Result<ObjectMeta> {
        let name = path.to_string();
        self.blocking(move |inner| {
            let _write = WRITE_LOCK.lock();
            inner.put(&name, &body, &options)
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let prefix = prefix.to_string();
        self.blocking(move |inner| inner.list(&prefix)).await
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let name = path.to_string();
        self.blocking(move |inner| {
            let _write = WRITE_LOCK.lock();
            inner.delete(&name)
        })
        .await
    }

    async fn stat(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let name = path.to_string();
        self.blocking(move |inner| inner.read_meta(&name)).await
    }
}

/// Serializes read-check-write sequences across every `FsStore` handle in the
/// process.
static WRITE_LOCK: Mutex<()> = Mutex::new(());

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::InvalidPath("object name cannot be empty".into()));
    }
    let path = Path::new(name);
    if path
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(StoreError::InvalidPath(format!(
            "object name '{name}' must be a relative path without '.' or '..'"
        )));
    }
    Ok(())
}

fn write_atomically(target: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("object");
    let tmp = target.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, target)?;
    Ok(())
}

fn collect_files(root: &Path, dir: &Path, names: &mut Vec<String>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, names)?;
        } else if file_type.is_file() {
            let is_temp = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with('.') && name.ends_with(".tmp"));
            if is_temp {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(root) {
                let name = relative
                    .components()
                    .filter_map(|component| component.as_os_str().to_str())
                    .collect::<Vec<_>>()
                    .join("/");
                names.push(name);
            }
        }
    }
    Ok(())
}
