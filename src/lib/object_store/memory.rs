use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::Result;

use super::{ObjectMeta, ObjectStore, PutOptions, StoredObject, check_precondition};

/// In-process store with GCS-like versioning: every content write gets a new,
/// strictly increasing generation and starts again at metageneration 1.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<String, MemoryObject>,
    last_generation: i64,
    clock: Option<DateTime<Utc>>,
}

struct MemoryObject {
    body: Vec<u8>,
    meta: ObjectMeta,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the `updated` time stamped on subsequent writes.
    pub fn set_clock(&self, now: DateTime<Utc>) {
        self.state.lock().clock = Some(now);
    }

    pub fn clear_clock(&self) {
        self.state.lock().clock = None;
    }

    pub fn len(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, path: &str) -> Result<Option<StoredObject>> {
        let state = self.state.lock();
        Ok(state.objects.get(path).map(|object| StoredObject {
            meta: object.meta.clone(),
            body: object.body.clone(),
        }))
    }

    async fn put(&self, path: &str, body: Vec<u8>, options: PutOptions) -> Result<ObjectMeta> {
        let mut state = self.state.lock();
        check_precondition(
            path,
            state.objects.get(path).map(|object| &object.meta),
            options.precondition,
        )?;

        state.last_generation += 1;
        let meta = ObjectMeta {
            name: path.to_string(),
            generation: state.last_generation,
            metageneration: 1,
            size: body.len() as u64,
            updated: state.clock.unwrap_or_else(Utc::now),
        };
        state.objects.insert(
            path.to_string(),
            MemoryObject {
                body,
                meta: meta.clone(),
            },
        );
        Ok(meta)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let state = self.state.lock();
        Ok(state
            .objects
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(_, object)| object.meta.clone())
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        Ok(self.state.lock().objects.remove(path).is_some())
    }

    async fn stat(&self, path: &str) -> Result<Option<ObjectMeta>> {
        Ok(self
            .state
            .lock()
            .objects
            .get(path)
            .map(|object| object.meta.clone()))
    }
}
