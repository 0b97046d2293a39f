use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, StoreError},
    object_store::{Precondition, SharedStore, read_json, write_json},
};

const ACQUIRE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Expiring lease object used as a per-path mutex between processes.
pub struct Lease {
    store: SharedStore,
    path: String,
    holder: String,
    generation: i64,
    expires_at: DateTime<Utc>,
}

impl Lease {
    /// Creates the lease object create-only. An existing lease that has
    /// expired (or cannot be decoded) is taken over with a generation guard,
    /// so two contenders can never both win the takeover.
    pub async fn acquire(
        store: SharedStore,
        path: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lease> {
        for attempt in 1..=ACQUIRE_ATTEMPTS {
            let now = Utc::now();
            let record = LeaseRecord {
                holder: holder.to_string(),
                acquired_at: now,
                expires_at: now + ttl,
            };

            let existing = match read_json::<LeaseRecord>(store.as_ref(), path).await {
                Ok(found) => found.map(|(record, meta)| (Some(record), meta)),
                Err(StoreError::Serialization(_)) => store
                    .stat(path)
                    .await?
                    .map(|meta| (None, meta)),
                Err(err) => return Err(err),
            };

            let precondition = match &existing {
                None => Precondition::DoesNotExist,
                Some((Some(current), _)) if current.expires_at > now => {
                    return Err(StoreError::LeaseHeld {
                        path: path.to_string(),
                        holder: current.holder.clone(),
                        expires_at: current.expires_at,
                    });
                }
                Some((current, meta)) => {
                    warn!(
                        path,
                        previous = current.as_ref().map(|c| c.holder.as_str()).unwrap_or("unknown"),
                        "taking over expired lease"
                    );
                    Precondition::GenerationMatch(meta.generation)
                }
            };

            match write_json(store.as_ref(), path, &record, Some(precondition)).await {
                Ok(meta) => {
                    info!(path, holder, expires_at = %record.expires_at, "lease acquired");
                    return Ok(Lease {
                        store,
                        path: path.to_string(),
                        holder: holder.to_string(),
                        generation: meta.generation,
                        expires_at: record.expires_at,
                    });
                }
                Err(err) if err.is_precondition_failed() => {
                    debug!(path, attempt, "lost lease race; re-reading");
                }
                Err(err) => return Err(err),
            }
        }

        let current = read_json::<LeaseRecord>(store.as_ref(), path)
            .await
            .ok()
            .flatten();
        Err(match current {
            Some((current, _)) => StoreError::LeaseHeld {
                path: path.to_string(),
                holder: current.holder,
                expires_at: current.expires_at,
            },
            None => StoreError::Conflict {
                path: path.to_string(),
                attempts: ACQUIRE_ATTEMPTS,
            },
        })
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Deletes the lease object if it is still the one this holder wrote.
    pub async fn release(self) -> Result<()> {
        match self.store.stat(&self.path).await? {
            Some(meta) if meta.generation == self.generation => {
                self.store.delete(&self.path).await?;
                info!(path = %self.path, holder = %self.holder, "lease released");
            }
            Some(_) => {
                warn!(path = %self.path, holder = %self.holder, "lease was taken over before release");
            }
            None => {
                debug!(path = %self.path, "lease already gone");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::object_store::{MemoryStore, ObjectStore, PutOptions};

    const PATH: &str = "env/dev/manifests/ideas/_compaction.lock";

    #[tokio::test]
    async fn second_holder_is_refused_until_release() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let lease = Lease::acquire(store.clone(), PATH, "job-a", Duration::minutes(5))
            .await
            .unwrap();

        let err = Lease::acquire(store.clone(), PATH, "job-b", Duration::minutes(5))
            .await
            .err()
            .unwrap();
        match err {
            StoreError::LeaseHeld { holder, .. } => assert_eq!(holder, "job-a"),
            other => panic!("unexpected error {other:?}"),
        }

        lease.release().await.unwrap();
        assert!(store.stat(PATH).await.unwrap().is_none());
        let lease = Lease::acquire(store.clone(), PATH, "job-b", Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(lease.holder(), "job-b");
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over_and_old_holder_cannot_release_it() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let stale = Lease::acquire(store.clone(), PATH, "job-a", Duration::seconds(-1))
            .await
            .unwrap();
        assert!(stale.is_expired());

        let fresh = Lease::acquire(store.clone(), PATH, "job-b", Duration::minutes(5))
            .await
            .unwrap();
        stale.release().await.unwrap();

        let (record, _) = read_json::<LeaseRecord>(store.as_ref(), PATH)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.holder, "job-b");
        fresh.release().await.unwrap();
    }

    #[tokio::test]
    async fn undecodable_lease_counts_as_expired() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        store
            .put(PATH, b"garbage".to_vec(), PutOptions::json(None))
            .await
            .unwrap();
        let lease = Lease::acquire(store.clone(), PATH, "job-a", Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(lease.holder(), "job-a");
    }
}
