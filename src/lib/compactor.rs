use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use futures::{StreamExt, stream};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::{
    config::CompactorConfig,
    entity::{EntityType, Env},
    error::{Result, StoreError},
    lease::Lease,
    object_store::{ObjectMeta, PutOptions, SharedStore, precondition_for, read_json},
    observability, paths,
    retry::RetryPolicy,
};

/// `u64` of the first eight SHA-256 bytes of `id`, big-endian, modulo
/// `shards`. Stable across runs, hosts and releases.
pub fn shard_for(id: &str, shards: u32) -> u32 {
    let digest = Sha256::digest(id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(shards.max(1))) as u32
}

/// Accepts an RFC 3339 instant or a look-back such as `7d`, `12h`, `30m`,
/// `45s`.
pub fn parse_since(raw: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Ok(instant.with_timezone(&Utc));
    }
    let invalid = || {
        StoreError::Config(format!(
            "invalid since '{raw}': expected RFC 3339 or a duration like 7d, 12h, 30m, 45s"
        ))
    };
    let split = raw.len().checked_sub(1).ok_or_else(invalid)?;
    if !raw.is_char_boundary(split) {
        return Err(invalid());
    }
    let (amount, unit) = raw.split_at(split);
    let amount: i64 = amount.parse().map_err(|_| invalid())?;
    if amount < 0 {
        return Err(invalid());
    }
    let lookback = match unit {
        "d" => Duration::try_days(amount),
        "h" => Duration::try_hours(amount),
        "m" => Duration::try_minutes(amount),
        "s" => Duration::try_seconds(amount),
        _ => None,
    }
    .ok_or_else(invalid)?;
    now.checked_sub_signed(lookback).ok_or_else(invalid)
}

/// One manifest per line, lines ordered by id, object keys sorted.
pub fn encode_shard(entries: &BTreeMap<String, Value>) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    for manifest in entries.values() {
        serde_json::to_writer(&mut body, &canonical(manifest))?;
        body.push(b'\n');
    }
    Ok(body)
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            Value::Object(
                keys.into_iter()
                    .map(|key| (key.clone(), canonical(&map[key])))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

pub fn decode_shard(body: &[u8]) -> Result<BTreeMap<String, Value>> {
    let mut entries = BTreeMap::new();
    for (line_no, line) in body.split(|byte| *byte == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let manifest: Value = serde_json::from_slice(line).map_err(|err| {
            StoreError::Serialization(format!("shard line {}: {err}", line_no + 1))
        })?;
        let id = manifest
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StoreError::Serialization(format!("shard line {} has no id", line_no + 1))
            })?
            .to_string();
        entries.insert(id, manifest);
    }
    Ok(entries)
}

#[derive(Debug, Clone)]
pub struct CompactionRequest {
    pub env: Env,
    pub entity_type: EntityType,
    pub shards: u32,
    /// Only manifests whose object was updated at or after this instant are
    /// merged; `None` rebuilds every shard from scratch.
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Written,
    Unchanged,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardReport {
    pub shard: u32,
    pub path: String,
    /// Manifests in the shard after the run.
    pub manifests: usize,
    /// Manifests from this run's selection that landed in the shard.
    pub changed: usize,
    pub status: ShardStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompactionReport {
    pub env: Env,
    pub entity_type: EntityType,
    pub mode: CompactionMode,
    pub shard_count: u32,
    pub listed: usize,
    pub selected: usize,
    pub shards: Vec<ShardReport>,
}

impl CompactionReport {
    pub fn failed_shards(&self) -> usize {
        self.shards
            .iter()
            .filter(|shard| shard.status == ShardStatus::Failed)
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.failed_shards() == 0
    }
}

const MAX_LEASE_SECS: u64 = 7 * 24 * 3600;

/// Folds per-id manifests into hash-sharded NDJSON blobs.
pub struct ManifestCompactor {
    store: SharedStore,
    retry: RetryPolicy,
    config: CompactorConfig,
    holder: String,
}

/// Manifests selected for one shard, or the reason the shard cannot be built.
type ShardInput = std::result::Result<BTreeMap<String, Value>, String>;

impl ManifestCompactor {
    pub fn new(store: SharedStore, retry: RetryPolicy, config: CompactorConfig) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "bucketdb".to_string());
        Self {
            store,
            retry,
            config,
            holder: format!("{host}-{}", uuid::Uuid::new_v4().simple()),
        }
    }

    pub async fn run(&self, request: CompactionRequest) -> Result<CompactionReport> {
        if request.shards == 0 {
            return Err(StoreError::Config("shard count must be at least 1".into()));
        }
        let lock_path = paths::compaction_lock_path(request.env, request.entity_type);
        let ttl = Duration::seconds(self.config.lock_ttl_secs.clamp(1, MAX_LEASE_SECS) as i64);
        let lease = Lease::acquire(self.store.clone(), &lock_path, &self.holder, ttl).await?;

        let outcome = self.run_locked(&request).await;
        if lease.is_expired() {
            warn!(path = %lock_path, "compaction outlived its lease");
        }
        if let Err(err) = lease.release().await {
            warn!(path = %lock_path, error = %err, "failed to release compaction lease");
        }
        outcome
    }

    async fn run_locked(&self, request: &CompactionRequest) -> Result<CompactionReport> {
        let prefix = paths::manifest_prefix(request.env, request.entity_type);
        let listing: Vec<(String, ObjectMeta)> = self
            .store
            .list(&prefix)
            .await?
            .into_iter()
            .filter_map(|meta| {
                let id = paths::id_from_object_name(&meta.name, &prefix)?.to_string();
                Some((id, meta))
            })
            .collect();
        let listed = listing.len();
        let selected: Vec<(String, ObjectMeta)> = match request.since {
            Some(since) => listing
                .into_iter()
                .filter(|(_, meta)| meta.updated >= since)
                .collect(),
            None => listing,
        };
        let selected_count = selected.len();
        let mode = if request.since.is_some() {
            CompactionMode::Incremental
        } else {
            CompactionMode::Full
        };
        info!(
            env = %request.env,
            entity = %request.entity_type,
            ?mode,
            listed,
            selected = selected_count,
            shards = request.shards,
            "compacting manifests"
        );

        let inputs = self.read_selection(selected, request.shards).await;
        let entity = request.entity_type.as_str();
        let mut reports: Vec<ShardReport> = stream::iter(inputs)
            .map(|(shard, input)| async move {
                let path = paths::shard_path(request.env, request.entity_type, shard);
                let report = match input {
                    Ok(changed) => self.write_shard(shard, &path, changed, mode).await,
                    Err(reason) => ShardReport {
                        shard,
                        path,
                        manifests: 0,
                        changed: 0,
                        status: ShardStatus::Failed,
                        error: Some(reason),
                    },
                };
                match report.status {
                    ShardStatus::Failed => {
                        observability::record_compaction_shard(entity, "failed");
                        warn!(shard, error = ?report.error, "shard compaction failed");
                    }
                    ShardStatus::Written => observability::record_compaction_shard(entity, "written"),
                    ShardStatus::Unchanged => {
                        observability::record_compaction_shard(entity, "unchanged")
                    }
                }
                report
            })
            .buffer_unordered(self.config.read_concurrency.max(1))
            .collect()
            .await;
        reports.sort_by_key(|report| report.shard);

        Ok(CompactionReport {
            env: request.env,
            entity_type: request.entity_type,
            mode,
            shard_count: request.shards,
            listed,
            selected: selected_count,
            shards: reports,
        })
    }

    /// Reads the selected manifests with bounded concurrency and groups them
    /// by shard. A shard with an unreadable manifest is not rebuilt, since
    /// writing it would silently drop that id.
    async fn read_selection(
        &self,
        selected: Vec<(String, ObjectMeta)>,
        shards: u32,
    ) -> BTreeMap<u32, ShardInput> {
        let store = self.store.as_ref();
        let reads: Vec<(String, Result<Option<Value>>)> = stream::iter(selected)
            .map(|(id, meta)| async move {
                let read = read_json::<Value>(store, &meta.name)
                    .await
                    .map(|found| found.map(|(manifest, _)| manifest));
                (id, read)
            })
            .buffer_unordered(self.config.read_concurrency.max(1))
            .collect()
            .await;

        let mut grouped: BTreeMap<u32, ShardInput> = BTreeMap::new();
        for (id, read) in reads {
            let shard = shard_for(&id, shards);
            let slot = grouped.entry(shard).or_insert_with(|| Ok(BTreeMap::new()));
            match (read, slot) {
                (Ok(Some(manifest)), Ok(entries)) => {
                    entries.insert(id, manifest);
                }
                (Ok(None), _) => {}
                (Err(err), slot) => {
                    warn!(id = %id, error = %err, "failed to read manifest");
                    if slot.is_ok() {
                        *slot = Err(format!("failed to read manifest {id}: {err}"));
                    }
                }
                (Ok(Some(_)), Err(_)) => {}
            }
        }
        grouped
    }

    async fn write_shard(
        &self,
        shard: u32,
        path: &str,
        changed: BTreeMap<String, Value>,
        mode: CompactionMode,
    ) -> ShardReport {
        let changed_count = changed.len();
        let mut report = ShardReport {
            shard,
            path: path.to_string(),
            manifests: 0,
            changed: changed_count,
            status: ShardStatus::Failed,
            error: None,
        };
        match self.merge_and_write(path, &changed, mode).await {
            Ok((manifests, written)) => {
                report.manifests = manifests;
                report.status = if written {
                    ShardStatus::Written
                } else {
                    ShardStatus::Unchanged
                };
            }
            Err(err) => report.error = Some(err.to_string()),
        }
        report
    }

    /// Returns the shard size and whether the blob changed.
    async fn merge_and_write(
        &self,
        path: &str,
        changed: &BTreeMap<String, Value>,
        mode: CompactionMode,
    ) -> Result<(usize, bool)> {
        for attempt in self.retry.attempts() {
            let existing = self.store.get(path).await?;
            let merged = match (mode, &existing) {
                (CompactionMode::Incremental, Some(object)) => {
                    let mut entries = decode_shard(&object.body)?;
                    entries.extend(changed.iter().map(|(id, manifest)| (id.clone(), manifest.clone())));
                    entries
                }
                _ => changed.clone(),
            };
            let body = encode_shard(&merged)?;
            if existing.as_ref().is_some_and(|object| object.body == body) {
                return Ok((merged.len(), false));
            }

            let precondition = precondition_for(existing.as_ref().map(|object| &object.meta));
            match self
                .store
                .put(path, body, PutOptions::ndjson(Some(precondition)))
                .await
            {
                Ok(_) => return Ok((merged.len(), true)),
                Err(err) if err.is_precondition_failed() => {
                    self.retry.backoff(attempt, path).await
                }
                Err(err) => return Err(err),
            }
        }
        Err(self.retry.exhausted(path))
    }
}
