use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    entity::EntityType,
    manifest::{Manifest, project},
    paths,
    snapshot::Snapshot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucketing {
    /// One bucket per normalized field value.
    Value,
    /// One bucket per distinct normalized element of a list field.
    Each,
    /// `floor(score)` clamped to 0..=10, two digits.
    ScoreDecile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDimension {
    pub name: &'static str,
    pub bucketing: Bucketing,
}

const STATUS: IndexDimension = IndexDimension {
    name: "status",
    bucketing: Bucketing::Value,
};
const STAGE: IndexDimension = IndexDimension {
    name: "stage",
    bucketing: Bucketing::Value,
};
const OWNER: IndexDimension = IndexDimension {
    name: "owner",
    bucketing: Bucketing::Value,
};
const TAG: IndexDimension = IndexDimension {
    name: "tag",
    bucketing: Bucketing::Each,
};
const SCORE: IndexDimension = IndexDimension {
    name: "score",
    bucketing: Bucketing::ScoreDecile,
};

pub fn dimensions_for(entity_type: EntityType) -> &'static [IndexDimension] {
    match entity_type {
        EntityType::Idea | EntityType::Venture => &[STATUS, STAGE, OWNER, TAG, SCORE],
        EntityType::Playbook => &[STATUS, OWNER, TAG],
        EntityType::PlaybookRun => &[STATUS, OWNER],
        EntityType::Comment => &[OWNER],
        EntityType::Round => &[STATUS, STAGE],
        EntityType::CapTable => &[STATUS],
    }
}

pub fn dimension(entity_type: EntityType, name: &str) -> Option<IndexDimension> {
    dimensions_for(entity_type)
        .iter()
        .copied()
        .find(|dimension| dimension.name == name)
}

/// Lower-cases and replaces anything outside `[a-z0-9._@-]` with `-`,
/// collapsing runs and trimming the ends.
pub fn bucket_value(raw: &str) -> Option<String> {
    let mut bucket = String::with_capacity(raw.len());
    for ch in raw.trim().chars().flat_map(char::to_lowercase) {
        let keep = ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '_' | '@');
        let next = if keep { ch } else { '-' };
        if next == '-' && bucket.ends_with('-') {
            continue;
        }
        bucket.push(next);
    }
    let bucket = bucket.trim_matches('-');
    // "." and ".." would not survive as a path segment.
    if bucket.is_empty() || bucket.chars().all(|ch| ch == '.') {
        None
    } else {
        Some(bucket.to_string())
    }
}

pub fn score_bucket(score: f64) -> Option<String> {
    if !score.is_finite() {
        return None;
    }
    let decile = score.floor().clamp(0.0, 10.0) as u8;
    Some(format!("{decile:02}"))
}

fn buckets(manifest: &Manifest, dimension: &IndexDimension) -> Vec<String> {
    let single = |value: &Option<String>| value.as_deref().and_then(bucket_value);
    let found = match (dimension.name, dimension.bucketing) {
        (_, Bucketing::ScoreDecile) => manifest.score.and_then(score_bucket),
        (_, Bucketing::Each) => {
            let distinct: BTreeSet<String> = manifest
                .tags
                .iter()
                .filter_map(|tag| bucket_value(tag))
                .collect();
            return distinct.into_iter().collect();
        }
        ("status", _) => single(&manifest.status),
        ("stage", _) => single(&manifest.stage),
        ("owner", _) => single(&manifest.owner),
        _ => None,
    };
    found.into_iter().collect()
}

/// Pointer body: the dimension and bucket it is filed under plus the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexPointer {
    pub dimension: String,
    pub bucket: String,
    #[serde(flatten)]
    pub manifest: Manifest,
}

/// Sweep instruction: remove pointers for `id` under `prefix` that were not
/// planned.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cleanup {
    pub dimension: &'static str,
    pub prefix: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexPlan {
    pub path: String,
    pub pointer: IndexPointer,
    pub cleanup: Option<Cleanup>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Plan {
    pub entries: Vec<IndexPlan>,
    /// Cleanups for dimensions that currently have no value, so their old
    /// pointers are swept too.
    pub vacant: Vec<Cleanup>,
}

impl Plan {
    pub fn cleanups(&self) -> BTreeSet<Cleanup> {
        self.entries
            .iter()
            .filter_map(|entry| entry.cleanup.clone())
            .chain(self.vacant.iter().cloned())
            .collect()
    }

    pub fn keep_set(&self) -> BTreeSet<String> {
        self.entries.iter().map(|entry| entry.path.clone()).collect()
    }
}

pub fn plan(snapshot: &Snapshot) -> Plan {
    let key = &snapshot.key;
    let manifest = project(snapshot);
    let mut plan = Plan::default();

    for dimension in dimensions_for(key.entity_type) {
        let cleanup = Cleanup {
            dimension: dimension.name,
            prefix: paths::index_prefix(key.env, key.entity_type, dimension.name),
            id: key.id.clone(),
        };
        let buckets = buckets(&manifest, dimension);
        if buckets.is_empty() {
            plan.vacant.push(cleanup);
            continue;
        }
        for bucket in buckets {
            plan.entries.push(IndexPlan {
                path: paths::index_pointer_path(key, dimension.name, &bucket),
                pointer: IndexPointer {
                    dimension: dimension.name.to_string(),
                    bucket,
                    manifest: manifest.clone(),
                },
                cleanup: Some(cleanup.clone()),
            });
        }
    }
    plan
}
