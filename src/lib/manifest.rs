use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    conditional::{UpsertReport, upsert_newer},
    entity::{EntityKey, EntityType},
    error::Result,
    object_store::{SharedStore, read_json},
    paths,
    retry::RetryPolicy,
    snapshot::Snapshot,
};

/// Listing record derived from a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

const TITLE_FIELDS: [&str; 3] = ["title", "theme", "name"];
const OWNER_FIELDS: [&str; 3] = ["owner", "owner_id", "owner_email"];

pub fn project(snapshot: &Snapshot) -> Manifest {
    let doc = &snapshot.document;
    Manifest {
        id: snapshot.key.id.clone(),
        entity_type: snapshot.key.entity_type,
        title: first_text(doc, &TITLE_FIELDS),
        status: first_text(doc, &["status"]),
        stage: first_text(doc, &["stage"]),
        owner: first_text(doc, &OWNER_FIELDS),
        score: doc.get("score").and_then(number),
        tags: doc.get("tags").map(tags).unwrap_or_default(),
        created_at: Some(snapshot.created_at),
        updated_at: snapshot.updated_at,
    }
}

fn first_text(doc: &serde_json::Map<String, Value>, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| doc.get(*field).and_then(text))
}

fn text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|score| score.is_finite())
}

fn tags(value: &Value) -> Vec<String> {
    let raw: Vec<String> = match value {
        Value::Array(items) => items.iter().filter_map(text).collect(),
        Value::String(list) => list.split(',').map(|tag| tag.trim().to_string()).collect(),
        _ => Vec::new(),
    };
    let mut tags = Vec::with_capacity(raw.len());
    for tag in raw {
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

#[derive(Clone)]
pub struct ManifestProjector {
    store: SharedStore,
    retry: RetryPolicy,
}

impl ManifestProjector {
    pub fn new(store: SharedStore, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn persist(&self, key: &EntityKey, manifest: &Manifest) -> Result<UpsertReport> {
        let path = paths::manifest_path(key);
        let document = serde_json::to_value(manifest)?;
        upsert_newer(
            self.store.as_ref(),
            &self.retry,
            &path,
            manifest.updated_at,
            |_| Ok(document.clone()),
        )
        .await
    }

    pub async fn read(&self, key: &EntityKey) -> Result<Option<Manifest>> {
        let path = paths::manifest_path(key);
        Ok(read_json::<Manifest>(self.store.as_ref(), &path)
            .await?
            .map(|(manifest, _)| manifest))
    }
}
