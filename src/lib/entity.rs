use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, StoreError};

/// Data partition every path is rooted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Env {
    Dev,
    Stg,
    Prod,
}

impl Env {
    pub const ALL: [Env; 3] = [Env::Dev, Env::Stg, Env::Prod];

    pub fn as_str(self) -> &'static str {
        match self {
            Env::Dev => "dev",
            Env::Stg => "stg",
            Env::Prod => "prod",
        }
    }
}

impl fmt::Display for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Env {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Env::Dev),
            "stg" | "staging" => Ok(Env::Stg),
            "prod" | "production" => Ok(Env::Prod),
            other => Err(StoreError::InvalidPath(format!(
                "unknown env '{other}' (expected dev, stg or prod)"
            ))),
        }
    }
}

impl Serialize for Env {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Env {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Closed vocabulary of entity types stored in the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityType {
    Venture,
    Idea,
    Playbook,
    PlaybookRun,
    Comment,
    Round,
    CapTable,
}

impl EntityType {
    pub const ALL: [EntityType; 7] = [
        EntityType::Venture,
        EntityType::Idea,
        EntityType::Playbook,
        EntityType::PlaybookRun,
        EntityType::Comment,
        EntityType::Round,
        EntityType::CapTable,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Venture => "venture",
            EntityType::Idea => "idea",
            EntityType::Playbook => "playbook",
            EntityType::PlaybookRun => "playbook_run",
            EntityType::Comment => "comment",
            EntityType::Round => "round",
            EntityType::CapTable => "cap_table",
        }
    }

    /// Plural segment used by the snapshot, manifest and index namespaces.
    pub fn segment(self) -> &'static str {
        match self {
            EntityType::Venture => "ventures",
            EntityType::Idea => "ideas",
            EntityType::Playbook => "playbooks",
            EntityType::PlaybookRun => "playbook_runs",
            EntityType::Comment => "comments",
            EntityType::Round => "rounds",
            EntityType::CapTable => "cap_tables",
        }
    }

    pub fn from_segment(segment: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|entity| entity.segment() == segment)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|entity| entity.as_str() == normalized || entity.segment() == normalized)
            .ok_or_else(|| StoreError::UnknownEntity(value.to_string()))
    }
}

impl Serialize for EntityType {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntityType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub env: Env,
    pub entity_type: EntityType,
    pub id: String,
}

impl EntityKey {
    pub fn new(env: Env, entity_type: EntityType, id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_id(&id)?;
        Ok(Self {
            env,
            entity_type,
            id,
        })
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.env, self.entity_type, self.id)
    }
}

/// Ids become a single path segment, so anything that would split or escape
/// the segment is refused.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(StoreError::InvalidPath("id cannot be empty".into()));
    }
    if id == "." || id == ".." {
        return Err(StoreError::InvalidPath(format!("id '{id}' is reserved")));
    }
    if id
        .chars()
        .any(|ch| ch == '/' || ch.is_whitespace() || ch.is_control())
    {
        return Err(StoreError::InvalidPath(format!(
            "id '{id}' contains '/', whitespace or control characters"
        )));
    }
    Ok(())
}
