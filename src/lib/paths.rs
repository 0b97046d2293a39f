use crate::entity::{EntityKey, EntityType, Env, validate_id};

const JSON_SUFFIX: &str = ".json";

pub fn history_prefix(key: &EntityKey) -> String {
    format!(
        "env/{}/{}/{}/history/",
        key.env,
        key.entity_type.as_str(),
        key.id
    )
}

pub fn history_path(key: &EntityKey, write_key: &str) -> String {
    format!("{}{write_key}{JSON_SUFFIX}", history_prefix(key))
}

pub fn snapshot_prefix(env: Env, entity_type: EntityType) -> String {
    format!("env/{env}/snapshots/{}/", entity_type.segment())
}

pub fn snapshot_path(key: &EntityKey) -> String {
    format!(
        "{}{}{JSON_SUFFIX}",
        snapshot_prefix(key.env, key.entity_type),
        key.id
    )
}

pub fn manifest_root(env: Env, entity_type: EntityType) -> String {
    format!("env/{env}/manifests/{}/", entity_type.segment())
}

pub fn manifest_prefix(env: Env, entity_type: EntityType) -> String {
    format!("{}by-id/", manifest_root(env, entity_type))
}

pub fn manifest_path(key: &EntityKey) -> String {
    format!(
        "{}{}{JSON_SUFFIX}",
        manifest_prefix(key.env, key.entity_type),
        key.id
    )
}

pub fn shard_path(env: Env, entity_type: EntityType, shard: u32) -> String {
    format!(
        "{}_index_shard={shard}.ndjson",
        manifest_root(env, entity_type)
    )
}

pub fn compaction_lock_path(env: Env, entity_type: EntityType) -> String {
    format!("{}_compaction.lock", manifest_root(env, entity_type))
}

pub fn index_prefix(env: Env, entity_type: EntityType, dimension: &str) -> String {
    format!("env/{env}/indices/{}/by-{dimension}/", entity_type.segment())
}

pub fn index_bucket_prefix(
    env: Env,
    entity_type: EntityType,
    dimension: &str,
    bucket: &str,
) -> String {
    format!("{}{bucket}/", index_prefix(env, entity_type, dimension))
}

pub fn index_pointer_path(key: &EntityKey, dimension: &str, bucket: &str) -> String {
    format!(
        "{}{}{JSON_SUFFIX}",
        index_bucket_prefix(key.env, key.entity_type, dimension, bucket),
        key.id
    )
}

pub fn rules_prefix(env: Env) -> String {
    format!("env/{env}/rules/")
}

pub fn alert_path(env: Env, rule_id: &str, entity_id: &str, alert_id: &str) -> String {
    format!("env/{env}/reports/alerts/{rule_id}/{entity_id}/{alert_id}{JSON_SUFFIX}")
}

/// Parses `env/{env}/snapshots/{entitySegment}/{id}.json`.
pub fn parse_snapshot_path(name: &str) -> Option<EntityKey> {
    let rest = name.strip_prefix("env/")?;
    let mut parts = rest.split('/');
    let env = parts.next()?.parse::<Env>().ok()?;
    if parts.next()? != "snapshots" {
        return None;
    }
    let entity_type = EntityType::from_segment(parts.next()?)?;
    let file = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let id = file.strip_suffix(JSON_SUFFIX)?;
    validate_id(id).ok()?;
    Some(EntityKey {
        env,
        entity_type,
        id: id.to_string(),
    })
}

/// Extracts the id from `{prefix}{id}.json`, ignoring nested names.
pub fn id_from_object_name<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    let file = name.strip_prefix(prefix)?;
    if file.contains('/') {
        return None;
    }
    file.strip_suffix(JSON_SUFFIX).filter(|id| !id.is_empty())
}

/// Splits `{prefix}{bucket}/{id}.json` for objects listed under an index
/// dimension prefix.
pub fn split_pointer_name<'a>(name: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    let rest = name.strip_prefix(prefix)?;
    let (bucket, file) = rest.split_once('/')?;
    if file.contains('/') {
        return None;
    }
    let id = file.strip_suffix(JSON_SUFFIX)?;
    Some((bucket, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idea(id: &str) -> EntityKey {
        EntityKey::new(Env::Dev, EntityType::Idea, id).unwrap()
    }

    #[test]
    fn builds_documented_shapes() {
        let key = idea("I1");
        assert_eq!(
            history_path(&key, "20250101T000000000000Z-abc"),
            "env/dev/idea/I1/history/20250101T000000000000Z-abc.json"
        );
        assert_eq!(snapshot_path(&key), "env/dev/snapshots/ideas/I1.json");
        assert_eq!(manifest_path(&key), "env/dev/manifests/ideas/by-id/I1.json");
        assert_eq!(
            shard_path(Env::Prod, EntityType::Venture, 7),
            "env/prod/manifests/ventures/_index_shard=7.ndjson"
        );
        assert_eq!(
            index_pointer_path(&key, "status", "new"),
            "env/dev/indices/ideas/by-status/new/I1.json"
        );
        assert_eq!(
            alert_path(Env::Stg, "hot-idea", "I1", "a1"),
            "env/stg/reports/alerts/hot-idea/I1/a1.json"
        );
    }

    #[test]
    fn parses_snapshot_paths_only() {
        let key = parse_snapshot_path("env/dev/snapshots/ideas/I1.json").unwrap();
        assert_eq!(key, idea("I1"));

        assert!(parse_snapshot_path("env/dev/manifests/ideas/by-id/I1.json").is_none());
        assert!(parse_snapshot_path("env/dev/snapshots/invoices/I1.json").is_none());
        assert!(parse_snapshot_path("env/dev/snapshots/ideas/I1.txt").is_none());
        assert!(parse_snapshot_path("env/dev/snapshots/ideas/nested/I1.json").is_none());
        assert!(parse_snapshot_path("env/qa/snapshots/ideas/I1.json").is_none());
    }

    #[test]
    fn splits_pointer_names_under_a_dimension() {
        let prefix = index_prefix(Env::Dev, EntityType::Idea, "status");
        assert_eq!(
            split_pointer_name("env/dev/indices/ideas/by-status/new/I1.json", &prefix),
            Some(("new", "I1"))
        );
        assert_eq!(
            split_pointer_name("env/dev/indices/ideas/by-status/I1.json", &prefix),
            None
        );
        assert_eq!(
            id_from_object_name("env/dev/manifests/ideas/by-id/I9.json", "env/dev/manifests/ideas/by-id/"),
            Some("I9")
        );
    }
}
