pub mod planner;
pub mod writer;

pub use planner::{
    Cleanup, IndexDimension, IndexPlan, IndexPointer, Plan, bucket_value, dimensions_for, plan,
    score_bucket,
};
pub use writer::{IndexOutcome, IndexReport, IndexWriter, ReindexSummary};

use crate::{
    entity::{EntityType, Env},
    error::{Result, StoreError},
    object_store::{ObjectStore, read_json},
    paths,
};

/// Reads every pointer filed under one bucket of a dimension, sorted by id.
pub async fn read_bucket(
    store: &dyn ObjectStore,
    env: Env,
    entity_type: EntityType,
    dimension: &str,
    bucket: &str,
) -> Result<Vec<IndexPointer>> {
    if planner::dimension(entity_type, dimension).is_none() {
        return Err(StoreError::InvalidPath(format!(
            "{entity_type} has no '{dimension}' index"
        )));
    }
    let bucket = bucket_value(bucket)
        .ok_or_else(|| StoreError::InvalidPath(format!("'{bucket}' is not a bucket value")))?;
    let prefix = paths::index_bucket_prefix(env, entity_type, dimension, &bucket);

    let mut pointers = Vec::new();
    for object in store.list(&prefix).await? {
        if paths::id_from_object_name(&object.name, &prefix).is_none() {
            continue;
        }
        if let Some((pointer, _)) = read_json::<IndexPointer>(store, &object.name).await? {
            pointers.push(pointer);
        }
    }
    pointers.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
    Ok(pointers)
}
