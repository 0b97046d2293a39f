pub mod compact;
pub mod document;
pub mod reindex;
pub mod serve;

use anyhow::{Context, Result};
use bucketdb::{
    config::Config,
    object_store::{SharedStore, open_store},
};

/// `--bucket` wins over the configured bucket.
pub(crate) fn store_for(config: &Config, bucket: Option<&str>) -> Result<SharedStore> {
    let bucket = bucket.unwrap_or(&config.bucket);
    open_store(bucket, &config.gcp).with_context(|| format!("failed to open bucket {bucket}"))
}
