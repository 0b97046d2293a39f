use anyhow::{Result, bail};
use clap::Args;

use bucketdb::{
    config::Config,
    entity::{EntityKey, EntityType, Env},
    index::IndexWriter,
};

#[derive(Args)]
pub struct ReindexArgs {
    /// Override the configured bucket
    #[arg(long)]
    pub bucket: Option<String>,

    /// Environment partition (dev, stg or prod)
    #[arg(long)]
    pub env: Env,

    /// Entity type to reindex
    #[arg(long)]
    pub entity: EntityType,

    /// Reindex a single entity instead of every snapshot
    #[arg(long)]
    pub id: Option<String>,
}

pub async fn execute(config: Config, args: ReindexArgs) -> Result<()> {
    let store = super::store_for(&config, args.bucket.as_deref())?;
    let writer = IndexWriter::new(store, config.retry);

    match args.id {
        Some(id) => {
            let key = EntityKey::new(args.env, args.entity, id)?;
            let report = writer.reindex(&key).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        None => {
            let summary = writer.reindex_all(args.env, args.entity).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.failed.is_empty() {
                bail!("{} entities failed to reindex", summary.failed.len());
            }
        }
    }
    Ok(())
}
