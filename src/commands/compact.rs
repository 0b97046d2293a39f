use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Args;

use bucketdb::{
    compactor::{CompactionReport, CompactionRequest, ManifestCompactor, parse_since},
    config::Config,
    entity::{EntityType, Env},
};

#[derive(Args)]
pub struct CompactArgs {
    /// Bucket to compact (gs://name, file:///dir or memory://)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Environment partition (dev, stg or prod)
    #[arg(long)]
    pub env: Env,

    /// Entity type whose manifests are compacted
    #[arg(long)]
    pub entity: EntityType,

    /// Number of shards ids are hashed into
    #[arg(long, default_value_t = 256, value_parser = clap::value_parser!(u32).range(1..))]
    pub shards: u32,

    /// Only merge manifests updated since an RFC 3339 instant or a relative
    /// age such as 6h, 2d or 30m; omit to rebuild every shard
    #[arg(long)]
    pub since: Option<String>,

    /// Emit the full report as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

pub async fn execute(config: Config, args: CompactArgs) -> Result<()> {
    let since = args
        .since
        .as_deref()
        .map(|raw| parse_since(raw, Utc::now()))
        .transpose()
        .context("invalid --since")?;

    let store = super::store_for(&config, args.bucket.as_deref())?;
    let compactor = ManifestCompactor::new(store, config.retry, config.compactor.clone());
    let report = compactor
        .run(CompactionRequest {
            env: args.env,
            entity_type: args.entity,
            shards: args.shards,
            since,
        })
        .await
        .with_context(|| format!("compaction of {} {} failed", args.env, args.entity))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    let failed = report.failed_shards();
    if failed > 0 {
        bail!("{failed} shard(s) failed to compact");
    }
    Ok(())
}

fn print_report(report: &CompactionReport) {
    for shard in &report.shards {
        match &shard.error {
            Some(error) => println!(
                "shard {:>4}  failed     {}  ({error})",
                shard.shard, shard.path
            ),
            None => println!(
                "shard {:>4}  {:<9}  manifests={} changed={}  {}",
                shard.shard,
                format!("{:?}", shard.status).to_ascii_lowercase(),
                shard.manifests,
                shard.changed,
                shard.path
            ),
        }
    }
    println!(
        "{} {}: {:?} compaction, {} listed, {} selected, {} shard(s) touched, {} failed",
        report.env,
        report.entity_type,
        report.mode,
        report.listed,
        report.selected,
        report.shards.len(),
        report.failed_shards()
    );
}
