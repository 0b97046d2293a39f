use anyhow::{Context, Result};
use clap::Args;

use bucketdb::{
    config::{Config, ConfigUpdate},
    observability,
    server::{self, Role},
};

#[derive(Args)]
pub struct ServeArgs {
    /// Override the configured bucket
    #[arg(long)]
    pub bucket: Option<String>,

    /// Override the configured listen port
    #[arg(long)]
    pub port: Option<u16>,

    /// Push handlers to mount (indices, rules or all)
    #[arg(long, default_value = "all")]
    pub role: Role,
}

pub async fn execute(mut config: Config, args: ServeArgs) -> Result<()> {
    config.apply_update(ConfigUpdate {
        bucket: args.bucket,
        port: args.port,
    });
    config.validate()?;
    observability::init()?;
    server::run(config, args.role)
        .await
        .context("bucketdb service failed")
}
