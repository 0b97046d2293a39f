use std::{
    fs,
    io::{self, Read},
    path::PathBuf,
};

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use serde_json::Value;

use bucketdb::{
    config::Config,
    document::DocumentStore,
    entity::{EntityKey, EntityType, Env},
};

#[derive(Subcommand)]
pub enum DocCommands {
    /// Record a payload and make it current when it is newer
    Put(DocPutArgs),
    /// Print the current snapshot
    Get(DocTarget),
    /// Print every recorded payload in write order
    History(DocTarget),
}

#[derive(Args)]
pub struct DocTarget {
    /// Override the configured bucket
    #[arg(long)]
    pub bucket: Option<String>,

    /// Environment partition (dev, stg or prod)
    #[arg(long)]
    pub env: Env,

    /// Entity type
    #[arg(long)]
    pub entity: EntityType,

    /// Entity id
    #[arg(long)]
    pub id: String,
}

#[derive(Args)]
pub struct DocPutArgs {
    #[command(flatten)]
    pub target: DocTarget,

    /// JSON payload file; reads stdin when omitted
    #[arg(long)]
    pub file: Option<PathBuf>,
}

impl DocTarget {
    fn key(&self) -> Result<EntityKey> {
        Ok(EntityKey::new(self.env, self.entity, self.id.clone())?)
    }

    fn documents(&self, config: &Config) -> Result<DocumentStore> {
        let store = super::store_for(config, self.bucket.as_deref())?;
        Ok(DocumentStore::new(store, config.retry))
    }
}

pub async fn execute(config: Config, command: DocCommands) -> Result<()> {
    match command {
        DocCommands::Put(args) => {
            let key = args.target.key()?;
            let payload = read_payload(args.file.as_ref())?;
            let outcome = args.target.documents(&config)?.write(&key, &payload).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        DocCommands::Get(target) => {
            let key = target.key()?;
            match target.documents(&config)?.get(&key).await? {
                Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot.to_value())?),
                None => bail!("no snapshot for {key}"),
            }
        }
        DocCommands::History(target) => {
            let key = target.key()?;
            let records = target.documents(&config)?.history(&key).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }
    Ok(())
}

fn read_payload(file: Option<&PathBuf>) -> Result<Value> {
    let contents = match file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read payload from stdin")?;
            buffer
        }
    };
    serde_json::from_str(&contents).context("payload is not valid JSON")
}
