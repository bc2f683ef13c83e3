use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use refsync_core::UpdateMode;
use refsync_extract::{CountryTable, MappingSet, COUNTRY_FEED_URL};
use refsync_fetch::{AuthorityFetcher, FetchConfig};
use refsync_sync::{
    CancelFlag, HttpResourceStore, RepositoryConfig, SyncParams, SyncPipeline,
};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "refsync")]
#[command(about = "IdRef authority reconciliation for web content repositories")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync against the configured repository.
    Run(RunArgs),
    /// Serve the web surface.
    Serve,
    /// Validate the mapping definitions and print their groups.
    CheckMappings {
        /// Mapping definition file overriding the bundled one.
        #[arg(long)]
        mapping_file: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Job file with the same fields as the flags, in YAML.
    #[arg(long)]
    job: Option<PathBuf>,

    /// Update mode: append or replace.
    #[arg(long, default_value = "append")]
    mode: String,

    /// Repository filter as key=value, repeatable.
    #[arg(long = "query", value_name = "KEY=VALUE")]
    query: Vec<String>,

    /// Property term to update, repeatable; "all" for no restriction.
    #[arg(long = "property", value_name = "TERM")]
    properties: Vec<String>,

    /// Datatype to consider on the URI property, repeatable; "all" for every
    /// managed datatype.
    #[arg(long = "datatype", value_name = "NAME")]
    datatypes: Vec<String>,

    /// Property holding the authority record link.
    #[arg(long, default_value = "dcterms:creator")]
    property_uri: String,

    /// Mapping group used when the record category has none.
    #[arg(long)]
    mapping_key: Option<String>,

    /// Mapping definition file overriding the bundled one.
    #[arg(long)]
    mapping_file: Option<PathBuf>,

    /// Base URL of the repository API.
    #[arg(long, default_value = "http://localhost/omeka")]
    api_base_url: String,

    /// Resource kind to search, e.g. items.
    #[arg(long, default_value = "items")]
    api_resource: String,

    #[arg(long)]
    key_identity: Option<String>,

    #[arg(long)]
    key_credential: Option<String>,
}

/// YAML shape of a job file; fields mirror the run flags.
#[derive(Debug, Deserialize)]
struct JobFile {
    mode: String,
    #[serde(default)]
    query: Vec<(String, String)>,
    properties: Vec<String>,
    #[serde(default)]
    datatypes: Vec<String>,
    property_uri: String,
    #[serde(default)]
    mapping_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Serve => refsync_web::serve_from_env().await,
        Commands::CheckMappings { mapping_file } => check_mappings(mapping_file),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let params = match &args.job {
        Some(path) => {
            let yaml = std::fs::read_to_string(path)
                .with_context(|| format!("reading job file {}", path.display()))?;
            let job: JobFile = serde_yaml::from_str(&yaml)
                .with_context(|| format!("parsing job file {}", path.display()))?;
            SyncParams {
                mode: job.mode.parse::<UpdateMode>()?,
                query: job.query,
                properties: job.properties,
                datatypes: job.datatypes,
                property_uri: job.property_uri,
                mapping_key: job.mapping_key,
            }
        }
        None => SyncParams {
            mode: args.mode.parse::<UpdateMode>()?,
            query: args
                .query
                .iter()
                .map(|pair| parse_query_pair(pair))
                .collect::<Result<_>>()?,
            properties: if args.properties.is_empty() {
                vec!["all".to_string()]
            } else {
                args.properties.clone()
            },
            datatypes: args.datatypes.clone(),
            property_uri: args.property_uri.clone(),
            mapping_key: args.mapping_key.clone(),
        },
    };

    let mappings = match &args.mapping_file {
        Some(path) => MappingSet::from_path(path)?,
        None => MappingSet::bundled()?,
    };
    let countries = CountryTable::load(COUNTRY_FEED_URL, Duration::from_secs(20)).await;

    let store = HttpResourceStore::new(RepositoryConfig {
        base_url: args.api_base_url.clone(),
        resource_name: args.api_resource.clone(),
        key_identity: args.key_identity.clone(),
        key_credential: args.key_credential.clone(),
        ..RepositoryConfig::default()
    })?;

    let cancel = CancelFlag::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping at the next item boundary");
            signal_cancel.cancel();
        }
    });

    let fetcher = AuthorityFetcher::new(FetchConfig::default())?;
    let pipeline = SyncPipeline::new(&store, fetcher, mappings, countries, cancel);
    let summary = pipeline.run(&params).await?;

    println!(
        "sync {}: {}/{} processed, {} updated, {} unchanged, {} failed, {} skipped{}",
        summary.run_id,
        summary.processed,
        summary.total_expected,
        summary.succeeded,
        summary.no_new_data,
        summary.failed,
        summary.skipped,
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    Ok(())
}

fn parse_query_pair(pair: &str) -> Result<(String, String)> {
    let (key, value) = pair
        .split_once('=')
        .with_context(|| format!("query filter {pair:?} is not key=value"))?;
    Ok((key.to_string(), value.to_string()))
}

fn check_mappings(mapping_file: Option<PathBuf>) -> Result<()> {
    let mappings = match &mapping_file {
        Some(path) => MappingSet::from_path(path)?,
        None => MappingSet::bundled()?,
    };
    for (group, maps) in mappings.group_summaries() {
        println!("{group}: {maps} field maps");
    }
    let countries = CountryTable::bundled();
    println!("country table: {} entries", countries.len());
    Ok(())
}
