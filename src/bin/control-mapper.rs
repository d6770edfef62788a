#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use control_mapper::cache::{default_path, BatchCache, JsonlBatchCache, SqliteBatchCache};
use control_mapper::gateway::{GatewayConfig, ProviderGateway, TracingUsageSink};
use control_mapper::trace::{JsonlTraceSink, TraceSink};
use control_mapper::{
    load_config_from_path, map_requirements, Catalog, CatalogEntry,
    GatewayInferenceClient, MapperConfig, Requirement, RunOptions, SharedCatalog,
    TierLadderPolicy,
};

#[derive(Parser)]
#[command(name = "control-mapper", version, about = "Map compliance requirements onto check functions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Map a requirements file against a catalog (LLM calls)
    Map {
        #[arg(long)]
        requirements: PathBuf,
        /// Catalog seed: a JSON list of entries or of bare names
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// Where to write the catalog after the run
        #[arg(long)]
        catalog_out: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        /// `.sqlite`/`.db` selects the SQLite backend, anything else JSONL
        #[arg(long)]
        cache: Option<PathBuf>,
        #[arg(long)]
        trace: Option<PathBuf>,
    },
    /// Export a SQLite cache to replayable JSONL
    CacheExport {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Validate a config file and print the effective settings
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogSeed {
    Entries(Vec<CatalogEntry>),
    Names(Vec<String>),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "control_mapper=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Map {
            requirements,
            catalog,
            out,
            catalog_out,
            config,
            cache,
            trace,
        } => {
            let config = load_config(config.as_deref())?;
            let requirements: Vec<Requirement> = read_json(&requirements)?;
            let catalog = match read_json::<CatalogSeed>(&catalog)? {
                CatalogSeed::Entries(entries) => Catalog::from_entries(entries)?,
                CatalogSeed::Names(names) => Catalog::from_names(names)?,
            };
            let catalog = SharedCatalog::new(catalog);

            let cache_path = cache.unwrap_or_else(default_path);
            let (cache, _lock): (Box<dyn BatchCache>, _) = if is_sqlite(&cache_path) {
                let cache = SqliteBatchCache::new(&cache_path)?;
                let lock = cache.lock_exclusive()?;
                (Box::new(cache), Some(lock))
            } else {
                let cache = JsonlBatchCache::open(&cache_path)?;
                let stats = cache.replay_stats();
                info!(
                    path = %cache_path.display(),
                    entries = cache.len(),
                    skipped = stats.skipped,
                    "cache replayed"
                );
                let lock = cache.lock_exclusive()?;
                (Box::new(cache), lock)
            };

            let (trace_sink, trace_worker) = if let Some(path) = trace {
                let (sink, worker) = JsonlTraceSink::new(path)?;
                (Some(sink), Some(worker))
            } else {
                (None, None)
            };
            let trace_ref = trace_sink.as_ref().map(|sink| sink as &dyn TraceSink);

            let cancel = Arc::new(AtomicBool::new(false));
            {
                let cancel = Arc::clone(&cancel);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("interrupt received; finishing in-flight batches");
                        cancel.store(true, Ordering::Relaxed);
                    }
                });
            }

            let usage = Arc::new(TracingUsageSink::new());
            let gateway = ProviderGateway::from_env(Arc::clone(&usage), GatewayConfig::default())?;
            let client = GatewayInferenceClient::new(Arc::new(gateway)).with_caller("control-mapper::map");
            let policy = Arc::new(TierLadderPolicy::from_config(&config.escalation));

            let run = map_requirements(
                &client,
                &catalog,
                &requirements,
                &config,
                RunOptions {
                    cache: Some(cache.as_ref()),
                    trace: trace_ref,
                    cancel_flag: Some(cancel.as_ref()),
                    policy: Some(policy),
                },
            )
            .await?;

            write_json(&out, &run)?;
            if let Some(path) = catalog_out {
                let snapshot = catalog.snapshot();
                let entries: Vec<&CatalogEntry> = snapshot.entries().collect();
                write_json(&path, &entries)?;
            }

            drop(trace_sink);
            if let Some(worker) = trace_worker {
                worker.join()?;
            }

            let totals = usage.totals();
            info!(
                calls = totals.calls,
                failed = totals.failed_calls,
                input_tokens = totals.input_tokens,
                output_tokens = totals.output_tokens,
                cost_usd = totals.cost_usd(),
                "provider usage"
            );
            eprintln!("{}", serde_json::to_string_pretty(&run.summary)?);
        }
        Commands::CacheExport { db, out } => {
            let cache = SqliteBatchCache::new(db)?;
            let _lock = cache.lock_exclusive()?;
            let rows = cache.export_jsonl(&out).await?;
            info!(rows, out = %out.display(), "cache exported");
        }
        Commands::CheckConfig { config } => {
            let config = load_config(config.as_deref())?;
            let policy = TierLadderPolicy::from_config(&config.escalation);
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!("{policy}");
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<MapperConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => load_config_from_path(path)?,
        None => MapperConfig::default(),
    };
    let config = config.with_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn is_sqlite(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("sqlite" | "sqlite3" | "db")
    )
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}
