use anyhow::{Context, Result};
use clap::Parser;
use docsync::config::DrainPolicy;
use docsync::{Config, Coordinator, ElasticsearchClient, FieldMapper, JsonlStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "docsync")]
#[command(about = "Replicate document collections into a search index")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "docsync.toml")]
    config: PathBuf,

    /// Stop each collection once it is caught up instead of polling forever
    #[arg(long)]
    once: bool,

    /// Database to read from (overrides config and DOCSYNC_DB)
    #[arg(long)]
    database: Option<String>,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    write_config: bool,
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.observability.log_level.clone()),
    );
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| config.observability.log_format.clone());

    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn install_metrics(addr: &str) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics address '{}'", addr))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    tracing::info!("Prometheus metrics on http://{}/metrics", addr);
    Ok(())
}

/// Effective config for this invocation. `--write-config` skips the
/// `DOCSYNC_*` environment so credentials are never written to the file.
fn load_config(args: &Args) -> Result<Config> {
    let loaded = if args.write_config {
        Config::load(&args.config)
    } else {
        Config::load_with_env(&args.config)
    };
    let mut config = loaded.with_context(|| format!("failed to load {}", args.config.display()))?;
    if args.once {
        config.source.drain_policy = DrainPolicy::Stop;
    }
    if let Some(database) = &args.database {
        config.source.database = database.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args)?;
    init_tracing(&config);
    if !args.config.exists() {
        tracing::info!("Config {} not found, using defaults", args.config.display());
    }

    if args.write_config {
        config.save(&args.config)?;
        tracing::info!("Wrote config to {}", args.config.display());
        return Ok(());
    }

    config.ensure_dirs()?;
    if let Some(addr) = &config.observability.metrics_addr {
        install_metrics(addr)?;
    }

    tracing::info!(
        database = %config.source.database,
        source = %config.source.root.display(),
        index = ?config.index.addresses,
        "Starting docsync"
    );

    let store = Arc::new(JsonlStore::new(&config.source.root));
    let index = Arc::new(ElasticsearchClient::new(&config.index)?);
    let mapper = FieldMapper::load(&config)?;
    let coordinator = Coordinator::new(config, store, index, mapper);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, finishing in-flight batches");
            on_signal.cancel();
        }
    });

    let report = coordinator.run(cancel).await?;
    for (name, collection) in &report.collections {
        tracing::info!(
            collection = %name,
            fetched = collection.fetched,
            indexed = collection.indexed,
            failed = collection.failed,
            rejected = collection.rejected,
            offset = collection.offset,
            status = ?collection.status,
            "collection summary"
        );
    }

    let failed = report.failed_collections();
    if !failed.is_empty() {
        anyhow::bail!("collections failed: {}", failed.join(", "));
    }
    Ok(())
}
