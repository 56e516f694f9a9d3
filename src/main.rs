use anyhow::Context;
use clap::Parser;
use mssql_cdc_sync::progress::{self, ProgressStore};
use mssql_cdc_sync::source::MssqlSourceFactory;
use mssql_cdc_sync::warehouse::BigQueryWarehouse;
use mssql_cdc_sync::{Config, Replicator};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "mssql-cdc-sync")]
#[command(about = "Replicate SQL Server CDC changes into BigQuery", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(long, value_name = "ID", help = "Only sync tables on this source connection")]
    connection: Option<String>,

    #[arg(
        long,
        value_name = "TABLE_KEY",
        help = "Delete the stored progress of dataset.table and exit"
    )]
    reset_state: Option<String>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting mssql-cdc-sync");
    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e).context("loading configuration");
        }
    };

    let progress = progress::open(&config.state)
        .await
        .context("opening progress store")?;

    if let Some(table_key) = &args.reset_state {
        progress.delete_position(table_key).await?;
        info!(table = %table_key, "Progress reset; next run starts from the earliest change");
        return Ok(());
    }

    info!(
        sources = ?config.sources.keys().collect::<Vec<_>>(),
        project = %config.warehouse.project_id,
        tables = config.tables.len(),
        chunk_size = config.sync.chunk_size,
        connection = ?args.connection,
        "Configuration summary"
    );

    let warehouse = BigQueryWarehouse::new(&config.warehouse)
        .await
        .context("connecting to BigQuery")?;
    let factory = MssqlSourceFactory::new(config.sources.clone());
    let replicator = Replicator::new(factory, warehouse, progress, config.sync.chunk_size);

    let report = replicator
        .run_once(&config.tables, args.connection.as_deref())
        .await;

    for failure in &report.failed {
        error!(table = %failure.table_key, "{}", failure.error);
    }
    info!(
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        "Sync finished"
    );

    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("mssql_cdc_sync=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("mssql_cdc_sync=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
