//! Roadworks Ingest - road-works open data loader

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use roadworks_common::logging::{init_logging, LogConfig, LogLevel};
use roadworks_common::secrets::{EnvSecretSource, SecretSource};
use roadworks_ingest::config::{WarehouseConfig, MOTHERDUCK_DATABASE, MOTHERDUCK_TOKEN};
use roadworks_ingest::{DuckDbWarehouse, FeedCatalog, FeedDefinition, IngestPipeline, PipelineConfig};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "roadworks-ingest")]
#[command(author, version, about = "Road-works open data ingestion tool")]
struct Cli {
    /// Feed to load
    #[command(subcommand)]
    feed: Feed,

    /// Rows per committed batch
    #[arg(long, global = true, env = "INGEST_BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Rows sampled for schema validation
    #[arg(long, global = true, env = "INGEST_SAMPLE_SIZE")]
    sample_size: Option<usize>,

    /// Load into a local DuckDB file instead of MotherDuck
    #[arg(long, global = true)]
    duckdb_path: Option<PathBuf>,

    /// Hide progress bars
    #[arg(long, global = true)]
    no_progress: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Feed {
    /// Street Manager permits for last month
    PermitsLatest,

    /// Street Manager permits for a range of months
    PermitsHistoric {
        /// Year of the archives
        #[arg(short, long)]
        year: i32,

        /// First month to load (1-12)
        #[arg(short, long, default_value_t = 1)]
        start_month: u32,

        /// Month after the last one to load (13 includes December)
        #[arg(short, long, default_value_t = 13)]
        end_month: u32,
    },

    /// OS Open Linked Identifiers, UPRN to USRN
    LinkedIds,

    /// OS Open USRN street geometries
    OpenUsrns,

    /// OS Open Roads road links
    OpenRoads,

    /// Scottish Road Works Register export
    ScottishPermits {
        /// Export to load: a year (2023), a month of this year (APR) or a
        /// day of this month (15)
        #[arg(short, long)]
        identifier: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging based on verbose flag
    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("roadworks-ingest")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env()?;
    let _guard = init_logging(&log_config)?;

    let config = pipeline_config(&cli)?;
    let catalog = FeedCatalog::new(&config, Local::now().date_naive());

    let feeds: Vec<FeedDefinition> = match cli.feed {
        Feed::PermitsLatest => vec![catalog.permits_latest()],
        Feed::PermitsHistoric {
            year,
            start_month,
            end_month,
        } => catalog.permits_historic(year, start_month, end_month)?,
        Feed::LinkedIds => vec![catalog.linked_ids()],
        Feed::OpenUsrns => vec![catalog.open_usrns()],
        Feed::OpenRoads => vec![catalog.open_roads()],
        Feed::ScottishPermits { identifier } => vec![catalog.scottish_permits(&identifier)?],
    };

    let warehouse_config = match &cli.duckdb_path {
        Some(path) => WarehouseConfig::local(path),
        None => {
            let secrets = EnvSecretSource::new()
                .get_secrets(&[MOTHERDUCK_TOKEN, MOTHERDUCK_DATABASE])
                .context("MotherDuck credentials are required unless --duckdb-path is given")?;
            WarehouseConfig::from_secrets(&secrets).map_err(anyhow::Error::msg)?
        },
    };

    let warehouse = DuckDbWarehouse::connect(&warehouse_config)?;
    let mut pipeline = IngestPipeline::new(warehouse, config);

    for feed in &feeds {
        let report = pipeline
            .run(feed)
            .await
            .with_context(|| format!("Feed {} failed", feed.name))?;

        if !report.errors.is_empty() {
            warn!(feed = %report.feed, skipped = report.errors.len(), "Records left out of the load");
        }
    }

    pipeline.into_warehouse().close()?;
    info!(feeds = feeds.len(), "Ingestion complete");
    Ok(())
}

/// Environment settings overlaid with command-line flags
fn pipeline_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env();

    if let Some(rows) = cli.batch_size {
        config.batch_size = rows;
    }
    if let Some(rows) = cli.sample_size {
        config.sample_size = rows;
    }
    if cli.no_progress {
        config.show_progress = false;
    }

    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}
