//! Roadworks Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Streaming batch ingestion of UK road-works open data into DuckDB or
//! MotherDuck.
//!
//! # Supported Feeds
//!
//! - **Street Manager**: monthly permit event archives (zip of JSON documents)
//! - **OS Open Linked Identifiers**: UPRN to USRN links (zipped CSV)
//! - **OS Open USRN** and **OS Open Roads**: street and road geometries
//!   (zipped GeoPackage)
//! - **Scottish Road Works Register**: register exports (zip of CSV files
//!   behind a presigned link)
//!
//! Records are read one at a time, flattened into column/value rows, checked
//! against a data contract on a sample, and committed in bounded batches.
//!
//! # Example
//!
//! ```no_run
//! use chrono::Local;
//! use roadworks_ingest::{DuckDbWarehouse, FeedCatalog, IngestPipeline, PipelineConfig};
//! use roadworks_ingest::config::WarehouseConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::from_env();
//!     let warehouse = DuckDbWarehouse::connect(&WarehouseConfig::local("./roadworks.duckdb"))?;
//!
//!     let feed = FeedCatalog::new(&config, Local::now().date_naive()).permits_latest();
//!     let report = IngestPipeline::new(warehouse, config).run(&feed).await?;
//!     println!("{} rows loaded", report.rows_committed);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod feeds;
pub mod flatten;
pub mod pipeline;
pub mod record;
pub mod retry;
pub mod schema;
pub mod sink;
pub mod source;
pub mod warehouse;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::{IngestError, Result};
pub use feeds::{FeedCatalog, FeedDefinition};
pub use pipeline::{IngestPipeline, RunReport};
pub use record::{FlatRow, Scalar};
pub use warehouse::{DuckDbWarehouse, Warehouse};
