//! Feed orchestration
//!
//! [`IngestPipeline::run`] takes one feed from archive to warehouse:
//!
//! 1. Create the destination schema and replace the table
//! 2. When the feed has a contract, read a sample from its own stream and
//!    stop if any sampled row breaks it
//! 3. Open the load stream and push every flattened row through a
//!    [`BatchSink`]
//! 4. Commit the tail batch and report
//!
//! Records that cannot be read or flattened are counted and left out; every
//! other failure ends the run.

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{IngestError, Result};
use crate::feeds::FeedDefinition;
use crate::flatten::Flattener;
use crate::record::FlatRow;
use crate::schema::{validate, SchemaContract};
use crate::sink::BatchSink;
use crate::source::{RecordStream, SourceEvent};
use crate::warehouse::{DestinationTable, Warehouse};

/// Outcome of one successful feed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub feed: String,
    pub table: DestinationTable,
    /// Records the reader produced, skipped ones included
    pub records_read: u64,
    pub rows_committed: u64,
    pub batches_committed: u64,
    pub retried_commits: u64,
    /// One line per record left out or degraded
    pub errors: Vec<String>,
}

impl RunReport {
    fn new(feed: &FeedDefinition) -> Self {
        Self {
            feed: feed.name.clone(),
            table: feed.table.clone(),
            records_read: 0,
            rows_committed: 0,
            batches_committed: 0,
            retried_commits: 0,
            errors: Vec::new(),
        }
    }

    fn record_error(&mut self, message: String) {
        self.errors.push(message);
    }
}

/// Runs feeds against one warehouse connection
pub struct IngestPipeline<W: Warehouse> {
    warehouse: W,
    config: PipelineConfig,
}

impl<W: Warehouse> IngestPipeline<W> {
    pub fn new(warehouse: W, config: PipelineConfig) -> Self {
        Self { warehouse, config }
    }

    pub fn warehouse(&self) -> &W {
        &self.warehouse
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn into_warehouse(self) -> W {
        self.warehouse
    }

    fn flattener(&self) -> Flattener {
        Flattener::new(self.config.separator).with_strip_prefix(self.config.strip_prefix.clone())
    }

    /// Load one feed end to end
    ///
    /// Every failure is logged with the number of rows already committed,
    /// which stay in the table.
    pub async fn run(&mut self, feed: &FeedDefinition) -> Result<RunReport> {
        info!(
            feed = %feed.name,
            source = %feed.source.describe(),
            table = %feed.table,
            "Starting feed"
        );

        let mut rows_committed = 0u64;
        let report = match self.load(feed, &mut rows_committed).await {
            Ok(report) => report,
            Err(e) => {
                error!(
                    feed = %feed.name,
                    table = %feed.table,
                    rows_committed,
                    error = %e,
                    "Feed failed, {} rows committed before failure",
                    rows_committed
                );
                return Err(e);
            },
        };

        info!(
            feed = %feed.name,
            table = %feed.table,
            records = report.records_read,
            rows = report.rows_committed,
            batches = report.batches_committed,
            skipped = report.errors.len(),
            "Data for {} has been processed",
            feed.table
        );
        if !report.errors.is_empty() {
            warn!(feed = %feed.name, count = report.errors.len(), "Some records were left out");
        }

        Ok(report)
    }

    /// Provision, check, drain and finish, keeping `rows_committed` current
    async fn load(&mut self, feed: &FeedDefinition, rows_committed: &mut u64) -> Result<RunReport> {
        self.warehouse.provision(&feed.table, &feed.definition).await?;

        let flattener = self.flattener();
        if let Some(contract) = &feed.contract {
            self.check_sample(feed, contract, &flattener).await?;
        }

        let mut stream = feed.source.open().await?;
        let mut report = RunReport::new(feed);
        let mut sink = BatchSink::new(
            &mut self.warehouse,
            feed.table.clone(),
            feed.definition.column_names(),
            self.config.batch_size,
            self.config.retry_policy(),
        );

        let drained = drain(&mut stream, &flattener, &mut sink, &mut report).await;
        *rows_committed = sink.stats().rows_committed;
        drained?;
        drop(stream);

        let stats = sink.finish().await?;
        *rows_committed = stats.rows_committed;

        report.rows_committed = stats.rows_committed;
        report.batches_committed = stats.batches_committed;
        report.retried_commits = stats.retried_commits;
        Ok(report)
    }

    /// Validate the first `sample_size` rows of a fresh stream
    ///
    /// The sample stream is dropped afterwards, which stops its reader.
    async fn check_sample(
        &self,
        feed: &FeedDefinition,
        contract: &SchemaContract,
        flattener: &Flattener,
    ) -> Result<()> {
        let limit = self.config.sample_size;
        let mut stream = feed.source.open().await?;
        let mut sample: Vec<FlatRow> = Vec::with_capacity(limit);

        while sample.len() < limit {
            let Some(event) = stream.next().await else {
                break;
            };

            if let SourceEvent::Record(record) = event? {
                match flattener.flatten(&record) {
                    Ok(row) => sample.push(row),
                    Err(e) => debug!(record = %record.origin, error = %e, "Unreadable record left out of sample"),
                }
            }
        }
        drop(stream);

        let report = validate(&sample, contract);
        if !report.is_empty() {
            error!(feed = %feed.name, report = %report, "Sample failed schema validation");
            return Err(IngestError::SchemaDrift(report));
        }

        info!(feed = %feed.name, rows = report.rows_checked, "Sample passed schema validation");
        Ok(())
    }
}

/// Feed every event of the load stream into the sink
async fn drain<W: Warehouse + ?Sized>(
    stream: &mut RecordStream,
    flattener: &Flattener,
    sink: &mut BatchSink<'_, W>,
    report: &mut RunReport,
) -> Result<()> {
    while let Some(event) = stream.next().await {
        match event? {
            SourceEvent::Record(record) => {
                report.records_read += 1;
                match flattener.flatten(&record) {
                    Ok(row) => sink.push(row).await?,
                    Err(e) => {
                        warn!(record = %record.origin, error = %e, "Skipping record that could not be flattened");
                        report.record_error(format!("{}: {}", record.origin, e));
                    },
                }
            },
            SourceEvent::Skipped { origin, reason } => {
                report.records_read += 1;
                report.record_error(format!("{}: {}", origin, reason));
            },
            SourceEvent::Warning { origin, message } => {
                report.record_error(format!("{}: {}", origin, message));
            },
        }
    }
    Ok(())
}
