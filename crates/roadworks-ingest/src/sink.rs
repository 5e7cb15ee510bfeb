//! Batch accumulation and committing
//!
//! [`BatchSink`] holds at most one batch of rows. When the batch reaches its
//! limit it is converted to a column table and handed to the warehouse, with
//! bounded retries and exponential backoff. [`BatchSink::finish`] commits the
//! partial tail batch at the end of a stream.

use tracing::{error, info, warn};

use crate::batch::Batch;
use crate::error::{IngestError, Result};
use crate::record::FlatRow;
use crate::retry::RetryPolicy;
use crate::warehouse::{DestinationTable, Warehouse};

/// Counters for one sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub rows_committed: u64,
    pub batches_committed: u64,
    /// Commits that needed more than one attempt
    pub retried_commits: u64,
}

/// Accumulates rows and commits them to one destination table
pub struct BatchSink<'w, W: Warehouse + ?Sized> {
    warehouse: &'w mut W,
    table: DestinationTable,
    column_order: Vec<String>,
    policy: RetryPolicy,
    batch: Batch,
    stats: SinkStats,
}

impl<'w, W: Warehouse + ?Sized> BatchSink<'w, W> {
    /// `column_order` fixes the column positions of every batch this sink builds
    pub fn new(
        warehouse: &'w mut W,
        table: DestinationTable,
        column_order: Vec<String>,
        batch_size: usize,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            warehouse,
            table,
            column_order,
            policy,
            batch: Batch::new(batch_size),
            stats: SinkStats::default(),
        }
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    /// Rows waiting for the next commit
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// Add a row, committing the batch once it is full
    pub async fn push(&mut self, row: FlatRow) -> Result<()> {
        if self.batch.push(row) {
            self.commit().await?;
        }
        Ok(())
    }

    /// Commit whatever is left and return the final counters
    pub async fn finish(mut self) -> Result<SinkStats> {
        if !self.batch.is_empty() {
            self.commit().await?;
        }
        Ok(self.stats)
    }

    /// Commit the current batch, retrying the same contents on failure
    async fn commit(&mut self) -> Result<()> {
        let columnar = self.batch.to_columnar(&self.column_order);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match self.warehouse.insert_batch(&self.table, &columnar).await {
                Ok(rows) => {
                    if attempt > 1 {
                        self.stats.retried_commits += 1;
                        info!(
                            table = %self.table,
                            rows,
                            attempt,
                            "Batch commit succeeded on attempt {}",
                            attempt
                        );
                    }

                    self.stats.rows_committed += rows;
                    self.stats.batches_committed += 1;
                    self.batch.clear();

                    info!(
                        table = %self.table,
                        batch = self.stats.batches_committed,
                        batch_rows = rows,
                        total_rows = self.stats.rows_committed,
                        "Batch committed"
                    );
                    return Ok(());
                },
                Err(e) if self.policy.should_retry(attempt) => {
                    let wait = self.policy.delay_for(attempt - 1);
                    warn!(
                        table = %self.table,
                        error = %e,
                        "Commit attempt {}/{} failed, retrying in {:?}",
                        attempt,
                        self.policy.max_attempts,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                },
                Err(e) => {
                    error!(
                        table = %self.table,
                        rows = self.batch.len(),
                        error = %e,
                        "Commit failed after {} attempts",
                        attempt
                    );
                    return Err(IngestError::RetryExhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                },
            }
        }
    }
}
