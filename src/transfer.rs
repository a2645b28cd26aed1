// ABOUTME: Batch transfer engine - streams source rows into fixed-size target batches
// ABOUTME: One bulk insert per full batch plus a final partial batch, no retries

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::info;

use crate::value::Row;

/// Rows per bulk-insert submission.
pub const BULK_ROWS: usize = 100;

/// Lazy, forward-only producer of rows from the last executed query.
#[async_trait]
pub trait RowSource: Send {
    /// Next row, or `None` once the cursor is exhausted.
    async fn next_row(&mut self) -> Result<Option<Row>>;
}

/// Consumer applying rows through a previously prepared insert statement.
#[async_trait]
pub trait RowSink: Send {
    /// Submit all `rows` as one bulk insert, returning the rows processed.
    async fn execute_many(&mut self, rows: &[Row]) -> Result<u64>;
}

/// Statistics from a transfer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferStats {
    /// Rows reported as processed by the target
    pub rows: u64,
    /// Non-empty batches submitted
    pub batches: usize,
    pub elapsed: Duration,
}

/// Moves rows from a [`RowSource`] to a [`RowSink`] in fixed-size batches.
///
/// Reading and writing are interleaved step by step: the source is not read
/// ahead while a batch is being submitted. A failed submission aborts the
/// transfer; batches already submitted stay with the sink, uncommitted.
#[derive(Debug, Clone, Copy)]
pub struct BatchTransfer {
    batch_size: usize,
}

impl Default for BatchTransfer {
    fn default() -> Self {
        Self {
            batch_size: BULK_ROWS,
        }
    }
}

impl BatchTransfer {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Drain `source` into `sink`.
    pub async fn run<S, K>(&self, source: &mut S, sink: &mut K) -> Result<TransferStats>
    where
        S: RowSource + ?Sized,
        K: RowSink + ?Sized,
    {
        let start = Instant::now();
        let mut stats = TransferStats::default();
        let mut batch: Vec<Row> = Vec::with_capacity(self.batch_size);

        while let Some(row) = source
            .next_row()
            .await
            .context("Failed to fetch row from source")?
        {
            batch.push(row);
            if batch.len() == self.batch_size {
                self.submit(sink, &batch, &mut stats).await?;
                batch.clear();
            }
        }

        self.submit(sink, &batch, &mut stats).await?;

        stats.elapsed = start.elapsed();
        Ok(stats)
    }

    async fn submit<K>(&self, sink: &mut K, rows: &[Row], stats: &mut TransferStats) -> Result<u64>
    where
        K: RowSink + ?Sized,
    {
        if rows.is_empty() {
            info!("Empty set - nothing to insert");
            return Ok(0);
        }

        let processed = sink.execute_many(rows).await.with_context(|| {
            format!(
                "Failed to insert batch of {} rows after {} rows were processed",
                rows.len(),
                stats.rows
            )
        })?;

        stats.rows += processed;
        stats.batches += 1;
        info!("{} rows processed", stats.rows);

        Ok(processed)
    }
}
