//! Per-table replication cycles.
//!
//! One [`Replicator::run_once`] call walks the configured tables in order.
//! Each table is either bootstrapped (its target does not exist yet) or
//! brought forward incrementally from its committed position, and the
//! source's high-water mark is committed only once the cycle succeeded. A
//! failing table is logged and reported; the remaining tables still run.

use chrono::Utc;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::clean::clean_batch;
use crate::config::TableSyncSpec;
use crate::lsn::Lsn;
use crate::progress::ProgressStore;
use crate::reconcile::MergeMode;
use crate::schema::StagingSchema;
use crate::source::{ChangeSource, SourceFactory};
use crate::warehouse::Warehouse;
use crate::Result;

/// How a table's cycle loaded its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    /// Full snapshot into a target that did not exist.
    Bootstrap,
    /// Changes since the committed position.
    Incremental,
}

impl fmt::Display for CycleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleMode::Bootstrap => f.write_str("bootstrap"),
            CycleMode::Incremental => f.write_str("incremental"),
        }
    }
}

/// Result of one successful table cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOutcome {
    pub table_key: String,
    pub mode: CycleMode,
    pub rows_staged: u64,
    /// Merge branch taken, `None` when there was nothing to merge.
    pub merge: Option<MergeMode>,
    pub committed: Lsn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFailure {
    pub table_key: String,
    pub error: String,
}

/// Summary of a whole run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub succeeded: Vec<TableOutcome>,
    pub failed: Vec<TableFailure>,
    /// Tables left out because they are inactive or not selected.
    pub skipped: usize,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn outcome(&self, table_key: &str) -> Option<&TableOutcome> {
        self.succeeded.iter().find(|o| o.table_key == table_key)
    }

    pub fn failure(&self, table_key: &str) -> Option<&TableFailure> {
        self.failed.iter().find(|f| f.table_key == table_key)
    }
}

/// Sources opened during one run, by connection id.
///
/// Connections are made on first use. A failed connect is not remembered,
/// so the next table on the same connection tries again.
pub struct SourceCache<S> {
    sources: HashMap<String, S>,
}

impl<S: ChangeSource> SourceCache<S> {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
        }
    }

    pub async fn get<F>(&mut self, factory: &F, connection_id: &str) -> Result<&mut S>
    where
        F: SourceFactory<Source = S>,
    {
        match self.sources.entry(connection_id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let source = factory.connect(connection_id).await?;
                info!(connection = %connection_id, "Opened change source");
                Ok(entry.insert(source))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl<S: ChangeSource> Default for SourceCache<S> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Replicator<F, W, P> {
    factory: F,
    warehouse: W,
    progress: P,
    chunk_size: usize,
}

impl<F, W, P> Replicator<F, W, P>
where
    F: SourceFactory,
    W: Warehouse,
    P: ProgressStore,
{
    pub fn new(factory: F, warehouse: W, progress: P, chunk_size: usize) -> Self {
        Self {
            factory,
            warehouse,
            progress,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Runs one cycle for every active table matching `selector`.
    ///
    /// Per-table errors end up in the report; this never fails as a whole.
    pub async fn run_once(&self, tables: &[TableSyncSpec], selector: Option<&str>) -> RunReport {
        let started = Instant::now();
        let mut cache = SourceCache::new();
        let mut report = RunReport::default();

        for table in tables {
            if !table.is_selected(selector) {
                debug!(table = %table.table_key(), "Skipping table");
                report.skipped += 1;
                continue;
            }

            match self.sync_table(&mut cache, table).await {
                Ok(outcome) => report.succeeded.push(outcome),
                Err(e) => {
                    error!(table = %table.table_key(), error = %e, "Table sync failed");
                    report.failed.push(TableFailure {
                        table_key: table.table_key(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped,
            connections = cache.len(),
            duration_ms = report.duration_ms,
            "Run finished"
        );
        report
    }

    async fn sync_table(
        &self,
        cache: &mut SourceCache<F::Source>,
        table: &TableSyncSpec,
    ) -> Result<TableOutcome> {
        let table_key = table.table_key();
        let source = cache.get(&self.factory, table.connection_id()).await?;

        let high_water = source.current_position().await?;
        let exists = self
            .warehouse
            .table_exists(&table.dataset, &table.table)
            .await?;

        info!(
            table = %table_key,
            source = %table.source_table,
            high_water = %high_water,
            target_exists = exists,
            "Starting table cycle"
        );

        let (mode, rows_staged, merge) = if exists {
            let (rows, merge) = self.incremental(source, table, &high_water).await?;
            (CycleMode::Incremental, rows, merge)
        } else {
            let (rows, merge) = self.bootstrap(source, table).await?;
            (CycleMode::Bootstrap, rows, merge)
        };

        self.progress.save_position(&table_key, &high_water).await?;
        info!(
            table = %table_key,
            mode = %mode,
            rows = rows_staged,
            committed = %high_water,
            "Table cycle committed"
        );

        Ok(TableOutcome {
            table_key,
            mode,
            rows_staged,
            merge,
            committed: high_water,
        })
    }

    /// Streams the source table into staging one chunk at a time, then
    /// creates the target from it.
    async fn bootstrap(
        &self,
        source: &mut F::Source,
        table: &TableSyncSpec,
    ) -> Result<(u64, Option<MergeMode>)> {
        let table_key = table.table_key();
        let mut cursor = source.open_snapshot(table, self.chunk_size).await?;
        let mut schema: Option<StagingSchema> = None;
        let mut rows = 0u64;

        while let Some(chunk) = source.next_snapshot_chunk(&mut cursor).await? {
            let staged = clean_batch(chunk, Utc::now().naive_utc());
            if let Some(expected) = &schema {
                staged.ensure_layout(expected, &table_key)?;
            }

            let replace = schema.is_none();
            self.warehouse
                .write_staging_chunk(&staged, &table.dataset, &table.table, replace)
                .await?;
            rows += staged.len() as u64;
            debug!(
                table = %table_key,
                chunk = cursor.chunks_read,
                rows = staged.len(),
                "Staged snapshot chunk"
            );

            if schema.is_none() {
                schema = Some(staged.schema);
            }
            source.release_snapshot_chunk(&mut cursor);
        }

        let Some(schema) = schema else {
            warn!(table = %table_key, "Source table is empty; target not created");
            return Ok((0, None));
        };

        let mode = self
            .warehouse
            .merge(&table.dataset, &table.table, &table.primary_key, &schema)
            .await?;
        Ok((rows, Some(mode)))
    }

    /// Stages and merges the changes between the committed position and
    /// `high_water`.
    async fn incremental(
        &self,
        source: &mut F::Source,
        table: &TableSyncSpec,
        high_water: &Lsn,
    ) -> Result<(u64, Option<MergeMode>)> {
        let table_key = table.table_key();

        let from = match self.progress.get_position(&table_key).await? {
            Some(committed) if committed == *high_water => {
                debug!(table = %table_key, "Already at high-water mark");
                return Ok((0, None));
            }
            Some(committed) if committed > *high_water => {
                warn!(
                    table = %table_key,
                    committed = %committed,
                    high_water = %high_water,
                    "Committed position is ahead of the source; was the source restored?"
                );
                return Ok((0, None));
            }
            Some(committed) => committed.next(),
            None => {
                let earliest = source.earliest_position(table).await?;
                info!(
                    table = %table_key,
                    earliest = %earliest,
                    "No committed position; starting from earliest available change"
                );
                earliest
            }
        };

        let batch = source.fetch_changes(table, &from, high_water).await?;
        if batch.is_empty() {
            info!(table = %table_key, "No new changes");
            return Ok((0, None));
        }

        let staged = clean_batch(batch, Utc::now().naive_utc());
        let rows = staged.len() as u64;
        self.warehouse
            .write_staging_chunk(&staged, &table.dataset, &table.table, true)
            .await?;

        let mode = self
            .warehouse
            .merge(&table.dataset, &table.table, &table.primary_key, &staged.schema)
            .await?;
        Ok((rows, Some(mode)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySource, MemorySourceFactory};

    #[tokio::test]
    async fn test_cache_connects_once_per_connection() {
        let factory = MemorySourceFactory::new()
            .with_source("default", MemorySource::new())
            .with_source("crm", MemorySource::new());
        let mut cache = SourceCache::new();

        cache.get(&factory, "default").await.unwrap();
        cache.get(&factory, "default").await.unwrap();
        cache.get(&factory, "crm").await.unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(factory.connects(), vec!["default", "crm"]);
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_cached() {
        let factory = MemorySourceFactory::new();
        let mut cache = SourceCache::new();

        assert!(cache.get(&factory, "missing").await.is_err());
        assert!(cache.get(&factory, "missing").await.is_err());

        assert!(cache.is_empty());
        assert_eq!(factory.connects().len(), 2);
    }
}
