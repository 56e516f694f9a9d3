//! Change sources.
//!
//! A [`ChangeSource`] exposes the change-log of one source database: its
//! current high-water mark, the earliest position still retained for a
//! table, the changes between two positions, and a chunked snapshot of a
//! table's current contents for bootstrapping.

pub mod mssql;

use async_trait::async_trait;

use crate::change::ChangeBatch;
use crate::config::TableSyncSpec;
use crate::lsn::Lsn;
use crate::{Error, Result};

pub use mssql::{MssqlSource, MssqlSourceFactory};

/// Read position of an in-progress snapshot.
///
/// Chunks are pulled one at a time with [`ChangeSource::next_snapshot_chunk`]
/// and must be handed back with [`ChangeSource::release_snapshot_chunk`]
/// before the next one is requested, so at most one chunk is resident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotCursor {
    pub source_table: String,
    pub order_by: Vec<String>,
    pub chunk_size: usize,
    pub offset: u64,
    pub chunks_read: u64,
    pub exhausted: bool,
    resident: bool,
}

impl SnapshotCursor {
    pub fn new(table: &TableSyncSpec, chunk_size: usize) -> Self {
        Self {
            source_table: table.source_table.clone(),
            order_by: table.primary_key.clone(),
            chunk_size: chunk_size.max(1),
            offset: 0,
            chunks_read: 0,
            exhausted: false,
            resident: false,
        }
    }

    /// Whether a chunk has been handed out and not yet released.
    pub fn is_resident(&self) -> bool {
        self.resident
    }

    /// Checks that the previous chunk was released before a new read.
    pub fn begin_read(&self) -> Result<()> {
        if self.resident {
            return Err(Error::Source {
                message: format!(
                    "snapshot chunk {} of {} requested before the previous one was released",
                    self.chunks_read + 1,
                    self.source_table
                ),
            });
        }
        Ok(())
    }

    /// Records a chunk of `rows` rows as handed out.
    pub fn advance(&mut self, rows: usize) {
        self.offset += rows as u64;
        self.chunks_read += 1;
        self.resident = true;
        if rows < self.chunk_size {
            self.exhausted = true;
        }
    }

    pub fn finish(&mut self) {
        self.exhausted = true;
    }

    pub fn release(&mut self) {
        self.resident = false;
    }
}

#[async_trait]
pub trait ChangeSource: Send {
    /// The source's current change-log high-water mark.
    async fn current_position(&mut self) -> Result<Lsn>;

    /// The earliest position still available for `table`.
    async fn earliest_position(&mut self, table: &TableSyncSpec) -> Result<Lsn>;

    /// All changes in `[start, end]`, both ends inclusive.
    async fn fetch_changes(
        &mut self,
        table: &TableSyncSpec,
        start: &Lsn,
        end: &Lsn,
    ) -> Result<ChangeBatch>;

    /// Starts a chunked read of the table's current contents.
    async fn open_snapshot(
        &mut self,
        table: &TableSyncSpec,
        chunk_size: usize,
    ) -> Result<SnapshotCursor> {
        Ok(SnapshotCursor::new(table, chunk_size))
    }

    /// The next chunk of synthetic insert rows, or `None` when exhausted.
    async fn next_snapshot_chunk(
        &mut self,
        cursor: &mut SnapshotCursor,
    ) -> Result<Option<ChangeBatch>>;

    /// Marks the current chunk as released.
    fn release_snapshot_chunk(&mut self, cursor: &mut SnapshotCursor) {
        cursor.release();
    }
}

/// Opens sources by logical connection id.
#[async_trait]
pub trait SourceFactory: Send + Sync {
    type Source: ChangeSource;

    async fn connect(&self, connection_id: &str) -> Result<Self::Source>;
}
