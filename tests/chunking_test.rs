use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use mssql_cdc_sync::change::{ChangeBatch, ChangeRow, Value};
use mssql_cdc_sync::clean::StagingBatch;
use mssql_cdc_sync::config::TableSyncSpec;
use mssql_cdc_sync::lsn::Lsn;
use mssql_cdc_sync::memory::MemoryProgressStore;
use mssql_cdc_sync::progress::ProgressStore;
use mssql_cdc_sync::reconcile::MergeMode;
use mssql_cdc_sync::replicator::CycleMode;
use mssql_cdc_sync::schema::StagingSchema;
use mssql_cdc_sync::source::{ChangeSource, SnapshotCursor, SourceFactory};
use mssql_cdc_sync::warehouse::Warehouse;
use mssql_cdc_sync::{Error, Replicator, Result};

const CHUNK_SIZE: usize = 50_000;
const TOTAL_ROWS: usize = 10 * CHUNK_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Read(u64),
    Release(u64),
    Stage { rows: usize, replace: bool },
    Merge,
}

type EventLog = Arc<Mutex<Vec<Event>>>;

/// Generates snapshot rows on demand instead of holding the table.
#[derive(Clone)]
struct GeneratedSource {
    total: usize,
    /// Column names per chunk index; the last entry repeats.
    layouts: Vec<Vec<String>>,
    log: EventLog,
    resident: Arc<Mutex<(usize, usize)>>,
}

impl GeneratedSource {
    fn new(total: usize, log: EventLog) -> Self {
        Self {
            total,
            layouts: vec![vec!["id".to_string(), "name".to_string()]],
            log,
            resident: Arc::new(Mutex::new((0, 0))),
        }
    }

    fn max_resident(&self) -> usize {
        self.resident.lock().unwrap().1
    }
}

#[async_trait]
impl ChangeSource for GeneratedSource {
    async fn current_position(&mut self) -> Result<Lsn> {
        Ok(Lsn::from_u64(0x99))
    }

    async fn earliest_position(&mut self, _table: &TableSyncSpec) -> Result<Lsn> {
        Ok(Lsn::from_u64(1))
    }

    async fn fetch_changes(
        &mut self,
        _table: &TableSyncSpec,
        _start: &Lsn,
        _end: &Lsn,
    ) -> Result<ChangeBatch> {
        Ok(ChangeBatch::default())
    }

    async fn next_snapshot_chunk(
        &mut self,
        cursor: &mut SnapshotCursor,
    ) -> Result<Option<ChangeBatch>> {
        cursor.begin_read()?;
        let start = cursor.offset as usize;
        if cursor.exhausted || start >= self.total {
            cursor.finish();
            return Ok(None);
        }

        let end = (start + cursor.chunk_size).min(self.total);
        let index = (cursor.chunks_read as usize).min(self.layouts.len() - 1);
        let mut batch = ChangeBatch::new(self.layouts[index].clone());
        batch.rows = (start..end)
            .map(|i| {
                ChangeRow::snapshot(vec![Value::Int(i as i64), Value::from(format!("row-{}", i))])
            })
            .collect();

        cursor.advance(batch.len());
        {
            let mut resident = self.resident.lock().unwrap();
            resident.0 += 1;
            resident.1 = resident.1.max(resident.0);
        }
        self.log.lock().unwrap().push(Event::Read(cursor.chunks_read));
        Ok(Some(batch))
    }

    fn release_snapshot_chunk(&mut self, cursor: &mut SnapshotCursor) {
        self.resident.lock().unwrap().0 -= 1;
        self.log.lock().unwrap().push(Event::Release(cursor.chunks_read));
        cursor.release();
    }
}

struct GeneratedFactory {
    source: GeneratedSource,
}

#[async_trait]
impl SourceFactory for GeneratedFactory {
    type Source = GeneratedSource;

    async fn connect(&self, _connection_id: &str) -> Result<GeneratedSource> {
        Ok(self.source.clone())
    }
}

/// Records staging writes and merges without keeping any rows.
struct CountingWarehouse {
    log: EventLog,
    staged_rows: Arc<Mutex<usize>>,
}

#[async_trait]
impl Warehouse for CountingWarehouse {
    async fn table_exists(&self, _dataset: &str, _table: &str) -> Result<bool> {
        Ok(false)
    }

    async fn write_staging_chunk(
        &self,
        batch: &StagingBatch,
        _dataset: &str,
        _table: &str,
        replace: bool,
    ) -> Result<()> {
        *self.staged_rows.lock().unwrap() += batch.len();
        self.log.lock().unwrap().push(Event::Stage {
            rows: batch.len(),
            replace,
        });
        Ok(())
    }

    async fn merge(
        &self,
        _dataset: &str,
        _table: &str,
        _key_columns: &[String],
        _schema: &StagingSchema,
    ) -> Result<MergeMode> {
        self.log.lock().unwrap().push(Event::Merge);
        Ok(MergeMode::CreateTable)
    }
}

fn big_table() -> TableSyncSpec {
    TableSyncSpec::new("dbo.big", "lake", "big", &["id"])
}

#[tokio::test]
async fn test_bootstrap_holds_one_chunk_at_a_time() {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let source = GeneratedSource::new(TOTAL_ROWS, log.clone());
    let staged_rows = Arc::new(Mutex::new(0));
    let warehouse = CountingWarehouse {
        log: log.clone(),
        staged_rows: staged_rows.clone(),
    };
    let progress = MemoryProgressStore::new();
    let replicator = Replicator::new(
        GeneratedFactory {
            source: source.clone(),
        },
        warehouse,
        progress.clone(),
        CHUNK_SIZE,
    );

    let report = replicator.run_once(&[big_table()], None).await;
    assert!(report.is_success(), "{:?}", report.failed);

    let outcome = report.outcome("lake.big").unwrap();
    assert_eq!(outcome.mode, CycleMode::Bootstrap);
    assert_eq!(outcome.rows_staged, TOTAL_ROWS as u64);
    assert_eq!(*staged_rows.lock().unwrap(), TOTAL_ROWS);
    assert_eq!(source.max_resident(), 1);

    let mut expected = Vec::new();
    for chunk in 1..=10u64 {
        expected.push(Event::Read(chunk));
        expected.push(Event::Stage {
            rows: CHUNK_SIZE,
            replace: chunk == 1,
        });
        expected.push(Event::Release(chunk));
    }
    expected.push(Event::Merge);
    assert_eq!(*log.lock().unwrap(), expected);

    assert_eq!(
        progress.get_position("lake.big").await.unwrap(),
        Some(Lsn::from_u64(0x99))
    );
}

#[tokio::test]
async fn test_partial_last_chunk_ends_the_snapshot() {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let source = GeneratedSource::new(25, log.clone());
    let replicator = Replicator::new(
        GeneratedFactory { source },
        CountingWarehouse {
            log: log.clone(),
            staged_rows: Arc::new(Mutex::new(0)),
        },
        MemoryProgressStore::new(),
        10,
    );

    let report = replicator.run_once(&[big_table()], None).await;
    assert_eq!(report.outcome("lake.big").unwrap().rows_staged, 25);

    let reads = log
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, Event::Read(_)))
        .count();
    assert_eq!(reads, 3);
}

#[tokio::test]
async fn test_column_change_between_chunks_fails_the_table() {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let mut source = GeneratedSource::new(30, log.clone());
    source.layouts.push(vec!["id".to_string(), "full_name".to_string()]);
    let progress = MemoryProgressStore::new();
    let replicator = Replicator::new(
        GeneratedFactory { source },
        CountingWarehouse {
            log: log.clone(),
            staged_rows: Arc::new(Mutex::new(0)),
        },
        progress.clone(),
        10,
    );

    let report = replicator.run_once(&[big_table()], None).await;
    let failure = report.failure("lake.big").unwrap();
    assert!(failure.error.contains("schema changed"), "{}", failure.error);
    assert!(!log.lock().unwrap().contains(&Event::Merge));
    assert!(progress.get_position("lake.big").await.unwrap().is_none());
}

#[tokio::test]
async fn test_reading_before_release_is_rejected() {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let mut source = GeneratedSource::new(30, log);
    let mut cursor = source.open_snapshot(&big_table(), 10).await.unwrap();

    assert!(source.next_snapshot_chunk(&mut cursor).await.unwrap().is_some());
    let err = source.next_snapshot_chunk(&mut cursor).await.unwrap_err();
    assert!(matches!(err, Error::Source { .. }));

    source.release_snapshot_chunk(&mut cursor);
    assert!(source.next_snapshot_chunk(&mut cursor).await.unwrap().is_some());
}
