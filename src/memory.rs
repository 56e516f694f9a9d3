//! In-memory implementations of the source, warehouse and progress store.
//!
//! These run the whole replication cycle without external services. The
//! warehouse executes [`MergePlan`]s row by row, so its behavior is the
//! reference the SQL rendering is checked against. It types its tables the
//! way BigQuery does and rejects merges whose staged types disagree with the
//! target.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::change::{ChangeBatch, ChangeRow, Value};
use crate::clean::StagingBatch;
use crate::config::TableSyncSpec;
use crate::lsn::Lsn;
use crate::progress::ProgressStore;
use crate::reconcile::{MergeMode, MergePlan};
use crate::schema::{ColumnType, StagingSchema};
use crate::source::{ChangeSource, SnapshotCursor, SourceFactory};
use crate::warehouse::{encoding, sql, Warehouse};
use crate::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default)]
struct SourceTable {
    columns: Vec<String>,
    column_types: Vec<Option<ColumnType>>,
    rows: Vec<Vec<Value>>,
    changes: Vec<ChangeRow>,
    earliest: Option<Lsn>,
}

#[derive(Debug, Default)]
struct SourceState {
    high_water: Option<Lsn>,
    tables: HashMap<String, SourceTable>,
    fetches: Vec<FetchCall>,
}

/// A recorded `fetch_changes` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub source_table: String,
    pub start: Lsn,
    pub end: Lsn,
}

/// A change source backed by tables held in memory.
///
/// Clones share state, so a test can keep a handle and keep adding changes
/// while the replicator owns another.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<SourceState>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_high_water(&self, lsn: Lsn) {
        lock(&self.state).high_water = Some(lsn);
    }

    /// Declares `source_table` with its business columns.
    pub fn add_table(&self, source_table: &str, columns: &[&str]) {
        lock(&self.state).tables.insert(
            source_table.to_string(),
            SourceTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                ..SourceTable::default()
            },
        );
    }

    /// Declares the source types of the table's columns, in column order.
    pub fn set_column_types(&self, source_table: &str, types: &[Option<ColumnType>]) {
        let mut state = lock(&self.state);
        state
            .tables
            .entry(source_table.to_string())
            .or_default()
            .column_types = types.to_vec();
    }

    /// Adds a row to the table's current contents.
    pub fn insert_row(&self, source_table: &str, values: Vec<Value>) {
        let mut state = lock(&self.state);
        state
            .tables
            .entry(source_table.to_string())
            .or_default()
            .rows
            .push(values);
    }

    /// Records a captured change for the table.
    pub fn push_change(&self, source_table: &str, change: ChangeRow) {
        let mut state = lock(&self.state);
        state
            .tables
            .entry(source_table.to_string())
            .or_default()
            .changes
            .push(change);
    }

    /// Overrides the earliest retained position of the table, which
    /// otherwise is its lowest change position (or the high-water mark
    /// when it has no changes).
    pub fn set_earliest(&self, source_table: &str, lsn: Lsn) {
        let mut state = lock(&self.state);
        state
            .tables
            .entry(source_table.to_string())
            .or_default()
            .earliest = Some(lsn);
    }

    pub fn fetches(&self) -> Vec<FetchCall> {
        lock(&self.state).fetches.clone()
    }

    /// An empty batch carrying the table's columns and declared types.
    fn empty_batch(&self, source_table: &str) -> Result<ChangeBatch> {
        lock(&self.state)
            .tables
            .get(source_table)
            .map(|t| {
                ChangeBatch::new(t.columns.clone()).with_column_types(t.column_types.clone())
            })
            .ok_or_else(|| Error::Source {
                message: format!("unknown source table {}", source_table),
            })
    }
}

#[async_trait]
impl ChangeSource for MemorySource {
    async fn current_position(&mut self) -> Result<Lsn> {
        lock(&self.state).high_water.clone().ok_or_else(|| Error::Source {
            message: "no maximum LSN; CDC is not enabled".to_string(),
        })
    }

    async fn earliest_position(&mut self, table: &TableSyncSpec) -> Result<Lsn> {
        let earliest = {
            let state = lock(&self.state);
            state.tables.get(&table.source_table).and_then(|t| {
                t.earliest
                    .clone()
                    .or_else(|| t.changes.iter().map(|c| c.start_lsn.clone()).min())
                    .or_else(|| state.high_water.clone())
            })
        };
        earliest.ok_or_else(|| Error::Source {
            message: format!(
                "capture instance '{}' for {} does not exist",
                table.capture_instance(),
                table.source_table
            ),
        })
    }

    async fn fetch_changes(
        &mut self,
        table: &TableSyncSpec,
        start: &Lsn,
        end: &Lsn,
    ) -> Result<ChangeBatch> {
        let mut batch = self.empty_batch(&table.source_table)?;
        let mut state = lock(&self.state);
        state.fetches.push(FetchCall {
            source_table: table.source_table.clone(),
            start: start.clone(),
            end: end.clone(),
        });

        let mut rows: Vec<ChangeRow> = state
            .tables
            .get(&table.source_table)
            .map(|t| {
                t.changes
                    .iter()
                    .filter(|c| &c.start_lsn >= start && &c.start_lsn <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| (&a.start_lsn, &a.seqval).cmp(&(&b.start_lsn, &b.seqval)));

        batch.rows = rows;
        Ok(batch)
    }

    async fn next_snapshot_chunk(
        &mut self,
        cursor: &mut SnapshotCursor,
    ) -> Result<Option<ChangeBatch>> {
        cursor.begin_read()?;
        if cursor.exhausted {
            return Ok(None);
        }

        let mut batch = self.empty_batch(&cursor.source_table)?;
        let rows: Vec<ChangeRow> = {
            let state = lock(&self.state);
            let all = state
                .tables
                .get(&cursor.source_table)
                .map(|t| t.rows.as_slice())
                .unwrap_or_default();
            let start = (cursor.offset as usize).min(all.len());
            let end = (start + cursor.chunk_size).min(all.len());
            all[start..end]
                .iter()
                .cloned()
                .map(ChangeRow::snapshot)
                .collect()
        };

        if rows.is_empty() {
            cursor.finish();
            return Ok(None);
        }
        cursor.advance(rows.len());
        batch.rows = rows;
        Ok(Some(batch))
    }
}

/// Hands out [`MemorySource`] handles by connection id.
#[derive(Debug, Clone, Default)]
pub struct MemorySourceFactory {
    sources: HashMap<String, MemorySource>,
    connects: Arc<Mutex<Vec<String>>>,
}

impl MemorySourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, connection_id: &str, source: MemorySource) -> Self {
        self.sources.insert(connection_id.to_string(), source);
        self
    }

    /// Connection ids in the order they were connected.
    pub fn connects(&self) -> Vec<String> {
        lock(&self.connects).clone()
    }
}

#[async_trait]
impl SourceFactory for MemorySourceFactory {
    type Source = MemorySource;

    async fn connect(&self, connection_id: &str) -> Result<MemorySource> {
        lock(&self.connects).push(connection_id.to_string());
        self.sources
            .get(connection_id)
            .cloned()
            .ok_or_else(|| Error::MissingSetting {
                table: format!("connection '{}'", connection_id),
                field: format!("sources.{}", connection_id),
            })
    }
}

/// Column names, BigQuery column types and rows of an in-memory table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableData {
    pub columns: Vec<String>,
    pub types: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl TableData {
    /// BigQuery type of `column`.
    pub fn type_of(&self, column: &str) -> Option<&str> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        self.types.get(idx).map(String::as_str)
    }

    /// Column types keyed by lowercase name, as INFORMATION_SCHEMA reports them.
    fn known_types(&self) -> HashMap<String, String> {
        self.columns
            .iter()
            .map(|c| c.to_lowercase())
            .zip(self.types.iter().cloned())
            .collect()
    }

    /// Values of `column` across all rows, in row order.
    pub fn column(&self, column: &str) -> Vec<Value> {
        match self.columns.iter().position(|c| c.eq_ignore_ascii_case(column)) {
            Some(idx) => self.rows.iter().map(|r| r[idx].clone()).collect(),
            None => Vec::new(),
        }
    }

    /// The first row whose `column` equals `value`.
    pub fn find(&self, column: &str, value: &Value) -> Option<&Vec<Value>> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        self.rows.iter().find(|r| &r[idx] == value)
    }

    /// Value of `column` in `row`.
    pub fn value<'a>(&self, row: &'a [Value], column: &str) -> Option<&'a Value> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        row.get(idx)
    }
}

/// Something the in-memory warehouse did, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseEvent {
    Staged {
        table: String,
        rows: usize,
        replace: bool,
    },
    Merged {
        table: String,
        mode: MergeMode,
    },
}

#[derive(Debug, Default)]
struct WarehouseState {
    tables: HashMap<String, TableData>,
    staging: HashMap<String, TableData>,
    failing_merges: HashSet<String>,
    events: Vec<WarehouseEvent>,
}

/// A warehouse holding its tables in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<Mutex<WarehouseState>>,
}

fn table_id(dataset: &str, table: &str) -> String {
    format!("{}.{}", dataset, table)
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, dataset: &str, table: &str) -> Option<TableData> {
        lock(&self.state).tables.get(&table_id(dataset, table)).cloned()
    }

    pub fn staged(&self, dataset: &str, table: &str) -> Option<TableData> {
        lock(&self.state).staging.get(&table_id(dataset, table)).cloned()
    }

    /// Makes every merge into `dataset.table` fail.
    pub fn fail_merge_for(&self, dataset: &str, table: &str) {
        lock(&self.state)
            .failing_merges
            .insert(table_id(dataset, table));
    }

    pub fn events(&self) -> Vec<WarehouseEvent> {
        lock(&self.state).events.clone()
    }
}

fn positions(columns: &[String], wanted: &[String], table: &str) -> Result<Vec<usize>> {
    wanted
        .iter()
        .map(|w| {
            columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(w))
                .ok_or_else(|| Error::Warehouse {
                    message: format!("column '{}' does not exist in {}", w, table),
                })
        })
        .collect()
}

fn key_of(row: &[Value], key_positions: &[usize]) -> Vec<String> {
    key_positions
        .iter()
        .map(|&idx| row.get(idx).unwrap_or(&Value::Null).key_text())
        .collect()
}

/// Fails like a MERGE would when a staged column feeds a target column of a
/// different type.
fn check_assignable(
    staged: &TableData,
    target: &TableData,
    columns: &[String],
    table: &str,
) -> Result<()> {
    for column in columns {
        if let (Some(from), Some(to)) = (staged.type_of(column), target.type_of(column)) {
            if !from.eq_ignore_ascii_case(to) {
                return Err(Error::Warehouse {
                    message: format!(
                        "cannot assign {} to column '{}' of type {} in {}",
                        from, column, to, table
                    ),
                });
            }
        }
    }
    Ok(())
}

/// Applies deduplicated `winners` to `target` following `plan`.
fn merge_into(
    plan: &MergePlan,
    schema: &StagingSchema,
    target: &TableData,
    winners: Vec<Vec<Value>>,
    table: &str,
) -> Result<TableData> {
    let staged_keys = positions(&schema.names(), &plan.key_columns, table)?;
    let target_keys = positions(&target.columns, &plan.key_columns, table)?;
    let update_from = positions(&schema.names(), &plan.update_columns, table)?;
    let update_to = positions(&target.columns, &plan.update_columns, table)?;
    let insert_to = positions(&target.columns, &plan.insert_columns, table)?;

    let mut rows: Vec<Option<Vec<Value>>> = target.rows.iter().cloned().map(Some).collect();
    let mut index: HashMap<Vec<String>, usize> = rows
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.as_ref().map(|r| (key_of(r, &target_keys), i)))
        .collect();

    for winner in winners {
        let key = key_of(&winner, &staged_keys);
        let delete = plan.is_delete(schema, &winner);
        match index.get(&key).copied() {
            Some(idx) if delete => {
                rows[idx] = None;
                index.remove(&key);
            }
            Some(idx) => {
                if let Some(row) = rows[idx].as_mut() {
                    for (&from, &to) in update_from.iter().zip(&update_to) {
                        row[to] = winner[from].clone();
                    }
                }
            }
            None if delete => {}
            None => {
                let mut row = vec![Value::Null; target.columns.len()];
                for (from, &to) in insert_to.iter().enumerate() {
                    row[to] = winner[from].clone();
                }
                index.insert(key, rows.len());
                rows.push(Some(row));
            }
        }
    }

    Ok(TableData {
        columns: target.columns.clone(),
        types: target.types.clone(),
        rows: rows.into_iter().flatten().collect(),
    })
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn table_exists(&self, dataset: &str, table: &str) -> Result<bool> {
        Ok(lock(&self.state)
            .tables
            .contains_key(&table_id(dataset, table)))
    }

    async fn write_staging_chunk(
        &self,
        batch: &StagingBatch,
        dataset: &str,
        table: &str,
        replace: bool,
    ) -> Result<()> {
        let id = table_id(dataset, table);
        let mut state = lock(&self.state);

        let known = state
            .tables
            .get(&id)
            .map(TableData::known_types)
            .unwrap_or_default();
        let staged = state.staging.entry(id.clone()).or_default();
        if replace {
            *staged = TableData {
                columns: batch.schema.names(),
                types: sql::resolve_types(&batch.schema, &known),
                rows: Vec::new(),
            };
        } else if staged.columns != batch.schema.names() {
            return Err(Error::Warehouse {
                message: format!("appended chunk does not match staging layout of {}", id),
            });
        }
        encoding::encode_rows(&staged.types, &batch.rows)?;
        staged.rows.extend(batch.rows.iter().cloned());

        state.events.push(WarehouseEvent::Staged {
            table: id,
            rows: batch.len(),
            replace,
        });
        Ok(())
    }

    async fn merge(
        &self,
        dataset: &str,
        table: &str,
        key_columns: &[String],
        schema: &StagingSchema,
    ) -> Result<MergeMode> {
        let id = table_id(dataset, table);
        let mut state = lock(&self.state);

        if state.failing_merges.contains(&id) {
            return Err(Error::Warehouse {
                message: format!("merge into {} rejected", id),
            });
        }

        let exists = state.tables.contains_key(&id);
        let plan = MergePlan::build(&id, key_columns, schema, exists)?;
        let mut staged = state.staging.get(&id).cloned().unwrap_or_default();
        let winners = plan.latest_per_key(schema, std::mem::take(&mut staged.rows))?;

        let merged = match plan.mode {
            MergeMode::CreateTable => TableData {
                columns: schema.names(),
                types: staged.types.clone(),
                rows: winners
                    .into_iter()
                    .filter(|row| !plan.is_delete(schema, row))
                    .collect(),
            },
            MergeMode::MergeInto => {
                let target = state.tables.get(&id).cloned().unwrap_or_default();
                check_assignable(&staged, &target, &plan.update_columns, &id)?;
                check_assignable(&staged, &target, &plan.insert_columns, &id)?;
                merge_into(&plan, schema, &target, winners, &id)?
            }
        };

        state.tables.insert(id.clone(), merged);
        state.events.push(WarehouseEvent::Merged {
            table: id,
            mode: plan.mode,
        });
        Ok(plan.mode)
    }
}

/// Progress kept in a map, with every save recorded.
#[derive(Debug, Clone, Default)]
pub struct MemoryProgressStore {
    positions: Arc<Mutex<HashMap<String, Lsn>>>,
    saves: Arc<Mutex<Vec<(String, Lsn)>>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `save_position` call so far, in order.
    pub fn saves(&self) -> Vec<(String, Lsn)> {
        lock(&self.saves).clone()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn get_position(&self, table_key: &str) -> Result<Option<Lsn>> {
        Ok(lock(&self.positions).get(table_key).cloned())
    }

    async fn save_position(&self, table_key: &str, lsn: &Lsn) -> Result<()> {
        lock(&self.positions).insert(table_key.to_string(), lsn.clone());
        lock(&self.saves).push((table_key.to_string(), lsn.clone()));
        Ok(())
    }

    async fn delete_position(&self, table_key: &str) -> Result<()> {
        lock(&self.positions).remove(table_key);
        Ok(())
    }
}
