//! Reconciliation of staged change rows into a target table.
//!
//! A [`MergePlan`] describes what a merge does without saying how: which
//! columns identify a row, which ones get overwritten, how duplicate change
//! rows for one key are ranked, and which operation code marks a delete.
//! Warehouse backends either render it to SQL or execute it directly.

use std::collections::HashMap;

use crate::change::{Operation, Value};
use crate::schema::{
    StagingSchema, OPERATION_COLUMN, SEQVAL_COLUMN, START_LSN_COLUMN, SYNCED_AT_COLUMN,
};
use crate::{Error, Result};

/// Which branch a merge took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// The target did not exist and was created from the deduplicated rows.
    CreateTable,
    /// Deduplicated rows were merged into an existing target.
    MergeInto,
}

impl std::fmt::Display for MergeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeMode::CreateTable => f.write_str("create"),
            MergeMode::MergeInto => f.write_str("merge"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub mode: MergeMode,
    /// Business key columns, spelled as in the staged schema.
    pub key_columns: Vec<String>,
    /// Columns overwritten on a matched key: everything but the keys.
    pub update_columns: Vec<String>,
    /// Columns written for a new key: every staged column.
    pub insert_columns: Vec<String>,
    /// Ranking columns, most significant first, all descending.
    pub order_columns: Vec<String>,
    pub operation_column: String,
    pub delete_code: i64,
    /// Date partitioning column for a created target.
    pub partition_column: String,
}

impl MergePlan {
    /// Builds the plan for merging rows staged with `schema`.
    ///
    /// Configured key names are matched to staged columns ignoring case; a
    /// key that matches nothing fails with [`Error::UnknownKeyColumn`].
    pub fn build(
        table_key: &str,
        key_columns: &[String],
        schema: &StagingSchema,
        target_exists: bool,
    ) -> Result<Self> {
        if key_columns.is_empty() {
            return Err(Error::MissingSetting {
                table: table_key.to_string(),
                field: "primary_key".to_string(),
            });
        }

        let keys = key_columns
            .iter()
            .map(|k| {
                schema
                    .resolve(k)
                    .map(str::to_string)
                    .ok_or_else(|| Error::UnknownKeyColumn {
                        table: table_key.to_string(),
                        column: k.clone(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let insert_columns = schema.names();
        let update_columns = insert_columns
            .iter()
            .filter(|c| !keys.contains(c))
            .cloned()
            .collect();

        Ok(Self {
            mode: if target_exists {
                MergeMode::MergeInto
            } else {
                MergeMode::CreateTable
            },
            key_columns: keys,
            update_columns,
            insert_columns,
            order_columns: vec![START_LSN_COLUMN.to_string(), SEQVAL_COLUMN.to_string()],
            operation_column: OPERATION_COLUMN.to_string(),
            delete_code: Operation::Delete.code(),
            partition_column: SYNCED_AT_COLUMN.to_string(),
        })
    }

    /// Positions of `columns` within `schema`.
    fn positions(&self, schema: &StagingSchema, columns: &[String]) -> Result<Vec<usize>> {
        columns
            .iter()
            .map(|c| {
                schema.position(c).ok_or_else(|| Error::Warehouse {
                    message: format!("column '{}' is not staged", c),
                })
            })
            .collect()
    }

    /// Whether a staged row is a delete.
    pub fn is_delete(&self, schema: &StagingSchema, row: &[Value]) -> bool {
        schema
            .position(&self.operation_column)
            .and_then(|idx| row.get(idx))
            .and_then(Value::as_i64)
            == Some(self.delete_code)
    }

    /// Identity of the row's business key.
    pub fn key_of(&self, schema: &StagingSchema, row: &[Value]) -> Result<Vec<String>> {
        Ok(self
            .positions(schema, &self.key_columns)?
            .into_iter()
            .map(|idx| row.get(idx).unwrap_or(&Value::Null).key_text())
            .collect())
    }

    /// Keeps the highest ranked row per business key.
    ///
    /// Keys come back in order of first appearance. On an exact tie of the
    /// ranking columns the row staged last wins.
    pub fn latest_per_key(
        &self,
        schema: &StagingSchema,
        rows: Vec<Vec<Value>>,
    ) -> Result<Vec<Vec<Value>>> {
        let order = self.positions(schema, &self.order_columns)?;
        let rank = |row: &[Value]| -> Vec<String> {
            order
                .iter()
                .map(|&idx| row.get(idx).map(Value::to_string).unwrap_or_default())
                .collect()
        };

        let mut slots: HashMap<Vec<String>, usize> = HashMap::new();
        let mut winners: Vec<Vec<Value>> = Vec::new();

        for row in rows {
            let key = self.key_of(schema, &row)?;
            match slots.get(&key) {
                Some(&slot) => {
                    if rank(&row) >= rank(&winners[slot]) {
                        winners[slot] = row;
                    }
                }
                None => {
                    slots.insert(key, winners.len());
                    winners.push(row);
                }
            }
        }

        Ok(winners)
    }
}
