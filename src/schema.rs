//! Staged column layout and warehouse typing.
//!
//! The column set of a replicated table is only known once the first batch
//! arrives, so a [`StagingSchema`] is built from that batch and passed along
//! explicitly to every later staging write and to the merge.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::change::Value;

pub const START_LSN_COLUMN: &str = "cdc_start_lsn";
pub const SEQVAL_COLUMN: &str = "cdc_seqval";
pub const OPERATION_COLUMN: &str = "cdc_operation";
pub const UPDATE_MASK_COLUMN: &str = "cdc_update_mask";
pub const SYNCED_AT_COLUMN: &str = "cdc_synced_at";

/// Metadata columns written ahead of the business columns, in order.
pub const LEADING_METADATA_COLUMNS: [&str; 4] = [
    START_LSN_COLUMN,
    SEQVAL_COLUMN,
    OPERATION_COLUMN,
    UPDATE_MASK_COLUMN,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int64,
    Float64,
    Numeric,
    Bool,
    String,
    Date,
    Time,
    DateTime,
    /// No non-null value was seen; the backend picks a type.
    Untyped,
}

impl ColumnType {
    /// Type of a single value, `None` for nulls.
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Bool),
            Value::Int(_) => Some(ColumnType::Int64),
            Value::Float(_) => Some(ColumnType::Float64),
            Value::Decimal(_) => Some(ColumnType::Numeric),
            Value::String(_) | Value::Bytes(_) => Some(ColumnType::String),
            Value::Date(_) => Some(ColumnType::Date),
            Value::Time(_) => Some(ColumnType::Time),
            Value::DateTime(_) | Value::Timestamp(_) => Some(ColumnType::DateTime),
        }
    }

    /// Fixed types of the metadata columns; `None` for business columns.
    pub fn for_metadata(name: &str) -> Option<Self> {
        match name {
            OPERATION_COLUMN => Some(ColumnType::Int64),
            START_LSN_COLUMN | SEQVAL_COLUMN | UPDATE_MASK_COLUMN => Some(ColumnType::String),
            SYNCED_AT_COLUMN => Some(ColumnType::DateTime),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Int64 => "int64",
            ColumnType::Float64 => "float64",
            ColumnType::Numeric => "numeric",
            ColumnType::Bool => "bool",
            ColumnType::String => "string",
            ColumnType::Date => "date",
            ColumnType::Time => "time",
            ColumnType::DateTime => "datetime",
            ColumnType::Untyped => "untyped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingColumn {
    pub name: String,
    pub ty: ColumnType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingSchema {
    pub columns: Vec<StagingColumn>,
}

impl StagingSchema {
    /// Infers column types from already-cleaned rows.
    ///
    /// Metadata columns get their fixed type; every other column takes the
    /// type of its first non-null value.
    pub fn infer(names: &[String], rows: &[Vec<Value>]) -> Self {
        Self::infer_with(names, &[], rows)
    }

    /// Like [`StagingSchema::infer`], but a type the source declared for a
    /// column (`declared[idx]`) wins over what its values suggest, so a
    /// column that is null in every row still gets its real type.
    pub fn infer_with(
        names: &[String],
        declared: &[Option<ColumnType>],
        rows: &[Vec<Value>],
    ) -> Self {
        let columns = names
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let ty = ColumnType::for_metadata(name)
                    .or_else(|| declared.get(idx).copied().flatten())
                    .unwrap_or_else(|| {
                        rows.iter()
                            .filter_map(|row| row.get(idx))
                            .find_map(ColumnType::of)
                            .unwrap_or(ColumnType::Untyped)
                    });
                StagingColumn {
                    name: name.clone(),
                    ty,
                }
            })
            .collect();

        Self { columns }
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Resolves a configured column name to the staged spelling, ignoring case.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .or_else(|| {
                self.columns
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(name))
            })
            .map(|c| c.name.as_str())
    }
}
