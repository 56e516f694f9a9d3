use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::lsn::Lsn;
use crate::schema::ColumnType;
use crate::{Error, Result};

/// SQL Server `__$operation` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Delete,
    Insert,
    UpdateBefore,
    UpdateAfter,
}

impl Operation {
    pub fn code(self) -> i64 {
        match self {
            Operation::Delete => 1,
            Operation::Insert => 2,
            Operation::UpdateBefore => 3,
            Operation::UpdateAfter => 4,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(Operation::Delete),
            2 => Ok(Operation::Insert),
            3 => Ok(Operation::UpdateBefore),
            4 => Ok(Operation::UpdateAfter),
            other => Err(Error::Source {
                message: format!("unknown CDC operation code {}", other),
            }),
        }
    }
}

/// A single dynamically typed cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Exact numerics are carried as their decimal text.
    Decimal(String),
    String(String),
    Bytes(Bytes),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Text used to compare business keys for equality. The type tag keeps
    /// `1` and `"1"` apart.
    pub fn key_text(&self) -> String {
        match self {
            Value::Null => "n:".to_string(),
            Value::Bool(b) => format!("b:{}", b),
            Value::Int(i) => format!("i:{}", i),
            Value::Float(f) => format!("f:{}", f),
            Value::Decimal(d) => format!("d:{}", d),
            Value::String(s) => format!("s:{}", s),
            Value::Bytes(b) => format!("x:{}", hex::encode(b)),
            Value::Date(d) => format!("D:{}", d),
            Value::Time(t) => format!("T:{}", t),
            Value::DateTime(dt) => format!("DT:{}", dt),
            Value::Timestamp(ts) => format!("DT:{}", ts.naive_utc()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Decimal(d) => f.write_str(d),
            Value::String(s) => f.write_str(s),
            Value::Bytes(b) => f.write_str(&hex::encode(b)),
            Value::Date(d) => write!(f, "{}", d),
            Value::Time(t) => write!(f, "{}", t),
            Value::DateTime(dt) => write!(f, "{}", dt),
            Value::Timestamp(ts) => write!(f, "{}", ts),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One captured row image.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    pub start_lsn: Lsn,
    pub seqval: Lsn,
    pub operation: Operation,
    pub update_mask: Option<Bytes>,
    /// Business values, in the owning batch's column order.
    pub values: Vec<Value>,
}

impl ChangeRow {
    /// A synthetic insert as produced for snapshot rows.
    pub fn snapshot(values: Vec<Value>) -> Self {
        Self {
            start_lsn: Lsn::zero(),
            seqval: Lsn::zero(),
            operation: Operation::Insert,
            update_mask: None,
            values,
        }
    }
}

/// A batch of change rows sharing one business column layout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    pub columns: Vec<String>,
    /// Types the source declared per column; empty or `None` where unknown.
    pub column_types: Vec<Option<ColumnType>>,
    pub rows: Vec<ChangeRow>,
}

impl ChangeBatch {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            column_types: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn with_column_types(mut self, column_types: Vec<Option<ColumnType>>) -> Self {
        self.column_types = column_types;
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_codes_round_trip() {
        for op in [
            Operation::Delete,
            Operation::Insert,
            Operation::UpdateBefore,
            Operation::UpdateAfter,
        ] {
            assert_eq!(Operation::from_code(op.code()).unwrap(), op);
        }
        assert!(Operation::from_code(5).is_err());
    }

    #[test]
    fn test_key_text_distinguishes_types() {
        assert_ne!(Value::Int(1).key_text(), Value::from("1").key_text());
        assert_eq!(Value::Int(7).key_text(), Value::from(7i64).key_text());
    }

    #[test]
    fn test_snapshot_rows_use_zero_sentinel() {
        let row = ChangeRow::snapshot(vec![Value::Int(1)]);
        assert!(row.start_lsn.is_zero());
        assert!(row.seqval.is_zero());
        assert_eq!(row.operation, Operation::Insert);
    }
}
