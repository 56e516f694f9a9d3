//! Protocol buffer rows for the BigQuery Storage Write API.
//!
//! Staging rows are appended to the default stream of the staging table.
//! Each field is encoded with the proto type its column is declared with;
//! dates, times, datetimes and numerics travel as their canonical text.

use gcp_bigquery_client::storage::{
    ColumnMode, ColumnType as StorageType, FieldDescriptor, TableDescriptor,
};
use prost::bytes;

use crate::change::Value;
use crate::{Error, Result};

/// Proto encoding of one staged column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int64,
    Double,
    Bool,
    Bytes,
    /// Everything BigQuery parses from text.
    String,
}

impl FieldKind {
    /// Kind for a BigQuery column type such as `INT64` or `NUMERIC(10, 2)`.
    pub fn for_sql_type(sql_type: &str) -> Self {
        let base = sql_type
            .split(['(', '<'])
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_uppercase();
        match base.as_str() {
            "INT64" | "INT" | "INTEGER" | "SMALLINT" | "BIGINT" | "TINYINT" | "BYTEINT" => {
                FieldKind::Int64
            }
            "FLOAT64" | "FLOAT" => FieldKind::Double,
            "BOOL" | "BOOLEAN" => FieldKind::Bool,
            "BYTES" => FieldKind::Bytes,
            _ => FieldKind::String,
        }
    }

    fn storage_type(self) -> StorageType {
        match self {
            FieldKind::Int64 => StorageType::Int64,
            FieldKind::Double => StorageType::Double,
            FieldKind::Bool => StorageType::Bool,
            FieldKind::Bytes => StorageType::Bytes,
            FieldKind::String => StorageType::String,
        }
    }
}

/// A single encoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Int64(i64),
    Double(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    String(String),
}

impl Cell {
    /// Converts `value` for a field of `kind`, failing when BigQuery could
    /// not store it in that column.
    pub fn encode(value: &Value, kind: FieldKind) -> Result<Self> {
        let cell = match (kind, value) {
            (_, Value::Null) => Cell::Null,
            (FieldKind::Int64, Value::Int(i)) => Cell::Int64(*i),
            (FieldKind::Int64, Value::Bool(b)) => Cell::Int64(i64::from(*b)),
            (FieldKind::Int64, Value::Decimal(d)) => match d.parse::<i64>() {
                Ok(i) => Cell::Int64(i),
                Err(_) => return Err(mismatch(value, kind)),
            },
            (FieldKind::Double, Value::Float(f)) => Cell::Double(*f),
            (FieldKind::Double, Value::Int(i)) => Cell::Double(*i as f64),
            (FieldKind::Double, Value::Decimal(d)) => match d.parse::<f64>() {
                Ok(f) => Cell::Double(f),
                Err(_) => return Err(mismatch(value, kind)),
            },
            (FieldKind::Bool, Value::Bool(b)) => Cell::Bool(*b),
            (FieldKind::Bool, Value::Int(i)) => Cell::Bool(*i != 0),
            (FieldKind::Bytes, Value::Bytes(b)) => Cell::Bytes(b.to_vec()),
            // Binary values arrive hex encoded from cleaning.
            (FieldKind::Bytes, Value::String(s)) => match hex::decode(s) {
                Ok(b) => Cell::Bytes(b),
                Err(_) => return Err(mismatch(value, kind)),
            },
            (FieldKind::String, v) => Cell::String(text(v)),
            _ => return Err(mismatch(value, kind)),
        };
        Ok(cell)
    }

    fn encode_prost(&self, tag: u32, buf: &mut impl bytes::BufMut) {
        match self {
            Cell::Null => {}
            Cell::Int64(i) => prost::encoding::int64::encode(tag, i, buf),
            Cell::Double(f) => prost::encoding::double::encode(tag, f, buf),
            Cell::Bool(b) => prost::encoding::bool::encode(tag, b, buf),
            Cell::Bytes(b) => prost::encoding::bytes::encode(tag, b, buf),
            Cell::String(s) => prost::encoding::string::encode(tag, s, buf),
        }
    }

    fn encoded_len(&self, tag: u32) -> usize {
        match self {
            Cell::Null => 0,
            Cell::Int64(i) => prost::encoding::int64::encoded_len(tag, i),
            Cell::Double(f) => prost::encoding::double::encoded_len(tag, f),
            Cell::Bool(b) => prost::encoding::bool::encoded_len(tag, b),
            Cell::Bytes(b) => prost::encoding::bytes::encoded_len(tag, b),
            Cell::String(s) => prost::encoding::string::encoded_len(tag, s),
        }
    }
}

fn mismatch(value: &Value, kind: FieldKind) -> Error {
    Error::Warehouse {
        message: format!("value '{}' does not fit a {:?} column", value, kind),
    }
}

/// Text form of a value as BigQuery parses it, with sub-second parts cut
/// to microseconds.
fn text(value: &Value) -> String {
    match value {
        Value::Time(t) => t.format("%H:%M:%S%.6f").to_string(),
        Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        Value::Timestamp(ts) => ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        other => other.to_string(),
    }
}

/// One staged row; field numbers follow column order starting at 1.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagingRow(Vec<Cell>);

impl StagingRow {
    pub fn cells(&self) -> &[Cell] {
        &self.0
    }
}

impl prost::Message for StagingRow {
    fn encode_raw(&self, buf: &mut impl bytes::BufMut)
    where
        Self: Sized,
    {
        for (tag, cell) in (1u32..).zip(&self.0) {
            cell.encode_prost(tag, buf);
        }
    }

    // Rows are only ever written.
    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: prost::encoding::WireType,
        buf: &mut impl bytes::Buf,
        ctx: prost::encoding::DecodeContext,
    ) -> std::result::Result<(), prost::DecodeError>
    where
        Self: Sized,
    {
        prost::encoding::skip_field(wire_type, tag, buf, ctx)
    }

    fn encoded_len(&self) -> usize {
        (1u32..)
            .zip(&self.0)
            .map(|(tag, cell)| cell.encoded_len(tag))
            .sum()
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

/// Descriptor of a staging table whose columns have `sql_types`.
pub fn table_descriptor(names: &[String], sql_types: &[String]) -> TableDescriptor {
    let field_descriptors = (1u32..)
        .zip(names.iter().zip(sql_types))
        .map(|(number, (name, ty))| FieldDescriptor {
            number,
            name: name.clone(),
            typ: FieldKind::for_sql_type(ty).storage_type(),
            mode: ColumnMode::Nullable,
        })
        .collect();
    TableDescriptor { field_descriptors }
}

/// Encodes `rows` for columns of `sql_types`.
pub fn encode_rows(sql_types: &[String], rows: &[Vec<Value>]) -> Result<Vec<StagingRow>> {
    let kinds: Vec<FieldKind> = sql_types.iter().map(|t| FieldKind::for_sql_type(t)).collect();
    rows.iter()
        .map(|row| {
            row.iter()
                .zip(&kinds)
                .map(|(value, &kind)| Cell::encode(value, kind))
                .collect::<Result<Vec<_>>>()
                .map(StagingRow)
        })
        .collect()
}
