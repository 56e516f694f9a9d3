use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::collections::HashMap;
use tiberius::{AuthMethod, Client, ColumnData, ColumnType as TdsType, FromSql, Row, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

use super::{ChangeSource, SnapshotCursor, SourceFactory};
use crate::change::{ChangeBatch, ChangeRow, Operation, Value};
use crate::config::{SourceConfig, TableSyncSpec};
use crate::lsn::Lsn;
use crate::schema::ColumnType;
use crate::{Error, Result};

const METADATA_PREFIX: &str = "__$";

type TdsClient = Client<Compat<TcpStream>>;

/// A SQL Server database with CDC enabled.
pub struct MssqlSource {
    client: TdsClient,
    connection_id: String,
}

impl MssqlSource {
    pub async fn connect(connection_id: &str, config: &SourceConfig) -> Result<Self> {
        info!(
            connection = %connection_id,
            host = %config.host,
            database = %config.database,
            "Connecting to SQL Server"
        );

        let mut tds = tiberius::Config::new();
        tds.host(&config.host);
        tds.port(config.port);
        tds.database(&config.database);
        tds.authentication(AuthMethod::sql_server(&config.username, &config.password));
        if config.trust_server_certificate {
            tds.trust_cert();
        }

        let tcp = TcpStream::connect(tds.get_addr()).await?;
        tcp.set_nodelay(true)?;
        let client = Client::connect(tds, tcp.compat_write()).await?;

        Ok(Self {
            client,
            connection_id: connection_id.to_string(),
        })
    }

    async fn query_position(&mut self, sql: &str, params: &[&dyn ToSql]) -> Result<Option<Lsn>> {
        let row = self.client.query(sql, params).await?.into_row().await?;
        match row {
            Some(row) => Ok(row
                .try_get::<&[u8], _>(0)?
                .map(|bytes| Lsn::from_bytes(bytes.to_vec()))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ChangeSource for MssqlSource {
    async fn current_position(&mut self) -> Result<Lsn> {
        self.query_position("SELECT sys.fn_cdc_get_max_lsn()", &[])
            .await?
            .ok_or_else(|| Error::Source {
                message: format!(
                    "no maximum LSN on connection '{}'; is CDC enabled for the database?",
                    self.connection_id
                ),
            })
    }

    async fn earliest_position(&mut self, table: &TableSyncSpec) -> Result<Lsn> {
        let capture_instance = checked_capture_instance(table)?;
        let lsn = self
            .query_position("SELECT sys.fn_cdc_get_min_lsn(@P1)", &[&capture_instance])
            .await?;

        match lsn {
            Some(lsn) if !lsn.is_zero() => Ok(lsn),
            _ => Err(Error::Source {
                message: format!(
                    "capture instance '{}' for {} does not exist",
                    capture_instance, table.source_table
                ),
            }),
        }
    }

    async fn fetch_changes(
        &mut self,
        table: &TableSyncSpec,
        start: &Lsn,
        end: &Lsn,
    ) -> Result<ChangeBatch> {
        let capture_instance = checked_capture_instance(table)?;
        let sql = format!(
            "SELECT * FROM cdc.fn_cdc_get_all_changes_{}(@P1, @P2, N'all')",
            capture_instance
        );
        let from = start.as_bytes().to_vec();
        let to = end.as_bytes().to_vec();

        debug!(table = %table.source_table, from = %start, to = %end, "Fetching changes");
        let rows = self
            .client
            .query(sql, &[&from, &to])
            .await?
            .into_first_result()
            .await?;

        decode_changes(rows)
    }

    async fn next_snapshot_chunk(
        &mut self,
        cursor: &mut SnapshotCursor,
    ) -> Result<Option<ChangeBatch>> {
        cursor.begin_read()?;
        if cursor.exhausted {
            return Ok(None);
        }

        let order_by = cursor
            .order_by
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT * FROM {} ORDER BY {} OFFSET @P1 ROWS FETCH NEXT @P2 ROWS ONLY",
            quote_table(&cursor.source_table),
            order_by
        );
        let offset = cursor.offset as i64;
        let limit = cursor.chunk_size as i64;

        let rows = self
            .client
            .query(sql, &[&offset, &limit])
            .await?
            .into_first_result()
            .await?;

        if rows.is_empty() {
            cursor.finish();
            return Ok(None);
        }

        let batch = decode_snapshot(rows)?;
        cursor.advance(batch.len());
        debug!(
            table = %cursor.source_table,
            chunk = cursor.chunks_read,
            rows = batch.len(),
            "Read snapshot chunk"
        );
        Ok(Some(batch))
    }
}

/// Opens [`MssqlSource`]s from the `sources` section of the configuration.
pub struct MssqlSourceFactory {
    sources: HashMap<String, SourceConfig>,
}

impl MssqlSourceFactory {
    pub fn new(sources: HashMap<String, SourceConfig>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl SourceFactory for MssqlSourceFactory {
    type Source = MssqlSource;

    async fn connect(&self, connection_id: &str) -> Result<MssqlSource> {
        let config = self
            .sources
            .get(connection_id)
            .ok_or_else(|| Error::MissingSetting {
                table: format!("connection '{}'", connection_id),
                field: format!("sources.{}", connection_id),
            })?;

        for (field, value) in [
            ("host", &config.host),
            ("database", &config.database),
            ("username", &config.username),
        ] {
            if value.trim().is_empty() {
                return Err(Error::MissingSetting {
                    table: format!("connection '{}'", connection_id),
                    field: format!("sources.{}.{}", connection_id, field),
                });
            }
        }

        MssqlSource::connect(connection_id, config).await
    }
}

/// The capture instance ends up inside a function name, so only plain
/// identifiers are accepted.
fn checked_capture_instance(table: &TableSyncSpec) -> Result<String> {
    let capture_instance = table.capture_instance();
    let valid = !capture_instance.is_empty()
        && capture_instance
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(capture_instance)
    } else {
        Err(Error::Config(format!(
            "invalid capture instance '{}' for {}",
            capture_instance, table.source_table
        )))
    }
}

fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

fn quote_table(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

fn column_names(rows: &[Row]) -> Vec<String> {
    rows.first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default()
}

/// Declared SQL Server types of the result columns, as staging types.
fn declared_types(rows: &[Row]) -> Vec<(String, Option<ColumnType>)> {
    rows.first()
        .map(|row| {
            row.columns()
                .iter()
                .map(|c| (c.name().to_string(), staging_type(c.column_type())))
                .collect()
        })
        .unwrap_or_default()
}

/// Binary columns stage as hex text, so they map to `String` too.
fn staging_type(ty: TdsType) -> Option<ColumnType> {
    let ty = match ty {
        TdsType::Bit | TdsType::Bitn => ColumnType::Bool,
        TdsType::Int1 | TdsType::Int2 | TdsType::Int4 | TdsType::Int8 | TdsType::Intn => {
            ColumnType::Int64
        }
        TdsType::Float4
        | TdsType::Float8
        | TdsType::Floatn
        | TdsType::Money
        | TdsType::Money4 => ColumnType::Float64,
        TdsType::Decimaln | TdsType::Numericn => ColumnType::Numeric,
        TdsType::Datetime
        | TdsType::Datetime4
        | TdsType::Datetimen
        | TdsType::Datetime2
        | TdsType::DatetimeOffsetn => ColumnType::DateTime,
        TdsType::Daten => ColumnType::Date,
        TdsType::Timen => ColumnType::Time,
        TdsType::Guid
        | TdsType::BigVarChar
        | TdsType::BigChar
        | TdsType::NVarchar
        | TdsType::NChar
        | TdsType::Text
        | TdsType::NText
        | TdsType::Xml
        | TdsType::BigVarBin
        | TdsType::BigBinary
        | TdsType::Image => ColumnType::String,
        _ => return None,
    };
    Some(ty)
}

fn decode_snapshot(rows: Vec<Row>) -> Result<ChangeBatch> {
    let types = declared_types(&rows).into_iter().map(|(_, ty)| ty).collect();
    let mut batch = ChangeBatch::new(column_names(&rows)).with_column_types(types);
    batch.rows.reserve(rows.len());
    for row in rows {
        let values = row.into_iter().map(to_value).collect::<Result<Vec<_>>>()?;
        batch.rows.push(ChangeRow::snapshot(values));
    }
    Ok(batch)
}

fn decode_changes(rows: Vec<Row>) -> Result<ChangeBatch> {
    let names = column_names(&rows);
    let business: Vec<String> = names
        .iter()
        .filter(|n| !n.starts_with(METADATA_PREFIX))
        .cloned()
        .collect();

    let types = declared_types(&rows)
        .into_iter()
        .filter(|(name, _)| !name.starts_with(METADATA_PREFIX))
        .map(|(_, ty)| ty)
        .collect();

    let mut batch = ChangeBatch::new(business).with_column_types(types);
    batch.rows.reserve(rows.len());

    for row in rows {
        let mut start_lsn = None;
        let mut seqval = None;
        let mut operation = None;
        let mut update_mask = None;
        let mut values = Vec::with_capacity(batch.columns.len());

        for (name, data) in names.iter().zip(row.into_iter()) {
            let value = to_value(data)?;
            match name.strip_prefix(METADATA_PREFIX) {
                Some("start_lsn") => start_lsn = binary(value),
                Some("seqval") => seqval = binary(value),
                Some("operation") => operation = value.as_i64(),
                Some("update_mask") => update_mask = binary(value),
                Some(_) => {}
                None => values.push(value),
            }
        }

        let missing = |field: &str| Error::Source {
            message: format!("change row without {}{}", METADATA_PREFIX, field),
        };
        batch.rows.push(ChangeRow {
            start_lsn: start_lsn.map(Lsn::from_bytes).ok_or_else(|| missing("start_lsn"))?,
            seqval: seqval.map(Lsn::from_bytes).ok_or_else(|| missing("seqval"))?,
            operation: Operation::from_code(operation.ok_or_else(|| missing("operation"))?)?,
            update_mask,
            values,
        });
    }

    Ok(batch)
}

fn binary(value: Value) -> Option<Bytes> {
    match value {
        Value::Bytes(bytes) => Some(bytes),
        _ => None,
    }
}

fn opt<T>(value: Option<T>, f: impl FnOnce(T) -> Value) -> Value {
    value.map(f).unwrap_or(Value::Null)
}

fn to_value(data: ColumnData<'static>) -> Result<Value> {
    match &data {
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            return Ok(opt(NaiveDateTime::from_sql(&data)?, Value::DateTime));
        }
        ColumnData::Date(_) => return Ok(opt(NaiveDate::from_sql(&data)?, Value::Date)),
        ColumnData::Time(_) => return Ok(opt(NaiveTime::from_sql(&data)?, Value::Time)),
        ColumnData::DateTimeOffset(_) => {
            return Ok(opt(DateTime::<Utc>::from_sql(&data)?, Value::Timestamp));
        }
        _ => {}
    }

    let value = match data {
        ColumnData::U8(v) => opt(v, |v| Value::Int(v.into())),
        ColumnData::I16(v) => opt(v, |v| Value::Int(v.into())),
        ColumnData::I32(v) => opt(v, |v| Value::Int(v.into())),
        ColumnData::I64(v) => opt(v, Value::Int),
        ColumnData::F32(v) => opt(v, |v| Value::Float(v.into())),
        ColumnData::F64(v) => opt(v, Value::Float),
        ColumnData::Bit(v) => opt(v, Value::Bool),
        ColumnData::String(v) => opt(v, |s| Value::String(s.into_owned())),
        ColumnData::Guid(v) => opt(v, |g| Value::String(g.to_string())),
        ColumnData::Binary(v) => opt(v, |b| Value::Bytes(Bytes::from(b.into_owned()))),
        ColumnData::Numeric(v) => opt(v, |n| Value::Decimal(n.to_string())),
        ColumnData::Xml(v) => opt(v, |x| Value::String(x.into_owned().into_string())),
        other => {
            return Err(Error::Source {
                message: format!("unsupported SQL Server value {:?}", other),
            })
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    #[test]
    fn test_identifiers_are_bracket_quoted() {
        assert_eq!(quote_table("dbo.orders"), "[dbo].[orders]");
        assert_eq!(quote_ident("odd]name"), "[odd]]name]");
    }

    #[test]
    fn test_capture_instance_must_be_plain() {
        let table = TableSyncSpec::new("dbo.orders", "sales", "orders", &["order_id"]);
        assert_eq!(checked_capture_instance(&table).unwrap(), "dbo_orders");

        let mut bad = table.clone();
        bad.capture_instance = Some("x; DROP TABLE y".to_string());
        assert!(checked_capture_instance(&bad).is_err());
    }

    #[test]
    fn test_declared_types_map_to_staging_types() {
        assert_eq!(staging_type(TdsType::Datetime2), Some(ColumnType::DateTime));
        assert_eq!(staging_type(TdsType::Datetimen), Some(ColumnType::DateTime));
        assert_eq!(staging_type(TdsType::Intn), Some(ColumnType::Int64));
        assert_eq!(staging_type(TdsType::Bitn), Some(ColumnType::Bool));
        assert_eq!(staging_type(TdsType::Numericn), Some(ColumnType::Numeric));
        assert_eq!(staging_type(TdsType::BigVarBin), Some(ColumnType::String));
        assert_eq!(staging_type(TdsType::SSVariant), None);
    }

    #[test]
    fn test_scalar_values_convert() {
        assert_eq!(to_value(ColumnData::I32(Some(5))).unwrap(), Value::Int(5));
        assert_eq!(to_value(ColumnData::I32(None)).unwrap(), Value::Null);
        assert_eq!(to_value(ColumnData::Bit(Some(true))).unwrap(), Value::Bool(true));
        assert_eq!(
            to_value(ColumnData::String(Some(Cow::Borrowed("abc")))).unwrap(),
            Value::from("abc")
        );
        assert_eq!(
            to_value(ColumnData::Binary(Some(Cow::Owned(vec![0xAB])))).unwrap(),
            Value::Bytes(Bytes::from_static(&[0xAB]))
        );
    }
}
