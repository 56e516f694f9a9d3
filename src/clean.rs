use chrono::NaiveDateTime;

use crate::change::{ChangeBatch, ChangeRow, Value};
use crate::schema::{StagingSchema, LEADING_METADATA_COLUMNS, SYNCED_AT_COLUMN};
use crate::{Error, Result};

/// Rows ready to be written to a staging table.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingBatch {
    pub schema: StagingSchema,
    pub rows: Vec<Vec<Value>>,
}

impl StagingBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Fails if this batch's columns differ from `expected` in name or order.
    pub fn ensure_layout(&self, expected: &StagingSchema, table: &str) -> Result<()> {
        let ours = self.schema.names();
        let theirs = expected.names();
        if ours == theirs {
            return Ok(());
        }

        let added: Vec<&String> = ours.iter().filter(|c| !theirs.contains(c)).collect();
        let removed: Vec<&String> = theirs.iter().filter(|c| !ours.contains(c)).collect();
        let message = if added.is_empty() && removed.is_empty() {
            "column order changed".to_string()
        } else {
            format!("added {:?}, removed {:?}", added, removed)
        };

        Err(Error::SchemaDrift {
            table: table.to_string(),
            message,
        })
    }
}

/// Normalizes a change batch for staging.
///
/// Change metadata becomes the fixed `cdc_` columns ahead of the business
/// columns, binary values become lowercase hex, UTC timestamps lose their
/// zone, and every row is stamped with `synced_at` in the trailing
/// `cdc_synced_at` column.
pub fn clean_batch(batch: ChangeBatch, synced_at: NaiveDateTime) -> StagingBatch {
    let mut names: Vec<String> = LEADING_METADATA_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .collect();
    let mut declared = vec![None; names.len()];
    declared.extend(
        (0..batch.columns.len()).map(|idx| batch.column_types.get(idx).copied().flatten()),
    );
    names.extend(batch.columns);
    names.push(SYNCED_AT_COLUMN.to_string());

    let rows: Vec<Vec<Value>> = batch
        .rows
        .into_iter()
        .map(|row| clean_row(row, synced_at))
        .collect();

    let schema = StagingSchema::infer_with(&names, &declared, &rows);
    StagingBatch { schema, rows }
}

fn clean_row(row: ChangeRow, synced_at: NaiveDateTime) -> Vec<Value> {
    let mut values = Vec::with_capacity(row.values.len() + LEADING_METADATA_COLUMNS.len() + 1);
    values.push(Value::String(row.start_lsn.to_hex()));
    values.push(Value::String(row.seqval.to_hex()));
    values.push(Value::Int(row.operation.code()));
    values.push(match row.update_mask {
        Some(mask) => Value::String(hex::encode(mask)),
        None => Value::Null,
    });
    values.extend(row.values.into_iter().map(clean_value));
    values.push(Value::DateTime(synced_at));
    values
}

fn clean_value(value: Value) -> Value {
    match value {
        Value::Bytes(bytes) => Value::String(hex::encode(bytes)),
        Value::Timestamp(ts) => Value::DateTime(ts.naive_utc()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Operation;
    use crate::lsn::Lsn;
    use crate::schema::ColumnType;
    use bytes::Bytes;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn synced_at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn sample_batch() -> ChangeBatch {
        ChangeBatch {
            columns: vec!["id".to_string(), "token".to_string(), "seen_at".to_string()],
            column_types: Vec::new(),
            rows: vec![ChangeRow {
                start_lsn: Lsn::from_u64(0x2a),
                seqval: Lsn::from_u64(1),
                operation: Operation::UpdateAfter,
                update_mask: Some(Bytes::from_static(&[0x06])),
                values: vec![
                    Value::Int(7),
                    Value::Bytes(Bytes::from_static(&[0xDE, 0xAD])),
                    Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 8, 30, 0).unwrap()),
                ],
            }],
        }
    }

    #[test]
    fn test_metadata_columns_are_renamed_and_placed_first() {
        let staged = clean_batch(sample_batch(), synced_at());
        assert_eq!(
            staged.schema.names(),
            vec![
                "cdc_start_lsn",
                "cdc_seqval",
                "cdc_operation",
                "cdc_update_mask",
                "id",
                "token",
                "seen_at",
                "cdc_synced_at"
            ]
        );
    }

    #[test]
    fn test_binary_values_become_lowercase_hex() {
        let staged = clean_batch(sample_batch(), synced_at());
        let row = &staged.rows[0];
        assert_eq!(row[0], Value::from("0000000000000000002a"));
        assert_eq!(row[2], Value::Int(4));
        assert_eq!(row[3], Value::from("06"));
        assert_eq!(row[5], Value::from("dead"));
        assert_eq!(
            row[6],
            Value::DateTime(
                NaiveDate::from_ymd_opt(2024, 1, 1)
                    .unwrap()
                    .and_hms_opt(8, 30, 0)
                    .unwrap()
            )
        );
        assert_eq!(row[7], Value::DateTime(synced_at()));
        assert_eq!(staged.schema.columns[6].ty, ColumnType::DateTime);
    }

    #[test]
    fn test_nulls_stay_null() {
        let mut batch = sample_batch();
        batch.rows[0].update_mask = None;
        batch.rows[0].values[1] = Value::Null;

        let staged = clean_batch(batch, synced_at());
        assert_eq!(staged.rows[0][3], Value::Null);
        assert_eq!(staged.rows[0][5], Value::Null);
    }

    #[test]
    fn test_declared_type_survives_all_null_column() {
        let mut batch = sample_batch();
        batch.rows[0].values[2] = Value::Null;
        let batch = batch.with_column_types(vec![
            Some(ColumnType::Int64),
            Some(ColumnType::String),
            Some(ColumnType::DateTime),
        ]);

        let staged = clean_batch(batch, synced_at());
        assert_eq!(staged.schema.columns[6].name, "seen_at");
        assert_eq!(staged.schema.columns[6].ty, ColumnType::DateTime);
        assert_eq!(staged.schema.columns[7].ty, ColumnType::DateTime);
    }

    #[test]
    fn test_layout_mismatch_is_schema_drift() {
        let first = clean_batch(sample_batch(), synced_at());
        let mut changed = sample_batch();
        changed.columns[2] = "seen_at_utc".to_string();
        let second = clean_batch(changed, synced_at());

        assert!(first.ensure_layout(&first.schema, "t").is_ok());
        let err = second.ensure_layout(&first.schema, "sales.orders").unwrap_err();
        assert!(matches!(err, Error::SchemaDrift { .. }));
    }
}
