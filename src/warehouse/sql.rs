//! GoogleSQL rendering for staging tables and merges.

use std::collections::HashMap;

use crate::reconcile::{MergeMode, MergePlan};
use crate::schema::{ColumnType, StagingSchema};

const ROW_RANK_COLUMN: &str = "cdc_row_rank";

/// Staging tables expire on their own if a cycle never comes back for them.
const STAGING_EXPIRATION_HOURS: u32 = 24;

pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

pub fn table_ref(project_id: &str, dataset: &str, table: &str) -> String {
    quote_ident(&format!("{}.{}.{}", project_id, dataset, table))
}

/// BigQuery type for a staged column, `None` when it has to be looked up.
pub fn bq_type(ty: ColumnType) -> Option<&'static str> {
    match ty {
        ColumnType::Int64 => Some("INT64"),
        ColumnType::Float64 => Some("FLOAT64"),
        ColumnType::Numeric => Some("BIGNUMERIC"),
        ColumnType::Bool => Some("BOOL"),
        ColumnType::String => Some("STRING"),
        ColumnType::Date => Some("DATE"),
        ColumnType::Time => Some("TIME"),
        ColumnType::DateTime => Some("DATETIME"),
        ColumnType::Untyped => None,
    }
}

/// Column types for a staging table.
///
/// Types of an existing target table (`known`, keyed by lowercase column
/// name) win, so staged values always merge into the target's columns.
/// Other columns take their inferred type, untyped ones fall back to STRING.
pub fn resolve_types(schema: &StagingSchema, known: &HashMap<String, String>) -> Vec<String> {
    schema
        .columns
        .iter()
        .map(|column| {
            known
                .get(&column.name.to_lowercase())
                .cloned()
                .or_else(|| bq_type(column.ty).map(str::to_string))
                .unwrap_or_else(|| "STRING".to_string())
        })
        .collect()
}

fn quote_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

pub fn create_staging_table(table: &str, names: &[String], types: &[String]) -> String {
    let columns = names
        .iter()
        .zip(types)
        .map(|(name, ty)| format!("{} {}", quote_ident(name), ty))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE OR REPLACE TABLE {} ({}) OPTIONS(expiration_timestamp = TIMESTAMP_ADD(CURRENT_TIMESTAMP(), INTERVAL {} HOUR))",
        table, columns, STAGING_EXPIRATION_HOURS
    )
}

fn latest_row_window(plan: &MergePlan) -> String {
    let partition = plan
        .key_columns
        .iter()
        .map(|k| format!("CAST({} AS STRING)", quote_ident(k)))
        .collect::<Vec<_>>()
        .join(", ");
    let order = plan
        .order_columns
        .iter()
        .map(|c| format!("{} DESC", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("ROW_NUMBER() OVER (PARTITION BY {} ORDER BY {})", partition, order)
}

/// Renders the merge of `staging` into `target`.
pub fn render_merge(plan: &MergePlan, target: &str, staging: &str) -> String {
    let window = latest_row_window(plan);
    let operation = quote_ident(&plan.operation_column);

    match plan.mode {
        MergeMode::CreateTable => format!(
            "CREATE OR REPLACE TABLE {target}\n\
             PARTITION BY DATE({partition})\n\
             AS\n\
             SELECT * EXCEPT({rank})\n\
             FROM (\n  SELECT *, {window} AS {rank}\n  FROM {staging}\n)\n\
             WHERE {rank} = 1 AND {operation} != {delete}",
            target = target,
            partition = quote_ident(&plan.partition_column),
            rank = ROW_RANK_COLUMN,
            window = window,
            staging = staging,
            operation = operation,
            delete = plan.delete_code,
        ),
        MergeMode::MergeInto => {
            let on = plan
                .key_columns
                .iter()
                .map(|k| format!("T.{0} = S.{0}", quote_ident(k)))
                .collect::<Vec<_>>()
                .join(" AND ");
            let set = plan
                .update_columns
                .iter()
                .map(|c| format!("{0} = S.{0}", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");
            let columns = plan
                .insert_columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            let values = plan
                .insert_columns
                .iter()
                .map(|c| format!("S.{}", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");

            format!(
                "MERGE {target} T\n\
                 USING (\n  SELECT * FROM {staging}\n  WHERE TRUE\n  QUALIFY {window} = 1\n) S\n\
                 ON {on}\n\
                 WHEN MATCHED AND S.{operation} = {delete} THEN DELETE\n\
                 WHEN MATCHED THEN UPDATE SET {set}\n\
                 WHEN NOT MATCHED AND S.{operation} != {delete} THEN INSERT ({columns}) VALUES ({values})",
                target = target,
                staging = staging,
                window = window,
                on = on,
                operation = operation,
                delete = plan.delete_code,
                set = set,
                columns = columns,
                values = values,
            )
        }
    }
}

/// Column names and types of `table` from the dataset's INFORMATION_SCHEMA.
pub fn column_types_query(project_id: &str, dataset: &str, table: &str) -> String {
    format!(
        "SELECT column_name, data_type FROM {}.INFORMATION_SCHEMA.COLUMNS WHERE table_name = {}",
        quote_ident(&format!("{}.{}", project_id, dataset)),
        quote_string(table)
    )
}
