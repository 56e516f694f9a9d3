use async_trait::async_trait;
use futures::StreamExt;
use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::model::get_query_results_parameters::GetQueryResultsParameters;
use gcp_bigquery_client::model::query_request::QueryRequest;
use gcp_bigquery_client::model::query_response::{QueryResponse, ResultSet};
use gcp_bigquery_client::storage::{StorageApi, StreamName, TableDescriptor};
use gcp_bigquery_client::Client;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use super::encoding::{self, StagingRow};
use super::sql;
use super::Warehouse;
use crate::clean::StagingBatch;
use crate::config::WarehouseConfig;
use crate::reconcile::{MergeMode, MergePlan};
use crate::schema::StagingSchema;
use crate::{Error, Result};

/// Upper bound for one append request to the Storage Write API.
const MAX_APPEND_BYTES: usize = 9 * 1024 * 1024;

const TRACE_ID: &str = "mssql-cdc-sync";

const JOB_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// BigQuery target. Staging rows go through the Storage Write API; the
/// merge is a single MERGE (or `CREATE OR REPLACE TABLE ... AS SELECT`)
/// query per cycle.
pub struct BigQueryWarehouse {
    client: Client,
    project_id: String,
    staging_suffix: String,
    query_timeout_ms: i32,
    /// Column types each staging table was created with, by staging table.
    staging_types: Mutex<HashMap<String, Vec<String>>>,
}

impl BigQueryWarehouse {
    pub async fn new(config: &WarehouseConfig) -> Result<Self> {
        let client =
            Client::from_service_account_key_file(&config.service_account_key_path).await?;
        info!(project = %config.project_id, "Connected to BigQuery");

        Ok(Self {
            client,
            project_id: config.project_id.clone(),
            staging_suffix: config.staging_suffix.clone(),
            query_timeout_ms: config.query_timeout_ms,
            staging_types: Mutex::new(HashMap::new()),
        })
    }

    fn staging_table(&self, table: &str) -> String {
        format!("{}{}", table, self.staging_suffix)
    }

    async fn query(&self, sql: String) -> Result<ResultSet> {
        debug!("Query: {}", sql);
        let mut request = QueryRequest::new(sql);
        request.timeout_ms = Some(self.query_timeout_ms);

        let response = self.client.job().query(&self.project_id, request).await?;
        let response = self.wait_for_job(response).await?;
        Ok(ResultSet::new_from_query_response(response))
    }

    /// Polls a query job that outlived the request timeout until it
    /// finishes. A failed job surfaces as an error from the poll.
    async fn wait_for_job(&self, mut response: QueryResponse) -> Result<QueryResponse> {
        while let Some((job_id, location)) = pending_job(&response)? {
            debug!(job = %job_id, "Waiting for query job");
            tokio::time::sleep(JOB_POLL_INTERVAL).await;

            let parameters = GetQueryResultsParameters {
                location,
                timeout_ms: Some(self.query_timeout_ms),
                ..Default::default()
            };
            let results = self
                .client
                .job()
                .get_query_results(&self.project_id, &job_id, parameters)
                .await?;
            response = QueryResponse::from(results);
        }
        Ok(response)
    }

    /// Appends `rows` to the default stream of `dataset.table`, one request
    /// per [`MAX_APPEND_BYTES`] of encoded rows.
    async fn append_rows(
        &self,
        dataset: &str,
        table: &str,
        descriptor: &TableDescriptor,
        mut rows: &[StagingRow],
    ) -> Result<usize> {
        let stream = StreamName::new_default(
            self.project_id.clone(),
            dataset.to_string(),
            table.to_string(),
        );
        let mut client = self.client.clone();
        let mut requests = 0usize;

        while !rows.is_empty() {
            let (request, processed) = StorageApi::create_rows(descriptor, rows, MAX_APPEND_BYTES);
            if processed == 0 {
                return Err(Error::Warehouse {
                    message: format!(
                        "a row for {}.{} exceeds the {} byte append limit",
                        dataset, table, MAX_APPEND_BYTES
                    ),
                });
            }

            let mut responses = client
                .storage_mut()
                .append_rows(&stream, request, TRACE_ID.to_string())
                .await?;
            if let Some(response) = responses.next().await {
                let response = response.map_err(BQError::from)?;
                if !response.row_errors.is_empty() {
                    return Err(Error::Warehouse {
                        message: format!(
                            "{}.{} rejected {} rows: {:?}",
                            dataset,
                            table,
                            response.row_errors.len(),
                            response.row_errors
                        ),
                    });
                }
            }

            rows = &rows[processed..];
            requests += 1;
        }
        Ok(requests)
    }

    /// Column types of an existing table, keyed by lowercase column name.
    async fn column_types(&self, dataset: &str, table: &str) -> Result<HashMap<String, String>> {
        let mut rs = self
            .query(sql::column_types_query(&self.project_id, dataset, table))
            .await?;

        let mut types = HashMap::new();
        while rs.next_row() {
            if let (Some(name), Some(ty)) = (
                rs.get_string_by_name("column_name")?,
                rs.get_string_by_name("data_type")?,
            ) {
                types.insert(name.to_lowercase(), ty);
            }
        }
        Ok(types)
    }

    /// Types to write a batch with, creating the staging table on `replace`.
    async fn prepare_staging(
        &self,
        schema: &StagingSchema,
        dataset: &str,
        table: &str,
        replace: bool,
    ) -> Result<Vec<String>> {
        let staging = self.staging_table(table);
        let staging_id = format!("{}.{}", dataset, staging);

        if !replace {
            let cached = self
                .staging_types
                .lock()
                .ok()
                .and_then(|types| types.get(&staging_id).cloned());
            if let Some(types) = cached {
                return Ok(types);
            }
            let known = self.column_types(dataset, &staging).await?;
            return Ok(sql::resolve_types(schema, &known));
        }

        let known = if self.table_exists(dataset, table).await? {
            self.column_types(dataset, table).await?
        } else {
            HashMap::new()
        };
        let types = sql::resolve_types(schema, &known);

        self.query(sql::create_staging_table(
            &sql::table_ref(&self.project_id, dataset, &staging),
            &schema.names(),
            &types,
        ))
        .await?;

        if let Ok(mut cache) = self.staging_types.lock() {
            cache.insert(staging_id, types.clone());
        }
        Ok(types)
    }
}

/// Job id and location of a query that has not completed yet.
fn pending_job(response: &QueryResponse) -> Result<Option<(String, Option<String>)>> {
    if response.job_complete.unwrap_or(false) {
        return Ok(None);
    }
    let job = response.job_reference.as_ref();
    match job.and_then(|j| j.job_id.clone()) {
        Some(job_id) => Ok(Some((job_id, job.and_then(|j| j.location.clone())))),
        None => Err(Error::Warehouse {
            message: "query did not complete and returned no job to wait for".to_string(),
        }),
    }
}

fn is_not_found(error: &BQError) -> bool {
    let text = error.to_string();
    text.contains("Not found") || text.contains("404")
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn table_exists(&self, dataset: &str, table: &str) -> Result<bool> {
        match self
            .client
            .table()
            .get(&self.project_id, dataset, table, None)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_staging_chunk(
        &self,
        batch: &StagingBatch,
        dataset: &str,
        table: &str,
        replace: bool,
    ) -> Result<()> {
        let types = self
            .prepare_staging(&batch.schema, dataset, table, replace)
            .await?;
        let staging = self.staging_table(table);
        let descriptor = encoding::table_descriptor(&batch.schema.names(), &types);
        let rows = encoding::encode_rows(&types, &batch.rows)?;
        let requests = self.append_rows(dataset, &staging, &descriptor, &rows).await?;

        debug!(
            table = %format!("{}.{}", dataset, table),
            rows = batch.len(),
            requests,
            replace,
            "Staged chunk"
        );
        Ok(())
    }

    async fn merge(
        &self,
        dataset: &str,
        table: &str,
        key_columns: &[String],
        schema: &StagingSchema,
    ) -> Result<MergeMode> {
        let table_key = format!("{}.{}", dataset, table);
        let exists = self.table_exists(dataset, table).await?;
        let plan = MergePlan::build(&table_key, key_columns, schema, exists)?;

        let statement = sql::render_merge(
            &plan,
            &sql::table_ref(&self.project_id, dataset, table),
            &sql::table_ref(&self.project_id, dataset, &self.staging_table(table)),
        );
        self.query(statement).await?;

        info!(table = %table_key, mode = %plan.mode, "Merged staging into target");
        Ok(plan.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_job_is_reported_until_complete() {
        let running: QueryResponse = serde_json::from_str(
            r#"{"jobComplete": false, "jobReference": {"projectId": "p", "jobId": "job_1", "location": "EU"}}"#,
        )
        .unwrap();
        assert_eq!(
            pending_job(&running).unwrap(),
            Some(("job_1".to_string(), Some("EU".to_string())))
        );

        let done: QueryResponse = serde_json::from_str(
            r#"{"jobComplete": true, "jobReference": {"projectId": "p", "jobId": "job_1"}}"#,
        )
        .unwrap();
        assert_eq!(pending_job(&done).unwrap(), None);

        let orphan: QueryResponse = serde_json::from_str(r#"{"jobComplete": false}"#).unwrap();
        assert!(matches!(pending_job(&orphan), Err(Error::Warehouse { .. })));
    }
}
