//! Analytical warehouse targets.
//!
//! Rows reach a target table in two steps: each cleaned batch is written to a
//! per-table staging table, then one merge folds the staged rows into the
//! target, creating it when it does not exist yet.

pub mod bigquery;
pub mod encoding;
pub mod sql;

use async_trait::async_trait;

use crate::clean::StagingBatch;
use crate::reconcile::MergeMode;
use crate::schema::StagingSchema;
use crate::Result;

pub use bigquery::BigQueryWarehouse;

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn table_exists(&self, dataset: &str, table: &str) -> Result<bool>;

    /// Writes `batch` to the staging table of `dataset.table`.
    ///
    /// With `replace` the staging table is recreated first; otherwise the
    /// rows are appended to what is already staged.
    async fn write_staging_chunk(
        &self,
        batch: &StagingBatch,
        dataset: &str,
        table: &str,
        replace: bool,
    ) -> Result<()>;

    /// Folds the staged rows into `dataset.table` as one atomic step.
    async fn merge(
        &self,
        dataset: &str,
        table: &str,
        key_columns: &[String],
        schema: &StagingSchema,
    ) -> Result<MergeMode>;
}
