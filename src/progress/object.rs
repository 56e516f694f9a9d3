//! Progress records as objects in a bucket, one per table.
//!
//! Records live at `{folder}/state_{table_key}.json`. An object put is
//! atomic, so readers see either the previous record or the new one.

use async_trait::async_trait;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{record_name, ProgressRecord, ProgressStore};
use crate::lsn::Lsn;
use crate::{Error, Result};

pub struct ObjectProgressStore {
    store: Arc<dyn ObjectStore>,
    folder: String,
}

impl ObjectProgressStore {
    pub fn new(store: Arc<dyn ObjectStore>, folder: &str) -> Self {
        Self {
            store,
            folder: folder.trim_matches('/').to_string(),
        }
    }

    /// A store on Cloud Storage `bucket`. Without a key file the ambient
    /// Google credentials are used.
    pub fn gcs(bucket: &str, folder: &str, service_account_key_path: Option<&str>) -> Result<Self> {
        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
        if let Some(path) = service_account_key_path {
            builder = builder.with_service_account_path(path);
        }
        let store = builder.build()?;
        info!(bucket = %bucket, folder = %folder, "Using Cloud Storage progress store");

        Ok(Self::new(Arc::new(store), folder))
    }

    /// Object path of the record for `table_key`.
    pub fn record_path(&self, table_key: &str) -> Result<Path> {
        let name = record_name(table_key);
        let location = if self.folder.is_empty() {
            name
        } else {
            format!("{}/{}", self.folder, name)
        };
        Path::parse(&location)
            .map_err(|e| Error::Config(format!("invalid progress object path '{}': {}", location, e)))
    }
}

#[async_trait]
impl ProgressStore for ObjectProgressStore {
    async fn get_position(&self, table_key: &str) -> Result<Option<Lsn>> {
        let path = self.record_path(table_key)?;
        let content = match self.store.get(&path).await {
            Ok(object) => object.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => {
                debug!(table = %table_key, "No progress record at {}", path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<ProgressRecord>(&content) {
            Ok(record) => {
                debug!(
                    table = %table_key,
                    lsn = %record.last_lsn,
                    updated_at = %record.updated_at,
                    "Loaded progress"
                );
                Ok(Some(record.last_lsn))
            }
            Err(e) => {
                warn!(
                    table = %table_key,
                    "Ignoring unreadable progress record {}: {}", path, e
                );
                Ok(None)
            }
        }
    }

    async fn save_position(&self, table_key: &str, lsn: &Lsn) -> Result<()> {
        let path = self.record_path(table_key)?;
        let json = serde_json::to_vec(&ProgressRecord::new(lsn.clone()))?;
        self.store.put(&path, PutPayload::from(json)).await?;

        debug!(table = %table_key, lsn = %lsn, "Progress saved");
        Ok(())
    }

    async fn delete_position(&self, table_key: &str) -> Result<()> {
        let path = self.record_path(table_key)?;
        match self.store.delete(&path).await {
            Ok(()) => {
                info!(table = %table_key, "Deleted progress record");
                Ok(())
            }
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn store() -> (Arc<InMemory>, ObjectProgressStore) {
        let memory = Arc::new(InMemory::new());
        let progress = ObjectProgressStore::new(memory.clone(), "cdc_states");
        (memory, progress)
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let (memory, progress) = store();
        assert!(progress.get_position("sales.orders").await.unwrap().is_none());

        progress
            .save_position("sales.orders", &Lsn::from_u64(0x1234))
            .await
            .unwrap();
        assert_eq!(
            progress.get_position("sales.orders").await.unwrap(),
            Some(Lsn::from_u64(0x1234))
        );

        let raw = memory
            .get(&Path::from("cdc_states/state_sales.orders.json"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let record: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(record["last_lsn"], "00000000000000001234");
    }

    #[tokio::test]
    async fn test_delete_and_missing_records() {
        let (_, progress) = store();
        progress.save_position("sales.orders", &Lsn::from_u64(7)).await.unwrap();
        progress.save_position("a b.c", &Lsn::from_u64(8)).await.unwrap();
        progress.save_position("a_b.c", &Lsn::from_u64(9)).await.unwrap();

        progress.delete_position("sales.orders").await.unwrap();
        progress.delete_position("sales.orders").await.unwrap();

        assert!(progress.get_position("sales.orders").await.unwrap().is_none());
        assert_eq!(progress.get_position("a b.c").await.unwrap(), Some(Lsn::from_u64(8)));
        assert_eq!(progress.get_position("a_b.c").await.unwrap(), Some(Lsn::from_u64(9)));
    }

    #[tokio::test]
    async fn test_corrupt_record_reads_as_absent() {
        let (memory, progress) = store();
        memory
            .put(
                &Path::from("cdc_states/state_sales.orders.json"),
                PutPayload::from(b"{not json".to_vec()),
            )
            .await
            .unwrap();

        assert!(progress.get_position("sales.orders").await.unwrap().is_none());
    }
}
