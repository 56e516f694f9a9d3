//! Progress records as JSON files, one per table.
//!
//! # Example
//!
//! ```rust,no_run
//! use mssql_cdc_sync::lsn::Lsn;
//! use mssql_cdc_sync::progress::{FileProgressStore, ProgressStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = FileProgressStore::new("cdc_states");
//!
//!     if let Some(lsn) = store.get_position("sales.orders").await? {
//!         println!("Resuming after LSN: {}", lsn);
//!     }
//!
//!     store.save_position("sales.orders", &Lsn::from_u64(42)).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{record_name, ProgressRecord, ProgressStore};
use crate::lsn::Lsn;
use crate::Result;

/// Stores each table's progress in `{directory}/state_{table_key}.json`.
///
/// Writes go to a temporary file that is synced and then renamed over the
/// record, so a crash mid-write leaves the previous record intact.
pub struct FileProgressStore {
    directory: PathBuf,
}

impl FileProgressStore {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    /// Path of the record for `table_key`.
    pub fn record_path(&self, table_key: &str) -> PathBuf {
        self.directory.join(record_name(table_key))
    }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    async fn get_position(&self, table_key: &str) -> Result<Option<Lsn>> {
        let path = self.record_path(table_key);
        if !fs::try_exists(&path).await? {
            debug!(table = %table_key, "No progress record at {:?}", path);
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        match serde_json::from_str::<ProgressRecord>(&content) {
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
                    "Ignoring unreadable progress record {:?}: {}", path, e
                );
                Ok(None)
            }
        }
    }

    async fn save_position(&self, table_key: &str, lsn: &Lsn) -> Result<()> {
        fs::create_dir_all(&self.directory).await?;

        let path = self.record_path(table_key);
        let temp_path = path.with_extension("tmp");

        let json = serde_json::to_string_pretty(&ProgressRecord::new(lsn.clone()))?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &path).await?;

        debug!(table = %table_key, lsn = %lsn, "Progress saved");
        Ok(())
    }

    async fn delete_position(&self, table_key: &str) -> Result<()> {
        let path = self.record_path(table_key);
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
            info!(table = %table_key, "Deleted progress record");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileProgressStore::new(temp_dir.path());

        assert!(store.get_position("sales.orders").await.unwrap().is_none());

        store
            .save_position("sales.orders", &Lsn::from_u64(0x1234))
            .await
            .unwrap();
        let loaded = store.get_position("sales.orders").await.unwrap().unwrap();
        assert_eq!(loaded, Lsn::from_u64(0x1234));
    }

    #[tokio::test]
    async fn test_overwrite_keeps_latest() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileProgressStore::new(temp_dir.path());

        store.save_position("sales.orders", &Lsn::from_u64(1)).await.unwrap();
        store.save_position("sales.orders", &Lsn::from_u64(2)).await.unwrap();

        let loaded = store.get_position("sales.orders").await.unwrap().unwrap();
        assert_eq!(loaded, Lsn::from_u64(2));
        assert!(!store.record_path("sales.orders").with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_records_are_independent() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileProgressStore::new(temp_dir.path());

        store.save_position("sales.orders", &Lsn::from_u64(7)).await.unwrap();
        store.save_position("sales.customers", &Lsn::from_u64(9)).await.unwrap();
        store.delete_position("sales.orders").await.unwrap();

        assert!(store.get_position("sales.orders").await.unwrap().is_none());
        assert_eq!(
            store.get_position("sales.customers").await.unwrap(),
            Some(Lsn::from_u64(9))
        );
    }

    #[tokio::test]
    async fn test_corrupt_record_reads_as_absent() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileProgressStore::new(temp_dir.path());
        std::fs::write(store.record_path("sales.orders"), "{not json").unwrap();

        assert!(store.get_position("sales.orders").await.unwrap().is_none());
    }

    #[test]
    fn test_record_path_is_sanitized() {
        let store = FileProgressStore::new("/state");
        assert_eq!(
            store.record_path("sales.orders"),
            PathBuf::from("/state/state_sales.orders.json")
        );
        assert_eq!(
            store.record_path("../x/y"),
            PathBuf::from("/state/state_..%2Fx%2Fy.json")
        );
    }

    #[tokio::test]
    async fn test_similar_keys_keep_separate_records() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileProgressStore::new(temp_dir.path());

        store.save_position("a b.c", &Lsn::from_u64(1)).await.unwrap();
        store.save_position("a_b.c", &Lsn::from_u64(2)).await.unwrap();

        assert_eq!(store.get_position("a b.c").await.unwrap(), Some(Lsn::from_u64(1)));
        assert_eq!(store.get_position("a_b.c").await.unwrap(), Some(Lsn::from_u64(2)));
    }
}
