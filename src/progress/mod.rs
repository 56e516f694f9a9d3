//! Durable per-table replication progress.
//!
//! Each table's last committed change-log position is kept as its own record,
//! keyed by `dataset.table`, so tables can be reset or inspected one at a time.

pub mod file;
pub mod object;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StateConfig;
use crate::lsn::Lsn;
use crate::Result;

pub use file::FileProgressStore;
pub use object::ObjectProgressStore;
pub use postgres::PostgresProgressStore;

/// File or object name of the record for `table_key`: `state_{key}.json`.
///
/// Bytes other than ASCII alphanumerics and `._-` are written as `%XX`, so
/// distinct keys never share a record and a key cannot leave its folder.
pub fn record_name(table_key: &str) -> String {
    let mut name = String::with_capacity(table_key.len() + 11);
    name.push_str("state_");
    for byte in table_key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            name.push(char::from(byte));
        } else {
            name.push_str(&format!("%{:02X}", byte));
        }
    }
    name.push_str(".json");
    name
}

/// The stored form of one table's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub last_lsn: Lsn,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn new(last_lsn: Lsn) -> Self {
        Self {
            last_lsn,
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// The last committed position for `table_key`, if any.
    ///
    /// An unreadable record is reported as absent.
    async fn get_position(&self, table_key: &str) -> Result<Option<Lsn>>;

    /// Replaces the committed position for `table_key`.
    async fn save_position(&self, table_key: &str, lsn: &Lsn) -> Result<()>;

    /// Forgets `table_key`; the next cycle falls back to the earliest position.
    async fn delete_position(&self, table_key: &str) -> Result<()>;
}

#[async_trait]
impl<T: ProgressStore + ?Sized> ProgressStore for Box<T> {
    async fn get_position(&self, table_key: &str) -> Result<Option<Lsn>> {
        (**self).get_position(table_key).await
    }

    async fn save_position(&self, table_key: &str, lsn: &Lsn) -> Result<()> {
        (**self).save_position(table_key, lsn).await
    }

    async fn delete_position(&self, table_key: &str) -> Result<()> {
        (**self).delete_position(table_key).await
    }
}

/// Opens the progress store selected by the `state` configuration section.
pub async fn open(config: &StateConfig) -> Result<Box<dyn ProgressStore>> {
    match config {
        StateConfig::File { directory } => Ok(Box::new(FileProgressStore::new(directory))),
        StateConfig::Postgres { url, table } => {
            Ok(Box::new(PostgresProgressStore::connect(url, table).await?))
        }
        StateConfig::Gcs {
            bucket,
            folder,
            service_account_key_path,
        } => Ok(Box::new(ObjectProgressStore::gcs(
            bucket,
            folder,
            service_account_key_path.as_deref(),
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_file_backend() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&StateConfig::File {
            directory: temp_dir.path().join("states"),
        })
        .await
        .unwrap();

        store.save_position("sales.orders", &Lsn::from_u64(5)).await.unwrap();
        assert_eq!(
            store.get_position("sales.orders").await.unwrap(),
            Some(Lsn::from_u64(5))
        );
        assert!(temp_dir.path().join("states/state_sales.orders.json").exists());
    }

    #[test]
    fn test_record_names_do_not_collide() {
        assert_eq!(record_name("sales.orders"), "state_sales.orders.json");
        assert_eq!(record_name("a b.c"), "state_a%20b.c.json");
        assert_eq!(record_name("a_b.c"), "state_a_b.c.json");
        assert_eq!(record_name("a%20b.c"), "state_a%2520b.c.json");
        assert_eq!(record_name("../x/y"), "state_..%2Fx%2Fy.json");
        assert_eq!(record_name("vente.créée"), "state_vente.cr%C3%A9%C3%A9e.json");
    }
}
