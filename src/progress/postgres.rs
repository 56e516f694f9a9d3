use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info, warn};

use super::ProgressStore;
use crate::lsn::Lsn;
use crate::{Error, Result};

/// Keeps progress as one row per table in a PostgreSQL table.
pub struct PostgresProgressStore {
    client: Client,
    table: String,
    connection_task: tokio::task::JoinHandle<()>,
}

impl PostgresProgressStore {
    /// Connects and creates the progress table if needed.
    pub async fn connect(url: &str, table: &str) -> Result<Self> {
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Err(Error::Config(format!(
                "invalid progress table name '{}'",
                table
            )));
        }

        let config = url.parse::<tokio_postgres::Config>()?;
        let (client, connection) = config.connect(NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Progress store connection error: {}", e);
            }
        });

        client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    table_key TEXT PRIMARY KEY,
                    last_lsn TEXT NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                table
            ))
            .await?;

        info!(table = %table, "Connected to PostgreSQL progress store");

        Ok(Self {
            client,
            table: table.to_string(),
            connection_task,
        })
    }
}

impl Drop for PostgresProgressStore {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}

#[async_trait]
impl ProgressStore for PostgresProgressStore {
    async fn get_position(&self, table_key: &str) -> Result<Option<Lsn>> {
        let row = self
            .client
            .query_opt(
                &format!("SELECT last_lsn FROM {} WHERE table_key = $1", self.table),
                &[&table_key],
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let text: String = row.try_get(0)?;
        match Lsn::from_hex(&text) {
            Ok(lsn) => Ok(Some(lsn)),
            Err(e) => {
                warn!(table = %table_key, "Ignoring unreadable progress record: {}", e);
                Ok(None)
            }
        }
    }

    async fn save_position(&self, table_key: &str, lsn: &Lsn) -> Result<()> {
        self.client
            .execute(
                &format!(
                    "INSERT INTO {} (table_key, last_lsn, updated_at) VALUES ($1, $2, NOW())
                     ON CONFLICT (table_key) DO UPDATE SET
                        last_lsn = EXCLUDED.last_lsn,
                        updated_at = EXCLUDED.updated_at",
                    self.table
                ),
                &[&table_key, &lsn.to_hex()],
            )
            .await?;

        debug!(table = %table_key, lsn = %lsn, "Progress saved");
        Ok(())
    }

    async fn delete_position(&self, table_key: &str) -> Result<()> {
        let removed = self
            .client
            .execute(
                &format!("DELETE FROM {} WHERE table_key = $1", self.table),
                &[&table_key],
            )
            .await?;
        if removed > 0 {
            info!(table = %table_key, "Deleted progress record");
        }
        Ok(())
    }
}
