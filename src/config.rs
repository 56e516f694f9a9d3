use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONNECTION: &str = "default";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub sources: HashMap<String, SourceConfig>,
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub tables: Vec<TableSyncSpec>,
}

/// Connection settings for one SQL Server source.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub host: String,
    #[serde(default = "default_sql_server_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub trust_server_certificate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WarehouseConfig {
    pub project_id: String,
    pub service_account_key_path: String,
    #[serde(default = "default_staging_suffix")]
    pub staging_suffix: String,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StateConfig {
    File {
        #[serde(default = "default_state_directory")]
        directory: PathBuf,
    },
    Postgres {
        url: String,
        #[serde(default = "default_state_table")]
        table: String,
    },
    /// One object per table under `folder` in a Cloud Storage bucket.
    Gcs {
        bucket: String,
        #[serde(default = "default_state_folder")]
        folder: String,
        /// Falls back to the ambient Google credentials when unset.
        #[serde(default)]
        service_account_key_path: Option<String>,
    },
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig::File {
            directory: default_state_directory(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

/// Per-table replication settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TableSyncSpec {
    /// Source table as `schema.table`.
    pub source_table: String,
    pub dataset: String,
    pub table: String,
    /// Business key columns; a single name is accepted too.
    #[serde(deserialize_with = "one_or_many")]
    pub primary_key: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub connection: Option<String>,
    #[serde(default)]
    pub capture_instance: Option<String>,
}

impl TableSyncSpec {
    pub fn new(source_table: &str, dataset: &str, table: &str, primary_key: &[&str]) -> Self {
        Self {
            source_table: source_table.to_string(),
            dataset: dataset.to_string(),
            table: table.to_string(),
            primary_key: primary_key.iter().map(|k| k.to_string()).collect(),
            active: true,
            connection: None,
            capture_instance: None,
        }
    }

    pub fn with_connection(mut self, connection: &str) -> Self {
        self.connection = Some(connection.to_string());
        self
    }

    /// Key under which replication progress is stored.
    pub fn table_key(&self) -> String {
        format!("{}.{}", self.dataset, self.table)
    }

    pub fn connection_id(&self) -> &str {
        self.connection.as_deref().unwrap_or(DEFAULT_CONNECTION)
    }

    /// CDC capture instance; SQL Server's default is `schema_table`.
    pub fn capture_instance(&self) -> String {
        self.capture_instance
            .clone()
            .unwrap_or_else(|| self.source_table.replace('.', "_"))
    }

    /// Whether this table takes part in a run restricted to `selector`.
    pub fn is_selected(&self, selector: Option<&str>) -> bool {
        self.active && selector.map_or(true, |s| s == self.connection_id())
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("CDC_SYNC")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let keys = match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(key) => vec![key],
        OneOrMany::Many(keys) => keys,
    };
    if keys.is_empty() {
        return Err(serde::de::Error::custom("primary_key must name at least one column"));
    }
    Ok(keys)
}

fn default_sql_server_port() -> u16 {
    1433
}

fn default_staging_suffix() -> String {
    "_staging".to_string()
}

fn default_query_timeout_ms() -> i32 {
    120_000
}

fn default_state_directory() -> PathBuf {
    PathBuf::from("cdc_states")
}

fn default_state_folder() -> String {
    "cdc_states".to_string()
}

fn default_state_table() -> String {
    "cdc_sync_state".to_string()
}

fn default_chunk_size() -> usize {
    50_000
}

fn default_active() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[sources.default]
host = "sql.internal"
database = "shop"
username = "cdc_reader"
password = "secret"

[warehouse]
project_id = "analytics-prod"
service_account_key_path = "/etc/cdc/key.json"

[state]
backend = "postgres"
url = "postgres://state@localhost/cdc"

[[tables]]
source_table = "dbo.orders"
dataset = "sales"
table = "orders"
primary_key = "order_id"

[[tables]]
source_table = "dbo.order_lines"
dataset = "sales"
table = "order_lines"
primary_key = ["order_id", "line_no"]
connection = "crm"
active = false
"#;

    fn load_sample() -> Config {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        Config::from_file(file.path()).unwrap()
    }

    #[test]
    fn test_defaults_are_applied() {
        let config = load_sample();
        let source = &config.sources["default"];
        assert_eq!(source.port, 1433);
        assert!(!source.trust_server_certificate);
        assert_eq!(config.warehouse.staging_suffix, "_staging");
        assert_eq!(config.sync.chunk_size, 50_000);
        match &config.state {
            StateConfig::Postgres { table, .. } => assert_eq!(table, "cdc_sync_state"),
            other => panic!("unexpected state backend: {:?}", other),
        }
    }

    #[test]
    fn test_primary_key_accepts_string_or_list() {
        let config = load_sample();
        assert_eq!(config.tables[0].primary_key, vec!["order_id"]);
        assert_eq!(config.tables[1].primary_key, vec!["order_id", "line_no"]);
    }

    #[test]
    fn test_table_helpers() {
        let spec = TableSyncSpec::new("dbo.orders", "sales", "orders", &["order_id"]);
        assert_eq!(spec.table_key(), "sales.orders");
        assert_eq!(spec.capture_instance(), "dbo_orders");
        assert_eq!(spec.connection_id(), DEFAULT_CONNECTION);
    }

    #[test]
    fn test_selection_respects_active_flag_and_connection() {
        let config = load_sample();
        let (orders, lines) = (&config.tables[0], &config.tables[1]);
        assert!(orders.is_selected(None));
        assert!(orders.is_selected(Some("default")));
        assert!(!orders.is_selected(Some("crm")));
        assert!(!lines.is_selected(None));
        assert!(!lines.is_selected(Some("crm")));
    }

    #[test]
    fn test_gcs_state_backend() {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
[warehouse]
project_id = "analytics-prod"
service_account_key_path = "/etc/cdc/key.json"

[state]
backend = "gcs"
bucket = "cdc-bucket"
"#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: Config = settings.try_deserialize().unwrap();
        match config.state {
            StateConfig::Gcs {
                bucket,
                folder,
                service_account_key_path,
            } => {
                assert_eq!(bucket, "cdc-bucket");
                assert_eq!(folder, "cdc_states");
                assert!(service_account_key_path.is_none());
            }
            other => panic!("unexpected state backend: {:?}", other),
        }
    }
}
