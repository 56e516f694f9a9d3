pub mod change;
pub mod clean;
pub mod config;
pub mod error;
pub mod lsn;
pub mod memory;
pub mod progress;
pub mod reconcile;
pub mod replicator;
pub mod schema;
pub mod source;
pub mod warehouse;

pub use config::Config;
pub use error::{Error, Result};
pub use replicator::{Replicator, RunReport};
