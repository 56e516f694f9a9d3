#![allow(dead_code)]

use mssql_cdc_sync::change::{ChangeRow, Operation, Value};
use mssql_cdc_sync::config::TableSyncSpec;
use mssql_cdc_sync::lsn::Lsn;
use mssql_cdc_sync::memory::{
    MemoryProgressStore, MemorySource, MemorySourceFactory, MemoryWarehouse,
};
use mssql_cdc_sync::Replicator;

pub type MemoryReplicator = Replicator<MemorySourceFactory, MemoryWarehouse, MemoryProgressStore>;

pub const ORDER_COLUMNS: [&str; 3] = ["order_id", "customer", "amount"];

/// A replicator over in-memory backends, with handles kept for inspection.
pub struct Harness {
    pub source: MemorySource,
    pub factory: MemorySourceFactory,
    pub warehouse: MemoryWarehouse,
    pub progress: MemoryProgressStore,
    pub replicator: MemoryReplicator,
}

impl Harness {
    /// One source on the default connection.
    pub fn new() -> Self {
        Self::with_chunk_size(50_000)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        let source = MemorySource::new();
        let factory = MemorySourceFactory::new().with_source("default", source.clone());
        let warehouse = MemoryWarehouse::new();
        let progress = MemoryProgressStore::new();
        let replicator = Replicator::new(
            factory.clone(),
            warehouse.clone(),
            progress.clone(),
            chunk_size,
        );

        Self {
            source,
            factory,
            warehouse,
            progress,
            replicator,
        }
    }

    pub fn positions_saved_for(&self, table_key: &str) -> Vec<Lsn> {
        self.progress
            .saves()
            .into_iter()
            .filter(|(key, _)| key == table_key)
            .map(|(_, lsn)| lsn)
            .collect()
    }
}

pub fn orders_spec() -> TableSyncSpec {
    TableSyncSpec::new("dbo.orders", "sales", "orders", &["order_id"])
}

pub fn order(id: i64, customer: &str, amount: i64) -> Vec<Value> {
    vec![Value::Int(id), Value::from(customer), Value::Int(amount)]
}

/// Declares `dbo.orders` with three rows and sets the high-water mark.
pub fn seed_orders(source: &MemorySource, high_water: u64) {
    source.add_table("dbo.orders", &ORDER_COLUMNS);
    source.insert_row("dbo.orders", order(1, "alice", 10));
    source.insert_row("dbo.orders", order(2, "bob", 20));
    source.insert_row("dbo.orders", order(3, "carol", 30));
    source.set_high_water(Lsn::from_u64(high_water));
}

pub fn change(lsn: u64, seqval: u64, operation: Operation, values: Vec<Value>) -> ChangeRow {
    ChangeRow {
        start_lsn: Lsn::from_u64(lsn),
        seqval: Lsn::from_u64(seqval),
        operation,
        update_mask: None,
        values,
    }
}
