//! In-memory stores for dry runs and tests.
//!
//! Each double can be told to fail, so the batch writer's error paths can be
//! driven without a database.

use super::{
    vehicle_id_from_key, vehicle_key, AlarmRow, CacheStore, ColumnStore, OrderRow, RelationalStore, RelationalTransaction,
    TrackingRow, VehicleState, ALARM_TABLE,
};
use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

const STORE: &str = "memory";

fn injected(key: &str) -> StoreError {
    StoreError::Write {
        store: STORE,
        key: key.to_string(),
        message: "injected write failure".into(),
    }
}

/// Keys to fail on, plus a switch failing everything.
#[derive(Default)]
struct FailureSwitch {
    all: AtomicBool,
    keys: Mutex<HashSet<String>>,
}

impl FailureSwitch {
    fn check(&self, key: &str) -> Result<(), StoreError> {
        if self.all.load(Ordering::Relaxed) || self.keys.lock().contains(key) {
            Err(injected(key))
        } else {
            Ok(())
        }
    }
}

/// Latest-state cache in a concurrent map, with the same key index the
/// Redis cache keeps.
#[derive(Default)]
pub struct MemoryCacheStore {
    states: DashMap<String, VehicleState>,
    index: DashSet<String>,
    failures: FailureSwitch,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write.
    pub fn fail_writes(&self, fail: bool) {
        self.failures.all.store(fail, Ordering::Relaxed);
    }

    /// Fail writes for one vehicle.
    pub fn fail_on(&self, vehicle_id: &str) {
        self.failures.keys.lock().insert(vehicle_id.to_string());
    }

    /// Cache keys in the vehicle index, sorted.
    pub fn index_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.index.iter().map(|k| k.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn upsert_vehicle(&self, state: &VehicleState) -> Result<(), StoreError> {
        self.failures.check(&state.vehicle_id)?;
        self.states.insert(state.vehicle_id.clone(), state.clone());
        self.index.insert(vehicle_key(&state.vehicle_id));
        Ok(())
    }

    async fn vehicle(&self, vehicle_id: &str) -> Result<Option<VehicleState>, StoreError> {
        Ok(self.states.get(vehicle_id).map(|s| s.value().clone()))
    }

    async fn vehicles(&self) -> Result<Vec<VehicleState>, StoreError> {
        let mut vehicles: Vec<_> = self
            .index
            .iter()
            .filter_map(|key| {
                let vehicle_id = vehicle_id_from_key(key.key())?;
                self.states.get(vehicle_id).map(|s| s.value().clone())
            })
            .collect();
        vehicles.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
        Ok(vehicles)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Position history ordered by row key.
#[derive(Default)]
pub struct MemoryColumnStore {
    rows: Mutex<BTreeMap<String, TrackingRow>>,
    failures: FailureSwitch,
}

impl MemoryColumnStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write.
    pub fn fail_writes(&self, fail: bool) {
        self.failures.all.store(fail, Ordering::Relaxed);
    }

    /// Fail writes for one vehicle.
    pub fn fail_on(&self, vehicle_id: &str) {
        self.failures.keys.lock().insert(vehicle_id.to_string());
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl ColumnStore for MemoryColumnStore {
    async fn put_location(&self, row: &TrackingRow) -> Result<(), StoreError> {
        self.failures.check(&row.vehicle_id)?;
        self.rows.lock().insert(row.row_key(), row.clone());
        Ok(())
    }

    async fn history(
        &self,
        vehicle_id: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<TrackingRow>, StoreError> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .values()
            .filter(|r| r.vehicle_id == vehicle_id && (from..=to).contains(&r.timestamp))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.timestamp);
        Ok(rows)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
struct RelationalState {
    tables: Mutex<BTreeSet<String>>,
    orders: Mutex<BTreeMap<String, Vec<OrderRow>>>,
    alarms: Mutex<Vec<AlarmRow>>,
    failures: FailureSwitch,
    fail_commit: AtomicBool,
    open_transactions: AtomicUsize,
    commits: AtomicU64,
}

impl RelationalState {
    fn check_table(&self, table: &str, key: &str) -> Result<(), StoreError> {
        if self.tables.lock().contains(table) {
            Ok(())
        } else {
            Err(StoreError::Write {
                store: STORE,
                key: key.to_string(),
                message: format!("table '{}' doesn't exist", table),
            })
        }
    }
}

/// Orders and alarms with staged transactions.
///
/// Rows become visible only on commit. Inserting into a table that
/// `ensure_tables` never created fails like it would on a real server.
#[derive(Clone, Default)]
pub struct MemoryRelationalStore {
    state: Arc<RelationalState>,
}

impl MemoryRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every commit fail.
    pub fn fail_commits(&self, fail: bool) {
        self.state.fail_commit.store(fail, Ordering::Relaxed);
    }

    /// Fail inserts keyed by `key` (order id or device id).
    pub fn fail_on(&self, key: &str) {
        self.state.failures.keys.lock().insert(key.to_string());
    }

    /// Committed rows of one order table.
    pub fn orders(&self, table: &str) -> Vec<OrderRow> {
        self.state
            .orders
            .lock()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Committed rows across every order table.
    pub fn order_count(&self) -> usize {
        self.state.orders.lock().values().map(Vec::len).sum()
    }

    /// Committed alarm rows.
    pub fn alarms(&self) -> Vec<AlarmRow> {
        self.state.alarms.lock().clone()
    }

    /// Tables created so far.
    pub fn tables(&self) -> Vec<String> {
        self.state.tables.lock().iter().cloned().collect()
    }

    /// Transactions begun and not yet finished or dropped.
    pub fn open_transactions(&self) -> usize {
        self.state.open_transactions.load(Ordering::SeqCst)
    }

    /// Successful commits.
    pub fn commits(&self) -> u64 {
        self.state.commits.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn ensure_tables(&self, order_tables: &[String]) -> Result<(), StoreError> {
        let mut tables = self.state.tables.lock();
        tables.insert(ALARM_TABLE.to_string());
        tables.extend(order_tables.iter().cloned());
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn RelationalTransaction>, StoreError> {
        self.state.open_transactions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            orders: Vec::new(),
            alarms: Vec::new(),
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct MemoryTransaction {
    state: Arc<RelationalState>,
    orders: Vec<OrderRow>,
    alarms: Vec<AlarmRow>,
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.state.open_transactions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RelationalTransaction for MemoryTransaction {
    async fn insert_order(&mut self, row: &OrderRow) -> Result<(), StoreError> {
        self.state.failures.check(&row.order_id)?;
        self.state.check_table(&row.table, &row.order_id)?;
        self.orders.push(row.clone());
        Ok(())
    }

    async fn insert_alarm(&mut self, row: &AlarmRow) -> Result<(), StoreError> {
        self.state.failures.check(&row.vehicle_id)?;
        self.state.check_table(ALARM_TABLE, &row.vehicle_id)?;
        self.alarms.push(row.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        if this.state.fail_commit.load(Ordering::Relaxed) {
            return Err(StoreError::Query {
                store: STORE,
                message: "injected commit failure".into(),
            });
        }

        let state = this.state.clone();
        {
            let mut orders = state.orders.lock();
            for row in this.orders.drain(..) {
                orders.entry(row.table.clone()).or_default().push(row);
            }
        }
        state.alarms.lock().append(&mut this.alarms);
        state.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
