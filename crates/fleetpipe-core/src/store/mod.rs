//! Backing stores and the rows written to them.
//!
//! Three access patterns, three traits:
//!
//! - [`CacheStore`] keeps the latest state of every vehicle (Redis).
//! - [`ColumnStore`] keeps the append-only position history (HBase).
//! - [`RelationalStore`] keeps order tracking and alarms (MySQL), written in
//!   one transaction per micro-batch.
//!
//! Each trait has a network adapter and an in-memory double.

mod hbase;
mod memory;
mod mysql;
mod redis;

pub use self::hbase::HBaseColumnStore;
pub use self::memory::{MemoryCacheStore, MemoryColumnStore, MemoryRelationalStore};
pub use self::mysql::MySqlRelationalStore;
pub use self::redis::RedisCacheStore;

use crate::error::StoreError;
use crate::telemetry::{AlertRecord, LocationRecord, LogisticsRecord};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::HashMap;

/// Set holding the cache key of every vehicle seen.
pub const VEHICLE_INDEX_KEY: &str = "vehicle:keys";

/// Relational table receiving alerts.
pub const ALARM_TABLE: &str = "alarm_log";

/// Cache key of a vehicle hash.
pub fn vehicle_key(vehicle_id: &str) -> String {
    format!("{}{}", VEHICLE_KEY_PREFIX, vehicle_id)
}

/// Vehicle id of a cache key, if it is one.
pub fn vehicle_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(VEHICLE_KEY_PREFIX)
        .filter(|id| !id.is_empty())
}

const VEHICLE_KEY_PREFIX: &str = "vehicle:";

/// Latest known state of a vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleState {
    pub vehicle_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub direction: i32,
    pub status: String,
    pub load: u8,
    pub timestamp: f64,
}

impl VehicleState {
    /// State carried by a location record.
    pub fn from_location(record: &LocationRecord) -> Self {
        Self {
            vehicle_id: record.vehicle_id.clone(),
            latitude: record.latitude,
            longitude: record.longitude,
            speed: record.speed,
            direction: record.direction,
            status: record.status.as_str().to_string(),
            load: record.load,
            timestamp: record.timestamp,
        }
    }

    /// Cache key of this vehicle.
    pub fn cache_key(&self) -> String {
        vehicle_key(&self.vehicle_id)
    }

    /// Hash fields as stored in the cache.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("lat", self.latitude.to_string()),
            ("lon", self.longitude.to_string()),
            ("speed", self.speed.to_string()),
            ("dir", self.direction.to_string()),
            ("status", self.status.clone()),
            ("load", self.load.to_string()),
            ("timestamp", self.timestamp.to_string()),
        ]
    }

    /// Rebuild a state from cached hash fields.
    pub fn from_fields(
        vehicle_id: &str,
        fields: &HashMap<String, String>,
    ) -> Result<Self, StoreError> {
        fn field<T: std::str::FromStr>(
            vehicle_id: &str,
            fields: &HashMap<String, String>,
            name: &str,
        ) -> Result<T, StoreError> {
            fields
                .get(name)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| StoreError::InvalidRecord {
                    key: vehicle_key(vehicle_id),
                    message: format!("missing or invalid field '{}'", name),
                })
        }

        Ok(Self {
            vehicle_id: vehicle_id.to_string(),
            latitude: field(vehicle_id, fields, "lat")?,
            longitude: field(vehicle_id, fields, "lon")?,
            speed: field(vehicle_id, fields, "speed")?,
            direction: field(vehicle_id, fields, "dir")?,
            status: field(vehicle_id, fields, "status")?,
            load: field(vehicle_id, fields, "load")?,
            timestamp: field(vehicle_id, fields, "timestamp")?,
        })
    }
}

/// One row of the position history table.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingRow {
    pub vehicle_id: String,
    /// Whole seconds since the epoch, as used in the row key
    pub timestamp: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub direction: i32,
    pub status: String,
}

impl TrackingRow {
    /// Row for a location record.
    pub fn from_location(record: &LocationRecord) -> Self {
        Self {
            vehicle_id: record.vehicle_id.clone(),
            timestamp: record.timestamp.trunc() as i64,
            latitude: record.latitude,
            longitude: record.longitude,
            speed: record.speed,
            direction: record.direction,
            status: record.status.as_str().to_string(),
        }
    }

    /// `<vehicle_id>_<unix_seconds>`
    pub fn row_key(&self) -> String {
        format!("{}_{}", self.vehicle_id, self.timestamp)
    }

    /// `(family:qualifier, value)` pairs.
    pub fn cells(&self) -> Vec<(&'static str, String)> {
        vec![
            ("loc:lat", self.latitude.to_string()),
            ("loc:lon", self.longitude.to_string()),
            ("stat:speed", self.speed.to_string()),
            ("stat:dir", self.direction.to_string()),
            ("stat:status", self.status.clone()),
        ]
    }

    /// Rebuild a row from its key and cells.
    pub fn from_cells(row_key: &str, cells: &HashMap<String, String>) -> Result<Self, StoreError> {
        let invalid = |message: String| StoreError::InvalidRecord {
            key: row_key.to_string(),
            message,
        };

        let (vehicle_id, timestamp) = parse_row_key(row_key)
            .ok_or_else(|| invalid("row key is not <vehicle>_<seconds>".into()))?;

        fn cell<T: std::str::FromStr>(
            cells: &HashMap<String, String>,
            name: &str,
        ) -> Result<T, String> {
            cells
                .get(name)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| format!("missing or invalid cell '{}'", name))
        }

        Ok(Self {
            vehicle_id: vehicle_id.to_string(),
            timestamp,
            latitude: cell(cells, "loc:lat").map_err(invalid)?,
            longitude: cell(cells, "loc:lon").map_err(invalid)?,
            speed: cell(cells, "stat:speed").map_err(invalid)?,
            direction: cell(cells, "stat:dir").map_err(invalid)?,
            status: cell(cells, "stat:status").map_err(invalid)?,
        })
    }
}

/// Split `<vehicle_id>_<seconds>`.
pub fn parse_row_key(row_key: &str) -> Option<(&str, i64)> {
    let (vehicle_id, seconds) = row_key.rsplit_once('_')?;
    Some((vehicle_id, seconds.parse().ok()?))
}

/// Order tracking row for the monthly order table.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRow {
    /// `order_<YYYYMM>` of the event time
    pub table: String,
    pub order_id: String,
    /// Emitting device; the order table's vehicle column holds device ids
    pub vehicle_id: String,
    pub status: String,
    pub temperature: f64,
    pub humidity: u8,
    /// Event time in UTC
    pub event_time: NaiveDateTime,
}

impl OrderRow {
    /// Row for a logistics record.
    pub fn from_logistics(record: &LogisticsRecord) -> Result<Self, StoreError> {
        let event_time = utc_datetime(record.timestamp).ok_or_else(|| StoreError::InvalidRecord {
            key: record.package_id.clone(),
            message: format!("timestamp {} out of range", record.timestamp),
        })?;

        Ok(Self {
            table: order_table_name(&event_time),
            order_id: record.package_id.clone(),
            vehicle_id: record.device_id.clone(),
            status: record.status.as_str().to_string(),
            temperature: record.temperature,
            humidity: record.humidity,
            event_time: event_time.naive_utc(),
        })
    }
}

/// Alarm log row.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmRow {
    /// Emitting device; the alarm table's vehicle column holds device ids
    pub vehicle_id: String,
    pub alert_type: String,
    pub severity: String,
    /// Event time in UTC
    pub timestamp: NaiveDateTime,
    pub detail: String,
}

impl AlarmRow {
    /// Row for an alert record.
    pub fn from_alert(record: &AlertRecord) -> Result<Self, StoreError> {
        let timestamp = utc_datetime(record.timestamp).ok_or_else(|| StoreError::InvalidRecord {
            key: record.device_id.clone(),
            message: format!("timestamp {} out of range", record.timestamp),
        })?;

        Ok(Self {
            vehicle_id: record.device_id.clone(),
            alert_type: record.alert_type.as_str().to_string(),
            severity: record.severity.as_str().to_string(),
            timestamp: timestamp.naive_utc(),
            detail: record.detail.clone(),
        })
    }
}

/// `order_<YYYYMM>` for an event time.
pub fn order_table_name(event_time: &DateTime<Utc>) -> String {
    format!("order_{}", event_time.format("%Y%m"))
}

fn utc_datetime(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let micros = (seconds * 1_000_000.0).round();
    if micros.abs() >= i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp_micros(micros as i64)
}

/// Latest-state cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Overwrite the vehicle hash and add its key to the index set.
    async fn upsert_vehicle(&self, state: &VehicleState) -> Result<(), StoreError>;

    /// State of one vehicle.
    async fn vehicle(&self, vehicle_id: &str) -> Result<Option<VehicleState>, StoreError>;

    /// State of every indexed vehicle, sorted by vehicle id.
    async fn vehicles(&self) -> Result<Vec<VehicleState>, StoreError>;

    /// Check connectivity.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Append-only position history.
#[async_trait]
pub trait ColumnStore: Send + Sync {
    /// Write one history row. Rewriting the same row key overwrites it.
    async fn put_location(&self, row: &TrackingRow) -> Result<(), StoreError>;

    /// Rows of a vehicle with `from <= timestamp <= to`, oldest first.
    async fn history(
        &self,
        vehicle_id: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<TrackingRow>, StoreError>;

    /// Check connectivity.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Transactional store for orders and alarms.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Create the alarm table and the given monthly order tables if missing.
    ///
    /// Must run outside any batch transaction.
    async fn ensure_tables(&self, order_tables: &[String]) -> Result<(), StoreError>;

    /// Open a transaction holding one connection until commit or drop.
    async fn begin(&self) -> Result<Box<dyn RelationalTransaction>, StoreError>;

    /// Check connectivity.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// An open relational transaction.
///
/// A failed insert leaves the transaction usable; earlier inserts are kept.
/// Dropping without commit rolls back.
#[async_trait]
pub trait RelationalTransaction: Send {
    async fn insert_order(&mut self, row: &OrderRow) -> Result<(), StoreError>;

    async fn insert_alarm(&mut self, row: &AlarmRow) -> Result<(), StoreError>;

    /// Dropping a transaction without committing discards its rows.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{AlertType, Severity, ShipmentStatus, VehicleStatus};

    fn location() -> LocationRecord {
        LocationRecord {
            device_id: "D0000".into(),
            vehicle_id: "V100".into(),
            latitude: 31.2,
            longitude: 120.5,
            speed: 60.0,
            direction: 0,
            status: VehicleStatus::InTransit,
            load: 40,
            timestamp: 1_717_171_717.9,
        }
    }

    #[test]
    fn test_vehicle_state_fields() {
        let state = VehicleState::from_location(&location());
        assert_eq!(state.cache_key(), "vehicle:V100");
        assert_eq!(vehicle_id_from_key(&state.cache_key()), Some("V100"));
        assert_eq!(vehicle_id_from_key("vehicle:"), None);
        assert_eq!(vehicle_id_from_key("order:P1"), None);

        let fields: HashMap<String, String> = state
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(fields["lat"], "31.2");
        assert_eq!(fields["speed"], "60");
        assert_eq!(fields["status"], "in_transit");
        assert_eq!(VehicleState::from_fields("V100", &fields).unwrap(), state);
    }

    #[test]
    fn test_vehicle_state_missing_field() {
        let fields = HashMap::from([("lat".to_string(), "31.2".to_string())]);
        let err = VehicleState::from_fields("V100", &fields).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord { ref key, .. } if key == "vehicle:V100"));
    }

    #[test]
    fn test_tracking_row_key_truncates_seconds() {
        let row = TrackingRow::from_location(&location());
        assert_eq!(row.row_key(), "V100_1717171717");

        let cells: HashMap<String, String> = row
            .cells()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(cells["loc:lat"], "31.2");
        assert_eq!(cells["stat:status"], "in_transit");
        assert_eq!(TrackingRow::from_cells(&row.row_key(), &cells).unwrap(), row);
    }

    #[test]
    fn test_parse_row_key() {
        assert_eq!(parse_row_key("V100_1717171717"), Some(("V100", 1717171717)));
        assert_eq!(parse_row_key("V100"), None);
        assert_eq!(parse_row_key("V100_abc"), None);
    }

    #[test]
    fn test_order_row_monthly_table_in_utc() {
        let record = LogisticsRecord {
            device_id: "D0003".into(),
            package_id: "P654321".into(),
            temperature: 4.5,
            humidity: 70,
            status: ShipmentStatus::PickedUp,
            // 2024-01-31T23:30:00Z
            timestamp: 1_706_743_800.0,
        };

        let row = OrderRow::from_logistics(&record).unwrap();
        assert_eq!(row.table, "order_202401");
        assert_eq!(row.order_id, "P654321");
        assert_eq!(row.vehicle_id, "D0003");
        assert_eq!(row.status, "picked_up");
        assert_eq!(row.event_time.to_string(), "2024-01-31 23:30:00");
    }

    #[test]
    fn test_order_row_rejects_bad_timestamp() {
        let record = LogisticsRecord {
            device_id: "D0003".into(),
            package_id: "P1".into(),
            temperature: 4.5,
            humidity: 70,
            status: ShipmentStatus::Delivered,
            timestamp: 1e300,
        };
        assert!(matches!(
            OrderRow::from_logistics(&record),
            Err(StoreError::InvalidRecord { .. })
        ));
    }

    #[test]
    fn test_alarm_row() {
        let record = AlertRecord {
            device_id: "D0001".into(),
            alert_type: AlertType::Tampering,
            severity: Severity::Low,
            timestamp: 0.5,
            detail: "Alert triggered by device D0001".into(),
        };
        let row = AlarmRow::from_alert(&record).unwrap();
        assert_eq!(row.vehicle_id, "D0001");
        assert_eq!(row.alert_type, "tampering");
        assert_eq!(row.timestamp.to_string(), "1970-01-01 00:00:00.500");
    }
}
