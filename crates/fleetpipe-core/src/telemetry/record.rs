//! Typed telemetry records and the topics they travel on.
//!
//! The JSON field names here are the wire contract between the simulator and
//! the writer; renaming a field is a breaking change for both sides.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The three telemetry topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Package tracking records
    Logistics,
    /// Vehicle position records
    Location,
    /// Device alerts
    Alerts,
}

impl Topic {
    /// Every topic, in subscription order.
    pub const ALL: [Topic; 3] = [Topic::Logistics, Topic::Location, Topic::Alerts];

    /// Broker topic name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Logistics => "logistics-data",
            Topic::Location => "vehicle-location",
            Topic::Alerts => "alerts",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "logistics-data" => Ok(Topic::Logistics),
            "vehicle-location" => Ok(Topic::Location),
            "alerts" => Ok(Topic::Alerts),
            other => Err(DecodeError::UnknownTopic(other.to_string())),
        }
    }
}

/// Implements `ALL` and `as_str` for a unit-only wire enum.
macro_rules! wire_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Every variant, used for uniform sampling.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Wire representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Shipment status reported on logistics records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    InTransit,
    Delivered,
    Delayed,
    PickedUp,
}

wire_enum!(ShipmentStatus {
    InTransit => "in_transit",
    Delivered => "delivered",
    Delayed => "delayed",
    PickedUp => "picked_up",
});

/// Vehicle status reported on location records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    InTransit,
    Loading,
    Unloading,
    Delayed,
    Parked,
    Maintenance,
    Idle,
}

wire_enum!(VehicleStatus {
    InTransit => "in_transit",
    Loading => "loading",
    Unloading => "unloading",
    Delayed => "delayed",
    Parked => "parked",
    Maintenance => "maintenance",
    Idle => "idle",
});

impl VehicleStatus {
    /// Statuses in which the vehicle is not moving at all.
    pub fn is_stationary(&self) -> bool {
        matches!(
            self,
            VehicleStatus::Loading
                | VehicleStatus::Unloading
                | VehicleStatus::Maintenance
                | VehicleStatus::Idle
        )
    }
}

/// Kind of condition an alert reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    TemperatureHigh,
    TemperatureLow,
    HumidityHigh,
    ShockDetected,
    PowerOutage,
    Tampering,
}

wire_enum!(AlertType {
    TemperatureHigh => "temperature_high",
    TemperatureLow => "temperature_low",
    HumidityHigh => "humidity_high",
    ShockDetected => "shock_detected",
    PowerOutage => "power_outage",
    Tampering => "tampering",
});

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

wire_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
});

/// Package tracking sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticsRecord {
    pub device_id: String,
    pub package_id: String,
    /// Degrees Celsius
    pub temperature: f64,
    /// Relative humidity, 0-100
    pub humidity: u8,
    pub status: ShipmentStatus,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

/// Vehicle position sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub device_id: String,
    pub vehicle_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// km/h
    pub speed: f64,
    /// Heading in degrees
    pub direction: i32,
    pub status: VehicleStatus,
    /// Load percentage, 1-100
    pub load: u8,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

/// Device alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub device_id: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    #[serde(rename = "details")]
    pub detail: String,
}

/// One decoded record of any kind.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryRecord {
    Logistics(LogisticsRecord),
    Location(LocationRecord),
    Alert(AlertRecord),
}

impl TelemetryRecord {
    /// Topic this record is published on.
    pub fn topic(&self) -> Topic {
        match self {
            TelemetryRecord::Logistics(_) => Topic::Logistics,
            TelemetryRecord::Location(_) => Topic::Location,
            TelemetryRecord::Alert(_) => Topic::Alerts,
        }
    }

    /// Emitting device, also the partition key.
    pub fn device_id(&self) -> &str {
        match self {
            TelemetryRecord::Logistics(r) => &r.device_id,
            TelemetryRecord::Location(r) => &r.device_id,
            TelemetryRecord::Alert(r) => &r.device_id,
        }
    }

    /// Event time in seconds since the Unix epoch.
    pub fn timestamp(&self) -> f64 {
        match self {
            TelemetryRecord::Logistics(r) => r.timestamp,
            TelemetryRecord::Location(r) => r.timestamp,
            TelemetryRecord::Alert(r) => r.timestamp,
        }
    }

    /// UTF-8 JSON payload as published to the broker.
    pub fn to_payload(&self) -> crate::Result<Vec<u8>> {
        let bytes = match self {
            TelemetryRecord::Logistics(r) => serde_json::to_vec(r)?,
            TelemetryRecord::Location(r) => serde_json::to_vec(r)?,
            TelemetryRecord::Alert(r) => serde_json::to_vec(r)?,
        };
        Ok(bytes)
    }
}
