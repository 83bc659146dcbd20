//! Telemetry records, their generation and their decoding.

mod decode;
mod generator;
mod record;

pub use decode::decode;
pub use generator::{speed_for, TelemetryGenerator, LATITUDE_STEP, LONGITUDE_DRIFT};
pub use record::{
    AlertRecord, AlertType, LocationRecord, LogisticsRecord, Severity, ShipmentStatus,
    TelemetryRecord, Topic, VehicleStatus,
};
