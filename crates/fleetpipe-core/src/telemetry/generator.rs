//! Random telemetry synthesis from device state.
//!
//! Every method takes the random source explicitly so tests can seed it.

use crate::error::RegistryError;
use crate::simulator::DeviceRegistry;
use crate::telemetry::record::{
    AlertRecord, AlertType, LocationRecord, LogisticsRecord, Severity, ShipmentStatus,
    TelemetryRecord, Topic, VehicleStatus,
};
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Per-emission latitude step; strictly positive so devices only move north.
pub const LATITUDE_STEP: RangeInclusive<f64> = 0.0005..=0.0015;

/// Per-emission longitude drift.
pub const LONGITUDE_DRIFT: RangeInclusive<f64> = -0.0005..=0.0005;

const TEMPERATURE: RangeInclusive<f64> = -20.0..=30.0;
const PACKAGE_NUMBER: RangeInclusive<u32> = 100_000..=999_999;
const DELAYED_SPEED: RangeInclusive<f64> = 0.0..=10.0;
const CRUISING_SPEED: RangeInclusive<f64> = 40.0..=80.0;

/// Builds records for registered devices.
#[derive(Debug, Clone)]
pub struct TelemetryGenerator {
    registry: Arc<DeviceRegistry>,
}

impl TelemetryGenerator {
    /// Create a generator over a registry.
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    /// Registry the generator reads and advances.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Generate a record of the kind carried by `topic`.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        topic: Topic,
        device_id: &str,
        rng: &mut R,
    ) -> Result<TelemetryRecord, RegistryError> {
        Ok(match topic {
            Topic::Logistics => TelemetryRecord::Logistics(self.logistics(device_id, rng)?),
            Topic::Location => TelemetryRecord::Location(self.location(device_id, rng)?),
            Topic::Alerts => TelemetryRecord::Alert(self.alert(device_id, rng)?),
        })
    }

    /// Package tracking sample.
    pub fn logistics<R: Rng + ?Sized>(
        &self,
        device_id: &str,
        rng: &mut R,
    ) -> Result<LogisticsRecord, RegistryError> {
        self.registry.vehicle_id(device_id)?;

        Ok(LogisticsRecord {
            device_id: device_id.to_string(),
            package_id: format!("P{}", rng.gen_range(PACKAGE_NUMBER)),
            temperature: round_to(rng.gen_range(TEMPERATURE), 2),
            humidity: rng.gen_range(0..=100),
            status: pick(ShipmentStatus::ALL, rng),
            timestamp: now_seconds(),
        })
    }

    /// Alert with a templated detail.
    pub fn alert<R: Rng + ?Sized>(
        &self,
        device_id: &str,
        rng: &mut R,
    ) -> Result<AlertRecord, RegistryError> {
        self.registry.vehicle_id(device_id)?;

        Ok(AlertRecord {
            device_id: device_id.to_string(),
            alert_type: pick(AlertType::ALL, rng),
            severity: pick(Severity::ALL, rng),
            timestamp: now_seconds(),
            detail: format!("Alert triggered by device {}", device_id),
        })
    }

    /// Advance the device one step and report where it is.
    ///
    /// Status is drawn independently of the previous one; speed follows from
    /// the drawn status.
    pub fn location<R: Rng + ?Sized>(
        &self,
        device_id: &str,
        rng: &mut R,
    ) -> Result<LocationRecord, RegistryError> {
        let vehicle_id = self.registry.vehicle_id(device_id)?.to_string();

        let delta_lat = rng.gen_range(LATITUDE_STEP);
        let delta_lon = rng.gen_range(LONGITUDE_DRIFT);
        let position = self.registry.advance(device_id, delta_lat, delta_lon)?;

        let status = pick(VehicleStatus::ALL, rng);
        let speed = speed_for(status, rng);

        Ok(LocationRecord {
            device_id: device_id.to_string(),
            vehicle_id,
            latitude: round_to(position.latitude, 6),
            longitude: round_to(position.longitude, 6),
            speed: round_to(speed, 2),
            direction: 0,
            status,
            load: rng.gen_range(1..=100),
            timestamp: now_seconds(),
        })
    }
}

/// Speed in km/h implied by a vehicle status.
pub fn speed_for<R: Rng + ?Sized>(status: VehicleStatus, rng: &mut R) -> f64 {
    if status.is_stationary() {
        0.0
    } else if status == VehicleStatus::Delayed {
        rng.gen_range(DELAYED_SPEED)
    } else {
        rng.gen_range(CRUISING_SPEED)
    }
}

fn pick<T: Copy, R: Rng + ?Sized>(choices: &[T], rng: &mut R) -> T {
    choices[rng.gen_range(0..choices.len())]
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn generator(count: usize) -> TelemetryGenerator {
        TelemetryGenerator::new(Arc::new(DeviceRegistry::register(count, 30.0, 120.0)))
    }

    #[test]
    fn test_logistics_ranges() {
        let generator = generator(1);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..500 {
            let record = generator.logistics("D0000", &mut rng).unwrap();
            assert!((-20.0..=30.0).contains(&record.temperature));
            assert!(record.humidity <= 100);
            assert!(record.package_id.starts_with('P'));
            assert_eq!(record.package_id.len(), 7);
            assert_eq!(record.temperature, round_to(record.temperature, 2));
        }
    }

    #[test]
    fn test_alert_detail_names_device() {
        let generator = generator(4);
        let mut rng = StdRng::seed_from_u64(1);
        let record = generator.alert("D0003", &mut rng).unwrap();
        assert_eq!(record.detail, "Alert triggered by device D0003");
    }

    #[test]
    fn test_location_latitude_bounds_after_n_steps() {
        let generator = generator(1);
        let mut rng = StdRng::seed_from_u64(42);
        let n = 200;

        let mut previous = 30.0;
        let mut last = None;
        for _ in 0..n {
            let record = generator.location("D0000", &mut rng).unwrap();
            assert!(record.latitude >= previous);
            previous = record.latitude;
            last = Some(record);
        }

        let last = last.unwrap();
        let lower = 30.0 + n as f64 * 0.0005;
        let upper = 30.0 + n as f64 * 0.0015;
        assert!(last.latitude >= lower - 1e-6, "{} < {}", last.latitude, lower);
        assert!(last.latitude <= upper + 1e-6, "{} > {}", last.latitude, upper);
        assert_eq!(last.vehicle_id, "V100");
    }

    #[test]
    fn test_location_speed_follows_status() {
        let generator = generator(1);
        let mut rng = StdRng::seed_from_u64(3);

        for _ in 0..500 {
            let record = generator.location("D0000", &mut rng).unwrap();
            if record.status.is_stationary() {
                assert_eq!(record.speed, 0.0);
            } else if record.status == VehicleStatus::Delayed {
                assert!((0.0..=10.0).contains(&record.speed));
            } else {
                assert!((40.0..=80.0).contains(&record.speed));
            }
            assert!((1..=100).contains(&record.load));
            assert_eq!(record.direction, 0);
        }
    }

    #[test]
    fn test_location_coordinates_rounded() {
        let generator = generator(1);
        let mut rng = StdRng::seed_from_u64(9);
        let record = generator.location("D0000", &mut rng).unwrap();
        assert_eq!(record.latitude, round_to(record.latitude, 6));
        assert_eq!(record.longitude, round_to(record.longitude, 6));
    }

    #[test]
    fn test_unknown_device_rejected() {
        let generator = generator(1);
        let mut rng = StdRng::seed_from_u64(0);
        for topic in Topic::ALL {
            assert_eq!(
                generator.generate(topic, "D0099", &mut rng).unwrap_err(),
                RegistryError::NotFound("D0099".into())
            );
        }
    }

    #[test]
    fn test_generate_dispatches_on_topic() {
        let generator = generator(2);
        let mut rng = StdRng::seed_from_u64(11);
        for topic in Topic::ALL {
            let record = generator.generate(topic, "D0001", &mut rng).unwrap();
            assert_eq!(record.topic(), topic);
            assert_eq!(record.device_id(), "D0001");
        }
    }
}
