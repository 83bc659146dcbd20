//! In-memory device registry.
//!
//! Each device owns one independently lockable entry, so concurrent drivers
//! never contend on each other's positions. The entry set is fixed at
//! construction; only positions change afterwards.

use crate::error::RegistryError;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Spacing between the starting latitudes of consecutive devices.
pub const LATITUDE_SPACING: f64 = 0.01;

/// First vehicle number; device `i` drives vehicle `V{FIRST_VEHICLE + i}`.
const FIRST_VEHICLE: usize = 100;

/// Largest fleet whose vehicle ids stay three digits (`V100` to `V999`).
pub const MAX_DEVICES: usize = 1000 - FIRST_VEHICLE;

/// Last known position of a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug)]
struct DeviceEntry {
    device_id: String,
    vehicle_id: String,
    position: Mutex<Position>,
}

/// Fixed set of devices with their vehicle binding and position.
#[derive(Debug)]
pub struct DeviceRegistry {
    entries: Vec<DeviceEntry>,
    index: HashMap<String, usize>,
}

impl DeviceRegistry {
    /// Build `count` devices.
    ///
    /// Device `i` is `D{i:04}`, drives `V{100 + i}` and starts at
    /// `(base_latitude + i * 0.01, base_longitude)`.
    pub fn register(count: usize, base_latitude: f64, base_longitude: f64) -> Self {
        let entries: Vec<DeviceEntry> = (0..count)
            .map(|i| DeviceEntry {
                device_id: device_id_for(i),
                vehicle_id: vehicle_id_for(i),
                position: Mutex::new(Position {
                    latitude: base_latitude + i as f64 * LATITUDE_SPACING,
                    longitude: base_longitude,
                }),
            })
            .collect();

        let index = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.device_id.clone(), i))
            .collect();

        Self { entries, index }
    }

    fn entry(&self, device_id: &str) -> Result<&DeviceEntry, RegistryError> {
        self.index
            .get(device_id)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| RegistryError::NotFound(device_id.to_string()))
    }

    /// Vehicle binding and current position of a device.
    pub fn get(&self, device_id: &str) -> Result<(&str, Position), RegistryError> {
        let entry = self.entry(device_id)?;
        let position = *entry.position.lock();
        Ok((entry.vehicle_id.as_str(), position))
    }

    /// Vehicle bound to a device.
    pub fn vehicle_id(&self, device_id: &str) -> Result<&str, RegistryError> {
        self.entry(device_id).map(|e| e.vehicle_id.as_str())
    }

    /// Move a device and return its new position.
    ///
    /// Latitude may only grow: a negative or non-finite step is rejected and
    /// leaves the position untouched.
    pub fn advance(
        &self,
        device_id: &str,
        delta_lat: f64,
        delta_lon: f64,
    ) -> Result<Position, RegistryError> {
        let entry = self.entry(device_id)?;

        if !delta_lat.is_finite() || !delta_lon.is_finite() || delta_lat < 0.0 {
            return Err(RegistryError::InvalidStep {
                device_id: device_id.to_string(),
                delta_lat,
                delta_lon,
            });
        }

        let mut position = entry.position.lock();
        position.latitude += delta_lat;
        position.longitude += delta_lon;
        Ok(*position)
    }

    /// Registered device ids in registration order.
    pub fn device_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.device_id.as_str())
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no device is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Device id for the device at `index`.
pub fn device_id_for(index: usize) -> String {
    format!("D{:04}", index)
}

/// Vehicle id for the device at `index`.
pub fn vehicle_id_for(index: usize) -> String {
    format!("V{}", FIRST_VEHICLE + index)
}
