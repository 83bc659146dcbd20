//! Device fleet simulator: registry, per-device drivers and the fleet runner.

mod driver;
mod fleet;
mod registry;

pub use driver::{DeviceDriver, DriverState, StopOutcome};
pub use fleet::{FleetSimulator, ShutdownReport};
pub use registry::{
    device_id_for, vehicle_id_for, DeviceRegistry, Position, LATITUDE_SPACING, MAX_DEVICES,
};
