//! Vehicles command implementation: the read side of the cache and history
//! stores.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use fleetpipe_core::store::{
    CacheStore, ColumnStore, HBaseColumnStore, RedisCacheStore, TrackingRow, VehicleState,
};
use fleetpipe_core::Config;

/// Default history window when `--from` is not given.
const DEFAULT_WINDOW_SECONDS: i64 = 3600;

/// Print the latest state of every vehicle.
pub async fn list(config: Config) -> Result<()> {
    let cache = RedisCacheStore::new(&config.stores.cache).await?;
    let vehicles = cache.vehicles().await?;

    if vehicles.is_empty() {
        println!("No vehicles in cache.");
        return Ok(());
    }

    println!("{}", state_header());
    for vehicle in &vehicles {
        println!("{}", state_line(vehicle));
    }
    println!("\n{} vehicles", vehicles.len());
    Ok(())
}

/// Print the latest state of one vehicle.
pub async fn show(config: Config, vehicle_id: &str) -> Result<()> {
    let cache = RedisCacheStore::new(&config.stores.cache).await?;
    match cache.vehicle(vehicle_id).await? {
        Some(vehicle) => {
            println!("{}", state_header());
            println!("{}", state_line(&vehicle));
            Ok(())
        }
        None => bail!("Vehicle {} not found in cache", vehicle_id),
    }
}

/// Print the position history of one vehicle, oldest first.
pub async fn history(
    config: Config,
    vehicle_id: &str,
    from: Option<i64>,
    to: Option<i64>,
) -> Result<()> {
    let to = to.unwrap_or_else(|| Utc::now().timestamp());
    let from = from.unwrap_or(to - DEFAULT_WINDOW_SECONDS);
    if from > to {
        bail!("--from ({}) is after --to ({})", from, to);
    }

    let column = HBaseColumnStore::new(&config.stores.column).await?;
    let rows = column.history(vehicle_id, from, to).await?;

    if rows.is_empty() {
        println!("No history for {} between {} and {}.", vehicle_id, format_time(from), format_time(to));
        return Ok(());
    }

    println!(
        "{:<20} {:>11} {:>11} {:>7} {:>4}  STATUS",
        "TIME (UTC)", "LAT", "LON", "SPEED", "DIR"
    );
    for row in &rows {
        println!("{}", history_line(row));
    }
    println!("\n{} positions", rows.len());
    Ok(())
}

fn state_header() -> String {
    format!(
        "{:<8} {:>11} {:>11} {:>7} {:>4} {:<12} {:>4}  UPDATED (UTC)",
        "VEHICLE", "LAT", "LON", "SPEED", "DIR", "STATUS", "LOAD"
    )
}

fn state_line(v: &VehicleState) -> String {
    format!(
        "{:<8} {:>11.6} {:>11.6} {:>7.2} {:>4} {:<12} {:>3}%  {}",
        v.vehicle_id,
        v.latitude,
        v.longitude,
        v.speed,
        v.direction,
        v.status,
        v.load,
        format_time(v.timestamp as i64)
    )
}

fn history_line(row: &TrackingRow) -> String {
    format!(
        "{:<20} {:>11.6} {:>11.6} {:>7.2} {:>4}  {}",
        format_time(row.timestamp),
        row.latitude,
        row.longitude,
        row.speed,
        row.direction,
        row.status
    )
}

fn format_time(seconds: i64) -> String {
    DateTime::<Utc>::from_timestamp(seconds, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| seconds.to_string())
}
