//! Status command implementation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Health response from the server.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    uptime_seconds: u64,
    components: BTreeMap<String, ComponentStatus>,
}

/// Component status from the server.
#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    message: Option<String>,
}

/// Show status and health.
pub async fn run(url: &str, metrics_url: &str) -> Result<()> {
    println!("Checking health at {}...\n", url);

    // Fetch health status
    let health_url = format!("{}/health", url.trim_end_matches('/'));
    let client = reqwest::Client::new();

    match client.get(&health_url).send().await {
        Ok(response) => {
            let status_code = response.status();
            match response.json::<HealthResponse>().await {
                Ok(health) => {
                    print_health_status(&health, status_code.as_u16());
                }
                Err(e) => {
                    println!("Failed to parse health response: {}", e);
                    println!("HTTP Status: {}", status_code);
                }
            }
        }
        Err(e) => {
            println!("Failed to connect to health endpoint: {}", e);
            println!("\nIs a fleetpipe process running?");
            println!("Start one with: fleetpipe ingest --config <path-to-config>");
            return Ok(());
        }
    }

    let metrics_url = format!("{}/metrics", metrics_url.trim_end_matches('/'));
    println!("\n--- Metrics ---");
    println!("Fetching from {}...\n", metrics_url);

    match client.get(&metrics_url).send().await {
        Ok(response) => {
            let text = response.text().await.context("Failed to read metrics")?;
            print_metrics(&text);
        }
        Err(e) => {
            println!("Failed to fetch metrics: {}", e);
        }
    }

    Ok(())
}

fn print_health_status(health: &HealthResponse, status_code: u16) {
    let status_emoji = match health.status.as_str() {
        "healthy" => "[OK]",
        "degraded" => "[WARN]",
        "unhealthy" => "[FAIL]",
        _ => "[?]",
    };

    println!(
        "{} Overall Status: {} (HTTP {}, up {}s)",
        status_emoji,
        health.status.to_uppercase(),
        status_code,
        health.uptime_seconds
    );
    println!();

    if !health.components.is_empty() {
        println!("Components:");
        for (name, status) in &health.components {
            let emoji = match status.status.as_str() {
                "healthy" => "[OK]",
                "degraded" => "[WARN]",
                "unhealthy" => "[FAIL]",
                _ => "[?]",
            };

            if let Some(msg) = &status.message {
                println!("  {} {}: {} ({})", emoji, name, status.status, msg);
            } else {
                println!("  {} {}: {}", emoji, name, status.status);
            }
        }
    }
}

fn print_metrics(metrics_text: &str) {
    // Parse Prometheus format and display nicely
    let mut values: HashMap<&str, u64> = HashMap::new();

    for line in metrics_text.lines() {
        if line.starts_with('#') || line.is_empty() {
            continue;
        }

        // Parse "metric_name value" format
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            if let Ok(value) = parts[1].parse::<u64>() {
                values.insert(parts[0], value);
            }
        }
    }

    let rows = [
        ("fleetpipe_messages_consumed_total", "Messages Consumed:  "),
        ("fleetpipe_records_written_total", "Records Written:    "),
        ("fleetpipe_batches_total", "Batches:            "),
        ("fleetpipe_batches_failed_total", "Failed Batches:     "),
        ("fleetpipe_decode_failures_total", "Decode Failures:    "),
        ("fleetpipe_relational_commit_failures_total", "Commit Failures:    "),
        ("fleetpipe_delivery_failures_total", "Delivery Failures:  "),
        ("fleetpipe_active_drivers", "Active Drivers:     "),
    ];
    for (name, label) in rows {
        if let Some(v) = values.get(name) {
            println!("{}{}", label, format_number(*v));
        }
    }

    // Labelled series are summed per metric
    let emitted: u64 = labelled(metrics_text, "fleetpipe_records_emitted_total");
    let store_failures: u64 = labelled(metrics_text, "fleetpipe_store_write_failures_total");
    if emitted > 0 {
        println!("Records Emitted:    {}", format_number(emitted));
    }
    if store_failures > 0 {
        println!("Store Failures:     {}", store_failures);
    }

    if values.is_empty() {
        println!("No metrics available yet.");
    }
}

fn labelled(metrics_text: &str, name: &str) -> u64 {
    let prefix = format!("{}{{", name);
    metrics_text
        .lines()
        .filter(|line| line.starts_with(&prefix))
        .filter_map(|line| line.rsplit(' ').next()?.parse::<u64>().ok())
        .sum()
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}
