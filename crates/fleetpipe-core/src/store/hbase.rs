//! HBase adapter for the position history, through the HBase REST gateway.
//!
//! The gateway's JSON CellSet format base64-encodes row keys, column names
//! and values.

use super::{ColumnStore, TrackingRow};
use crate::config::ColumnStoreConfig;
use crate::error::StoreError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const STORE: &str = "hbase";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CellSet {
    #[serde(rename = "Row", default)]
    rows: Vec<RowJson>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RowJson {
    key: String,
    #[serde(rename = "Cell", default)]
    cells: Vec<CellJson>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CellJson {
    column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<u64>,
    #[serde(rename = "$")]
    value: String,
}

impl CellSet {
    fn from_row(row: &TrackingRow) -> Self {
        let cells = row
            .cells()
            .into_iter()
            .map(|(column, value)| CellJson {
                column: STANDARD.encode(column),
                timestamp: None,
                value: STANDARD.encode(value),
            })
            .collect();

        Self {
            rows: vec![RowJson {
                key: STANDARD.encode(row.row_key()),
                cells,
            }],
        }
    }

    fn into_rows(self) -> Result<Vec<TrackingRow>, StoreError> {
        self.rows
            .into_iter()
            .map(|row| {
                let key = decode_text(&row.key)?;
                let cells = row
                    .cells
                    .iter()
                    .map(|c| Ok((decode_text(&c.column)?, decode_text(&c.value)?)))
                    .collect::<Result<HashMap<_, _>, StoreError>>()?;
                TrackingRow::from_cells(&key, &cells)
            })
            .collect()
    }
}

fn decode_text(encoded: &str) -> Result<String, StoreError> {
    let bytes = STANDARD.decode(encoded).map_err(|e| StoreError::Query {
        store: STORE,
        message: format!("invalid base64 in response: {}", e),
    })?;
    String::from_utf8(bytes).map_err(|e| StoreError::Query {
        store: STORE,
        message: format!("non UTF-8 cell: {}", e),
    })
}

/// History store speaking to an HBase REST gateway.
#[derive(Clone)]
pub struct HBaseColumnStore {
    client: Client,
    base_url: String,
    table: String,
}

impl HBaseColumnStore {
    /// Create the HTTP client and check the gateway answers.
    pub async fn new(config: &ColumnStoreConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| StoreError::Connection {
                store: STORE,
                message: e.to_string(),
            })?;

        let store = Self {
            client,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            table: config.table.clone(),
        };
        store.ping().await?;
        info!(url = %store.base_url, table = %store.table, "HBase REST gateway connected");
        Ok(store)
    }

    fn row_url(&self, row_key: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.table, row_key)
    }
}

#[async_trait]
impl ColumnStore for HBaseColumnStore {
    async fn put_location(&self, row: &TrackingRow) -> Result<(), StoreError> {
        let row_key = row.row_key();
        let write_error = |message: String| StoreError::Write {
            store: STORE,
            key: row_key.clone(),
            message,
        };

        let response = self
            .client
            .put(self.row_url(&row_key))
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&CellSet::from_row(row))
            .send()
            .await
            .map_err(|e| write_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(write_error(format!("HTTP {}: {}", status, body)));
        }

        debug!(row_key = %row_key, "Tracking row written");
        Ok(())
    }

    async fn history(
        &self,
        vehicle_id: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<TrackingRow>, StoreError> {
        let query_error = |message: String| StoreError::Query {
            store: STORE,
            message,
        };

        let response = self
            .client
            .get(self.row_url(&format!("{}_*", vehicle_id)))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| query_error(e.to_string()))?;

        // The gateway answers 404 when the prefix matches nothing
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(query_error(format!("HTTP {}", response.status())));
        }

        let cell_set: CellSet = response
            .json()
            .await
            .map_err(|e| query_error(e.to_string()))?;

        let rows = rows_in_range(cell_set.into_rows()?, vehicle_id, from, to);
        if rows.is_empty() {
            debug!(vehicle_id, from, to, "No history rows in range");
        }
        Ok(rows)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let response = self
            .client
            .get(format!("{}/version/cluster", self.base_url))
            .send()
            .await
            .map_err(|e| StoreError::Connection {
                store: STORE,
                message: e.to_string(),
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::Connection {
                store: STORE,
                message: format!("HTTP {}", response.status()),
            })
        }
    }
}

/// Rows of one vehicle inside `[from, to]`, oldest first.
fn rows_in_range(
    rows: Vec<TrackingRow>,
    vehicle_id: &str,
    from: i64,
    to: i64,
) -> Vec<TrackingRow> {
    let mut rows: Vec<TrackingRow> = rows
        .into_iter()
        .filter(|row| row.vehicle_id == vehicle_id)
        .filter(|row| (from..=to).contains(&row.timestamp))
        .collect();
    rows.sort_by_key(|row| row.timestamp);
    rows
}
