//! MySQL adapter for order tracking and alarms.

use super::{AlarmRow, OrderRow, RelationalStore, RelationalTransaction, ALARM_TABLE};
use crate::config::RelationalStoreConfig;
use crate::error::StoreError;
use async_trait::async_trait;
use sqlx::mysql::{MySql, MySqlPool, MySqlPoolOptions};
use sqlx::Transaction;
use std::time::Duration;
use tracing::{debug, info};

const STORE: &str = "mysql";

fn query_error(e: sqlx::Error) -> StoreError {
    StoreError::Query {
        store: STORE,
        message: e.to_string(),
    }
}

/// `order_` followed by six digits. Table names are interpolated into SQL,
/// so anything else is refused.
fn is_order_table(name: &str) -> bool {
    name.strip_prefix("order_")
        .is_some_and(|month| month.len() == 6 && month.bytes().all(|b| b.is_ascii_digit()))
}

fn order_table_ddl(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id BIGINT AUTO_INCREMENT PRIMARY KEY,
            order_id VARCHAR(32) NOT NULL,
            user_id VARCHAR(32) NULL,
            vehicle_id VARCHAR(32) NOT NULL,
            start_time DATETIME NULL,
            end_time DATETIME NULL,
            status VARCHAR(32) NOT NULL,
            temperature DOUBLE NOT NULL,
            humidity TINYINT UNSIGNED NOT NULL,
            event_time DATETIME(6) NOT NULL,
            INDEX idx_{table}_order (order_id)
        )
        "#
    )
}

/// Relational store on a MySQL connection pool.
#[derive(Clone)]
pub struct MySqlRelationalStore {
    pool: MySqlPool,
}

impl MySqlRelationalStore {
    /// Connect the pool and create the alarm table.
    pub async fn new(config: &RelationalStoreConfig) -> Result<Self, StoreError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.url)
            .await
            .map_err(|e| StoreError::Connection {
                store: STORE,
                message: e.to_string(),
            })?;

        let store = Self { pool };
        store.ensure_tables(&[]).await?;
        info!(
            max_connections = config.max_connections,
            "MySQL relational store connected"
        );
        Ok(store)
    }
}

#[async_trait]
impl RelationalStore for MySqlRelationalStore {
    async fn ensure_tables(&self, order_tables: &[String]) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {ALARM_TABLE} (
                id BIGINT AUTO_INCREMENT PRIMARY KEY,
                vehicle_id VARCHAR(32) NOT NULL,
                type VARCHAR(32) NOT NULL,
                severity VARCHAR(16) NOT NULL,
                timestamp DATETIME(6) NOT NULL,
                detail VARCHAR(255) NOT NULL,
                INDEX idx_alarm_vehicle (vehicle_id)
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(query_error)?;

        for table in order_tables {
            if !is_order_table(table) {
                return Err(StoreError::InvalidRecord {
                    key: table.clone(),
                    message: "not a monthly order table name".into(),
                });
            }
            sqlx::query(&order_table_ddl(table))
                .execute(&self.pool)
                .await
                .map_err(query_error)?;
            debug!(table = %table, "Order table ensured");
        }

        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn RelationalTransaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(|e| StoreError::Connection {
            store: STORE,
            message: e.to_string(),
        })?;
        Ok(Box::new(MySqlTransaction { tx }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Connection {
                store: STORE,
                message: e.to_string(),
            })?;
        Ok(())
    }
}

/// Open MySQL transaction. A statement error does not abort it.
struct MySqlTransaction {
    tx: Transaction<'static, MySql>,
}

#[async_trait]
impl RelationalTransaction for MySqlTransaction {
    async fn insert_order(&mut self, row: &OrderRow) -> Result<(), StoreError> {
        if !is_order_table(&row.table) {
            return Err(StoreError::InvalidRecord {
                key: row.order_id.clone(),
                message: format!("invalid order table '{}'", row.table),
            });
        }

        sqlx::query(&format!(
            "INSERT INTO {} (order_id, user_id, vehicle_id, start_time, end_time, status, \
             temperature, humidity, event_time) VALUES (?, NULL, ?, NOW(), NOW(), ?, ?, ?, ?)",
            row.table
        ))
        .bind(&row.order_id)
        .bind(&row.vehicle_id)
        .bind(&row.status)
        .bind(row.temperature)
        .bind(row.humidity)
        .bind(row.event_time)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| StoreError::Write {
            store: STORE,
            key: row.order_id.clone(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    async fn insert_alarm(&mut self, row: &AlarmRow) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO {ALARM_TABLE} (vehicle_id, type, severity, timestamp, detail) \
             VALUES (?, ?, ?, ?, ?)"
        ))
        .bind(&row.vehicle_id)
        .bind(&row.alert_type)
        .bind(&row.severity)
        .bind(row.timestamp)
        .bind(&row.detail)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| StoreError::Write {
            store: STORE,
            key: row.vehicle_id.clone(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(query_error)
    }
}
