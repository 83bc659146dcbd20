//! Redis adapter for the latest-state cache.

use super::{vehicle_id_from_key, vehicle_key, CacheStore, VehicleState, VEHICLE_INDEX_KEY};
use crate::config::CacheStoreConfig;
use crate::error::StoreError;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use std::collections::HashMap;
use tracing::{debug, info};

const STORE: &str = "redis";

/// Redis cache backed by a deadpool connection pool.
#[derive(Clone)]
pub struct RedisCacheStore {
    pool: Pool,
}

impl RedisCacheStore {
    /// Build the pool and check the server answers.
    pub async fn new(config: &CacheStoreConfig) -> Result<Self, StoreError> {
        let pool = Config::from_url(&config.url)
            .builder()
            .map_err(connection_error)?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(connection_error)?;

        let store = Self { pool };
        store.ping().await?;
        info!(pool_size = config.pool_size, "Redis cache connected");
        Ok(store)
    }

    async fn connection(&self) -> Result<Connection, StoreError> {
        self.pool.get().await.map_err(connection_error)
    }
}

fn connection_error(e: impl std::fmt::Display) -> StoreError {
    StoreError::Connection {
        store: STORE,
        message: e.to_string(),
    }
}

fn query_error(e: ::redis::RedisError) -> StoreError {
    StoreError::Query {
        store: STORE,
        message: e.to_string(),
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn upsert_vehicle(&self, state: &VehicleState) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let key = state.cache_key();

        ::redis::pipe()
            .atomic()
            .hset_multiple(&key, &state.to_fields())
            .ignore()
            .sadd(VEHICLE_INDEX_KEY, &key)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::Write {
                store: STORE,
                key: key.clone(),
                message: e.to_string(),
            })?;

        debug!(key = %key, "Vehicle state cached");
        Ok(())
    }

    async fn vehicle(&self, vehicle_id: &str) -> Result<Option<VehicleState>, StoreError> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> =
            conn.hgetall(vehicle_key(vehicle_id)).await.map_err(query_error)?;

        if fields.is_empty() {
            return Ok(None);
        }
        VehicleState::from_fields(vehicle_id, &fields).map(Some)
    }

    async fn vehicles(&self) -> Result<Vec<VehicleState>, StoreError> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = conn.smembers(VEHICLE_INDEX_KEY).await.map_err(query_error)?;
        let keys: Vec<(&str, &String)> = keys
            .iter()
            .filter_map(|key| vehicle_id_from_key(key).map(|id| (id, key)))
            .collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = ::redis::pipe();
        for (_, key) in &keys {
            pipe.hgetall(*key);
        }
        let hashes: Vec<HashMap<String, String>> =
            pipe.query_async(&mut conn).await.map_err(query_error)?;

        let mut vehicles = Vec::with_capacity(keys.len());
        for ((vehicle_id, _), fields) in keys.iter().zip(hashes) {
            // Index entries can outlive their hash
            if fields.is_empty() {
                continue;
            }
            vehicles.push(VehicleState::from_fields(vehicle_id, &fields)?);
        }

        debug!(count = vehicles.len(), "Vehicle states read");
        vehicles.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
        Ok(vehicles)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        ::redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(connection_error)?;
        Ok(())
    }
}
