//! Integration tests for fleetpipe-core.
//!
//! The in-memory pipeline tests run everywhere. Tests talking to a real
//! broker or Redis require Docker and are marked with #[ignore].
//!
//! Run with: cargo test --test integration_tests -- --ignored

use fleetpipe_core::config::{Config, EmissionProbabilities, SimulatorConfig};
use fleetpipe_core::engine::{IngestionEngine, StoreHandles};
use fleetpipe_core::health::{Component, ComponentStatus};
use fleetpipe_core::kafka::{KafkaMessage, MemoryEmitter, MemorySource, RetryConfig};
use fleetpipe_core::simulator::FleetSimulator;
use fleetpipe_core::store::{
    CacheStore, ColumnStore, MemoryCacheStore, MemoryColumnStore, MemoryRelationalStore,
};
use fleetpipe_core::telemetry::{
    AlertRecord, AlertType, LocationRecord, LogisticsRecord, Severity, ShipmentStatus,
    TelemetryRecord, Topic, VehicleStatus,
};
use fleetpipe_core::{Error, StoreError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

fn engine_config(batch_size: usize) -> Config {
    let mut config = Config::with_bootstrap_servers(vec!["localhost:29092".into()]);
    config.kafka.batch_size = batch_size;
    config.kafka.batch_timeout_ms = 10;
    config
}

fn message(record: &TelemetryRecord, partition: i32, offset: i64) -> KafkaMessage {
    KafkaMessage {
        key: Some(record.device_id().as_bytes().to_vec()),
        value: Some(record.to_payload().unwrap()),
        topic: record.topic().as_str().to_string(),
        partition,
        offset,
        timestamp: 0,
        headers: Vec::new(),
    }
}

fn location(device: &str, vehicle: &str, latitude: f64, timestamp: f64) -> TelemetryRecord {
    TelemetryRecord::Location(LocationRecord {
        device_id: device.into(),
        vehicle_id: vehicle.into(),
        latitude,
        longitude: 120.5,
        speed: 60.0,
        direction: 90,
        status: VehicleStatus::InTransit,
        load: 45,
        timestamp,
    })
}

fn logistics(device: &str, package: &str, timestamp: f64) -> TelemetryRecord {
    TelemetryRecord::Logistics(LogisticsRecord {
        device_id: device.into(),
        package_id: package.into(),
        temperature: 12.3,
        humidity: 55,
        status: ShipmentStatus::InTransit,
        timestamp,
    })
}

fn alert(device: &str, timestamp: f64) -> TelemetryRecord {
    TelemetryRecord::Alert(AlertRecord {
        device_id: device.into(),
        alert_type: AlertType::TemperatureHigh,
        severity: Severity::High,
        timestamp,
        detail: format!("Alert triggered by device {}", device),
    })
}

struct Stores {
    cache: Arc<MemoryCacheStore>,
    column: Arc<MemoryColumnStore>,
    relational: Arc<MemoryRelationalStore>,
}

impl Stores {
    fn new() -> Self {
        Self {
            cache: Arc::new(MemoryCacheStore::new()),
            column: Arc::new(MemoryColumnStore::new()),
            relational: Arc::new(MemoryRelationalStore::new()),
        }
    }

    fn handles(&self) -> StoreHandles {
        StoreHandles {
            cache: self.cache.clone(),
            column: self.column.clone(),
            relational: self.relational.clone(),
        }
    }
}

async fn drain(engine: &mut IngestionEngine) -> usize {
    let mut batches = 0;
    while engine.step().await.unwrap().is_some() {
        batches += 1;
    }
    batches
}

mod memory_pipeline {
    use super::*;

    fn simulator_config(devices: usize) -> SimulatorConfig {
        SimulatorConfig {
            device_count: devices,
            sleep_interval_ms: 5,
            stop_timeout_ms: 500,
            flush_timeout_ms: 100,
            probabilities: EmissionProbabilities {
                logistics: 0.8,
                location: 1.0,
                alert: 0.3,
            },
            ..SimulatorConfig::default()
        }
    }

    /// Simulated fleet output lands in all three stores and every partition
    /// is committed past its last message.
    #[tokio::test]
    async fn test_simulated_fleet_reaches_every_store() {
        let emitter = Arc::new(MemoryEmitter::new(8));
        let mut simulator = FleetSimulator::new(simulator_config(5), emitter.clone()).with_seed(11);

        simulator.start();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let report = simulator.stop().await;
        assert!(report.ensure_flushed().is_ok());

        let published = emitter.messages();
        assert!(!published.is_empty());

        let source = Arc::new(MemorySource::from_messages(published.clone()));
        let stores = Stores::new();
        let mut engine =
            IngestionEngine::with_components(engine_config(16), source.clone(), stores.handles());

        assert!(drain(&mut engine).await > 0);
        assert_eq!(
            engine.metrics().messages_consumed_total(),
            published.len() as u64
        );

        // Every vehicle that reported a position has a cache entry
        let vehicles: HashSet<String> = emitter
            .messages_for(Topic::Location)
            .iter()
            .map(|m| {
                match fleetpipe_core::telemetry::decode(&m.topic, m.value.as_deref().unwrap()) {
                    Ok(TelemetryRecord::Location(r)) => r.vehicle_id,
                    other => panic!("unexpected record {:?}", other),
                }
            })
            .collect();
        let cached: HashSet<String> = stores
            .cache
            .vehicles()
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.vehicle_id)
            .collect();
        assert_eq!(cached, vehicles);
        assert!(!stores.column.is_empty());

        assert_eq!(
            stores.relational.order_count(),
            emitter.messages_for(Topic::Logistics).len()
        );
        assert_eq!(
            stores.relational.alarms().len(),
            emitter.messages_for(Topic::Alerts).len()
        );
        assert_eq!(stores.relational.open_transactions(), 0);

        let mut last: HashMap<(String, i32), i64> = HashMap::new();
        for m in &published {
            let entry = last.entry((m.topic.clone(), m.partition)).or_insert(m.offset);
            *entry = (*entry).max(m.offset);
        }
        for ((topic, partition), offset) in last {
            assert_eq!(source.committed(&topic, partition), Some(offset + 1));
        }
    }

    /// Simulated positions of the first device stay within the step bounds.
    #[tokio::test]
    async fn test_first_device_latitude_stays_in_bounds() {
        let emitter = Arc::new(MemoryEmitter::new(4));
        let mut simulator = FleetSimulator::new(simulator_config(3), emitter.clone()).with_seed(3);

        simulator.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        simulator.stop().await;

        let positions: Vec<LocationRecord> = emitter
            .messages_for(Topic::Location)
            .iter()
            .filter(|m| m.key_str() == Some("D0000"))
            .map(|m| {
                match fleetpipe_core::telemetry::decode(&m.topic, m.value.as_deref().unwrap()) {
                    Ok(TelemetryRecord::Location(r)) => r,
                    other => panic!("unexpected record {:?}", other),
                }
            })
            .collect();
        assert!(!positions.is_empty());

        let n = positions.len() as f64;
        let mut previous = 30.0;
        for record in &positions {
            assert_eq!(record.vehicle_id, "V100");
            assert!(record.latitude >= previous - 1e-9);
            previous = record.latitude;
        }
        assert!(previous >= 30.0 + n * 0.0005 - 1e-4);
        assert!(previous <= 30.0 + n * 0.0015 + 1e-4);
    }

    /// Distinct devices never report the same vehicle.
    #[tokio::test]
    async fn test_device_vehicle_mapping_is_injective() {
        let emitter = Arc::new(MemoryEmitter::new(4));
        let mut simulator = FleetSimulator::new(simulator_config(20), emitter.clone()).with_seed(8);

        simulator.start();
        tokio::time::sleep(Duration::from_millis(40)).await;
        simulator.stop().await;

        let mut vehicle_of: HashMap<String, String> = HashMap::new();
        for m in emitter.messages_for(Topic::Location) {
            if let Ok(TelemetryRecord::Location(r)) =
                fleetpipe_core::telemetry::decode(&m.topic, m.value.as_deref().unwrap())
            {
                let bound = vehicle_of
                    .entry(r.device_id.clone())
                    .or_insert_with(|| r.vehicle_id.clone());
                assert_eq!(bound, &r.vehicle_id);
            }
        }
        let vehicles: HashSet<&String> = vehicle_of.values().collect();
        assert_eq!(vehicles.len(), vehicle_of.len());
    }
}

mod batch_semantics {
    use super::*;

    /// A location record reaches the cache hash and a history row keyed by
    /// vehicle and whole seconds.
    #[tokio::test]
    async fn test_location_written_to_cache_and_history() {
        let record = location("D0000", "V100", 31.2, 1_717_200_000.5);
        let source = Arc::new(MemorySource::from_messages(vec![message(&record, 0, 0)]));
        let stores = Stores::new();
        let mut engine =
            IngestionEngine::with_components(engine_config(10), source, stores.handles());

        let report = engine.step().await.unwrap().unwrap();
        assert_eq!(report.written, 1);

        let state = stores.cache.vehicle("V100").await.unwrap().unwrap();
        assert_eq!(state.latitude, 31.2);
        assert_eq!(state.status, "in_transit");
        assert!(stores.cache.index_keys().contains(&"vehicle:V100".to_string()));

        let rows = stores
            .column
            .history("V100", 1_717_199_000, 1_717_201_000)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_key(), "V100_1717200000");
        assert_eq!(rows[0].latitude, 31.2);
    }

    /// One malformed message out of ten is skipped; the other nine are
    /// written and the batch offsets move past all ten.
    #[tokio::test]
    async fn test_malformed_record_is_skipped() {
        let mut messages = Vec::new();
        for i in 0..9 {
            let record = logistics("D0001", &format!("P10000{}", i), 1_717_200_000.0 + i as f64);
            messages.push(message(&record, 2, i));
        }
        messages.push(KafkaMessage {
            key: Some(b"D0001".to_vec()),
            value: Some(b"{\"device_id\":\"D0001\"".to_vec()),
            topic: Topic::Logistics.as_str().to_string(),
            partition: 2,
            offset: 9,
            timestamp: 0,
            headers: Vec::new(),
        });

        let source = Arc::new(MemorySource::from_messages(messages));
        let stores = Stores::new();
        let mut engine =
            IngestionEngine::with_components(engine_config(10), source.clone(), stores.handles());

        let report = engine.step().await.unwrap().unwrap();
        assert_eq!(report.records, 10);
        assert_eq!(report.decode_failures, 1);
        assert_eq!(report.written, 9);
        assert_eq!(report.relational_rows, 9);
        assert_eq!(stores.relational.orders("order_202406").len(), 9);
        assert_eq!(source.committed("logistics-data", 2), Some(10));
        assert_eq!(engine.metrics().decode_failures_total(), 1);
    }

    /// Decoded logistics values land unchanged in the order table.
    #[tokio::test]
    async fn test_logistics_values_preserved() {
        let raw = br#"{"device_id":"D0004","package_id":"P123456","temperature":12.3,"humidity":55,"status":"delayed","timestamp":1717171717.25}"#;
        let source = Arc::new(MemorySource::from_messages(vec![KafkaMessage {
            key: Some(b"D0004".to_vec()),
            value: Some(raw.to_vec()),
            topic: "logistics-data".into(),
            partition: 0,
            offset: 0,
            timestamp: 0,
            headers: Vec::new(),
        }]));
        let stores = Stores::new();
        let mut engine =
            IngestionEngine::with_components(engine_config(10), source, stores.handles());

        engine.step().await.unwrap().unwrap();

        let orders = stores.relational.orders("order_202405");
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order_id, "P123456");
        assert_eq!(orders[0].vehicle_id, "D0004");
        assert_eq!(orders[0].humidity, 55);
        assert_eq!(orders[0].temperature, 12.3);
        assert_eq!(orders[0].status, "delayed");
    }

    /// A failed relational commit discards every staged row of the batch,
    /// keeps the cache and history writes, and leaves offsets uncommitted.
    #[tokio::test]
    async fn test_commit_failure_discards_relational_rows() {
        let mut messages = Vec::new();
        for i in 0..5 {
            messages.push(message(&alert("D0002", 1_717_200_000.0 + i as f64), 3, i));
        }
        messages.push(message(&location("D0002", "V102", 30.05, 1_717_200_010.0), 1, 0));

        let source = Arc::new(MemorySource::from_messages(messages));
        let stores = Stores::new();
        stores.relational.fail_commits(true);
        let mut engine =
            IngestionEngine::with_components(engine_config(10), source.clone(), stores.handles())
                .with_retry_config(
                    RetryConfig::new(Duration::from_millis(1), Duration::from_millis(2), 1)
                        .without_jitter(),
                );

        let err = engine.step().await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Commit { .. })));

        assert!(stores.relational.alarms().is_empty());
        assert_eq!(stores.relational.commits(), 0);
        assert_eq!(stores.relational.open_transactions(), 0);
        assert!(stores.cache.vehicle("V102").await.unwrap().is_some());
        assert_eq!(stores.column.len(), 1);

        assert_eq!(source.committed("alerts", 3), None);
        assert_eq!(source.committed("vehicle-location", 1), None);
        assert!(matches!(
            engine.health().get_component_status(Component::Relational),
            Some(ComponentStatus::Unhealthy(_))
        ));
    }

    /// Cache failures for one vehicle do not keep the rest of the batch out.
    #[tokio::test]
    async fn test_store_failure_isolated_to_record() {
        let messages = vec![
            message(&location("D0000", "V100", 30.0, 1_717_200_000.0), 0, 0),
            message(&location("D0001", "V101", 30.01, 1_717_200_000.0), 1, 0),
            message(&alert("D0001", 1_717_200_000.0), 1, 0),
        ];
        let source = Arc::new(MemorySource::from_messages(messages));
        let stores = Stores::new();
        stores.cache.fail_on("V100");
        let mut engine =
            IngestionEngine::with_components(engine_config(10), source.clone(), stores.handles());

        let report = engine.step().await.unwrap().unwrap();
        assert_eq!(report.written, 2);
        assert_eq!(report.store_failures.cache, 1);
        assert!(stores.cache.vehicle("V101").await.unwrap().is_some());
        assert_eq!(stores.relational.alarms().len(), 1);
        assert_eq!(source.committed("vehicle-location", 0), Some(1));
    }
}

mod kafka_integration {
    use super::*;
    use fleetpipe_core::config::OffsetReset;
    use fleetpipe_core::kafka::{
        create_topics, EventEmitter, KafkaEmitter, MessageSource, MultiTopicReader, TopicOutcome,
    };
    use testcontainers::runners::AsyncRunner;
    use testcontainers_modules::kafka::Kafka;

    /// Records published by the emitter come back through the reader.
    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_emitter_to_reader_roundtrip() {
        let kafka = Kafka::default()
            .start()
            .await
            .expect("Failed to start Kafka container");
        let bootstrap_servers = format!(
            "127.0.0.1:{}",
            kafka
                .get_host_port_ipv4(9093)
                .await
                .expect("Failed to get Kafka port")
        );

        let mut config = Config::with_bootstrap_servers(vec![bootstrap_servers]);
        config.kafka.auto_offset_reset = OffsetReset::Earliest;

        let outcomes = create_topics(&config.kafka, 2, 1)
            .await
            .expect("Failed to create topics");
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, TopicOutcome::Created(_))));

        // A second run finds the topics in place
        let again = create_topics(&config.kafka, 2, 1).await.unwrap();
        assert!(again
            .iter()
            .all(|o| matches!(o, TopicOutcome::AlreadyExists(_))));

        let emitter = KafkaEmitter::new(&config.kafka).expect("Failed to create emitter");
        let record = location("D0000", "V100", 31.2, 1_717_200_000.0);
        let delivery = emitter
            .emit(Topic::Location, "D0000", &record)
            .unwrap()
            .await
            .expect("Delivery failed");
        assert_eq!(delivery.key, "D0000");
        assert!(emitter.flush(Duration::from_secs(5)).await.is_complete());

        let reader = MultiTopicReader::new(&config.kafka).expect("Failed to create reader");
        let mut received = Vec::new();
        for _ in 0..20 {
            received.extend(reader.poll_batch(10, Duration::from_millis(500)).await.unwrap());
            if !received.is_empty() {
                break;
            }
        }

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].topic, "vehicle-location");
        assert_eq!(received[0].key_str(), Some("D0000"));
        assert_eq!(
            fleetpipe_core::telemetry::decode(&received[0].topic, received[0].value.as_deref().unwrap())
                .unwrap(),
            record
        );
    }
}

mod redis_integration {
    use super::*;
    use fleetpipe_core::config::CacheStoreConfig;
    use fleetpipe_core::store::{RedisCacheStore, VehicleState, VEHICLE_INDEX_KEY};
    use redis::AsyncCommands;
    use testcontainers::runners::AsyncRunner;
    use testcontainers_modules::redis::{Redis, REDIS_PORT};

    fn state(record: &TelemetryRecord) -> VehicleState {
        match record {
            TelemetryRecord::Location(r) => VehicleState::from_location(r),
            other => panic!("unexpected record {:?}", other),
        }
    }

    /// Every indexed vehicle is read back in one round trip; index entries
    /// without a hash are skipped.
    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_vehicles_read_through_index() {
        let redis = Redis::default()
            .start()
            .await
            .expect("Failed to start Redis container");
        let url = format!(
            "redis://127.0.0.1:{}/0",
            redis
                .get_host_port_ipv4(REDIS_PORT)
                .await
                .expect("Failed to get Redis port")
        );

        let store = RedisCacheStore::new(&CacheStoreConfig {
            url: url.clone(),
            pool_size: 2,
        })
        .await
        .expect("Failed to connect to Redis");

        store
            .upsert_vehicle(&state(&location("D0001", "V101", 30.01, 1_717_200_000.0)))
            .await
            .unwrap();
        store
            .upsert_vehicle(&state(&location("D0000", "V100", 30.0, 1_717_200_000.0)))
            .await
            .unwrap();

        let client = redis::Client::open(url).unwrap();
        let mut conn = client.get_multiplexed_async_connection().await.unwrap();
        let _: () = conn.sadd(VEHICLE_INDEX_KEY, "vehicle:V102").await.unwrap();

        let vehicles = store.vehicles().await.unwrap();
        let ids: Vec<_> = vehicles.iter().map(|v| v.vehicle_id.as_str()).collect();
        assert_eq!(ids, vec!["V100", "V101"]);
        assert_eq!(vehicles[1].latitude, 30.01);
    }
}
