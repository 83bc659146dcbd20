//! Raw payload to typed record decoding.
//!
//! Decoding never panics and never fails a whole batch; callers get one
//! `Result` per message.

use crate::error::DecodeError;
use crate::telemetry::record::{
    AlertRecord, LocationRecord, LogisticsRecord, TelemetryRecord, Topic,
};
use serde::de::DeserializeOwned;

/// Decode a payload read from `topic`.
///
/// Missing fields, wrong JSON types and unknown enum values are all
/// `MalformedRecord`. Humidity must lie in 0-100 and load in 1-100.
pub fn decode(topic: &str, raw: &[u8]) -> Result<TelemetryRecord, DecodeError> {
    let kind: Topic = topic.parse()?;

    if raw.is_empty() {
        return Err(DecodeError::EmptyPayload(topic.to_string()));
    }

    let record = match kind {
        Topic::Logistics => {
            let record: LogisticsRecord = parse(topic, raw)?;
            if record.humidity > 100 {
                return Err(malformed(topic, format!("humidity {} out of range", record.humidity)));
            }
            TelemetryRecord::Logistics(record)
        }
        Topic::Location => {
            let record: LocationRecord = parse(topic, raw)?;
            if !(1..=100).contains(&record.load) {
                return Err(malformed(topic, format!("load {} out of range", record.load)));
            }
            if record.vehicle_id.is_empty() {
                return Err(malformed(topic, "empty vehicle_id"));
            }
            TelemetryRecord::Location(record)
        }
        Topic::Alerts => TelemetryRecord::Alert(parse::<AlertRecord>(topic, raw)?),
    };

    if record.device_id().is_empty() {
        return Err(malformed(topic, "empty device_id"));
    }

    Ok(record)
}

fn parse<T: DeserializeOwned>(topic: &str, raw: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(raw).map_err(|e| malformed(topic, e.to_string()))
}

fn malformed(topic: &str, message: impl Into<String>) -> DecodeError {
    DecodeError::MalformedRecord {
        topic: topic.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::record::{AlertType, Severity, ShipmentStatus, VehicleStatus};

    #[test]
    fn test_decode_logistics_exact_values() {
        let raw = br#"{"device_id":"D0004","package_id":"P123456","temperature":12.3,"humidity":55,"status":"delayed","timestamp":1717171717.25}"#;

        match decode("logistics-data", raw).unwrap() {
            TelemetryRecord::Logistics(record) => {
                assert_eq!(record.humidity, 55);
                assert_eq!(record.temperature, 12.3);
                assert_eq!(record.status, ShipmentStatus::Delayed);
                assert_eq!(record.package_id, "P123456");
                assert_eq!(record.timestamp, 1717171717.25);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_decode_is_idempotent() {
        let raw = br#"{"device_id":"D0004","package_id":"P123456","temperature":12.3,"humidity":55,"status":"in_transit","timestamp":1.0}"#;
        let first = decode("logistics-data", raw).unwrap();
        let second = decode("logistics-data", &first.to_payload().unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_decode_location() {
        let raw = br#"{"device_id":"D0000","vehicle_id":"V100","latitude":31.2,"longitude":120.5,"speed":60.0,"direction":0,"status":"in_transit","load":40,"timestamp":1717171717.0}"#;
        match decode("vehicle-location", raw).unwrap() {
            TelemetryRecord::Location(record) => {
                assert_eq!(record.vehicle_id, "V100");
                assert_eq!(record.latitude, 31.2);
                assert_eq!(record.status, VehicleStatus::InTransit);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_decode_alert_reads_details() {
        let raw = br#"{"device_id":"D0002","alert_type":"power_outage","severity":"medium","timestamp":5.0,"details":"Alert triggered by device D0002"}"#;
        match decode("alerts", raw).unwrap() {
            TelemetryRecord::Alert(record) => {
                assert_eq!(record.alert_type, AlertType::PowerOutage);
                assert_eq!(record.severity, Severity::Medium);
                assert_eq!(record.detail, "Alert triggered by device D0002");
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_decode_missing_field() {
        let raw = br#"{"device_id":"D0004","temperature":12.3,"humidity":55,"status":"delayed","timestamp":1.0}"#;
        let err = decode("logistics-data", raw).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedRecord { ref topic, .. } if topic == "logistics-data"));
    }

    #[test]
    fn test_decode_wrong_type() {
        let raw = br#"{"device_id":"D0004","package_id":"P1","temperature":"warm","humidity":55,"status":"delayed","timestamp":1.0}"#;
        assert!(matches!(
            decode("logistics-data", raw),
            Err(DecodeError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn test_decode_unknown_status() {
        let raw = br#"{"device_id":"D0004","package_id":"P1","temperature":1.0,"humidity":55,"status":"lost","timestamp":1.0}"#;
        assert!(decode("logistics-data", raw).is_err());
    }

    #[test]
    fn test_decode_out_of_range_humidity() {
        let raw = br#"{"device_id":"D0004","package_id":"P1","temperature":1.0,"humidity":180,"status":"delayed","timestamp":1.0}"#;
        assert!(decode("logistics-data", raw).is_err());
    }

    #[test]
    fn test_decode_not_json() {
        assert!(matches!(
            decode("alerts", b"not json"),
            Err(DecodeError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn test_decode_empty_and_unknown_topic() {
        assert_eq!(
            decode("alerts", b"").unwrap_err(),
            DecodeError::EmptyPayload("alerts".into())
        );
        assert_eq!(
            decode("orders", b"{}").unwrap_err(),
            DecodeError::UnknownTopic("orders".into())
        );
    }
}
