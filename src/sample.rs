//! Poll results as handed to viewers.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

/// Value of one field in a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Value(f64),
    /// The read failed or the decoded value did not pass the sanity check
    Unavailable,
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(*v),
            Self::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Value(_))
    }
}

impl From<Option<f64>> for FieldValue {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Self::Unavailable, Self::Value)
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Value(v) => serializer.serialize_f64(*v),
            Self::Unavailable => serializer.serialize_none(),
        }
    }
}

/// One complete snapshot of every polled field.
///
/// Built in full by the poller and never mutated once published.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    /// Sequence number of this sample since the process started
    pub update_count: u64,
    pub values: BTreeMap<String, FieldValue>,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, update_count: u64) -> Self {
        Self {
            timestamp,
            update_count,
            values: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, field: impl Into<String>, value: FieldValue) {
        self.values.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<FieldValue> {
        self.values.get(field).copied()
    }

    /// Logical value of `field`, if it was read successfully.
    pub fn value(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(|v| v.as_f64())
    }

    pub fn available_count(&self) -> usize {
        self.values.values().filter(|v| v.is_available()).count()
    }

    pub fn has_any_value(&self) -> bool {
        self.values.values().any(FieldValue::is_available)
    }

    /// Viewer message: `{"type":"update","timestamp":..,"data":{..}}`.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Serialize for Sample {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry("type", "update")?;
        map.serialize_entry(
            "timestamp",
            &self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        )?;
        map.serialize_entry("update_count", &self.update_count)?;
        map.serialize_entry("data", &self.values)?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Sample {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut sample = Sample::new(ts, 7);
        sample.insert("battery_soc", FieldValue::Value(87.0));
        sample.insert("vbattery", FieldValue::Unavailable);
        sample
    }

    #[test]
    fn test_viewer_message() {
        let json: serde_json::Value = serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["timestamp"], "2024-05-01T12:00:00.000Z");
        assert_eq!(json["update_count"], 7);
        assert_eq!(json["data"]["battery_soc"], 87.0);
        assert!(json["data"]["vbattery"].is_null());
    }

    #[test]
    fn test_availability() {
        let s = sample();
        assert_eq!(s.value("battery_soc"), Some(87.0));
        assert_eq!(s.value("vbattery"), None);
        assert_eq!(s.get("missing"), None);
        assert_eq!(s.available_count(), 1);
        assert!(s.has_any_value());

        let empty = Sample::new(Utc::now(), 0);
        assert!(!empty.has_any_value());
    }

    #[test]
    fn test_field_value_from_option() {
        assert_eq!(FieldValue::from(Some(1.5)), FieldValue::Value(1.5));
        assert_eq!(FieldValue::from(None), FieldValue::Unavailable);
    }
}
