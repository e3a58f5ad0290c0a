use chrono::{DateTime, Utc};

use super::extractor::ReadingSet;
use super::identity::ResolvedIdentity;
use super::timestamp::ResolvedTimestamp;
use crate::shared::config::IngestConfig;

/// Measurement and tag names written for every point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointSchema {
    pub measurement: String,
    pub device_tag: String,
    pub room_tag: String,
}

impl From<&IngestConfig> for PointSchema {
    fn from(config: &IngestConfig) -> Self {
        PointSchema {
            measurement: config.measurement.clone(),
            device_tag: config.device_tag.clone(),
            room_tag: config.room_tag.clone(),
        }
    }
}

impl Default for PointSchema {
    fn default() -> Self {
        PointSchema::from(&IngestConfig::default())
    }
}

/// A single time-series write, always carrying at least one field.
#[derive(Debug, Clone, PartialEq)]
pub struct TimePoint {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub fields: ReadingSet,
    pub timestamp: DateTime<Utc>,
    pub timestamp_nanos: i64,
}

impl TimePoint {
    #[cfg(test)]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub fn build_point(
    schema: &PointSchema,
    identity: &ResolvedIdentity,
    timestamp: &ResolvedTimestamp,
    readings: ReadingSet,
) -> Option<TimePoint> {
    if readings.is_empty() {
        return None;
    }

    Some(TimePoint {
        measurement: schema.measurement.clone(),
        tags: vec![
            (schema.device_tag.clone(), identity.device_id.clone()),
            (schema.room_tag.clone(), identity.room_id.clone()),
        ],
        fields: readings,
        timestamp: timestamp.instant,
        timestamp_nanos: timestamp.nanos(),
    })
}
