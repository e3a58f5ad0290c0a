use chrono::{DateTime, Utc};
use log::warn;
use serde_json::Value;

use super::models::{json_kind, DecodedPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSource {
    Payload,
    ProcessingTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTimestamp {
    pub instant: DateTime<Utc>,
    pub source: TimestampSource,
}

impl ResolvedTimestamp {
    /// Nanoseconds since the Unix epoch.
    pub fn nanos(&self) -> i64 {
        // Only instants with a nanosecond representation are ever resolved.
        self.instant.timestamp_nanos_opt().unwrap_or_default()
    }
}

pub fn resolve_timestamp(payload: &DecodedPayload) -> ResolvedTimestamp {
    resolve_timestamp_at(payload, Utc::now())
}

/// Payload `timestamp` as an RFC 3339 instant, otherwise `now`.
pub fn resolve_timestamp_at(payload: &DecodedPayload, now: DateTime<Utc>) -> ResolvedTimestamp {
    let fallback = ResolvedTimestamp {
        instant: now,
        source: TimestampSource::ProcessingTime,
    };

    let raw = match payload.get("timestamp") {
        None => return fallback,
        Some(Value::String(s)) => s,
        Some(other) => {
            warn!(
                "Error parsing timestamp: expected a string, got a {}; using processing time",
                json_kind(other)
            );
            return fallback;
        }
    };

    let instant = match DateTime::parse_from_rfc3339(raw.trim()) {
        Ok(parsed) => parsed.with_timezone(&Utc),
        Err(e) => {
            warn!("Error parsing timestamp '{}': {}; using processing time", raw, e);
            return fallback;
        }
    };

    if instant.timestamp_nanos_opt().is_none() {
        warn!(
            "Timestamp '{}' is outside the nanosecond range; using processing time",
            raw
        );
        return fallback;
    }

    ResolvedTimestamp {
        instant,
        source: TimestampSource::Payload,
    }
}
