use log::warn;
use serde_json::Value;

use super::models::{json_kind, DecodedPayload};

pub const UNKNOWN_DEVICE: &str = "unknown_device";
pub const UNKNOWN_ROOM: &str = "unknown_room";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub device_id: String,
    pub room_id: String,
}

/// Device id precedence: payload `device_id`, then the topic segment after
/// `prefix/`, then [`UNKNOWN_DEVICE`]. Room id: payload `room_id`, then
/// [`UNKNOWN_ROOM`].
pub fn resolve_identity(topic: &str, prefix: &str, payload: &DecodedPayload) -> ResolvedIdentity {
    let topic_device = topic_device_id(topic, prefix);
    if topic_device.is_none() {
        warn!("Unexpected topic format '{}', expected '{}/<device-id>'", topic, prefix);
    }

    let device_id = match payload_id(payload, "device_id").or_else(|| topic_device.map(String::from)) {
        Some(id) => id,
        None => {
            warn!(
                "No device id in payload or topic '{}', using '{}'",
                topic, UNKNOWN_DEVICE
            );
            UNKNOWN_DEVICE.to_string()
        }
    };

    let room_id = payload_id(payload, "room_id").unwrap_or_else(|| UNKNOWN_ROOM.to_string());

    ResolvedIdentity { device_id, room_id }
}

/// Everything after `prefix/`, when the topic has that shape.
pub fn topic_device_id<'a>(topic: &'a str, prefix: &str) -> Option<&'a str> {
    topic
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|id| !id.is_empty())
}

fn payload_id(payload: &DecodedPayload, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::String(_) => {
            warn!("Ignoring blank '{}' in payload", key);
            None
        }
        Value::Number(n) => Some(n.to_string()),
        other => {
            warn!("Ignoring '{}' in payload: {} is not an identifier", key, json_kind(other));
            None
        }
    }
}
