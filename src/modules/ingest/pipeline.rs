use log::{error, info};

use super::extractor::extract_readings;
use super::identity::resolve_identity;
use super::models::{DecodedPayload, InboundMessage};
use super::point::{build_point, PointSchema};
use super::timestamp::resolve_timestamp;
use crate::shared::config::IngestConfig;
use crate::shared::influx::line_protocol::encode_point;
use crate::shared::sink::WriteSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Payload was not a JSON object.
    Undecodable,
    /// Nothing could be extracted from `readings`.
    NoFields,
}

/// How a single message ended. Never an error: every outcome is terminal for
/// that message only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Written,
    Skipped(SkipReason),
    WriteFailed,
}

/// Per-message orchestration: decode, resolve, extract, build, write.
///
/// Holds no per-message state, so one instance can serve concurrent
/// invocations as long as the sink can.
pub struct IngestPipeline<S> {
    topic_prefix: String,
    schema: PointSchema,
    sink: S,
}

impl<S: WriteSink> IngestPipeline<S> {
    pub fn new(config: &IngestConfig, sink: S) -> Self {
        IngestPipeline {
            topic_prefix: config.topic_prefix.clone(),
            schema: PointSchema::from(config),
            sink,
        }
    }

    pub fn process(&self, message: &InboundMessage) -> Outcome {
        info!("Received message on topic: '{}'", message.topic);

        let payload = match DecodedPayload::decode(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    "Error processing message on topic '{}': {}. Problematic payload: {}",
                    message.topic,
                    e,
                    message.payload_lossy()
                );
                return Outcome::Skipped(SkipReason::Undecodable);
            }
        };

        let identity = resolve_identity(&message.topic, &self.topic_prefix, &payload);
        let timestamp = resolve_timestamp(&payload);
        let readings = extract_readings(&payload);

        let Some(point) = build_point(&self.schema, &identity, &timestamp, readings) else {
            info!(
                "No fields found in message for device '{}' on topic '{}'",
                identity.device_id, message.topic
            );
            return Outcome::Skipped(SkipReason::NoFields);
        };

        match self.sink.write(&point) {
            Ok(()) => {
                info!(
                    "Wrote point for device '{}' (room '{}', {} fields)",
                    identity.device_id,
                    identity.room_id,
                    point.fields.len()
                );
                Outcome::Written
            }
            Err(e) => {
                error!(
                    "Failed to write point for device '{}' room '{}' at {} fields {}: {}. Replay line: {}",
                    identity.device_id,
                    identity.room_id,
                    point.timestamp.to_rfc3339(),
                    point.fields,
                    e,
                    encode_point(&point)
                );
                Outcome::WriteFailed
            }
        }
    }
}
