//! Sensor message ingestion: decode a payload, resolve who sent it and when,
//! extract the readings and hand a single point to the write sink.

pub mod extractor;
pub mod identity;
pub mod models;
pub mod pipeline;
pub mod point;
pub mod timestamp;

pub use models::InboundMessage;
pub use pipeline::IngestPipeline;
