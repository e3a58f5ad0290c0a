mod client;
pub mod line_protocol;

pub use client::InfluxSink;
