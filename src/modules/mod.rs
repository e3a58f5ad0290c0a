pub mod ingest;
pub mod mqtt;
