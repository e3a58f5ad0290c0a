pub mod config;
pub mod errors;
pub mod influx;
pub mod sink;
