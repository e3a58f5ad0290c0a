use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::errors::ConfigError;

#[derive(Debug, Deserialize, Clone)]
pub struct Configs {
    pub mqtt: MqttConfig,
    pub influx: Option<InfluxConfig>,
    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(skip)]
    config_path: PathBuf,
}

impl Configs {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        let mut configs = Self::from_toml(&config_content)?;
        configs.config_path = path.as_ref().to_path_buf();
        Ok(configs)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let configs: Configs = toml::from_str(content)?;
        configs.validate()?;
        Ok(configs)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Subscription filter, derived from the topic prefix unless set explicitly.
    pub fn topic_filter(&self) -> String {
        match &self.mqtt.topic_filter {
            Some(filter) => filter.clone(),
            None => format!("{}/#", self.ingest.topic_prefix),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        if self.ingest.topic_prefix.is_empty() {
            return invalid("ingest.topic_prefix must not be empty".into());
        }
        if self.ingest.measurement.is_empty() {
            return invalid("ingest.measurement must not be empty".into());
        }
        if self.ingest.device_tag.is_empty() || self.ingest.room_tag.is_empty() {
            return invalid("ingest tag names must not be empty".into());
        }

        let filter = self.topic_filter();
        if !rumqttc::valid_filter(&filter) {
            return invalid(format!("'{}' is not a valid MQTT topic filter", filter));
        }

        let mqtt = &self.mqtt;
        if mqtt.reconnect_initial_delay == 0 {
            return invalid("mqtt.reconnect_initial_delay must be at least 1 second".into());
        }
        if mqtt.reconnect_initial_delay > mqtt.reconnect_max_delay {
            return invalid(format!(
                "mqtt.reconnect_initial_delay ({}) exceeds mqtt.reconnect_max_delay ({})",
                mqtt.reconnect_initial_delay, mqtt.reconnect_max_delay
            ));
        }
        if mqtt.max_in_flight == 0 {
            return invalid("mqtt.max_in_flight must be at least 1".into());
        }

        let tls_parts = [&mqtt.ca_cert, &mqtt.client_cert, &mqtt.client_key];
        let present = tls_parts.iter().filter(|p| p.is_some()).count();
        if present != 0 && present != tls_parts.len() {
            return invalid(
                "mqtt.ca_cert, mqtt.client_cert and mqtt.client_key must be set together".into(),
            );
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u16,
    #[serde(default)]
    pub tls: bool,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
    pub topic_filter: Option<String>,
    #[serde(default = "default_reconnect_initial_delay")]
    pub reconnect_initial_delay: u64,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: u64,
}

impl MqttConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
    #[serde(default = "default_influx_timeout")]
    pub timeout: u64,
    pub backup_dir: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    pub topic_prefix: String,
    pub measurement: String,
    pub device_tag: String,
    pub room_tag: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            topic_prefix: "SensorData".to_string(),
            measurement: "sensorData".to_string(),
            device_tag: "device_id".to_string(),
            room_tag: "room_id".to_string(),
        }
    }
}

fn default_client_id_prefix() -> String {
    "GDA".to_string()
}

fn default_keep_alive() -> u16 {
    60
}

fn default_reconnect_initial_delay() -> u64 {
    1
}

fn default_reconnect_max_delay() -> u64 {
    120
}

fn default_max_in_flight() -> usize {
    16
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_influx_timeout() -> u64 {
    10
}
