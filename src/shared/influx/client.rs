use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::time::Duration;

use super::line_protocol::encode_point;
use crate::modules::ingest::point::TimePoint;
use crate::shared::config::InfluxConfig;
use crate::shared::errors::SinkError;
use crate::shared::sink::WriteSink;

/// Writes points through the InfluxDB v2 HTTP API, one request per point.
///
/// Uses a blocking client: build and drop it outside of async contexts.
pub struct InfluxSink {
    client: Client,
    write_url: String,
    org: String,
    bucket: String,
    token: String,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()?;

        Ok(InfluxSink {
            client,
            write_url: write_url(&config.url),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
        })
    }

    pub fn write_url(&self) -> &str {
        &self.write_url
    }
}

impl WriteSink for InfluxSink {
    fn write(&self, point: &TimePoint) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(encode_point(point))
            .send()?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().unwrap_or_default();
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

fn write_url(base: &str) -> String {
    format!("{}/api/v2/write", base.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_url_ignores_trailing_slash() {
        assert_eq!(
            write_url("https://eu-central-1-1.aws.cloud2.influxdata.com/"),
            "https://eu-central-1-1.aws.cloud2.influxdata.com/api/v2/write"
        );
        assert_eq!(write_url("http://localhost:8086"), "http://localhost:8086/api/v2/write");
    }
}
