mod backoff;
mod handlers;
mod mqtt_client;

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ingest::IngestPipeline;
use crate::shared::config::Configs;
use crate::shared::errors::AppError;
use crate::shared::sink::WriteSink;
use mqtt_client::MqttClient;

/// Starts the broker connection and routes sensor topics into `pipeline`.
///
/// The returned task finishes after `shutdown` is cancelled and in-flight
/// messages have drained.
pub async fn start_mqtt<S>(
    configs: &Configs,
    pipeline: Arc<IngestPipeline<S>>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, AppError>
where
    S: WriteSink + 'static,
{
    let (mqtt, supervisor) = MqttClient::new(&configs.mqtt, shutdown)?;
    log::info!("Mqtt started...");

    handlers::sensor_data::handler(&mqtt, &configs.topic_filter(), pipeline).await?;

    Ok(supervisor)
}
