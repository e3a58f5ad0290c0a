use rumqttc::QoS;
use std::sync::Arc;

use crate::modules::ingest::IngestPipeline;
use crate::modules::mqtt::mqtt_client::MqttClient;
use crate::shared::errors::AppError;
use crate::shared::sink::WriteSink;

/// Feeds every message under `filter` through the ingestion pipeline.
pub async fn handler<S>(
    client: &MqttClient,
    filter: &str,
    pipeline: Arc<IngestPipeline<S>>,
) -> Result<(), AppError>
where
    S: WriteSink + 'static,
{
    client
        .add_topic_handler(filter, move |message| {
            pipeline.process(&message);
        })
        .await;

    if let Err(err) = client.subscribe(filter, QoS::AtLeastOnce).await {
        log::error!("Error subscribing to {} err: {:#?}", filter, err);
        return Err(err.into());
    }
    log::info!("Subscribed to {}", filter);

    Ok(())
}
