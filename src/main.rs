mod logger;
mod modules;
mod shared;

use log::{error, info, warn};
use std::{env, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use modules::ingest::IngestPipeline;
use shared::config::Configs;
use shared::errors::AppError;
use shared::influx::InfluxSink;
use shared::sink::{BackupSink, LogSink, WriteSink};

type Pipeline = IngestPipeline<Box<dyn WriteSink>>;

fn main() -> Result<(), AppError> {
    logger::start_log();

    let config_path = env::var("BRIDGE_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let configs = match Configs::load_from_file(&config_path) {
        Ok(c) => {
            info!("Configurations loaded from '{}'", c.config_path().display());
            c
        }
        Err(e) => {
            error!("Failed to load configurations: {}", e);
            return Err(e.into());
        }
    };

    // The blocking HTTP client is created and dropped outside the runtime.
    let pipeline = Arc::new(IngestPipeline::new(&configs.ingest, build_sink(&configs)?));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(&configs, Arc::clone(&pipeline)));
    runtime.shutdown_timeout(Duration::from_secs(1));
    drop(pipeline);

    info!("Bridge stopped");
    result
}

async fn run(configs: &Configs, pipeline: Arc<Pipeline>) -> Result<(), AppError> {
    let shutdown = CancellationToken::new();
    let supervisor = modules::mqtt::start_mqtt(configs, pipeline, shutdown.clone()).await?;

    shutdown_signal().await?;
    info!("Shutdown signal received, cleaning up...");
    shutdown.cancel();

    supervisor.await?;
    Ok(())
}

fn build_sink(configs: &Configs) -> Result<Box<dyn WriteSink>, AppError> {
    let Some(influx) = &configs.influx else {
        warn!("No [influx] section configured, points will only be logged");
        return Ok(Box::new(LogSink));
    };

    let sink = InfluxSink::new(influx)?;
    info!(
        "Writing to InfluxDB at {} (org '{}', bucket '{}')",
        sink.write_url(),
        influx.org,
        influx.bucket
    );

    match &influx.backup_dir {
        Some(dir) => {
            let sink = BackupSink::new(sink, dir);
            info!("Failed writes are backed up to '{}'", sink.backup_dir().display());
            Ok(Box::new(sink))
        }
        None => Ok(Box::new(sink)),
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
