use chrono::Utc;
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS, TlsConfiguration,
    Transport,
};
use std::{
    collections::HashMap,
    fs, io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{RwLock, Semaphore},
    task::{self, JoinHandle},
    time::{sleep, timeout},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::backoff::Backoff;
use crate::modules::ingest::InboundMessage;
use crate::shared::config::MqttConfig;
use crate::shared::errors::AppError;

/// Handler for messages matching a subscription filter. Runs on a blocking
/// worker and may be invoked concurrently.
pub type TopicHandler = Arc<dyn Fn(InboundMessage) + Send + Sync + 'static>;

type TopicHandlers = Arc<RwLock<HashMap<String, TopicHandler>>>;

const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct MqttClient {
    client: AsyncClient,
    topic_handlers: TopicHandlers,
}

impl MqttClient {
    /// Connects lazily and starts the supervisor task that polls the event
    /// loop until `shutdown` is cancelled.
    pub fn new(
        config: &MqttConfig,
        shutdown: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>), AppError> {
        let options = mqtt_options(config)?;
        let (client, eventloop) = AsyncClient::new(options, 250);

        let mqtt_client = MqttClient {
            client,
            topic_handlers: Arc::new(RwLock::new(HashMap::new())),
        };

        let supervisor = Supervisor {
            dispatcher: Dispatcher::new(mqtt_client.clone(), config.max_in_flight),
            eventloop,
            backoff: Backoff::from_secs(config.reconnect_initial_delay, config.reconnect_max_delay),
            drain_timeout: config.drain_timeout(),
            shutdown,
        };

        let handle = task::spawn(supervisor.run());
        Ok((mqtt_client, handle))
    }

    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), rumqttc::ClientError> {
        self.client.subscribe(filter, qos).await?;
        Ok(())
    }

    /// Registers `handler` for `filter`; registered filters are subscribed
    /// again on every new connection.
    pub async fn add_topic_handler<F>(&self, filter: &str, handler: F)
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        let mut handlers = self.topic_handlers.write().await;
        handlers.insert(filter.to_string(), Arc::new(handler));
    }

    /// Subscribes every registered filter again after a (re)connect.
    async fn resubscribe(&self) {
        let handlers = self.topic_handlers.read().await;
        for filter in handlers.keys() {
            info!("Subscribing to topic filter '{}'", filter);
            // Never block the poll loop on the request channel.
            if let Err(e) = self.client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                error!("Failed to subscribe to topic '{}': {}", filter, e);
            }
        }
    }

    async fn handlers_for(&self, topic: &str) -> Vec<TopicHandler> {
        self.topic_handlers
            .read()
            .await
            .iter()
            .filter(|(filter, _)| rumqttc::matches(topic, filter))
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }
}

enum Step {
    Event(Result<Event, rumqttc::ConnectionError>),
    Stop,
}

/// Hands publishes to blocking workers. Shared by the poll loop and every
/// worker it spawns.
#[derive(Clone)]
struct Dispatcher {
    mqtt: MqttClient,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    /// Bumped whenever the connection is lost; packet ids from an older
    /// connection must not be acknowledged on a newer one.
    generation: Arc<AtomicU64>,
}

impl Dispatcher {
    fn new(mqtt: MqttClient, max_in_flight: usize) -> Self {
        Dispatcher {
            mqtt,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            tracker: TaskTracker::new(),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn connection_lost(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) != generation
    }

    /// Waits for a free worker slot before spawning, so at most
    /// `max_in_flight` messages are held at once and intake follows sink
    /// throughput.
    async fn dispatch(&self, publish: Publish) {
        let generation = self.generation.load(Ordering::Acquire);
        let handlers = self.mqtt.handlers_for(&publish.topic).await;

        if handlers.is_empty() {
            warn!("No handler registered for topic '{}'", publish.topic);
            // Never block the poll loop on the request channel.
            if let Err(e) = self.mqtt.client.try_ack(&publish) {
                warn!("Failed to acknowledge message on '{}': {}", publish.topic, e);
            }
            return;
        }

        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let dispatcher = self.clone();
        self.tracker.spawn(async move {
            let _permit = permit;

            for handler in handlers {
                let message = InboundMessage::new(publish.topic.clone(), publish.payload.clone());
                let topic = publish.topic.clone();
                if let Err(e) = task::spawn_blocking(move || handler(message)).await {
                    error!("Handler for topic '{}' failed: {}", topic, e);
                }
            }

            // Acknowledge only after processing has finished.
            dispatcher.ack(&publish, generation).await;
        });
    }

    async fn ack(&self, publish: &Publish, generation: u64) {
        if self.is_stale(generation) {
            debug!(
                "Not acknowledging message {} on '{}' from a previous connection",
                publish.pkid, publish.topic
            );
            return;
        }
        if let Err(e) = self.mqtt.client.ack(publish).await {
            warn!("Failed to acknowledge message on '{}': {}", publish.topic, e);
        }
    }
}

/// Owns the event loop: keeps the session alive, reconnects with backoff and
/// fans publishes out to blocking workers without waiting on their results.
struct Supervisor {
    dispatcher: Dispatcher,
    eventloop: EventLoop,
    backoff: Backoff,
    drain_timeout: Duration,
    shutdown: CancellationToken,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                _ = self.shutdown.cancelled() => Step::Stop,
                event = self.eventloop.poll() => Step::Event(event),
            };

            let event = match step {
                Step::Stop => break,
                Step::Event(event) => event,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.dispatcher.dispatch(publish) => (),
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connection established with broker.");
                    self.backoff.reset();
                    self.dispatcher.mqtt.resubscribe().await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Broker closed the connection.");
                }
                Ok(_) => (),
                Err(e) => {
                    self.dispatcher.connection_lost();
                    let delay = self.backoff.next_delay();
                    error!(
                        "MQTT connection error: {}. Reconnecting in {:.1}s",
                        e,
                        delay.as_secs_f64()
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep(delay) => (),
                    }
                }
            }
        }

        self.drain().await;
    }

    async fn drain(mut self) {
        let tracker = self.dispatcher.tracker.clone();
        tracker.close();
        if !tracker.is_empty() {
            info!(
                "Shutting down, waiting for {} in-flight messages",
                tracker.len()
            );
        }

        let deadline = sleep(self.drain_timeout);
        tokio::pin!(deadline);
        let mut connected = true;

        loop {
            // Keep polling so acknowledgements of draining handlers go out.
            let step = tokio::select! {
                _ = tracker.wait() => Step::Stop,
                _ = &mut deadline => {
                    warn!(
                        "Drain timeout elapsed with {} messages still in flight",
                        tracker.len()
                    );
                    Step::Stop
                }
                event = self.eventloop.poll(), if connected => Step::Event(event),
            };

            match step {
                Step::Stop => break,
                Step::Event(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    debug!("Ignoring message on '{}' during shutdown", publish.topic);
                }
                Step::Event(Ok(_)) => (),
                Step::Event(Err(e)) => {
                    // Sink writes do not need the broker, keep waiting for them.
                    warn!("Connection lost while draining: {}", e);
                    self.dispatcher.connection_lost();
                    connected = false;
                }
            }
        }

        if !connected {
            return;
        }
        if let Err(e) = self.dispatcher.mqtt.client.try_disconnect() {
            warn!("Failed to request disconnect: {}", e);
            return;
        }

        let flushed = timeout(DISCONNECT_FLUSH_TIMEOUT, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => (),
                }
            }
        })
        .await;

        match flushed {
            Ok(()) => info!("Disconnected from broker."),
            Err(_) => warn!("Timed out waiting for broker disconnect."),
        }
    }
}

fn mqtt_options(config: &MqttConfig) -> Result<MqttOptions, AppError> {
    // Unique per process start, so restarts never collide with a stale session.
    let client_id = format!(
        "{}_{}",
        config.client_id_prefix,
        Utc::now().timestamp_millis()
    );
    info!("Initializing MQTT client with ID: {}", client_id);

    let mut options = MqttOptions::new(client_id, config.broker.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive.into()));
    options.set_clean_session(true);
    options.set_manual_acks(true);

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username.clone(), password.clone());
    }

    if let (Some(ca_cert), Some(client_cert), Some(client_key)) =
        (&config.ca_cert, &config.client_cert, &config.client_key)
    {
        let tls_config = TlsConfiguration::Simple {
            ca: load_certificate(ca_cert)?,
            alpn: None,
            client_auth: Some((load_certificate(client_cert)?, load_certificate(client_key)?)),
        };
        options.set_transport(Transport::tls_with_config(tls_config));
    } else if config.tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    Ok(options)
}

fn load_certificate(path: &str) -> io::Result<Vec<u8>> {
    fs::read(path).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("failed to read certificate file '{}': {}", path, e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Instant;

    fn config() -> MqttConfig {
        crate::shared::config::Configs::from_toml(
            r#"
            [mqtt]
            broker = "127.0.0.1"
            port = 1
            "#,
        )
        .unwrap()
        .mqtt
    }

    #[test]
    fn options_use_clean_session_and_manual_acks() {
        let options = mqtt_options(&config()).unwrap();

        assert!(options.client_id().starts_with("GDA_"));
        assert!(options.clean_session());
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
        assert_eq!(options.broker_address(), ("127.0.0.1".to_string(), 1));
    }

    #[test]
    fn missing_certificate_is_an_error() {
        let mut config = config();
        config.ca_cert = Some("/nonexistent/ca.pem".to_string());
        config.client_cert = Some("/nonexistent/client.pem".to_string());
        config.client_key = Some("/nonexistent/client.key".to_string());

        assert!(matches!(mqtt_options(&config), Err(AppError::Io(_))));
    }

    #[tokio::test]
    async fn handlers_match_wildcard_filters() {
        let shutdown = CancellationToken::new();
        let (client, supervisor) = MqttClient::new(&config(), shutdown.clone()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client
            .add_topic_handler("SensorData/#", move |message| {
                sink.lock().unwrap().push(message.topic);
            })
            .await;

        assert_eq!(client.handlers_for("SensorData/p1").await.len(), 1);
        assert_eq!(client.handlers_for("SensorData/a/b").await.len(), 1);
        assert!(client.handlers_for("Other/p1").await.is_empty());

        let handler = client.handlers_for("SensorData/p1").await.remove(0);
        handler(InboundMessage::new("SensorData/p1", "{}"));
        assert_eq!(*seen.lock().unwrap(), vec!["SensorData/p1".to_string()]);

        shutdown.cancel();
        supervisor.await.unwrap();
    }

    fn dispatcher(max_in_flight: usize) -> (Dispatcher, EventLoop) {
        let options = mqtt_options(&config()).unwrap();
        let (client, eventloop) = AsyncClient::new(options, 10);
        let mqtt = MqttClient {
            client,
            topic_handlers: Arc::new(RwLock::new(HashMap::new())),
        };
        (Dispatcher::new(mqtt, max_in_flight), eventloop)
    }

    fn publish(topic: &str) -> Publish {
        Publish::new(topic, QoS::AtMostOnce, r#"{"readings":{}}"#)
    }

    async fn finish(dispatcher: &Dispatcher) {
        dispatcher.tracker.close();
        dispatcher.tracker.wait().await;
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_dispatch() {
        let (dispatcher, _eventloop) = dispatcher(4);
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&handled);
        dispatcher
            .mqtt
            .add_topic_handler("SensorData/#", move |message| {
                if message.topic.ends_with("boom") {
                    panic!("handler failure");
                }
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        dispatcher.dispatch(publish("SensorData/boom")).await;
        dispatcher.dispatch(publish("SensorData/ok")).await;
        finish(&dispatcher).await;

        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pending_work_is_capped_at_max_in_flight() {
        let (dispatcher, _eventloop) = dispatcher(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handled = Arc::new(AtomicUsize::new(0));
        {
            let (running, peak, handled) =
                (Arc::clone(&running), Arc::clone(&peak), Arc::clone(&handled));
            dispatcher
                .mqtt
                .add_topic_handler("SensorData/#", move |_| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(100));
                    running.fetch_sub(1, Ordering::SeqCst);
                    handled.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }

        for i in 0..6 {
            dispatcher.dispatch(publish(&format!("SensorData/p{}", i))).await;
            assert!(dispatcher.tracker.len() <= 2);
        }
        finish(&dispatcher).await;

        assert_eq!(handled.load(Ordering::SeqCst), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn unmatched_topic_spawns_no_work() {
        let (dispatcher, _eventloop) = dispatcher(1);
        dispatcher.dispatch(publish("Other/p1")).await;
        assert!(dispatcher.tracker.is_empty());
    }

    #[tokio::test]
    async fn acks_from_a_lost_connection_are_stale() {
        let (dispatcher, _eventloop) = dispatcher(1);
        let generation = dispatcher.generation.load(Ordering::Acquire);
        assert!(!dispatcher.is_stale(generation));

        dispatcher.connection_lost();
        assert!(dispatcher.is_stale(generation));
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_messages_without_a_broker() {
        let (dispatcher, eventloop) = dispatcher(2);
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&handled);
        dispatcher
            .mqtt
            .add_topic_handler("SensorData/#", move |_| {
                std::thread::sleep(Duration::from_millis(300));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        dispatcher.dispatch(publish("SensorData/p1")).await;
        dispatcher.dispatch(publish("SensorData/p2")).await;

        let supervisor = Supervisor {
            dispatcher,
            eventloop,
            backoff: Backoff::from_secs(1, 1),
            drain_timeout: Duration::from_secs(5),
            shutdown: CancellationToken::new(),
        };
        let started = Instant::now();
        supervisor.drain().await;

        assert_eq!(handled.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
