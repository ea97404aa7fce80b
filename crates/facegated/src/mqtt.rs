//! MQTT transport: broker connection, subscription, and per-message dispatch.

use crate::config::Config;
use async_trait::async_trait;
use facegate_core::{handle_message, HandleOutcome, PipelineContext, PublishError, Publisher, WorkflowOutcome};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use uuid::Uuid;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("broker connection failed: {0}")]
    Connect(#[from] ConnectionError),
    #[error("broker did not acknowledge the connection within {0:?}")]
    ConnectTimeout(Duration),
    #[error("subscribe request failed: {0}")]
    Subscribe(#[from] rumqttc::ClientError),
}

/// Build client options from config. The client id gets a random suffix so
/// several listeners can share a broker.
pub fn options(config: &Config) -> MqttOptions {
    let client_id = format!("{}-{}", config.mqtt_client_prefix, Uuid::new_v4().simple());
    let mut opts = MqttOptions::new(client_id, config.mqtt_host.clone(), config.mqtt_port);
    opts.set_keep_alive(KEEP_ALIVE);
    opts.set_clean_session(true);
    opts.set_max_packet_size(config.mqtt_max_packet_bytes, config.mqtt_max_packet_bytes);
    if let Some(user) = &config.mqtt_username {
        opts.set_credentials(user.clone(), config.mqtt_password.clone().unwrap_or_default());
    }
    opts
}

/// Outbound commands share the listener's connection.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))
    }
}

/// Drive the event loop until the broker acknowledges the connection, then
/// subscribe. Fails fast so a misconfigured broker stops startup.
pub async fn connect(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    topic: &str,
) -> Result<(), TransportError> {
    let acked = tokio::time::timeout(CONNECT_TIMEOUT, async {
        loop {
            if let Event::Incoming(Packet::ConnAck(ack)) = eventloop.poll().await? {
                return Ok::<_, ConnectionError>(ack);
            }
        }
    })
    .await
    .map_err(|_| TransportError::ConnectTimeout(CONNECT_TIMEOUT))??;

    tracing::info!(code = ?acked.code, "connected to MQTT broker");
    client.subscribe(topic, QoS::AtMostOnce).await?;
    Ok(())
}

/// Receive messages forever, handling each on its own task. At most
/// `max_in_flight` handlers run at once; the rest wait on the semaphore
/// without blocking the event loop. Resubscribes after every reconnect.
pub async fn listen(
    ctx: Arc<PipelineContext>,
    client: AsyncClient,
    mut eventloop: EventLoop,
    topic: String,
    max_in_flight: usize,
) {
    let permits = Arc::new(Semaphore::new(max_in_flight.max(1)));

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                tracing::info!(code = ?ack.code, "reconnected to MQTT broker");
                if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                    tracing::error!(topic = %topic, error = %e, "resubscribe failed");
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                tracing::info!(topic = %topic, "listening");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let ctx = Arc::clone(&ctx);
                let permits = Arc::clone(&permits);
                // Wait for a slot off the poll loop so keepalives keep flowing.
                tokio::spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    tracing::debug!(topic = %publish.topic, bytes = publish.payload.len(), "message received");
                    let outcome = handle_message(&ctx, &publish.topic, &publish.payload).await;
                    tracing::info!(topic = %publish.topic, outcome = describe(outcome.as_ref()), "message handled");
                });
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "MQTT connection error; retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Short label for the handled-message log line.
fn describe(outcome: Option<&HandleOutcome>) -> &'static str {
    match outcome {
        None => "dropped",
        Some(HandleOutcome::Recognized { .. }) => "recognized",
        Some(HandleOutcome::MissingPicture) => "missing_picture",
        Some(HandleOutcome::AlreadyLocked) => "already_locked",
        Some(HandleOutcome::CooldownActive) => "cooldown_active",
        Some(HandleOutcome::Registration(WorkflowOutcome::Registered { .. })) => "registered",
        Some(HandleOutcome::Registration(WorkflowOutcome::ImagePersistFailed(_))) => "image_persist_failed",
        Some(HandleOutcome::Registration(WorkflowOutcome::IdentityInsertFailed(_))) => "identity_insert_failed",
        Some(HandleOutcome::Registration(WorkflowOutcome::LockExpired { .. })) => "lock_expired",
    }
}
