//! MQTT transport for operator traffic
//!
//! Topics (per agent):
//! - `<prefix>/command@v1/<agent_id>`: inbound operator messages
//! - `<prefix>/reply@v1/<agent_id>`: replies and alerts
//!
//! Only messages from the configured admin identity reach the dispatcher.
//! Each accepted message is handled on its own task. A message carries
//! either command text or a base64 `document` to store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::dispatcher::{Dispatcher, Outbox};
use crate::presentation;
use crate::watchdog::{AlertSink, LowBatteryAlert};

/// Pause before polling again after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Upper bound for flushing queued replies on shutdown
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Operator message on the command topic
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundMessage {
    pub sender: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub document: Option<Document>,
}

/// File attached to an inbound message, base64 encoded on the wire
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Document {
    pub file_name: String,
    pub content: String,
}

/// What the dispatcher is asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Text(String),
    Upload { file_name: String, content: Vec<u8> },
}

impl InboundMessage {
    /// Decode the attachment if there is one, otherwise take the text
    pub fn request(&self) -> Result<Request, Rejection> {
        match &self.document {
            Some(document) => {
                let content = base64::engine::general_purpose::STANDARD
                    .decode(document.content.trim())
                    .map_err(|e| Rejection::Malformed(format!("document content: {}", e)))?;
                Ok(Request::Upload {
                    file_name: document.file_name.clone(),
                    content,
                })
            }
            None => Ok(Request::Text(self.text.clone())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Reply,
    Alert,
}

/// Envelope published on the reply topic
#[derive(Debug, Serialize)]
pub struct OutboundMessage {
    pub agent_id: String,
    pub recipient: String,
    pub kind: MessageKind,
    pub text: String,
    pub in_reply_to: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("message from unauthorized sender '{0}'")]
    Unauthorized(String),
}

/// Decode an inbound payload and check it comes from the admin
pub fn accept(payload: &[u8], admin_id: &str) -> Result<(InboundMessage, Request), Rejection> {
    let message: InboundMessage =
        serde_json::from_slice(payload).map_err(|e| Rejection::Malformed(e.to_string()))?;
    if message.sender != admin_id {
        return Err(Rejection::Unauthorized(message.sender));
    }
    let request = message.request()?;
    Ok((message, request))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub command: String,
    pub reply: String,
}

impl Topics {
    pub fn new(prefix: &str, agent_id: &str) -> Self {
        Self {
            command: format!("{}/command@v1/{}", prefix, agent_id),
            reply: format!("{}/reply@v1/{}", prefix, agent_id),
        }
    }
}

/// Publishes envelopes addressed to the admin
pub struct Publisher {
    client: AsyncClient,
    topic: String,
    agent_id: String,
    recipient: String,
}

impl Publisher {
    pub async fn publish(&self, kind: MessageKind, text: &str, in_reply_to: Option<&str>) -> Result<()> {
        let message = OutboundMessage {
            agent_id: self.agent_id.clone(),
            recipient: self.recipient.clone(),
            kind,
            text: text.to_string(),
            in_reply_to: in_reply_to.map(str::to_string),
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_vec(&message).context("Failed to serialize outbound message")?;

        self.client
            .publish(&self.topic, QoS::AtLeastOnce, false, payload)
            .await
            .context("Failed to publish message")?;
        debug!(kind = ?kind, "Published message on {}", self.topic);
        Ok(())
    }
}

#[async_trait]
impl AlertSink for Publisher {
    async fn send_alert(&self, alert: &LowBatteryAlert) -> Result<()> {
        self.publish(MessageKind::Alert, &presentation::low_battery_alert(alert), None)
            .await
    }
}

/// Replies to a single inbound request
struct ReplyOutbox {
    publisher: Arc<Publisher>,
    request_id: String,
}

#[async_trait]
impl Outbox for ReplyOutbox {
    async fn send(&self, text: &str) -> Result<()> {
        self.publisher
            .publish(MessageKind::Reply, text, Some(&self.request_id))
            .await
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
    topics: Topics,
    admin_id: String,
    publisher: Arc<Publisher>,
}

impl MqttTransport {
    /// Set up the client. Nothing connects until [`MqttTransport::run`] polls.
    pub fn new(config: &AgentConfig) -> Self {
        let mut options = MqttOptions::new(
            config.mqtt_client_id(),
            &config.mqtt.broker_host,
            config.mqtt.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(config.mqtt.keep_alive_secs));
        options.set_clean_session(true);
        options.set_max_packet_size(config.mqtt.max_packet_bytes, config.mqtt.max_packet_bytes);

        let (client, eventloop) = AsyncClient::new(options, 10);
        let topics = Topics::new(&config.mqtt.topic_prefix, &config.agent_id);
        let publisher = Arc::new(Publisher {
            client: client.clone(),
            topic: topics.reply.clone(),
            agent_id: config.agent_id.clone(),
            recipient: config.admin_id.clone(),
        });

        Self {
            client,
            eventloop,
            topics,
            admin_id: config.admin_id.clone(),
            publisher,
        }
    }

    /// Sink for watchdog alerts, sharing this connection
    pub fn alert_sink(&self) -> Arc<Publisher> {
        self.publisher.clone()
    }

    /// Process broker events until `shutdown` flips, then disconnect
    pub async fn run(mut self, dispatcher: Arc<Dispatcher>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Connecting to MQTT broker, listening on {}", self.topics.command);

        loop {
            tokio::select! {
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("Connected to broker, subscribing to {}", self.topics.command);
                        if let Err(e) = self.client.try_subscribe(&self.topics.command, QoS::AtLeastOnce) {
                            error!("Failed to subscribe to command topic: {}", e);
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        self.dispatch(&publish.payload, &dispatcher);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.disconnect().await;
        Ok(())
    }

    fn dispatch(&self, payload: &[u8], dispatcher: &Arc<Dispatcher>) {
        let (message, request) = match accept(payload, &self.admin_id) {
            Ok(accepted) => accepted,
            Err(Rejection::Unauthorized(sender)) => {
                debug!("Ignoring message from unauthorized sender {}", sender);
                return;
            }
            Err(e) => {
                warn!("Dropping inbound message: {}", e);
                return;
            }
        };

        let request_id = message
            .request_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = info_span!("request", id = %request_id);
        let outbox = ReplyOutbox {
            publisher: self.publisher.clone(),
            request_id,
        };
        let dispatcher = dispatcher.clone();

        tokio::spawn(
            async move {
                match request {
                    Request::Text(text) => dispatcher.handle(&text, &outbox).await,
                    Request::Upload { file_name, content } => {
                        dispatcher.handle_upload(&file_name, &content, &outbox).await
                    }
                }
            }
            .instrument(span),
        );
    }

    /// Flush queued publishes, then close the session
    async fn disconnect(mut self) {
        info!("Disconnecting from broker");
        if let Err(e) = self.client.try_disconnect() {
            warn!("Failed to queue disconnect: {}", e);
            return;
        }

        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_TIMEOUT, flush).await.is_err() {
            warn!("Timed out flushing messages before disconnect");
        }
    }
}
