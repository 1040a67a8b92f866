//! MQTT client wrapper for the relay's control bus.

use crate::config::MqttConfig;
use async_trait::async_trait;
use log::{debug, error, info};
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, Publish,
    QoS,
};
use std::time::Duration;
use tokio::sync::mpsc;

/// Message received from the MQTT broker.
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
    /// Original packet, needed to acknowledge the message.
    packet: Publish,
}

impl MqttMessage {
    pub fn packet(&self) -> &Publish {
        &self.packet
    }
}

impl From<Publish> for MqttMessage {
    fn from(packet: Publish) -> Self {
        Self {
            topic: packet.topic.clone(),
            payload: String::from_utf8_lossy(&packet.payload).into_owned(),
            packet,
        }
    }
}

/// What the event loop reports to its consumer.
#[derive(Debug, Clone)]
pub enum MqttEvent {
    /// The broker accepted a (re)connection; subscriptions must be renewed.
    Connected,
    Message(MqttMessage),
}

/// Publishing side of the broker connection.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ClientError>;
}

#[async_trait]
impl Publisher for AsyncClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ClientError> {
        AsyncClient::publish(self, topic, QoS::AtMostOnce, false, payload).await
    }
}

/// MQTT client for the relay.
///
/// Inbound messages are acknowledged manually, so a command that fails to
/// execute is not acknowledged.
pub struct MqttClient {
    client: AsyncClient,
    event_loop: EventLoop,
}

impl MqttClient {
    /// Create a new MQTT client from configuration.
    pub fn new(config: &MqttConfig) -> Self {
        let mut options =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_manual_acks(true);

        if let Some(username) = &config.username {
            let password = config.password.as_deref().unwrap_or_default();
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, 100);

        Self { client, event_loop }
    }

    /// Get a clone of the async client for publishing from other tasks.
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Run the MQTT event loop and forward connection and message events.
    ///
    /// Connection errors are logged and retried after a pause. Returns once
    /// the receiving side of `tx` is dropped.
    pub async fn run(mut self, tx: mpsc::Sender<MqttEvent>) {
        info!("[MQTT] Starting event loop");

        loop {
            let event = match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        error!("[MQTT] Broker refused connection: {:?}", ack.code);
                        continue;
                    }
                    info!("[MQTT] Connected to broker");
                    MqttEvent::Connected
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!(
                        "[MQTT] Message({}) on {}: {:?}",
                        publish.pkid, publish.topic, publish.payload
                    );
                    MqttEvent::Message(publish.into())
                }
                Ok(_) => continue,
                Err(e) => {
                    error!("[MQTT] Connection error: {:?}", e);
                    // Wait before reconnecting
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            if tx.send(event).await.is_err() {
                debug!("[MQTT] Event channel closed, stopping event loop");
                break;
            }
        }
    }
}
