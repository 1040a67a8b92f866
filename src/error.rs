use crate::bond::api::ApiError;
use crate::bond::push::{KeepaliveError, PushError};
use crate::config::ConfigError;
use std::sync::Arc;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Bond API error: {0}")]
    Api(#[from] ApiError),

    #[error("Push session error: {0}")]
    Push(#[from] PushError),

    #[error("Keepalive failed: {0}")]
    Keepalive(Arc<KeepaliveError>),

    #[error("Could not discover devices from bridge: {0}")]
    Discovery(#[source] ApiError),

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("MQTT connection failed: {0}")]
    MqttConnection(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
