use crate::bond::push::BPUP_PORT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Client id used when the hostname cannot be determined.
const FALLBACK_CLIENT_ID: &str = "bondhome-mqtt-bridge";

/// Load environment variables from a `.env` file in the working directory.
pub fn load_dotenv() {
    load_dotenv_from(Path::new(".env"));
}

/// Load environment variables from the given file, if it exists.
/// Variables already present in the environment win.
pub fn load_dotenv_from(path: &Path) {
    let Ok(content) = fs::read_to_string(path) else {
        return;
    };

    for (key, value) in content.lines().filter_map(parse_dotenv_line) {
        if std::env::var_os(key).is_none() {
            // SAFETY: called at startup, before the async runtime spawns threads
            unsafe { std::env::set_var(key, value) };
        }
    }
}

/// Split one `.env` line into key and value. Blank lines and `#` comments
/// yield nothing; one pair of surrounding quotes is removed from the value.
fn parse_dotenv_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let mut value = value.trim();
    if value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')))
    {
        value = &value[1..value.len() - 1];
    }
    Some((key, value))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bond: BondConfig,
    pub mqtt: MqttConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BondConfig {
    /// Hostname or IP of the bridge, optionally with an `http(s)://` scheme.
    pub host: String,
    /// Local API token, sent as the `BOND-Token` header.
    pub token: String,
    pub push_port: u16,
    pub http_timeout_secs: u64,
}

impl BondConfig {
    /// Base URL of the bridge's HTTP API, without a trailing slash.
    pub fn api_base_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.contains("://") {
            host.to_string()
        } else {
            format!("http://{}", host)
        }
    }

    /// `host:port` of the bridge's BPUP listener.
    pub fn push_address(&self) -> String {
        let host = self
            .host
            .split_once("://")
            .map_or(self.host.as_str(), |(_, rest)| rest);
        let host = host.split('/').next().unwrap_or(host);
        format!("{}:{}", host, self.push_port)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// First segment of every MQTT topic the bridge publishes or subscribes to.
    pub topic_prefix: String,
    /// Upper bound on a single push receive before the loop checks in again.
    pub receive_timeout_secs: u64,
}

impl RelayConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }
}

/// MQTT client id derived from the machine's hostname.
pub fn default_client_id() -> String {
    gethostname::gethostname()
        .into_string()
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_CLIENT_ID.to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bond: BondConfig {
                host: String::new(),
                token: String::new(),
                push_port: BPUP_PORT,
                http_timeout_secs: 10,
            },
            mqtt: MqttConfig {
                broker_host: "localhost".to_string(),
                broker_port: 1883,
                client_id: default_client_id(),
                username: None,
                password: None,
            },
            relay: RelayConfig {
                topic_prefix: "bondhome".to_string(),
                receive_timeout_secs: 10,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Bond bridge
        if let Ok(host) = std::env::var("BOND_HOST") {
            config.bond.host = host;
        }
        if let Ok(token) = std::env::var("BOND_TOKEN") {
            config.bond.token = token;
        }
        if let Ok(port) = std::env::var("BOND_PUSH_PORT")
            && let Ok(p) = port.parse()
        {
            config.bond.push_port = p;
        }
        if let Ok(secs) = std::env::var("BOND_RECEIVE_TIMEOUT_SECS")
            && let Ok(s) = secs.parse()
        {
            config.relay.receive_timeout_secs = s;
        }

        // MQTT broker
        if let Ok(host) = std::env::var("MQTT_BROKER_HOST") {
            config.mqtt.broker_host = host;
        }
        if let Ok(port) = std::env::var("MQTT_BROKER_PORT")
            && let Ok(p) = port.parse()
        {
            config.mqtt.broker_port = p;
        }
        if let Ok(client_id) = std::env::var("MQTT_CLIENT_ID") {
            config.mqtt.client_id = client_id;
        }
        if let Ok(username) = std::env::var("MQTT_USERNAME") {
            config.mqtt.username = Some(username);
        }
        if let Ok(password) = std::env::var("MQTT_PASSWORD") {
            config.mqtt.password = Some(password);
        }
        if let Ok(prefix) = std::env::var("MQTT_TOPIC_PREFIX") {
            config.relay.topic_prefix = prefix;
        }

        config
    }

    /// Check that everything needed to reach both ends is set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bond.host.trim().is_empty() {
            return Err(ConfigError::Missing("bridge host"));
        }
        if self.bond.token.trim().is_empty() {
            return Err(ConfigError::Missing("bridge token"));
        }
        if self.mqtt.broker_host.trim().is_empty() {
            return Err(ConfigError::Missing("MQTT broker host"));
        }
        Ok(())
    }
}
