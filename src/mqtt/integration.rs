//! Relay between a Bond bridge and the MQTT broker.
//!
//! Bridge state flows out of the push session onto `<prefix>/<topic>`.
//! Commands arrive on `<prefix>/devices/<device_id>/<action_id>` and are
//! executed through the bridge's HTTP API. [`BondMqttIntegration`] wires both
//! directions together and keeps MQTT and BPUP details out of `main.rs`.

use super::client::{MqttClient, MqttEvent, MqttMessage, Publisher};
use crate::bond::api::{ApiError, BondApi, RestApiClient};
use crate::bond::push::{PushError, PushSession, SessionConfig, ShutdownReason, Update, UpdateKind};
use crate::config::Config;
use crate::error::{BridgeError, Result};
use futures_util::future::try_join_all;
use log::{debug, error, info, trace, warn};
use rumqttc::{AsyncClient, QoS};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long to wait for the broker to accept the first connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Topic an update for `update_topic` is published on.
pub fn state_topic(prefix: &str, update_topic: &str) -> String {
    format!("{}/{}", prefix, update_topic)
}

/// Topic commands for one device action are accepted on.
pub fn action_topic(prefix: &str, device_id: &str, action_id: &str) -> String {
    format!("{}/devices/{}/{}", prefix, device_id, action_id)
}

/// Turn an MQTT command payload into an action request body.
///
/// JSON objects are passed through. Anything else is wrapped as the action's
/// `argument`, with non-JSON text sent as a string. An empty payload means an
/// action without argument.
pub fn action_body(payload: &str) -> Value {
    let payload = payload.trim();
    if payload.is_empty() {
        return Value::Object(Map::new());
    }

    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(object)) => Value::Object(object),
        Ok(argument) => {
            debug!("[MQTT] Payload {} is not an object, wrapping as argument", payload);
            json!({ "argument": argument })
        }
        Err(_) => json!({ "argument": payload }),
    }
}

/// One device action reachable over MQTT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRoute {
    pub device_id: String,
    pub action_id: String,
    pub topic: String,
}

/// Ask the bridge for every device and build one route per action.
pub async fn discover_routes(
    api: &dyn BondApi,
    prefix: &str,
) -> std::result::Result<Vec<ActionRoute>, ApiError> {
    let device_ids = api.device_ids().await?;
    info!("[API] Got device IDs: {:?}", device_ids);

    let devices = try_join_all(device_ids.iter().map(|device_id| async move {
        let device = api.device(device_id).await?;
        info!(
            "[API] Discovered device with id {:?}: {:?}",
            device_id, device
        );
        Ok::<_, ApiError>((device_id, device))
    }))
    .await?;

    Ok(devices
        .into_iter()
        .flat_map(|(device_id, device)| {
            device.actions.into_iter().map(move |action_id| ActionRoute {
                topic: action_topic(prefix, device_id, &action_id),
                device_id: device_id.clone(),
                action_id,
            })
        })
        .collect())
}

/// Action routes indexed by topic.
#[derive(Debug, Default)]
pub struct ActionRouter {
    routes: HashMap<String, ActionRoute>,
}

impl ActionRouter {
    pub fn new(routes: Vec<ActionRoute>) -> Self {
        Self {
            routes: routes
                .into_iter()
                .map(|route| (route.topic.clone(), route))
                .collect(),
        }
    }

    pub fn route(&self, topic: &str) -> Option<&ActionRoute> {
        self.routes.get(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Execute the action behind `route` with an MQTT payload.
pub async fn execute_route(
    api: &dyn BondApi,
    route: &ActionRoute,
    payload: &str,
) -> std::result::Result<(), ApiError> {
    let body = action_body(payload);
    api.execute_action(&route.device_id, &route.action_id, &body)
        .await
}

/// Pull updates from `session` and publish them until the session closes.
///
/// Timeouts and malformed datagrams are skipped. Returns `Ok` once the
/// session is closed, or the first error that is neither of those.
pub async fn forward_updates(
    session: &PushSession,
    publisher: &dyn Publisher,
    prefix: &str,
    receive_timeout: Duration,
) -> std::result::Result<(), PushError> {
    loop {
        let update = match session.receive(receive_timeout).await {
            Ok(update) => update,
            Err(PushError::Timeout(_)) => continue,
            Err(PushError::Decode(e)) => {
                warn!("[BPUP] Ignoring malformed update: {}", e);
                continue;
            }
            Err(PushError::Closed) => {
                info!("[BPUP] Push session closed, stopping state forwarding");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        publish_update(&update, publisher, prefix).await;
    }
}

async fn publish_update(update: &Update, publisher: &dyn Publisher, prefix: &str) {
    match update.kind() {
        UpdateKind::Topic => {
            let topic = state_topic(prefix, &update.topic);
            let body = match serde_json::to_vec(&update.body) {
                Ok(body) => body,
                Err(e) => {
                    error!("[MQTT] Unable to marshal update body to JSON: {}", e);
                    return;
                }
            };
            debug!(
                "[MQTT] Publishing to {} with body: {}",
                topic,
                String::from_utf8_lossy(&body)
            );
            if let Err(e) = publisher.publish(&topic, body).await {
                error!("[MQTT] Unable to publish to topic {}: {}", topic, e);
            }
        }
        UpdateKind::Error => {
            error!(
                "[BPUP] Got error response from bridge {}: code {:?} {:?}",
                update.bond_id,
                update.error_id,
                update.error_message().unwrap_or_default()
            );
        }
        UpdateKind::Noop => trace!("[BPUP] No-op update from {}", update.bond_id),
    }
}

async fn subscribe_all(client: &AsyncClient, router: &ActionRouter) -> Result<()> {
    for topic in router.topics() {
        client.subscribe(topic, QoS::AtLeastOnce).await?;
        info!("[MQTT] Subscribed to topic {}", topic);
    }
    Ok(())
}

async fn handle_message(
    message: MqttMessage,
    router: &ActionRouter,
    api: &dyn BondApi,
    client: &AsyncClient,
) {
    let Some(route) = router.route(&message.topic) else {
        debug!("[MQTT] Ignoring message on unrouted topic {}", message.topic);
        if let Err(e) = client.ack(message.packet()).await {
            warn!("[MQTT] Failed to ack message on {}: {}", message.topic, e);
        }
        return;
    };

    match execute_route(api, route, &message.payload).await {
        Ok(()) => {
            if let Err(e) = client.ack(message.packet()).await {
                warn!("[MQTT] Failed to ack message on {}: {}", message.topic, e);
            }
        }
        Err(e) => {
            error!(
                "[MQTT] Not acking message due to error executing action: {}",
                e
            );
        }
    }
}

/// Process broker events: renew subscriptions on reconnect, execute commands.
///
/// Each command runs on its own task. An action can take up to the HTTP
/// timeout, and the event channel must keep draining meanwhile or the MQTT
/// event loop stalls and stops sending pings.
async fn dispatch_actions(
    mut events: mpsc::Receiver<MqttEvent>,
    router: Arc<ActionRouter>,
    api: Arc<dyn BondApi>,
    client: AsyncClient,
) {
    while let Some(event) = events.recv().await {
        match event {
            MqttEvent::Connected => {
                if let Err(e) = subscribe_all(&client, &router).await {
                    error!("[MQTT] Failed to renew subscriptions: {}", e);
                }
            }
            MqttEvent::Message(message) => {
                let router = router.clone();
                let api = api.clone();
                let client = client.clone();
                tokio::spawn(async move {
                    handle_message(message, &router, api.as_ref(), &client).await;
                });
            }
        }
    }
}

async fn wait_for_connection(events: &mut mpsc::Receiver<MqttEvent>) -> Result<()> {
    let connected = tokio::time::timeout(CONNECT_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            if let MqttEvent::Connected = event {
                return true;
            }
        }
        false
    })
    .await;

    match connected {
        Ok(true) => Ok(()),
        Ok(false) => Err(BridgeError::MqttConnection(
            "event loop stopped before connecting".to_string(),
        )),
        Err(_) => Err(BridgeError::MqttConnection(format!(
            "timed out after {:?}",
            CONNECT_TIMEOUT
        ))),
    }
}

/// The whole relay: MQTT connection, device discovery, push feed.
pub struct BondMqttIntegration {
    config: Config,
    session_config: SessionConfig,
}

impl BondMqttIntegration {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            session_config: SessionConfig::default(),
        }
    }

    pub fn with_session_config(mut self, session_config: SessionConfig) -> Self {
        self.session_config = session_config;
        self
    }

    /// Run until `shutdown` is cancelled or something fatal happens.
    ///
    /// A keepalive failure on the push session is fatal and returned as
    /// [`BridgeError::Keepalive`]; the caller is expected to exit so the
    /// process can be restarted with a fresh session.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let prefix = self.config.relay.topic_prefix.clone();

        info!(
            "[MQTT] Connecting to {}:{} as {:?}",
            self.config.mqtt.broker_host, self.config.mqtt.broker_port, self.config.mqtt.client_id
        );
        let mqtt = MqttClient::new(&self.config.mqtt);
        let client = mqtt.client();
        let (event_tx, mut events) = mpsc::channel(64);
        let mut mqtt_loop = tokio::spawn(mqtt.run(event_tx));

        if let Err(e) = wait_for_connection(&mut events).await {
            mqtt_loop.abort();
            return Err(e);
        }

        let api: Arc<dyn BondApi> = match RestApiClient::new(&self.config.bond) {
            Ok(api) => Arc::new(api),
            Err(e) => {
                mqtt_loop.abort();
                return Err(e.into());
            }
        };
        let router = match discover_routes(api.as_ref(), &prefix).await {
            Ok(routes) => ActionRouter::new(routes),
            Err(e) => {
                mqtt_loop.abort();
                return Err(BridgeError::Discovery(e));
            }
        };
        if let Err(e) = subscribe_all(&client, &router).await {
            mqtt_loop.abort();
            return Err(e);
        }
        info!("[MQTT] Listening for {} device action(s)", router.len());

        let session = match PushSession::open(&self.config.bond.push_address(), self.session_config)
            .await
        {
            Ok(session) => Arc::new(session),
            Err(e) => {
                mqtt_loop.abort();
                return Err(e.into());
            }
        };

        let dispatcher = tokio::spawn(dispatch_actions(
            events,
            Arc::new(router),
            api,
            client.clone(),
        ));
        let mut forwarder = {
            let session = session.clone();
            let receive_timeout = self.config.relay.receive_timeout();
            tokio::spawn(async move {
                forward_updates(&session, &client, &prefix, receive_timeout).await
            })
        };

        info!("[BPUP] Relaying updates from {}", session.peer_addr());

        let mut outcome = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested");
                Ok(())
            }
            forwarded = &mut forwarder => match forwarded {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(e.into()),
            },
            _ = &mut mqtt_loop => Err(BridgeError::MqttConnection(
                "event loop ended".to_string(),
            )),
        };

        // The forwarder also ends when the keepalive fails; report why.
        if let Some(ShutdownReason::KeepaliveFailed(err)) = session.shutdown_reason() {
            outcome = Err(BridgeError::Keepalive(err));
        }

        session.close();
        forwarder.abort();
        dispatcher.abort();
        mqtt_loop.abort();

        outcome
    }
}
