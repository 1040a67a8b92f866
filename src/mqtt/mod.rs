//! MQTT side of the relay.
//!
//! [`MqttClient`] owns the broker connection. The integration layer maps
//! bridge updates onto state topics and command topics onto bridge actions.

mod client;
mod integration;

pub use client::{MqttClient, MqttEvent, MqttMessage, Publisher};
pub use integration::{
    ActionRoute, ActionRouter, BondMqttIntegration, action_body, action_topic, discover_routes,
    execute_route, forward_updates, state_topic,
};
