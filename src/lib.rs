//! Bond Home MQTT bridge library.
//!
//! Talks to a Bond bridge over its Push UDP Protocol and local HTTP API, and
//! relays both to an MQTT broker.

pub mod bond;
pub mod config;
pub mod error;
pub mod mqtt;
