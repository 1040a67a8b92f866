//! BPUP update messages.
//!
//! The bridge pushes one JSON object per datagram, terminated by a newline.
//! Field names on the wire are single letters (`B`, `t`, `s`, `m`, `b`) plus
//! `err_id`/`err_msg` on error messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, FromRepr};
use thiserror::Error;

/// A datagram that could not be decoded into an [`Update`].
///
/// This is per-message noise: the session that produced it stays usable.
#[derive(Debug, Error)]
#[error("error decoding update {raw:?}: {source}")]
pub struct DecodeError {
    /// The trimmed datagram text.
    pub raw: String,
    #[source]
    pub source: serde_json::Error,
}

/// Request method that produced an update, as encoded in the `m` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u8)]
pub enum HttpMethod {
    Get = 0,
    Post = 1,
    Put = 2,
    Delete = 3,
    Patch = 4,
}

/// What an update carries, derived from its `topic` and `error_msg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// State for a resource path.
    Topic,
    /// An error report from the bridge.
    Error,
    /// Neither topic nor error, e.g. the echo of a handshake or keepalive.
    Noop,
}

/// One message pushed by a Bond bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    /// Id of the bridge that sent the update.
    #[serde(rename = "B", default)]
    pub bond_id: String,

    /// Resource path, e.g. `devices/1a2b/state`. Empty on error messages.
    #[serde(rename = "t", default, skip_serializing_if = "String::is_empty")]
    pub topic: String,

    /// HTTP-style status of the update.
    #[serde(rename = "s", default)]
    pub status_code: i32,

    /// Raw method code, see [`Update::method`].
    #[serde(rename = "m", default)]
    pub http_method: u8,

    /// Payload, kept as-is.
    #[serde(rename = "b", default, skip_serializing_if = "Value::is_null")]
    pub body: Value,

    #[serde(rename = "err_id", default, skip_serializing_if = "Option::is_none")]
    pub error_id: Option<i32>,

    #[serde(rename = "err_msg", default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl Update {
    /// Decode one datagram.
    ///
    /// Surrounding whitespace and line terminators are trimmed first. Invalid
    /// UTF-8 is replaced rather than rejected, so only the JSON parse can fail.
    pub fn decode(datagram: &[u8]) -> Result<Self, DecodeError> {
        let text = String::from_utf8_lossy(datagram);
        let trimmed = text.trim();
        serde_json::from_str(trimmed).map_err(|source| DecodeError {
            raw: trimmed.to_string(),
            source,
        })
    }

    /// Encode to the newline-terminated wire form.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// The method code as an enum, if it is one the protocol defines.
    pub fn method(&self) -> Option<HttpMethod> {
        HttpMethod::from_repr(self.http_method)
    }

    /// The error message, if present and non-empty.
    pub fn error_message(&self) -> Option<&str> {
        self.error_msg.as_deref().filter(|msg| !msg.is_empty())
    }

    pub fn kind(&self) -> UpdateKind {
        if !self.topic.is_empty() {
            UpdateKind::Topic
        } else if self.error_message().is_some() {
            UpdateKind::Error
        } else {
            UpdateKind::Noop
        }
    }

    pub fn is_noop(&self) -> bool {
        self.kind() == UpdateKind::Noop
    }
}
