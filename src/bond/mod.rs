//! Clients for a Bond Home bridge: the local HTTP API and the BPUP push feed.

pub mod api;
pub mod push;

pub use api::{ApiError, BondApi, Device, RestApiClient};
pub use push::{PushError, PushSession, SessionConfig, Update};
