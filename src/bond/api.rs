//! Client for the bridge's local HTTP API (v2).
//!
//! Every call is a single request authenticated with the bridge token. There
//! is no retry and no state beyond the HTTP connection pool.

use crate::config::BondConfig;
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Header carrying the bridge's local API token.
const TOKEN_HEADER: &str = "BOND-Token";

/// Key the bridge uses for the version hash in listing responses.
const HASH_KEY: &str = "_";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("error executing HTTP request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("expected 2xx response from {url} but got {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },

    #[error("error unmarshaling JSON from response body: {source}; body: {body}")]
    Decode {
        #[source]
        source: serde_json::Error,
        body: String,
    },
}

/// A device as described by `GET /v2/devices/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub device_type: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub actions: Vec<String>,
}

/// Operations the relay needs from a bridge.
#[async_trait]
pub trait BondApi: Send + Sync {
    /// Ids of all devices known to the bridge.
    async fn device_ids(&self) -> Result<Vec<String>, ApiError>;

    async fn device(&self, device_id: &str) -> Result<Device, ApiError>;

    /// Run `action_id` on a device. `body` is sent as the request body.
    async fn execute_action(
        &self,
        device_id: &str,
        action_id: &str,
        body: &Value,
    ) -> Result<(), ApiError>;
}

/// [`BondApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct RestApiClient {
    client: Client,
    base_url: String,
    token: String,
}

impl RestApiClient {
    pub fn new(config: &BondConfig) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(config.http_timeout()).build()?;
        Ok(Self::with_client(
            client,
            config.api_base_url(),
            config.token.clone(),
        ))
    }

    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.base_url, path))
            .header(TOKEN_HEADER, &self.token)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = expect_2xx(self.request(Method::GET, path).send().await?).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|source| ApiError::Decode { source, body })
    }
}

async fn expect_2xx(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status { url, status, body })
}

#[async_trait]
impl BondApi for RestApiClient {
    async fn device_ids(&self) -> Result<Vec<String>, ApiError> {
        let listing: Map<String, Value> = self.get_json("v2/devices").await?;
        Ok(listing
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| id != HASH_KEY)
            .collect())
    }

    async fn device(&self, device_id: &str) -> Result<Device, ApiError> {
        self.get_json(&format!("v2/devices/{}", device_id)).await
    }

    async fn execute_action(
        &self,
        device_id: &str,
        action_id: &str,
        body: &Value,
    ) -> Result<(), ApiError> {
        let path = format!("v2/devices/{}/actions/{}", device_id, action_id);
        info!("[API] Sending request: PUT {} body={}", path, body);

        let response = self.request(Method::PUT, &path).json(body).send().await?;
        let response = expect_2xx(response).await?;
        debug!("[API] {} answered {}", path, response.status());
        Ok(())
    }
}
