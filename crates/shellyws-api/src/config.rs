//! Device endpoint configuration and the bounded reachability probe.
//!
//! A [`DeviceConfig`] is immutable once a session is created from it:
//! reconfiguring credentials means shutting the session down and building
//! a new one. [`probe`] is the one synchronous, bounded use of connection
//! logic -- setup flows call it to confirm reachability before persisting
//! a configuration; everything afterwards is background retries.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::codec::{self, DecodedMessage, RpcRequest};
use crate::error::Error;

/// Default RPC port on the device.
pub const DEFAULT_PORT: u16 = 80;

/// Default display name for an unconfigured device.
pub const DEFAULT_NAME: &str = "Shelly Dimmer";

/// Default `src` identifier sent with every request.
pub const DEFAULT_CLIENT_ID: &str = "shellyws";

/// Connection parameters for one physical dimmer.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Hostname or IP address of the device.
    pub host: String,

    /// RPC port (the device serves `ws://host:port/rpc`).
    pub port: u16,

    /// Human-facing device name.
    pub name: String,

    /// Username for digest auth. Shelly firmware only knows `admin`,
    /// but the field is carried verbatim.
    pub username: Option<String>,

    /// Password for digest auth.
    pub password: Option<SecretString>,

    /// Client identifier used as the RPC `src` field.
    pub client_id: String,
}

impl DeviceConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            name: DEFAULT_NAME.to_string(),
            username: None,
            password: None,
            client_id: DEFAULT_CLIENT_ID.to_string(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: SecretString,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password);
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Whether both halves of a credential pair are configured.
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Build the RPC endpoint URL, validating host and port.
    pub fn ws_url(&self) -> Result<Url, Error> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(Error::InvalidConfig {
                field: "host",
                reason: "host must not be empty".to_string(),
            });
        }
        if host.contains("://") || host.contains('/') || host.contains(char::is_whitespace) {
            return Err(Error::InvalidConfig {
                field: "host",
                reason: format!("'{host}' is not a bare hostname or IP"),
            });
        }
        if self.port == 0 {
            return Err(Error::InvalidConfig {
                field: "port",
                reason: "port must be non-zero".to_string(),
            });
        }

        Url::parse(&format!("ws://{host}:{}/rpc", self.port)).map_err(|e| Error::InvalidConfig {
            field: "host",
            reason: e.to_string(),
        })
    }
}

/// Identity reported by a reachable device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device id, e.g. `"shellydimmerg3-aabbccddeeff"`.
    pub id: Option<String>,

    /// Device model code.
    pub model: Option<String>,

    /// The device answered with an auth challenge. Still counts as
    /// reachable -- credentials are needed for actual use.
    pub auth_required: bool,
}

/// Probe the device with a single bounded `Shelly.GetDeviceInfo` exchange.
///
/// Surfaces [`Error::ConnectionFailed`] when the endpoint cannot be
/// reached or does not answer within `timeout`. A 401 reply is success
/// with `auth_required` set.
pub async fn probe(config: &DeviceConfig, timeout: Duration) -> Result<DeviceInfo, Error> {
    let url = config.ws_url()?;

    tokio::time::timeout(timeout, probe_once(config, &url))
        .await
        .map_err(|_| Error::ConnectionFailed {
            url: url.to_string(),
            reason: format!("no answer within {}s", timeout.as_secs()),
        })?
}

async fn probe_once(config: &DeviceConfig, url: &Url) -> Result<DeviceInfo, Error> {
    tracing::debug!(url = %url, "probing device");

    let (mut ws, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| Error::ConnectionFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let request = RpcRequest::new(1, config.client_id.clone(), "Shelly.GetDeviceInfo");
    let frame = codec::encode(&request)?;
    ws.send(Message::Text(frame.into()))
        .await
        .map_err(|e| Error::ConnectionFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    // The device may interleave pushes; read until our reply arrives.
    while let Some(message) = ws.next().await {
        let message = message.map_err(|e| Error::ConnectionFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let Message::Text(text) = message else {
            continue;
        };

        match codec::decode(&text) {
            DecodedMessage::Response { id: 1, result, error } => {
                let _ = ws.close(None).await;

                if let Some(error) = error {
                    if error.is_auth_challenge() {
                        return Ok(DeviceInfo {
                            id: None,
                            model: None,
                            auth_required: true,
                        });
                    }
                    return Err(Error::Rpc {
                        code: error.code,
                        message: error.message,
                    });
                }

                let result = result.unwrap_or(Value::Null);
                return Ok(DeviceInfo {
                    id: result
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    model: result
                        .get("model")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    auth_required: result
                        .get("auth_en")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                });
            }
            // Stray response or push before our reply: keep reading.
            DecodedMessage::Response { .. } | DecodedMessage::Notification { .. } => {}
            DecodedMessage::Malformed { reason } => {
                tracing::debug!(reason, "ignoring malformed frame during probe");
            }
        }
    }

    Err(Error::ConnectionFailed {
        url: url.to_string(),
        reason: "connection closed before a reply".to_string(),
    })
}
