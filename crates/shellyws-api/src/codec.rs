//! Text frame codec for the Shelly Gen3 RPC dialect.
//!
//! One WebSocket text frame carries one JSON message. Outbound frames are
//! requests `{id, src, method, params?, auth?}`; inbound frames are either
//! responses `{id, result|error}` or unsolicited notifications
//! `{method, params}` with no id. Decoding never fails on garbled input --
//! anything unrecognizable maps to [`DecodedMessage::Malformed`] and is the
//! caller's to log and drop.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::AuthParams;
use crate::error::Error;

/// An outbound RPC request.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    /// Correlation id, echoed back in the matching response.
    pub id: u64,

    /// Client identifier the device uses as the notification destination.
    pub src: String,

    /// RPC method, e.g. `"Light.Set"` or `"Shelly.GetStatus"`.
    pub method: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Digest auth material, attached once negotiated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
}

impl RpcRequest {
    pub fn new(id: u64, src: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            id,
            src: src.into(),
            method: method.into(),
            params: None,
            auth: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_auth(mut self, auth: Option<AuthParams>) -> Self {
        self.auth = auth;
        self
    }
}

/// Error object embedded in an RPC response.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// HTTP-style code the device uses for digest auth challenges.
pub const AUTH_CHALLENGE_CODE: i64 = 401;

impl RpcError {
    /// Whether this error is a digest auth challenge rather than a
    /// genuine method failure.
    pub fn is_auth_challenge(&self) -> bool {
        self.code == AUTH_CHALLENGE_CODE
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone)]
pub enum DecodedMessage {
    /// A reply to a request we sent. Exactly one of `result` / `error`
    /// is populated by well-behaved devices; both are kept so the
    /// session can decide.
    Response {
        id: u64,
        result: Option<Value>,
        error: Option<RpcError>,
    },

    /// An unsolicited push (`NotifyStatus`, `NotifyEvent`). Carries no id.
    Notification { method: String, params: Value },

    /// Anything that is not valid JSON or lacks both an id and a method.
    Malformed { reason: String },
}

/// Serialize a request into a text frame.
///
/// Fails only for unserializable params, which is a programmer error
/// class ([`Error::Encode`]), never device input.
pub fn encode(request: &RpcRequest) -> Result<String, Error> {
    Ok(serde_json::to_string(request)?)
}

/// Decode a raw text frame into a tagged message.
///
/// Never panics or errors on arbitrary input.
pub fn decode(raw: &str) -> DecodedMessage {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            return DecodedMessage::Malformed {
                reason: format!("invalid JSON: {e}"),
            };
        }
    };

    // A response is anything carrying an id; the device echoes our u64.
    if let Some(id_value) = value.get("id") {
        let Some(id) = id_value.as_u64() else {
            return DecodedMessage::Malformed {
                reason: format!("non-numeric response id: {id_value}"),
            };
        };

        let error = value
            .get("error")
            .and_then(|e| serde_json::from_value::<RpcError>(e.clone()).ok());
        let result = value.get("result").cloned();

        return DecodedMessage::Response { id, result, error };
    }

    // No id: a push notification, identified by its method.
    if let Some(method) = value.get("method").and_then(Value::as_str) {
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        return DecodedMessage::Notification {
            method: method.to_string(),
            params,
        };
    }

    DecodedMessage::Malformed {
        reason: "frame has neither id nor method".to_string(),
    }
}
