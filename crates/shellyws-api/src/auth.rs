//! SHA-256 digest challenge-response for Shelly Gen3 WebSocket auth.
//!
//! The device never accepts a plaintext password: it rejects the first
//! request with a 401 error whose message carries `{realm, nonce}`, and
//! expects the request resubmitted with an `auth` object computed per the
//! HTTP digest scheme (RFC 7616 shape, SHA-256, fixed `dummy_method` /
//! `dummy_uri` as documented for the Gen2+ RPC channel).

use std::time::{SystemTime, UNIX_EPOCH};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Nonce count is constant: every negotiation is a fresh exchange.
const NONCE_COUNT: &str = "00000001";

/// A device-issued digest challenge.
///
/// Parsed from the 401 error message, which firmware emits either as a
/// JSON object or as a bare `"realm:nonce"` string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthChallenge {
    pub realm: String,
    #[serde(deserialize_with = "de_nonce")]
    pub nonce: String,
    #[serde(default)]
    pub algorithm: Option<String>,
}

/// Firmware sends the nonce as either a number or a string.
fn de_nonce<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "nonce must be string or number, got {other}"
        ))),
    }
}

impl AuthChallenge {
    /// Parse a challenge out of a 401 error message.
    ///
    /// Accepts the JSON object form first, then falls back to the legacy
    /// `"realm:nonce"` colon form. `fallback_realm` (typically the device
    /// host) fills in a missing realm. Returns `None` when no nonce can
    /// be recovered at all.
    pub fn parse(message: &str, fallback_realm: &str) -> Option<Self> {
        if message.trim_start().starts_with('{') {
            return serde_json::from_str::<Self>(message).ok();
        }

        let mut parts = message.splitn(2, ':');
        let realm = parts.next()?.trim();
        let nonce = parts.next()?.trim();
        if nonce.is_empty() {
            return None;
        }

        Some(Self {
            realm: if realm.is_empty() {
                fallback_realm.to_string()
            } else {
                realm.to_string()
            },
            nonce: nonce.to_string(),
            algorithm: None,
        })
    }
}

/// The `auth` object attached to a resubmitted request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthParams {
    pub realm: String,
    pub username: String,
    pub nonce: String,
    pub cnonce: String,
    pub response: String,
    pub algorithm: String,
}

/// Compute the digest response for a challenge.
pub fn respond(challenge: &AuthChallenge, username: &str, password: &SecretString) -> AuthParams {
    let cnonce = generate_cnonce();
    respond_with_cnonce(challenge, username, password, &cnonce)
}

/// Deterministic core of [`respond`], split out for test vectors.
fn respond_with_cnonce(
    challenge: &AuthChallenge,
    username: &str,
    password: &SecretString,
    cnonce: &str,
) -> AuthParams {
    let ha1 = sha256_hex(&format!(
        "{username}:{}:{}",
        challenge.realm,
        password.expose_secret()
    ));
    let ha2 = sha256_hex("dummy_method:dummy_uri");
    let response = sha256_hex(&format!(
        "{ha1}:{}:{NONCE_COUNT}:{cnonce}:auth:{ha2}",
        challenge.nonce
    ));

    AuthParams {
        realm: challenge.realm.clone(),
        username: username.to_string(),
        nonce: challenge.nonce.clone(),
        cnonce: cnonce.to_string(),
        response,
        algorithm: "SHA-256".to_string(),
    }
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn generate_cnonce() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let digest = sha256_hex(&format!("{}", now.as_nanos()));
    digest[..8].to_string()
}
