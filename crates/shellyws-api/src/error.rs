use thiserror::Error;

/// Top-level error type for the `shellyws-api` crate.
///
/// Covers every failure mode across the session lifecycle: configuration,
/// transport, authentication, request correlation, and caller mistakes.
/// Consumers can branch on the helper predicates instead of matching
/// individual variants.
#[derive(Debug, Error)]
pub enum Error {
    // ── Configuration ───────────────────────────────────────────────
    /// Host/port do not form a connectable WebSocket endpoint.
    #[error("invalid {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    // ── Transport ───────────────────────────────────────────────────
    /// The bounded first connect attempt could not complete.
    /// Surfaced by [`probe`](crate::config::probe) so setup flows can
    /// confirm reachability before persisting configuration.
    #[error("could not connect to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// WebSocket-level failure while connected (socket close, read error).
    /// Recoverable: the session transitions to `Reconnecting`.
    #[error("websocket transport error: {0}")]
    Transport(String),

    // ── Protocol ────────────────────────────────────────────────────
    /// Request parameters could not be serialized. Programmer error,
    /// never triggered by device input.
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    /// The device answered a request with an RPC error object.
    #[error("device returned RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    // ── Request lifecycle ───────────────────────────────────────────
    /// No response arrived within the per-request timeout.
    #[error("request timed out after {timeout_secs}s")]
    RequestTimeout { timeout_secs: u64 },

    /// The connection dropped while the request was pending.
    #[error("connection lost before a response arrived")]
    ConnectionLost,

    /// The session was shut down while the request was pending.
    #[error("session shut down")]
    Shutdown,

    // ── Authentication ──────────────────────────────────────────────
    /// The device challenged but no credentials are configured.
    /// Terminal until the session is rebuilt with credentials.
    #[error("device requires authentication but no credentials are configured")]
    AuthRequired,

    /// The device rejected the configured credentials twice in a row.
    /// Terminal until the session is rebuilt with corrected credentials.
    #[error("device rejected the configured credentials")]
    AuthFailed,

    // ── Caller errors ───────────────────────────────────────────────
    /// Rejected locally before any network traffic.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A command was issued while the session is not in the `Connected`
    /// state. No bytes were sent.
    #[error("not connected to the device")]
    NotConnected,
}

impl Error {
    /// Returns `true` if this is a transient failure the session
    /// recovers from by reconnecting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::ConnectionFailed { .. }
                | Self::RequestTimeout { .. }
                | Self::ConnectionLost
        )
    }

    /// Returns `true` for the terminal authentication failures that
    /// require credential reconfiguration.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthRequired | Self::AuthFailed)
    }

    /// Returns `true` if the failure was caused by the caller and had
    /// no network effect.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::NotConnected | Self::InvalidConfig { .. }
        )
    }
}
