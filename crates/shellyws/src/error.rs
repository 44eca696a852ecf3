//! CLI error types with miette diagnostics.
//!
//! Maps library [`shellyws_api::Error`] variants into user-facing errors
//! with actionable help text and stable exit codes.

use miette::Diagnostic;
use thiserror::Error;

use shellyws_api::Error as ApiError;

/// Process exit codes.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not reach device at {endpoint}")]
    #[diagnostic(
        code(shellyws::connection_failed),
        help(
            "Check that the device is powered and on the network.\n\
             Endpoint: {endpoint}\n\
             Try: shellyws probe --host <host>"
        )
    )]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Connection to the device was lost")]
    #[diagnostic(
        code(shellyws::connection_lost),
        help("The command may or may not have been applied. Re-run it to be sure.")
    )]
    ConnectionLost,

    #[error("Request timed out after {seconds}s")]
    #[diagnostic(
        code(shellyws::timeout),
        help("Increase the bound with --timeout or check device responsiveness.")
    )]
    Timeout { seconds: u64 },

    // ── Authentication ───────────────────────────────────────────────
    #[error("Device requires authentication")]
    #[diagnostic(
        code(shellyws::auth_required),
        help(
            "Pass --username and --password, set SHELLY_PASSWORD,\n\
             or add credentials to the device entry in the config file."
        )
    )]
    AuthRequired,

    #[error("Authentication failed")]
    #[diagnostic(
        code(shellyws::auth_failed),
        help("The device rejected the configured credentials. Verify the password.")
    )]
    AuthFailed,

    // ── Device ───────────────────────────────────────────────────────
    #[error("Device error ({code}): {message}")]
    #[diagnostic(code(shellyws::device_error))]
    Device { code: i64, message: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(shellyws::validation))]
    Validation { field: String, reason: String },

    #[error("No device selected")]
    #[diagnostic(
        code(shellyws::no_device),
        help(
            "Pass --host, set SHELLY_HOST, or add a device entry\n\
             to the config file at: {config_path}"
        )
    )]
    NoDevice { config_path: String },

    #[error("Device '{name}' not found in configuration")]
    #[diagnostic(
        code(shellyws::unknown_device),
        help("Known devices: {available}")
    )]
    UnknownDevice { name: String, available: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error(transparent)]
    #[diagnostic(code(shellyws::config))]
    Config(Box<figment::Error>),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON payload: {0}")]
    #[diagnostic(code(shellyws::json), help("Check the JSON argument and try again."))]
    Json(#[from] serde_json::Error),
}

impl From<figment::Error> for CliError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::ConnectionLost => exit_code::CONNECTION,
            Self::AuthRequired | Self::AuthFailed => exit_code::AUTH,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } | Self::NoDevice { .. } | Self::UnknownDevice { .. } => {
                exit_code::USAGE
            }
            _ => exit_code::GENERAL,
        }
    }
}

// ── ApiError → CliError mapping ──────────────────────────────────────

impl From<ApiError> for CliError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::InvalidConfig { field, reason } => CliError::Validation {
                field: field.to_string(),
                reason,
            },

            ApiError::ConnectionFailed { url, reason } => CliError::ConnectionFailed {
                endpoint: url,
                reason,
            },

            ApiError::Transport(reason) => CliError::ConnectionFailed {
                endpoint: "(device)".into(),
                reason,
            },

            ApiError::ConnectionLost | ApiError::NotConnected | ApiError::Shutdown => {
                CliError::ConnectionLost
            }

            ApiError::RequestTimeout { timeout_secs } => CliError::Timeout {
                seconds: timeout_secs,
            },

            ApiError::AuthRequired => CliError::AuthRequired,
            ApiError::AuthFailed => CliError::AuthFailed,

            ApiError::Rpc { code, message } => CliError::Device { code, message },

            ApiError::InvalidArgument(reason) => CliError::Validation {
                field: "argument".into(),
                reason,
            },

            ApiError::Encode(e) => CliError::Json(e),
        }
    }
}
