//! Clap derive structures for the `shellyws` CLI.
//!
//! Defines the command tree, global flags, and shared value enums.

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// shellyws -- control Shelly dimmers over WebSocket RPC
#[derive(Debug, Parser)]
#[command(
    name = "shellyws",
    version,
    about = "Control Shelly dimmers from the command line",
    long_about = "Talks to Shelly Gen2/Gen3 dimmers over their WebSocket RPC\n\
        endpoint (ws://<host>/rpc), with digest authentication and live\n\
        state streaming.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Named device from the config file
    #[arg(long, short = 'd', env = "SHELLY_DEVICE", global = true)]
    pub device: Option<String>,

    /// Device hostname or IP (overrides the config file)
    #[arg(long, short = 'H', env = "SHELLY_HOST", global = true)]
    pub host: Option<String>,

    /// Device RPC port
    #[arg(long, env = "SHELLY_PORT", global = true)]
    pub port: Option<u16>,

    /// Username for digest auth (the firmware only knows "admin")
    #[arg(long, short = 'u', env = "SHELLY_USERNAME", global = true)]
    pub username: Option<String>,

    /// Password for digest auth
    #[arg(long, env = "SHELLY_PASSWORD", global = true, hide_env = true)]
    pub password: Option<String>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "SHELLY_OUTPUT",
        default_value = "text",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Seconds to wait for the device before giving up
    #[arg(long, env = "SHELLY_TIMEOUT", default_value = "10", global = true)]
    pub timeout: u64,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text (default)
    Text,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON (scripting)
    JsonCompact,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show the current device state
    #[command(alias = "st")]
    Status(StatusArgs),

    /// Switch the light on
    On,

    /// Switch the light off
    Off,

    /// Toggle the light
    Toggle,

    /// Set brightness as a percentage (0-100)
    #[command(alias = "br")]
    Brightness(BrightnessArgs),

    /// Ask the device to restart
    Restart,

    /// Stream state changes until interrupted
    #[command(alias = "w")]
    Watch,

    /// Check reachability and report device identity
    Probe,

    /// Issue a raw RPC method call
    Call(CallArgs),

    /// Inspect the configuration
    Config(ConfigArgs),
}

// ── Per-Command Args ─────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Force a fresh fetch instead of the session cache
    #[arg(long)]
    pub refresh: bool,
}

#[derive(Debug, Args)]
pub struct BrightnessArgs {
    /// Brightness percentage
    #[arg(value_name = "PERCENT")]
    pub percent: u8,

    /// Also switch the light on
    #[arg(long)]
    pub on: bool,
}

#[derive(Debug, Args)]
pub struct CallArgs {
    /// RPC method name, e.g. "Shelly.GetDeviceInfo"
    pub method: String,

    /// JSON parameter object
    #[arg(value_name = "PARAMS")]
    pub params: Option<String>,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the config file path
    Path,
    /// Show the resolved configuration (passwords redacted)
    Show,
}
