//! Async WebSocket RPC client for Shelly Dimmer Gen3 devices.
//!
//! Maintains one long-lived, authenticated, push-based connection per
//! device over the `ws://<host>:<port>/rpc` channel, translating RPC
//! notifications into typed state-change events and commands into RPC
//! requests on the same multiplexed stream.
//!
//! - **[`DimmerClient`]** -- the public command façade: `set_power`,
//!   `set_brightness`, `restart`, `status`.
//! - **[`Session`]** -- connection lifecycle: receive loop,
//!   request/response correlation, digest auth, fixed-interval
//!   reconnection, deterministic shutdown.
//! - **[`DeviceState`] / [`StateChange`]** -- the normalized cache and
//!   the per-payload change events consumed by entity bindings.
//! - **[`probe`]** -- bounded reachability check used by setup flows.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use shellyws_api::{DeviceConfig, DimmerClient};
//!
//! let config = DeviceConfig::new("192.168.1.50");
//! let client = DimmerClient::connect(config)?;
//! client.wait_until_connected(Duration::from_secs(10)).await?;
//!
//! client.set_brightness(65).await?;
//! let state = client.status().await?;
//! println!("power: {:?}, {:?} W", state.power, state.power_w);
//!
//! let mut changes = client.subscribe();
//! while let Ok(change) = changes.recv().await {
//!     println!("{change:?}");
//! }
//! ```

pub mod auth;
pub mod codec;
pub mod config;
pub mod error;
pub mod session;
pub mod state;
pub mod tracker;

mod client;

pub use client::DimmerClient;
pub use config::{DEFAULT_CLIENT_ID, DEFAULT_NAME, DEFAULT_PORT, DeviceConfig, DeviceInfo, probe};
pub use error::Error;
pub use session::{ConnectionState, Session, SessionTiming};
pub use state::{DeviceState, StateChange};
