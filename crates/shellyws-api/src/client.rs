//! High-level command façade over a running session.
//!
//! Every operation maps 1:1 to one RPC method. Arguments are validated
//! locally before any network traffic, and nothing here mutates the
//! device state cache -- it only changes on confirmed pushes and status
//! fetches.

use std::time::Duration;

use serde_json::{Value, json};

use crate::config::DeviceConfig;
use crate::error::Error;
use crate::session::{ConnectionState, Session, SessionTiming};
use crate::state::{DeviceState, StateChange};

/// Client for one Shelly dimmer.
///
/// Owns the session handle; cheaply cloneable. The underlying connection
/// is managed in the background -- construction returns immediately and
/// the first connect happens asynchronously.
#[derive(Clone)]
pub struct DimmerClient {
    session: Session,
}

impl DimmerClient {
    /// Validate the configuration and spawn the background session.
    pub fn connect(config: DeviceConfig) -> Result<Self, Error> {
        Self::connect_with_timing(config, SessionTiming::default())
    }

    /// Like [`connect`](Self::connect) with explicit session timing.
    pub fn connect_with_timing(
        config: DeviceConfig,
        timing: SessionTiming,
    ) -> Result<Self, Error> {
        // Surface bad host/port here, not from inside the retry loop.
        config.ws_url()?;
        Ok(Self {
            session: Session::spawn_with_timing(config, timing),
        })
    }

    /// The underlying session handle.
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Observe connection state transitions.
    pub fn watch_state(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.session.watch_state()
    }

    /// Subscribe to state-change events in arrival order.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StateChange> {
        self.session.subscribe()
    }

    /// Block until the session first reaches `Connected`, bounded.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), Error> {
        self.session.wait_until_connected(timeout).await
    }

    /// Switch the light on or off.
    pub async fn set_power(&self, on: bool) -> Result<(), Error> {
        self.session
            .call("Light.Set", Some(json!({"id": 0, "on": on})))
            .await?;
        Ok(())
    }

    /// Set brightness as a percentage.
    ///
    /// Values above 100 are rejected locally with
    /// [`Error::InvalidArgument`]; zero requests are sent.
    pub async fn set_brightness(&self, percent: u8) -> Result<(), Error> {
        if percent > 100 {
            return Err(Error::InvalidArgument(format!(
                "brightness {percent} out of range 0..=100"
            )));
        }
        self.session
            .call("Light.Set", Some(json!({"id": 0, "brightness": percent})))
            .await?;
        Ok(())
    }

    /// Ask the device to restart.
    ///
    /// Success means the device accepted the command. The connection is
    /// expected to drop shortly afterwards, so losing it while the reply
    /// is in flight also counts as accepted.
    pub async fn restart(&self) -> Result<(), Error> {
        match self.session.call("Shelly.Reboot", None).await {
            Ok(_) | Err(Error::ConnectionLost) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Current cached device state.
    ///
    /// Returns immediately while `Connected`; the cache is primed by the
    /// status fetch issued on every (re)connect. Fails fast with
    /// [`Error::NotConnected`] otherwise.
    pub async fn status(&self) -> Result<DeviceState, Error> {
        if !self.session.is_connected() {
            return match self.session.state() {
                ConnectionState::AuthFailed => Err(Error::AuthFailed),
                _ => Err(Error::NotConnected),
            };
        }
        Ok(self.session.device_state().await)
    }

    /// Issue a fresh `Shelly.GetStatus` and return the resulting state.
    ///
    /// The session applies the response to the cache before the call
    /// resolves, so the returned snapshot includes it.
    pub async fn refresh_status(&self) -> Result<DeviceState, Error> {
        self.session.call("Shelly.GetStatus", None).await?;
        Ok(self.session.device_state().await)
    }

    /// Raw RPC escape hatch for methods without a dedicated wrapper.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        self.session.call(method, params).await
    }

    /// Stop the background session.
    pub fn shutdown(&self) {
        self.session.shutdown();
    }
}
