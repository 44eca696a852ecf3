//! Device state cache and push-payload normalization.
//!
//! The device is the source of truth: this cache is updated only by
//! confirmed data -- `NotifyStatus` / `NotifyEvent` pushes and
//! `Shelly.GetStatus` results -- never optimistically by commands. Each
//! payload is normalized into one [`StateChange`] and merged atomically,
//! so a consumer can never observe a half-applied payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cached view of the dimmer, populated field by field as payloads arrive.
///
/// `None` means "not reported yet", not "off"/zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Light output on/off (`light:0.output`).
    pub power: Option<bool>,

    /// Brightness percentage 0-100 (`light:0.brightness`).
    pub brightness: Option<u8>,

    /// Instantaneous active power in watts (`pm1:0.apower`).
    pub power_w: Option<f64>,

    /// Line voltage in volts (`pm1:0.voltage`).
    pub voltage_v: Option<f64>,

    /// Current in amperes (`pm1:0.current`).
    pub current_a: Option<f64>,

    /// Cumulative energy in watt-hours (`pm1:0.aenergy.total`).
    pub energy_wh: Option<f64>,
}

impl DeviceState {
    /// Merge one normalized payload into the cache. All fields of the
    /// change land in a single call, keeping per-payload atomicity.
    pub fn apply(&mut self, change: &StateChange) {
        if let Some(power) = change.power {
            self.power = Some(power);
        }
        if let Some(brightness) = change.brightness {
            self.brightness = Some(brightness);
        }
        if let Some(power_w) = change.power_w {
            self.power_w = Some(power_w);
        }
        if let Some(voltage_v) = change.voltage_v {
            self.voltage_v = Some(voltage_v);
        }
        if let Some(current_a) = change.current_a {
            self.current_a = Some(current_a);
        }
        if let Some(energy_wh) = change.energy_wh {
            self.energy_wh = Some(energy_wh);
        }
    }
}

/// One normalized state-change record, emitted per applied payload.
///
/// Every field is optional because pushes are deltas; `restart` marks a
/// device-announced restart (`NotifyEvent` with a restart event), which
/// carries no key/value state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateChange {
    pub power: Option<bool>,
    pub brightness: Option<u8>,
    pub power_w: Option<f64>,
    pub voltage_v: Option<f64>,
    pub current_a: Option<f64>,
    pub energy_wh: Option<f64>,
    pub restart: bool,
}

impl StateChange {
    /// `true` when the payload contained nothing we understand.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Normalize a status payload (`NotifyStatus` params or a
/// `Shelly.GetStatus` result).
///
/// Understands the dimmer's `light:0` and `pm1:0` components; unknown
/// keys are ignored without failing the payload. Returns `None` when
/// nothing usable was found.
pub fn normalize_status(params: &Value) -> Option<StateChange> {
    let mut change = StateChange::default();

    if let Some(light) = params.get("light:0") {
        change.power = light.get("output").and_then(Value::as_bool);
        change.brightness = light
            .get("brightness")
            .and_then(Value::as_f64)
            .map(clamp_percent);
    }

    if let Some(pm) = params.get("pm1:0") {
        change.power_w = pm.get("apower").and_then(Value::as_f64);
        change.voltage_v = pm.get("voltage").and_then(Value::as_f64);
        change.current_a = pm.get("current").and_then(Value::as_f64);
        // aenergy is a nested object: {"total": f64, ...}
        change.energy_wh = pm
            .get("aenergy")
            .and_then(|e| e.get("total"))
            .and_then(Value::as_f64);
    }

    if change.is_empty() { None } else { Some(change) }
}

/// Normalize a `NotifyEvent` payload.
///
/// The only event surfaced is a device restart announcement; everything
/// else is ignored.
pub fn normalize_event(params: &Value) -> Option<StateChange> {
    let events = params.get("events").and_then(Value::as_array)?;

    let restarting = events.iter().any(|event| {
        matches!(
            event.get("event").and_then(Value::as_str),
            Some("scheduled_restart" | "restart")
        )
    });

    restarting.then(|| StateChange {
        restart: true,
        ..StateChange::default()
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_percent(raw: f64) -> u8 {
    raw.round().clamp(0.0, 100.0) as u8
}
