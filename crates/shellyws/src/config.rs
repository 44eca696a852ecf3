//! CLI-owned configuration: TOML device entries and translation to
//! [`shellyws_api::DeviceConfig`].
//!
//! The library never sees these types -- it receives a pre-built
//! `DeviceConfig`. Precedence is CLI flag > environment > config file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use shellyws_api::{DEFAULT_PORT, DeviceConfig};

use crate::cli::GlobalOpts;
use crate::error::CliError;

// ── TOML config structs ──────────────────────────────────────────────

/// CLI-owned TOML configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// Device entry used when --device is not specified.
    pub default_device: Option<String>,

    /// Named device entries.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceEntry>,
}

/// One configured device.
#[derive(Debug, Deserialize, Serialize)]
pub struct DeviceEntry {
    /// Hostname or IP address.
    pub host: String,

    /// RPC port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Display name.
    pub name: Option<String>,

    /// Username for digest auth.
    pub username: Option<String>,

    /// Password for digest auth (plaintext -- prefer SHELLY_PASSWORD).
    pub password: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

// ── Config file path ─────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "shellyws", "shellyws")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("shellyws");
            p.push("config.toml");
            p
        })
}

// ── Config loading ───────────────────────────────────────────────────

/// Load the full Config from the default file location.
pub fn load_config() -> Result<Config, CliError> {
    load_config_from(&config_path())
}

/// Load the full Config from `path` plus `SHELLYWS_*` environment keys.
pub fn load_config_from(path: &Path) -> Result<Config, CliError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        // SHELLYWS_ rather than SHELLY_: the SHELLY_* names belong to
        // the clap flag env vars (SHELLY_HOST, SHELLY_PASSWORD, ...).
        .merge(Env::prefixed("SHELLYWS_").split("__"));

    Ok(figment.extract()?)
}

/// Load config, returning a default if the file is absent or broken.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Device resolution ────────────────────────────────────────────────

/// Build the [`DeviceConfig`] for this invocation.
///
/// `--host` alone is enough for an ad-hoc device; otherwise the named
/// (or default) config entry supplies the base and flags override it.
pub fn resolve_device(global: &GlobalOpts, config: &Config) -> Result<DeviceConfig, CliError> {
    let entry = named_entry(global, config)?;

    let host = global
        .host
        .clone()
        .or_else(|| entry.map(|(_, e)| e.host.clone()))
        .ok_or_else(|| CliError::NoDevice {
            config_path: config_path().display().to_string(),
        })?;

    let port = global
        .port
        .or_else(|| entry.map(|(_, e)| e.port))
        .unwrap_or(DEFAULT_PORT);

    let mut device = DeviceConfig::new(host).with_port(port);

    if let Some((name, entry)) = entry {
        device = device.with_name(entry.name.clone().unwrap_or_else(|| name.to_string()));
    }

    let username = global
        .username
        .clone()
        .or_else(|| entry.and_then(|(_, e)| e.username.clone()));
    let password = global
        .password
        .clone()
        .or_else(|| entry.and_then(|(_, e)| e.password.clone()));

    // Shelly firmware authenticates as "admin"; a bare password is enough.
    if let Some(password) = password {
        let username = username.unwrap_or_else(|| "admin".to_string());
        device = device.with_credentials(username, SecretString::from(password));
    }

    Ok(device)
}

/// Look up the selected config entry, if any.
///
/// An explicit `--device` that matches nothing is an error; a missing
/// default entry is not, because `--host` may stand alone.
fn named_entry<'c>(
    global: &GlobalOpts,
    config: &'c Config,
) -> Result<Option<(&'c str, &'c DeviceEntry)>, CliError> {
    if let Some(ref name) = global.device {
        let entry = config
            .devices
            .get_key_value(name.as_str())
            .ok_or_else(|| CliError::UnknownDevice {
                name: name.clone(),
                available: known_devices(config),
            })?;
        return Ok(Some((entry.0.as_str(), entry.1)));
    }

    let name = match config.default_device.as_deref() {
        Some(name) => Some(name),
        // A single configured device is an unambiguous default.
        None if config.devices.len() == 1 => config.devices.keys().next().map(String::as_str),
        None => None,
    };

    Ok(name
        .and_then(|n| config.devices.get_key_value(n))
        .map(|(k, v)| (k.as_str(), v)))
}

fn known_devices(config: &Config) -> String {
    if config.devices.is_empty() {
        return "(none)".to_string();
    }
    config
        .devices
        .keys()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;
    use pretty_assertions::assert_eq;

    use super::{load_config_from, resolve_device};
    use crate::cli::Cli;
    use crate::error::CliError;

    fn opts(args: &[&str]) -> crate::cli::GlobalOpts {
        let mut argv = vec!["shellyws"];
        argv.extend_from_slice(args);
        argv.push("status");
        Cli::try_parse_from(argv).expect("valid args").global
    }

    fn write_config(toml: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").expect("tempfile");
        file.write_all(toml.as_bytes()).expect("write");
        file
    }

    #[test]
    fn host_flag_alone_builds_an_adhoc_device() {
        let config = super::Config::default();
        let device = resolve_device(&opts(&["--host", "192.168.1.50"]), &config).expect("resolved");
        assert_eq!(device.host, "192.168.1.50");
        assert_eq!(device.port, 80);
        assert!(!device.has_credentials());
    }

    #[test]
    fn config_entry_supplies_the_base_and_flags_override() {
        let file = write_config(
            r#"
            default_device = "hallway"

            [devices.hallway]
            host = "192.168.1.60"
            port = 8080
            name = "Hallway Dimmer"
            username = "admin"
            password = "hunter2"
            "#,
        );
        let config = load_config_from(file.path()).expect("loaded");

        let device = resolve_device(&opts(&[]), &config).expect("resolved");
        assert_eq!(device.host, "192.168.1.60");
        assert_eq!(device.port, 8080);
        assert_eq!(device.name, "Hallway Dimmer");
        assert!(device.has_credentials());

        let device = resolve_device(&opts(&["--host", "10.0.0.9", "--port", "80"]), &config)
            .expect("resolved");
        assert_eq!(device.host, "10.0.0.9");
        assert_eq!(device.port, 80);
    }

    #[test]
    fn a_single_entry_is_the_implicit_default() {
        let file = write_config(
            r#"
            [devices.only]
            host = "192.168.1.70"
            "#,
        );
        let config = load_config_from(file.path()).expect("loaded");
        let device = resolve_device(&opts(&[]), &config).expect("resolved");
        assert_eq!(device.host, "192.168.1.70");
    }

    #[test]
    fn unknown_device_name_lists_alternatives() {
        let file = write_config(
            r#"
            [devices.kitchen]
            host = "192.168.1.80"
            "#,
        );
        let config = load_config_from(file.path()).expect("loaded");
        match resolve_device(&opts(&["--device", "attic"]), &config) {
            Err(CliError::UnknownDevice { name, available }) => {
                assert_eq!(name, "attic");
                assert_eq!(available, "kitchen");
            }
            other => panic!("expected UnknownDevice, got {other:?}"),
        }
    }

    #[test]
    fn no_host_anywhere_is_a_usage_error() {
        let config = super::Config::default();
        match resolve_device(&opts(&[]), &config) {
            Err(CliError::NoDevice { .. }) => {}
            other => panic!("expected NoDevice, got {other:?}"),
        }
    }

    #[test]
    fn bare_password_defaults_the_username_to_admin() {
        let config = super::Config::default();
        let device = resolve_device(
            &opts(&["--host", "192.168.1.50", "--password", "hunter2"]),
            &config,
        )
        .expect("resolved");
        assert!(device.has_credentials());
        assert_eq!(device.username.as_deref(), Some("admin"));
    }
}
