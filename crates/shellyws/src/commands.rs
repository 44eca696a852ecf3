//! Command handlers: one function per subcommand.
//!
//! Each handler builds a client from the resolved device configuration,
//! runs its operation, and renders the result in the selected format.

use std::time::Duration;

use owo_colors::OwoColorize;
use serde_json::{Value, json};

use shellyws_api::{
    ConnectionState, DeviceConfig, DeviceState, DimmerClient, Error as ApiError, StateChange,
    probe,
};

use crate::cli::{
    BrightnessArgs, CallArgs, Command, ConfigAction, ConfigArgs, GlobalOpts, StatusArgs,
};
use crate::config;
use crate::error::CliError;
use crate::output;

pub async fn dispatch(command: Command, global: &GlobalOpts) -> Result<(), CliError> {
    match command {
        Command::Config(args) => handle_config(&args, global),
        Command::Probe => handle_probe(global).await,

        Command::Status(args) => handle_status(&args, global).await,
        Command::On => handle_power(true, global).await,
        Command::Off => handle_power(false, global).await,
        Command::Toggle => handle_toggle(global).await,
        Command::Brightness(args) => handle_brightness(&args, global).await,
        Command::Restart => handle_restart(global).await,
        Command::Watch => handle_watch(global).await,
        Command::Call(args) => handle_call(&args, global).await,
    }
}

// ── Session setup ────────────────────────────────────────────────────

fn resolve(global: &GlobalOpts) -> Result<DeviceConfig, CliError> {
    let config = config::load_config_or_default();
    config::resolve_device(global, &config)
}

/// Connect and wait for a usable session, surfacing auth failures as
/// their own error class instead of a generic timeout.
async fn connect(global: &GlobalOpts) -> Result<DimmerClient, CliError> {
    let device = resolve(global)?;
    let endpoint = format!("{}:{}", device.host, device.port);
    let has_credentials = device.has_credentials();

    let client = DimmerClient::connect(device)?;
    let mut state_rx = client.watch_state();

    let ready = tokio::time::timeout(Duration::from_secs(global.timeout), async {
        loop {
            match *state_rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::AuthFailed => {
                    return Err(if has_credentials {
                        CliError::AuthFailed
                    } else {
                        CliError::AuthRequired
                    });
                }
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(CliError::ConnectionLost);
            }
        }
    })
    .await;

    match ready {
        Ok(Ok(())) => Ok(client),
        Ok(Err(err)) => {
            client.shutdown();
            Err(err)
        }
        Err(_) => {
            client.shutdown();
            Err(CliError::ConnectionFailed {
                endpoint,
                reason: format!("not connected after {}s", global.timeout),
            })
        }
    }
}

// ── Status ───────────────────────────────────────────────────────────

async fn handle_status(args: &StatusArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let client = connect(global).await?;
    let result = if args.refresh {
        client.refresh_status().await
    } else {
        client.status().await
    };
    client.shutdown();

    let state = result?;
    let colored = output::should_color(&global.color);
    let rendered = output::render(&global.output, &state, |s| render_status(s, colored));
    output::print_output(&rendered, global.quiet);
    Ok(())
}

fn render_status(state: &DeviceState, colored: bool) -> String {
    let mut lines = Vec::new();

    let power = match state.power {
        Some(true) if colored => format!("{}", "on".green().bold()),
        Some(false) if colored => format!("{}", "off".red()),
        Some(true) => "on".to_string(),
        Some(false) => "off".to_string(),
        None => "unknown".to_string(),
    };
    lines.push(format!("power       {power}"));

    if let Some(brightness) = state.brightness {
        lines.push(format!("brightness  {brightness}%"));
    }
    if let Some(watts) = state.power_w {
        lines.push(format!("power draw  {watts:.1} W"));
    }
    if let Some(volts) = state.voltage_v {
        lines.push(format!("voltage     {volts:.1} V"));
    }
    if let Some(amps) = state.current_a {
        lines.push(format!("current     {amps:.3} A"));
    }
    if let Some(energy) = state.energy_wh {
        lines.push(format!("energy      {energy:.1} Wh"));
    }

    lines.join("\n")
}

// ── Light commands ───────────────────────────────────────────────────

async fn handle_power(on: bool, global: &GlobalOpts) -> Result<(), CliError> {
    let client = connect(global).await?;
    let result = client.set_power(on).await;
    client.shutdown();
    result?;

    confirm(global, if on { "light switched on" } else { "light switched off" });
    Ok(())
}

async fn handle_toggle(global: &GlobalOpts) -> Result<(), CliError> {
    let client = connect(global).await?;
    let result = toggle(&client).await;
    client.shutdown();

    let now_on = result?;
    confirm(global, if now_on { "light switched on" } else { "light switched off" });
    Ok(())
}

async fn toggle(client: &DimmerClient) -> Result<bool, ApiError> {
    // The cache may not have seen the light yet right after connect.
    let current = match client.status().await?.power {
        Some(power) => power,
        None => client.refresh_status().await?.power.unwrap_or(false),
    };
    client.set_power(!current).await?;
    Ok(!current)
}

async fn handle_brightness(args: &BrightnessArgs, global: &GlobalOpts) -> Result<(), CliError> {
    if args.percent > 100 {
        return Err(CliError::Validation {
            field: "brightness".into(),
            reason: format!("{} is out of range 0..=100", args.percent),
        });
    }

    let client = connect(global).await?;
    let result = if args.on {
        client
            .call("Light.Set", Some(json!({"id": 0, "on": true, "brightness": args.percent})))
            .await
            .map(|_| ())
    } else {
        client.set_brightness(args.percent).await
    };
    client.shutdown();
    result?;

    confirm(global, &format!("brightness set to {}%", args.percent));
    Ok(())
}

async fn handle_restart(global: &GlobalOpts) -> Result<(), CliError> {
    let client = connect(global).await?;
    let result = client.restart().await;
    client.shutdown();
    result?;

    confirm(global, "restart requested");
    Ok(())
}

// ── Watch ────────────────────────────────────────────────────────────

async fn handle_watch(global: &GlobalOpts) -> Result<(), CliError> {
    let client = connect(global).await?;
    let mut changes = client.subscribe();
    let mut state_rx = client.watch_state();
    let colored = output::should_color(&global.color);

    if !global.quiet {
        eprintln!("watching for state changes, press Ctrl-C to stop");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                if !global.quiet {
                    eprintln!("connection: {state}");
                }
            }

            received = changes.recv() => {
                match received {
                    Ok(change) => {
                        let line = output::render(&global.output, &change, |c| {
                            render_change(c, colored)
                        });
                        output::print_output(&line, false);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "watch fell behind, dropping changes");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    client.shutdown();
    Ok(())
}

fn render_change(change: &StateChange, colored: bool) -> String {
    let mut parts = Vec::new();

    if let Some(power) = change.power {
        let word = if power { "on" } else { "off" };
        if colored {
            parts.push(if power {
                format!("{}", word.green().bold())
            } else {
                format!("{}", word.red())
            });
        } else {
            parts.push(word.to_string());
        }
    }
    if let Some(brightness) = change.brightness {
        parts.push(format!("{brightness}%"));
    }
    if let Some(watts) = change.power_w {
        parts.push(format!("{watts:.1} W"));
    }
    if let Some(volts) = change.voltage_v {
        parts.push(format!("{volts:.1} V"));
    }
    if let Some(amps) = change.current_a {
        parts.push(format!("{amps:.3} A"));
    }
    if let Some(energy) = change.energy_wh {
        parts.push(format!("{energy:.1} Wh"));
    }
    if change.restart {
        parts.push(if colored {
            format!("{}", "restarting".yellow().bold())
        } else {
            "restarting".to_string()
        });
    }

    parts.join("  ")
}

// ── Probe ────────────────────────────────────────────────────────────

async fn handle_probe(global: &GlobalOpts) -> Result<(), CliError> {
    let device = resolve(global)?;
    let info = probe(&device, Duration::from_secs(global.timeout)).await?;

    let payload = json!({
        "host": device.host,
        "port": device.port,
        "id": info.id,
        "model": info.model,
        "auth_required": info.auth_required,
    });
    let rendered = output::render(&global.output, &payload, |_| {
        let mut lines = vec![format!("endpoint    {}:{}", device.host, device.port)];
        if let Some(ref id) = info.id {
            lines.push(format!("device id   {id}"));
        }
        if let Some(ref model) = info.model {
            lines.push(format!("model       {model}"));
        }
        lines.push(format!(
            "auth        {}",
            if info.auth_required { "required" } else { "open" }
        ));
        lines.join("\n")
    });
    output::print_output(&rendered, global.quiet);
    Ok(())
}

// ── Raw call ─────────────────────────────────────────────────────────

async fn handle_call(args: &CallArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let params: Option<Value> = args.params.as_deref().map(serde_json::from_str).transpose()?;

    let client = connect(global).await?;
    let result = client.call(&args.method, params).await;
    client.shutdown();

    let value = result?;
    let rendered = output::render(&global.output, &value, output::render_json_pretty);
    output::print_output(&rendered, global.quiet);
    Ok(())
}

// ── Config ───────────────────────────────────────────────────────────

fn handle_config(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.action {
        ConfigAction::Path => {
            output::print_output(&config::config_path().display().to_string(), global.quiet);
            Ok(())
        }
        ConfigAction::Show => {
            let config = config::load_config_or_default();
            let payload = json!({
                "path": config::config_path().display().to_string(),
                "default_device": config.default_device,
                "devices": config.devices.iter().map(|(name, entry)| {
                    json!({
                        "name": name,
                        "host": entry.host,
                        "port": entry.port,
                        "credentials": entry.password.is_some(),
                    })
                }).collect::<Vec<_>>(),
            });

            let rendered = output::render(&global.output, &payload, |_| {
                let mut lines = vec![format!("config file  {}", config::config_path().display())];
                if config.devices.is_empty() {
                    lines.push("no devices configured".to_string());
                }
                for (name, entry) in &config.devices {
                    let default = config.default_device.as_deref() == Some(name.as_str());
                    lines.push(format!(
                        "{} {name}: {}:{}{}",
                        if default { "*" } else { " " },
                        entry.host,
                        entry.port,
                        if entry.password.is_some() { " (credentials set)" } else { "" },
                    ));
                }
                lines.join("\n")
            });
            output::print_output(&rendered, global.quiet);
            Ok(())
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn confirm(global: &GlobalOpts, message: &str) {
    if global.quiet {
        return;
    }
    if output::should_color(&global.color) {
        println!("{} {message}", "ok".green().bold());
    } else {
        println!("ok {message}");
    }
}
