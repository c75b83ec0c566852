//! User commands
//! Parses the line-oriented command surface of the monitor and dispatches
//! each intent to the connection manager.

use anyhow::{anyhow, bail, Result};
use log::warn;
use serde_json::{json, Value};

use crate::core::bluetooth::sort_by_signal_strength;
use crate::state::AppState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    Scan,
    StopScan,
    /// Connect to a device from the latest scan by its identifier
    Connect(String),
    Disconnect,
    AutoReconnect(bool),
    /// Print the scanned devices, strongest signal first
    Devices,
    Status,
    Quit,
}

impl UserCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let command = words.next().ok_or_else(|| anyhow!("empty command"))?;
        let argument = words.next();

        let parsed = match (command.to_ascii_lowercase().as_str(), argument) {
            ("scan", None) => Self::Scan,
            ("stop", None) => Self::StopScan,
            ("connect", Some(id)) => Self::Connect(id.to_string()),
            ("connect", None) => bail!("usage: connect <device-id>"),
            ("disconnect", None) => Self::Disconnect,
            ("auto", Some(switch)) => match switch.to_ascii_lowercase().as_str() {
                "on" => Self::AutoReconnect(true),
                "off" => Self::AutoReconnect(false),
                other => bail!("usage: auto on|off (got {:?})", other),
            },
            ("auto", None) => bail!("usage: auto on|off"),
            ("devices", None) => Self::Devices,
            ("status", None) => Self::Status,
            ("quit" | "exit", None) => Self::Quit,
            (other, Some(_)) if is_known(other) => bail!("{} takes no argument", other),
            (other, _) => bail!("unknown command: {}", other),
        };

        if words.next().is_some() {
            bail!("too many arguments");
        }
        Ok(parsed)
    }
}

fn is_known(command: &str) -> bool {
    matches!(
        command,
        "scan" | "stop" | "disconnect" | "devices" | "status" | "quit" | "exit"
    )
}

/// Runs `command`. Returns a JSON payload for commands that report something.
pub async fn execute(command: UserCommand, app_state: &AppState) -> Result<Option<Value>> {
    let manager = app_state.connection_manager();

    match command {
        UserCommand::Scan => manager.start_scan().await,
        UserCommand::StopScan => manager.stop_scan().await,
        UserCommand::Connect(id) => {
            let device = manager
                .scanned_devices()
                .into_iter()
                .find(|d| d.id.eq_ignore_ascii_case(&id));
            match device {
                Some(device) => manager.connect(device).await,
                None => {
                    warn!("Device {} not in the scan results", id);
                    bail!("device not found: {} (run scan first)", id);
                }
            }
        }
        UserCommand::Disconnect => manager.disconnect().await,
        UserCommand::AutoReconnect(enabled) => manager.enable_auto_reconnect(enabled).await,
        UserCommand::Devices => {
            let devices = sort_by_signal_strength(&manager.scanned_devices());
            return Ok(Some(serde_json::to_value(devices)?));
        }
        UserCommand::Status => {
            return Ok(Some(json!({
                "connection": manager.connection_state(),
                "device_info": manager.device_info(),
                "reconnect": manager.reconnect_state(),
                "radio": manager.radio_state(),
                "scanning": manager.is_scanning(),
                "auto_reconnect": manager.auto_reconnect_enabled(),
                "last_connected_device": manager.last_connected_device(),
            })));
        }
        UserCommand::Quit => {}
    }
    Ok(None)
}
