use std::path::PathBuf;

use anyhow::{bail, Result};
use ble_vitals_monitor_lib::commands::{self, UserCommand};
use ble_vitals_monitor_lib::config::AppConfig;
use ble_vitals_monitor_lib::logging::{ForwardingLogger, LogMessage};
use ble_vitals_monitor_lib::state::AppState;
use log::{error, info, LevelFilter};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

const USAGE: &str = "usage: ble-vitals-monitor [--simulate] [--config PATH] [--emit-logs]";

struct Args {
    simulate: bool,
    config_path: Option<PathBuf>,
    emit_logs: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        simulate: false,
        config_path: None,
        emit_logs: false,
    };

    let mut raw = std::env::args().skip(1);
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--simulate" => args.simulate = true,
            "--emit-logs" => args.emit_logs = true,
            "--config" => match raw.next() {
                Some(path) => args.config_path = Some(PathBuf::from(path)),
                None => bail!("--config needs a path\n{}", USAGE),
            },
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other => bail!("unknown argument: {}\n{}", other, USAGE),
        }
    }
    Ok(args)
}

/// One line of stdout output
#[derive(Serialize)]
struct EventLine<'a, T: Serialize> {
    event: &'a str,
    payload: &'a T,
}

fn emit_event<T: Serialize>(event: &str, payload: &T) {
    match serde_json::to_string(&EventLine { event, payload }) {
        Ok(line) => println!("{}", line),
        Err(e) => error!("Failed to serialize {} event: {}", event, e),
    }
}

/// Prints the current value of `rx` and every change after it.
fn forward_changes<T>(event: &'static str, mut rx: watch::Receiver<T>)
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let initial = rx.borrow_and_update().clone();
        emit_event(event, &initial);
        while rx.changed().await.is_ok() {
            let value = rx.borrow_and_update().clone();
            emit_event(event, &value);
        }
    });
}

fn forward_logs(mut rx: mpsc::UnboundedReceiver<LogMessage>) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            emit_event("log-message", &message);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    let config_path = args.config_path.clone().unwrap_or_else(AppConfig::default_path);

    let log_forward = if args.emit_logs {
        let (tx, rx) = mpsc::unbounded_channel();
        forward_logs(rx);
        Some(tx)
    } else {
        None
    };
    // Starts at Info so config loading is logged, then switches to the configured level.
    if let Err(e) = ForwardingLogger::init(LevelFilter::Info, log_forward) {
        eprintln!("Failed to install logger: {}", e);
    }

    let config = AppConfig::load_config(&config_path).await?;
    if let Some(level) = config.log.level_filter() {
        ForwardingLogger::set_level(level);
    }
    info!("Using config at {:?}", config_path);

    let app_state = AppState::new(&config, args.simulate).await?;
    let manager = app_state.connection_manager();

    forward_changes("device-list", manager.subscribe_devices());
    forward_changes("connection-state", manager.subscribe_connection_state());
    forward_changes("device-info", manager.subscribe_device_info());
    forward_changes("reconnect-state", manager.subscribe_reconnect_state());
    forward_changes("radio-state", manager.subscribe_radio_state());
    forward_changes("scanning", manager.subscribe_scanning());

    info!("Ready. Commands: scan, stop, connect <id>, disconnect, auto on|off, devices, status, quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                let command = match UserCommand::parse(&line) {
                    Ok(UserCommand::Quit) => break,
                    Ok(command) => command,
                    Err(e) => {
                        emit_event("command-error", &e.to_string());
                        continue;
                    }
                };
                let event = match command {
                    UserCommand::Devices => "device-list",
                    _ => "status",
                };
                match commands::execute(command, &app_state).await {
                    Ok(Some(payload)) => emit_event(event, &payload),
                    Ok(None) => {}
                    Err(e) => emit_event("command-error", &e.to_string()),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    manager.stop_scan().await;
    if manager.connection_state().is_busy() {
        manager.disconnect().await;
    }
    info!("Shutting down");
    Ok(())
}
