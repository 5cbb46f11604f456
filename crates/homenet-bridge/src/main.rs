//! Homenet bridge binary.
//!
//! # Usage
//!
//! ```bash
//! # Bridge a TCP-tunnelled serial bus with the config in ./homenet.yaml
//! homenet-bridge --config homenet.yaml
//!
//! # Dump the parsed config back out (bytes in 0xXX hex)
//! homenet-bridge --config homenet.yaml --dump
//! ```
//!
//! Environment: `CONFIG_ROOT` (directory the config path is resolved
//! against), `MQTT_URL` (handed to the external broker client),
//! `MQTT_TOPIC_PREFIX` (default `homenet`), `SERIAL_PATH_WAIT_TIMEOUT_MS`,
//! `TIMEZONE`. Exit codes: 0 on clean shutdown, non-zero on unrecoverable
//! configuration errors.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use homenet_bridge::{
    Bus, DEFAULT_TOPIC_PREFIX, LogBroker, TcpSerialTransport,
    config::BridgeConfig,
};
use homenet_core::script::NullEngine;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Homenet RS-485 to pub/sub bridge
#[derive(Parser, Debug)]
#[command(name = "homenet-bridge")]
#[command(about = "Bridges an RS-485 home-automation bus to a message broker")]
#[command(version)]
struct Args {
    /// Configuration file (resolved against CONFIG_ROOT when relative)
    #[arg(short, long, default_value = "homenet.yaml")]
    config: PathBuf,

    /// Parse the config, print it back in canonical form, and exit
    #[arg(long)]
    dump: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config_path = match std::env::var("CONFIG_ROOT") {
        Ok(root) if args.config.is_relative() => Path::new(&root).join(&args.config),
        _ => args.config.clone(),
    };

    tracing::info!(config = %config_path.display(), "homenet bridge starting");
    if let Ok(timezone) = std::env::var("TIMEZONE") {
        tracing::info!(%timezone, "timezone requested; ensure TZ matches for cron triggers");
    }

    let config = match BridgeConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "configuration rejected");
            return ExitCode::from(2);
        },
    };

    if args.dump {
        match config.dump() {
            Ok(dump) => {
                tracing::info!("\n{dump}");
                return ExitCode::SUCCESS;
            },
            Err(err) => {
                tracing::error!(error = %err, "dump failed");
                return ExitCode::from(2);
            },
        }
    }

    let (Some(host), Some(port)) = (config.serial.host.clone(), config.serial.port) else {
        // Native serial devices are opened by an external collaborator (e.g.
        // a ser2net sidecar); the bridge itself only speaks TCP.
        if let Some(path) = &config.serial.path {
            wait_for_path(path).await;
            tracing::error!(
                path,
                "serial.path needs an external serial-to-TCP bridge; configure serial.host/port"
            );
        } else {
            tracing::error!("config declares no serial link (serial.host/serial.port)");
        }
        return ExitCode::from(2);
    };

    if let Ok(url) = std::env::var("MQTT_URL") {
        tracing::info!(%url, "broker client is external; bridging to the process log");
    }
    let prefix =
        std::env::var("MQTT_TOPIC_PREFIX").unwrap_or_else(|_| DEFAULT_TOPIC_PREFIX.to_owned());

    let transport = TcpSerialTransport::new(format!("{host}:{port}"));
    let scripts = Arc::new(NullEngine);
    if !config.scripts.is_empty() {
        tracing::warn!(
            count = config.scripts.len(),
            "helper scripts declared but no expression evaluator is wired in"
        );
    }

    let bus = match Bus::new(config, transport, LogBroker, scripts, &prefix) {
        Ok(bus) => bus,
        Err(err) => {
            tracing::error!(error = %err, "bus startup failed");
            return ExitCode::from(2);
        },
    };

    match bus.run().await {
        Ok(()) => {
            tracing::info!("clean shutdown");
            ExitCode::SUCCESS
        },
        Err(err) => {
            tracing::error!(error = %err, "bus stopped");
            ExitCode::FAILURE
        },
    }
}

/// Give a hot-plugged serial device time to appear before giving up.
async fn wait_for_path(path: &str) {
    let timeout_ms = std::env::var("SERIAL_PATH_WAIT_TIMEOUT_MS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0u64);
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if Path::new(path).exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
