//! ASB Agent - remote administration of a single device over MQTT
//!
//! The agent lets one admin operate the device remotely:
//! - Bounded shell command execution and reboot
//! - Service restarts with fallback strategies
//! - Self-update from git with backup and rollback
//! - Low battery alerts from a background watchdog

mod bootstrap;
mod config;
mod dispatcher;
mod execution;
mod metrics;
mod outcome;
mod presentation;
mod services;
mod storage;
mod transport;
mod updater;
mod watchdog;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::AgentConfig;
use dispatcher::Dispatcher;
use execution::{CommandRequest, CommandRunner, ShellRunner};
use transport::MqttTransport;
use watchdog::battery::{BatterySensor, TermuxBatterySensor};
use watchdog::HealthWatchdog;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("asb_agent=info")),
        )
        .init();

    info!("🤖 ASB Agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load(std::env::args_os().nth(1).map(PathBuf::from))
        .await
        .context("Failed to load configuration")?;
    let storage = bootstrap::prepare_storage(&config.storage_dir)?;

    let runner: Arc<dyn CommandRunner> = Arc::new(
        ShellRunner::new(config.commands.shell.clone())
            .with_output_limit(config.commands.max_output_bytes),
    );
    let sensor = Arc::new(TermuxBatterySensor::new(
        runner.clone(),
        config.watchdog.sensor_command.clone(),
        Duration::from_secs(config.watchdog.sensor_timeout_secs),
    ));
    if let Some(program) = sensor.command().split_whitespace().next() {
        warn_if_missing(runner.as_ref(), program).await;
    }
    let sensor: Arc<dyn BatterySensor> = sensor;

    let transport = MqttTransport::new(&config);
    let watchdog = Arc::new(HealthWatchdog::new(
        sensor.clone(),
        transport.alert_sink(),
        Duration::from_secs(config.watchdog.poll_interval_secs),
        config.watchdog.low_battery_threshold,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        &config,
        runner,
        sensor,
        watchdog.clone(),
        storage,
    ));

    let watchdog_handle = watchdog.spawn();
    let shutdown = dispatcher.shutdown_signal();

    let ctrl_c = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                dispatcher.request_shutdown();
            }
        })
    };

    info!("Agent {} ready, admin {}", config.agent_id, config.admin_id);
    let result = transport.run(dispatcher, shutdown).await;

    ctrl_c.abort();
    watchdog_handle.shutdown().await;
    info!("ASB Agent stopped");
    result
}

/// Battery features stay usable without the sensor, just degraded
async fn warn_if_missing(runner: &dyn CommandRunner, program: &str) {
    let line = format!("which {}", shell_words::quote(program));
    let outcome = runner.run(CommandRequest::new(line, Duration::from_secs(5))).await;
    if !outcome.success() {
        warn!("{} not found. Battery monitoring will not work until it is installed.", program);
    }
}
