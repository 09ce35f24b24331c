//! Operator command routing
//!
//! Parses slash commands, calls into the control plane and sends rendered
//! replies through an [`Outbox`]. Long operations send an interim progress
//! message first.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::execution::{CommandExecutor, CommandRunner};
use crate::metrics::SystemMonitor;
use crate::presentation;
use crate::services::ServiceController;
use crate::storage;
use crate::updater::UpdateManager;
use crate::watchdog::battery::BatterySensor;
use crate::watchdog::HealthWatchdog;

/// Where replies to one request go
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn send(&self, text: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootAction {
    Prompt,
    Confirm,
    Cancel,
}

/// A parsed operator command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Status,
    Battery,
    Watchdog,
    Exec { command: String, timeout: Option<Duration> },
    ExecUsage,
    Reboot(RebootAction),
    Restart(Option<String>),
    Update { now: bool },
    Unknown(String),
}

impl Command {
    pub fn parse(text: &str) -> Command {
        let text = text.trim();
        let (head, rest) = match text.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (text, ""),
        };

        match head {
            "/start" => Command::Start,
            "/help" => Command::Help,
            "/status" => Command::Status,
            "/battery" => Command::Battery,
            "/watchdog" => Command::Watchdog,
            "/exec" => parse_exec(rest),
            "/reboot" => match rest {
                "confirm" => Command::Reboot(RebootAction::Confirm),
                "cancel" => Command::Reboot(RebootAction::Cancel),
                _ => Command::Reboot(RebootAction::Prompt),
            },
            "/restart" if rest.is_empty() => Command::Restart(None),
            "/restart" => Command::Restart(Some(rest.to_string())),
            "/update" => Command::Update { now: rest == "now" },
            _ => Command::Unknown(head.to_string()),
        }
    }
}

/// `[-t <secs>] <command>`
fn parse_exec(rest: &str) -> Command {
    let (timeout, command) = match rest.strip_prefix("-t") {
        Some(after) if after.starts_with(char::is_whitespace) => {
            let after = after.trim_start();
            let (secs, command) = after.split_once(char::is_whitespace).unwrap_or((after, ""));
            match secs.parse::<u64>() {
                Ok(secs) if secs > 0 => (Some(Duration::from_secs(secs)), command.trim()),
                _ => return Command::ExecUsage,
            }
        }
        _ => (None, rest),
    };

    if command.is_empty() {
        Command::ExecUsage
    } else {
        Command::Exec {
            command: command.to_string(),
            timeout,
        }
    }
}

pub struct Dispatcher {
    executor: CommandExecutor,
    services: ServiceController,
    updater: UpdateManager,
    watchdog: Arc<HealthWatchdog>,
    sensor: Arc<dyn BatterySensor>,
    monitor: SystemMonitor,
    storage_path: PathBuf,
    shutdown: watch::Sender<bool>,
    max_message_chars: usize,
}

impl Dispatcher {
    pub fn new(
        config: &AgentConfig,
        runner: Arc<dyn CommandRunner>,
        sensor: Arc<dyn BatterySensor>,
        watchdog: Arc<HealthWatchdog>,
        storage_path: PathBuf,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            executor: CommandExecutor::new(runner.clone(), &config.commands),
            services: ServiceController::new(runner.clone(), &config.commands, config.services.clone()),
            updater: UpdateManager::new(runner, config),
            watchdog,
            sensor,
            monitor: SystemMonitor::new(storage_path.clone()),
            storage_path,
            shutdown,
            max_message_chars: config.mqtt.max_message_chars,
        }
    }

    /// Flips to `true` once shutdown has been requested
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Handle one authenticated operator message
    pub async fn handle(&self, text: &str, outbox: &dyn Outbox) {
        let command = Command::parse(text);
        info!(?command, "Handling operator command");

        match command {
            Command::Start => self.reply(outbox, &presentation::welcome()).await,
            Command::Help => {
                let help = presentation::help(self.executor.default_timeout());
                self.reply(outbox, &help).await
            }
            Command::Status => {
                let status = self.monitor.snapshot(self.sensor.as_ref()).await;
                self.reply(outbox, &presentation::system_status(&status)).await
            }
            Command::Battery => {
                let reading = self.watchdog.battery_now().await;
                self.reply(outbox, &presentation::battery(&reading)).await
            }
            Command::Watchdog => {
                let status = self.watchdog.status();
                let text = presentation::watchdog_status(&status, self.watchdog.threshold());
                self.reply(outbox, &text).await
            }
            Command::Exec { command, timeout } => {
                self.reply(outbox, &presentation::exec_started(&command)).await;
                let outcome = self.executor.execute_shell_command(&command, timeout).await;
                self.reply(outbox, &presentation::exec_result(&outcome)).await
            }
            Command::ExecUsage => self.reply(outbox, &presentation::exec_usage()).await,
            Command::Reboot(RebootAction::Prompt) => self.reply(outbox, &presentation::reboot_prompt()).await,
            Command::Reboot(RebootAction::Cancel) => self.reply(outbox, &presentation::reboot_cancelled()).await,
            Command::Reboot(RebootAction::Confirm) => {
                let report = self.executor.reboot().await;
                self.reply(outbox, &presentation::reboot_result(&report)).await
            }
            Command::Restart(None) => {
                let list = presentation::known_services(self.services.known_services());
                self.reply(outbox, &list).await
            }
            Command::Restart(Some(service)) => {
                self.reply(outbox, &presentation::restart_started(&service)).await;
                let result = self.services.restart(&service).await;
                self.reply(outbox, &presentation::restart_result(&result)).await
            }
            Command::Update { now: false } => {
                self.reply(outbox, &presentation::update_checking()).await;
                let result = self.updater.check_for_updates().await;
                self.reply(outbox, &presentation::update_check(&result)).await
            }
            Command::Update { now: true } => self.update_now(outbox).await,
            Command::Unknown(head) => self.reply(outbox, &presentation::unknown_command(&head)).await,
        }
    }

    /// Store an uploaded file in the storage directory
    pub async fn handle_upload(&self, file_name: &str, content: &[u8], outbox: &dyn Outbox) {
        info!(file_name, bytes = content.len(), "Handling operator upload");
        self.reply(outbox, &presentation::upload_started(file_name)).await;
        let result = storage::save_file(&self.storage_path, file_name, content).await;
        if let Err(e) = &result {
            warn!("Upload of {} failed: {}", file_name, e);
        }
        self.reply(outbox, &presentation::upload_result(&result)).await
    }

    /// Pull, report, then hand over to a fresh instance if anything changed
    async fn update_now(&self, outbox: &dyn Outbox) {
        self.reply(outbox, &presentation::update_started()).await;
        let result = self.updater.perform_update().await;
        self.reply(outbox, &presentation::update_result(&result)).await;

        match result {
            Ok(report) if report.changed() => {
                let restart = self.updater.restart_self().await;
                self.reply(outbox, &presentation::self_restart_result(&restart)).await;
                if restart.success {
                    info!("Shutting down for relaunch after update");
                    self.request_shutdown();
                }
            }
            _ => {}
        }
    }

    async fn reply(&self, outbox: &dyn Outbox, text: &str) {
        for chunk in presentation::split_message(text, self.max_message_chars) {
            if let Err(e) = outbox.send(&chunk).await {
                warn!("Failed to send reply: {:#}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::testing::{failed, ok, ScriptedRunner};
    use crate::watchdog::battery::{BatteryReading, SensorError};
    use crate::watchdog::{AlertSink, LowBatteryAlert};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingOutbox {
        sent: Mutex<Vec<String>>,
    }

    impl RecordingOutbox {
        fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl Outbox for RecordingOutbox {
        async fn send(&self, text: &str) -> anyhow::Result<()> {
            self.sent.lock().push(text.to_string());
            Ok(())
        }
    }

    struct FixedSensor;

    #[async_trait]
    impl BatterySensor for FixedSensor {
        async fn read(&self) -> Result<BatteryReading, SensorError> {
            Ok(BatteryReading {
                percentage: 64.0,
                plugged: "UNPLUGGED".into(),
                status: "DISCHARGING".into(),
                temperature: 30.5,
                health: "GOOD".into(),
            })
        }
    }

    struct NullSink;

    #[async_trait]
    impl AlertSink for NullSink {
        async fn send_alert(&self, _alert: &LowBatteryAlert) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        config: AgentConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("asb");
        std::fs::create_dir_all(repo.join(".git")).unwrap();
        let mut config = AgentConfig::parse(r#"admin_id = "42""#).unwrap();
        config.update.repo_dir = Some(repo);
        config.update.relaunch_command = Some("true".into());
        config.update.relaunch_delay_secs = 0;
        Fixture { dir, config }
    }

    fn dispatcher(fx: &Fixture, runner: Arc<ScriptedRunner>) -> Dispatcher {
        let sensor: Arc<dyn BatterySensor> = Arc::new(FixedSensor);
        let watchdog = Arc::new(HealthWatchdog::new(
            sensor.clone(),
            Arc::new(NullSink),
            Duration::from_secs(300),
            20.0,
        ));
        Dispatcher::new(&fx.config, runner, sensor, watchdog, fx.dir.path().to_path_buf())
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("/start"), Command::Start);
        assert_eq!(Command::parse("  /status  "), Command::Status);
        assert_eq!(Command::parse("/reboot"), Command::Reboot(RebootAction::Prompt));
        assert_eq!(Command::parse("/reboot confirm"), Command::Reboot(RebootAction::Confirm));
        assert_eq!(Command::parse("/reboot cancel"), Command::Reboot(RebootAction::Cancel));
        assert_eq!(Command::parse("/restart"), Command::Restart(None));
        assert_eq!(Command::parse("/restart  nginx "), Command::Restart(Some("nginx".into())));
        assert_eq!(Command::parse("/update"), Command::Update { now: false });
        assert_eq!(Command::parse("/update now"), Command::Update { now: true });
        assert_eq!(Command::parse("hello"), Command::Unknown("hello".into()));
    }

    #[test]
    fn test_parse_exec() {
        assert_eq!(
            Command::parse("/exec ls -la | head"),
            Command::Exec { command: "ls -la | head".into(), timeout: None }
        );
        assert_eq!(
            Command::parse("/exec -t 120 apt upgrade -y"),
            Command::Exec {
                command: "apt upgrade -y".into(),
                timeout: Some(Duration::from_secs(120)),
            }
        );
        assert_eq!(
            Command::parse("/exec -tx"),
            Command::Exec { command: "-tx".into(), timeout: None }
        );
        assert_eq!(Command::parse("/exec"), Command::ExecUsage);
        assert_eq!(Command::parse("/exec -t 10"), Command::ExecUsage);
        assert_eq!(Command::parse("/exec -t abc ls"), Command::ExecUsage);
        assert_eq!(Command::parse("/exec -t 0 ls"), Command::ExecUsage);
    }

    #[tokio::test]
    async fn test_exec_sends_progress_then_output() {
        let fx = fixture();
        let runner = Arc::new(ScriptedRunner::new().respond("uptime", ok("up 3 days\n")));
        let outbox = RecordingOutbox::default();

        dispatcher(&fx, runner.clone()).handle("/exec -t 5 uptime", &outbox).await;

        let sent = outbox.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].starts_with("⏳ Executing: `uptime`"));
        assert!(sent[1].contains("up 3 days"));
        assert_eq!(runner.requests()[0].timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_long_output_is_split() {
        let mut fx = fixture();
        fx.config.mqtt.max_message_chars = 100;
        let long = "line of output\n".repeat(30);
        let runner = Arc::new(ScriptedRunner::new().respond("cat", ok(&long)));
        let outbox = RecordingOutbox::default();

        dispatcher(&fx, runner).handle("/exec cat big.log", &outbox).await;

        let sent = outbox.sent();
        assert!(sent.len() > 2);
        assert!(sent.iter().all(|m| m.chars().count() <= 100));
    }

    #[tokio::test]
    async fn test_reboot_requires_confirmation() {
        let fx = fixture();
        let runner = Arc::new(ScriptedRunner::new());
        let dispatcher = dispatcher(&fx, runner.clone());
        let outbox = RecordingOutbox::default();

        dispatcher.handle("/reboot", &outbox).await;
        dispatcher.handle("/reboot cancel", &outbox).await;
        assert!(runner.lines().is_empty());

        dispatcher.handle("/reboot confirm", &outbox).await;
        assert_eq!(runner.lines(), vec!["reboot"]);
        assert!(outbox.sent().last().unwrap().contains("reboot initiated"));
    }

    #[tokio::test]
    async fn test_restart_without_name_lists_services() {
        let fx = fixture();
        let runner = Arc::new(ScriptedRunner::new());
        let outbox = RecordingOutbox::default();

        dispatcher(&fx, runner.clone()).handle("/restart", &outbox).await;

        assert!(runner.lines().is_empty());
        let sent = outbox.sent();
        assert!(sent[0].contains("• ssh (SSH server)"));
        assert!(sent[0].contains("• nginx"));
    }

    #[tokio::test]
    async fn test_restart_reports_fallback() {
        let fx = fixture();
        let runner = Arc::new(
            ScriptedRunner::new()
                .respond("systemctl", failed("not booted with systemd", 1))
                .respond("service", ok("")),
        );
        let outbox = RecordingOutbox::default();

        dispatcher(&fx, runner).handle("/restart nginx", &outbox).await;

        let sent = outbox.sent();
        assert!(sent[0].contains("Restarting service: `nginx`"));
        assert!(sent[1].contains("restarted successfully via service"));
    }

    #[tokio::test]
    async fn test_status_and_battery_queries() {
        let fx = fixture();
        let dispatcher = dispatcher(&fx, Arc::new(ScriptedRunner::new()));
        let outbox = RecordingOutbox::default();

        dispatcher.handle("/status", &outbox).await;
        dispatcher.handle("/battery", &outbox).await;
        dispatcher.handle("/watchdog", &outbox).await;

        let sent = outbox.sent();
        assert!(sent[0].contains("64.0% (DISCHARGING, not charging)"));
        assert!(sent[1].contains("Charge: 64.0%"));
        assert!(sent[2].contains("Alert active: false"));
    }

    #[tokio::test]
    async fn test_update_with_changes_relaunches_and_shuts_down() {
        let fx = fixture();
        let runner = Arc::new(
            ScriptedRunner::new()
                .respond_once("git rev-parse --short HEAD", ok("abc1234\n"))
                .respond("git rev-parse --short HEAD", ok("def5678\n"))
                .respond("git pull", ok("Fast-forward\n")),
        );
        let dispatcher = dispatcher(&fx, runner);
        let shutdown = dispatcher.shutdown_signal();
        let outbox = RecordingOutbox::default();

        dispatcher.handle("/update now", &outbox).await;

        let sent = outbox.sent();
        assert!(sent[0].contains("Starting update process"));
        assert!(sent[1].contains("Successfully updated"));
        assert!(sent[1].contains("`def5678`"));
        assert!(sent[2].contains("ASB restarting with new version"));
        assert!(*shutdown.borrow());
    }

    #[tokio::test]
    async fn test_update_without_changes_keeps_running() {
        let fx = fixture();
        let runner = Arc::new(ScriptedRunner::new().respond("git rev-parse --short HEAD", ok("abc1234\n")));
        let dispatcher = dispatcher(&fx, runner);
        let shutdown = dispatcher.shutdown_signal();
        let outbox = RecordingOutbox::default();

        dispatcher.handle("/update now", &outbox).await;

        let sent = outbox.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].contains("Already up to date"));
        assert!(!*shutdown.borrow());
    }

    #[tokio::test]
    async fn test_failed_pull_does_not_relaunch() {
        let fx = fixture();
        let runner = Arc::new(ScriptedRunner::new().respond("git pull", failed("merge conflict", 1)));
        let dispatcher = dispatcher(&fx, runner);
        let shutdown = dispatcher.shutdown_signal();
        let outbox = RecordingOutbox::default();

        dispatcher.handle("/update now", &outbox).await;

        let sent = outbox.sent();
        assert!(sent[1].starts_with("⚠️ Remediated"));
        assert!(!*shutdown.borrow());
    }

    #[tokio::test]
    async fn test_upload_is_stored_in_storage_dir() {
        let fx = fixture();
        let outbox = RecordingOutbox::default();

        dispatcher(&fx, Arc::new(ScriptedRunner::new()))
            .handle_upload("../tools/run.sh", b"#!/bin/sh\n", &outbox)
            .await;

        let saved = fx.dir.path().join("run.sh");
        assert_eq!(std::fs::read(&saved).unwrap(), b"#!/bin/sh\n");
        let sent = outbox.sent();
        assert_eq!(sent[0], "📥 Receiving file: ../tools/run.sh...");
        assert!(sent[1].starts_with("✅ File saved and made executable"));
        assert!(sent[1].contains("`~/server/run.sh`"));
    }

    #[tokio::test]
    async fn test_upload_with_unusable_name_is_reported() {
        let fx = fixture();
        let outbox = RecordingOutbox::default();

        dispatcher(&fx, Arc::new(ScriptedRunner::new()))
            .handle_upload("..", b"x", &outbox)
            .await;

        let sent = outbox.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].starts_with("❌ Error saving file: invalid file name"));
    }

    #[tokio::test]
    async fn test_unknown_command_gets_hint() {
        let fx = fixture();
        let outbox = RecordingOutbox::default();

        dispatcher(&fx, Arc::new(ScriptedRunner::new())).handle("/frobnicate", &outbox).await;

        assert_eq!(outbox.sent(), vec![presentation::unknown_command("/frobnicate")]);
    }
}
