//! Markdown rendering of control plane results
//!
//! Everything operator-visible is produced here from structured values. The
//! control plane itself never formats text.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::KnownService;
use crate::execution::{CommandOutcome, RebootReport};
use crate::metrics::SystemStatus;
use crate::outcome::Severity;
use crate::services::{RestartReport, ServiceError, StrategyAttempt};
use crate::storage::StorageError;
use crate::updater::{SelfRestartReport, UpdateCheck, UpdateError, UpdateReport};
use crate::watchdog::battery::{BatteryReading, SensorError};
use crate::watchdog::{LowBatteryAlert, WatchdogStatus};

pub fn welcome() -> String {
    "Welcome to Android Server Brain. Use /status to check system health, /help for all commands.".to_string()
}

pub fn help(default_timeout: Duration) -> String {
    format!(
        "📖 *Commands*\n\n\
         • `/status` - System status\n\
         • `/battery` - Battery details\n\
         • `/watchdog` - Watchdog status\n\
         • `/exec [-t <secs>] <command>` - Run a shell command (default timeout {}s)\n\
         • `/restart [service]` - Restart a service or list known ones\n\
         • `/update` - Check for updates, `/update now` to install\n\
         • `/reboot` - Reboot the device\n\n\
         Send a document to store it in `~/server`, ready to run.",
        default_timeout.as_secs()
    )
}

pub fn unknown_command(command: &str) -> String {
    format!("Unknown command `{}`. Use /help to list commands.", command)
}

pub fn upload_started(file_name: &str) -> String {
    format!("📥 Receiving file: {}...", file_name)
}

pub fn upload_result(result: &Result<PathBuf, StorageError>) -> String {
    match result {
        Ok(path) => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            format!(
                "✅ File saved and made executable:\n`{}`\n\nYou can run it from `~/server/{}`",
                path.display(),
                name
            )
        }
        Err(e) => format!("❌ Error saving file: {}", e),
    }
}

pub fn exec_usage() -> String {
    "Usage: `/exec [-t <secs>] <command>`".to_string()
}

pub fn exec_started(command: &str) -> String {
    format!("⏳ Executing: `{}`...", command)
}

pub fn exec_result(outcome: &CommandOutcome) -> String {
    let mut output = outcome.output.clone();
    if output.trim().is_empty() {
        output = match &outcome.error {
            Some(e) => format!("Error: {}", e),
            None => "Command executed successfully (no output).".to_string(),
        };
    }

    let mut message = format!("📝 *Output:*\n```\n{}\n```", output.trim_end());
    match &outcome.error {
        Some(e) if outcome.timed_out => message.push_str(&format!("\n⏱ {}", e)),
        Some(e) if !outcome.output.trim().is_empty() => message.push_str(&format!("\n❌ {}", e)),
        _ => {}
    }
    message
}

pub fn reboot_prompt() -> String {
    "⚠️ *System Reboot Confirmation*\n\n\
     Are you sure you want to reboot the system? This will disconnect all active sessions.\n\n\
     Send `/reboot confirm` to proceed or `/reboot cancel` to abort."
        .to_string()
}

pub fn reboot_cancelled() -> String {
    "❌ Reboot cancelled.".to_string()
}

pub fn reboot_result(report: &RebootReport) -> String {
    if report.initiated {
        let mut message = "🔄 System reboot initiated...".to_string();
        if !report.diagnostic.is_empty() {
            message.push_str(&format!("\n{}", report.diagnostic));
        }
        message
    } else {
        format!("❌ Reboot command failed:\n```\n{}\n```", report.diagnostic)
    }
}

pub fn known_services(services: &[KnownService]) -> String {
    let mut message = "📋 *Available Services for Restart:*\n\n".to_string();
    for service in services {
        message.push_str(&format!("• {} ({})\n", service.name, service.description));
    }
    message.push_str("\nUsage: `/restart <service_name>`\nExample: `/restart ssh`");
    message
}

pub fn restart_started(service: &str) -> String {
    format!("⏳ Restarting service: `{}`...", service)
}

pub fn restart_result(result: &Result<RestartReport, ServiceError>) -> String {
    match result {
        Ok(report) if report.verified() => format!(
            "✅ Service '{}' restarted successfully via {}\n{}",
            report.service,
            report.strategy_used,
            attempt_log(&report.attempts)
        ),
        Ok(report) => format!(
            "⚠️ Service '{}' could not be restarted directly.\n{}\n✅ Process killed. Service should restart automatically.",
            report.service,
            attempt_log(&report.attempts)
        ),
        Err(e @ ServiceError::InvalidName(name)) => {
            format!("{}Invalid service name `{}`", severity_prefix(e.severity()), name)
        }
        Err(e @ ServiceError::AllStrategiesFailed { service, attempts }) => format!(
            "{}All restart methods failed for '{}'\n{}",
            severity_prefix(e.severity()),
            service,
            attempt_log(attempts)
        ),
    }
}

fn attempt_log(attempts: &[StrategyAttempt]) -> String {
    attempts
        .iter()
        .map(|attempt| {
            let mark = if attempt.success() { "✅" } else { "⚠️" };
            let output = attempt.output.trim();
            if output.is_empty() {
                format!("{} {}", mark, attempt.strategy)
            } else {
                format!("{} {}: {}", mark, attempt.strategy, output)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn update_checking() -> String {
    "🔍 Checking for updates...".to_string()
}

pub fn update_check(result: &Result<UpdateCheck, UpdateError>) -> String {
    match result {
        Ok(UpdateCheck::UpToDate { version }) => {
            format!("✅ Already up to date. No updates available.\n*Version:* `{}`", version)
        }
        Ok(UpdateCheck::Available { current, remote }) => format!(
            "✅ Updates are available!\n\n\
             *Current version:* `{}`\n\
             *Available version:* `{}`\n\n\
             Use `/update now` to install updates",
            current, remote
        ),
        Err(e) => update_error(e),
    }
}

pub fn update_started() -> String {
    "🔄 Starting update process...".to_string()
}

pub fn update_result(result: &Result<UpdateReport, UpdateError>) -> String {
    match result {
        Ok(report) if report.changed() => format!(
            "✅ Successfully updated!\n```\n{}\n```\n\
             *Updated to version:* `{}`\n\
             Backup created at: `{}`\n\n\
             Restarting ASB service now...",
            report.output.trim_end(),
            report.new_version,
            report.backup_path.display()
        ),
        Ok(report) => format!(
            "✅ Already up to date, nothing pulled.\n*Version:* `{}`\nBackup created at: `{}`",
            report.new_version,
            report.backup_path.display()
        ),
        Err(e) => update_error(e),
    }
}

fn update_error(error: &UpdateError) -> String {
    let mut message = format!("{}{}", severity_prefix(error.severity()), error);
    match error {
        UpdateError::FetchFailed { output, .. }
        | UpdateError::StatusFailed { output, .. }
        | UpdateError::PullFailed { output, .. }
            if !output.trim().is_empty() =>
        {
            message.push_str(&format!("\n```\n{}\n```", output.trim_end()));
        }
        _ => {}
    }
    if let UpdateError::PullFailed { backup_path, .. } = error {
        message.push_str(&format!("\nBackup kept at: `{}`", backup_path.display()));
    }
    message
}

pub fn self_restart_result(report: &SelfRestartReport) -> String {
    if report.success {
        format!("✅ ASB restarting with new version ({})", report.diagnostic)
    } else {
        format!("⚠️ {}\n\nManual restart may be required.", report.diagnostic)
    }
}

fn severity_prefix(severity: Severity) -> &'static str {
    match severity {
        Severity::Failed => "❌ ",
        Severity::Remediated => "⚠️ Remediated: ",
        Severity::ManualInterventionRequired => "🚨 Manual intervention required: ",
    }
}

pub fn battery(result: &Result<BatteryReading, SensorError>) -> String {
    match result {
        Ok(reading) => format!(
            "🔋 *Battery Status*\n\n\
             Charge: {:.1}%\n\
             Status: {}\n\
             Plugged: {}\n\
             Health: {}\n\
             Temperature: {:.1}°C",
            reading.percentage, reading.status, reading.plugged, reading.health, reading.temperature
        ),
        Err(e) => format!("❌ Battery info unavailable: {}", e),
    }
}

pub fn watchdog_status(status: &WatchdogStatus, threshold: f64) -> String {
    let mut message = format!(
        "🐕 *Watchdog Status*\n\n\
         ⏱ Uptime: {}\n\
         📅 Interval: {}\n\
         🪫 Threshold: {:.0}%\n\
         📢 Alert active: {}",
        format_duration(status.uptime),
        format_duration(status.interval),
        threshold,
        status.alerted
    );
    if let Some((reading, at)) = &status.last_reading {
        message.push_str(&format!(
            "\n🔋 Last reading: {:.1}% at {}",
            reading.percentage,
            at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    message
}

pub fn system_status(status: &SystemStatus) -> String {
    let battery = match &status.battery {
        Ok(reading) => format!(
            "{:.1}% ({}, {})",
            reading.percentage,
            reading.status,
            if reading.is_charging() { "charging" } else { "not charging" }
        ),
        Err(e) => format!("Unavailable ({})", e),
    };
    let storage = match &status.storage {
        Some(space) => format!(
            "{} free of {} on {}",
            format_bytes(space.available_bytes),
            format_bytes(space.total_bytes),
            space.mount_point.display()
        ),
        None => "N/A".to_string(),
    };
    format!(
        "📊 *System Status* ({})\n\n\
         🔋 *Battery:* {}\n\
         💾 *Free Space:* {}\n\
         ⏱ *Uptime:* {}",
        status.hostname,
        battery,
        storage,
        format_duration(Duration::from_secs(status.uptime_seconds))
    )
}

pub fn low_battery_alert(alert: &LowBatteryAlert) -> String {
    format!(
        "⚠️ *Low Battery Alert*\n\n\
         🔋 Current charge: {:.1}%\n\
         🌡 Temperature: {:.1}°C\n\
         🔌 Status: {}\n\n\
         Below the {:.0}% threshold. Please connect charger!",
        alert.percentage, alert.temperature, alert.status, alert.threshold
    )
}

pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (days, hours, minutes, seconds) = (total / 86_400, total / 3600 % 24, total / 60 % 60, total % 60);
    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 {
        parts.push(format!("{}m", minutes));
    }
    if seconds > 0 || parts.is_empty() {
        parts.push(format!("{}s", seconds));
    }
    parts.join(" ")
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Code fence marker
const FENCE: &str = "```";
/// Room kept per chunk for re-opening and closing a split fence
const FENCE_OVERHEAD: usize = 2 * (FENCE.len() + 1);

/// Split a message into chunks of at most `max_chars` characters, preferring
/// line boundaries. A code block cut in two is closed at the end of one chunk
/// and re-opened at the start of the next. Without code blocks, concatenating
/// the chunks gives back the input.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let budget = if text.contains(FENCE) && max_chars > 2 * FENCE_OVERHEAD {
        max_chars - FENCE_OVERHEAD
    } else {
        max_chars
    };
    let mut chunker = Chunker {
        chunks: Vec::new(),
        current: String::new(),
        len: 0,
        budget,
        in_fence: false,
    };

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        let is_fence = line.trim_start().starts_with(FENCE);
        if is_fence && chunker.in_fence && (chunker.current.is_empty() || !chunker.fits(line_len)) {
            // Closed by the chunk boundary instead
            chunker.flush();
            chunker.in_fence = false;
            continue;
        }
        if line_len > budget {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(budget) {
                chunker.push(&piece.iter().collect::<String>());
            }
        } else {
            chunker.push(line);
        }
        if is_fence {
            chunker.in_fence = !chunker.in_fence;
        }
    }
    chunker.flush();
    chunker.chunks
}

struct Chunker {
    chunks: Vec<String>,
    current: String,
    /// Characters of `current` taken from the input
    len: usize,
    budget: usize,
    in_fence: bool,
}

impl Chunker {
    fn fits(&self, len: usize) -> bool {
        self.len + len <= self.budget
    }

    fn push(&mut self, piece: &str) {
        let piece_len = piece.chars().count();
        if !self.fits(piece_len) && self.len > 0 {
            self.flush();
        }
        if self.current.is_empty() && self.in_fence {
            self.current.push_str(FENCE);
            self.current.push('\n');
        }
        self.current.push_str(piece);
        self.len += piece_len;
    }

    fn flush(&mut self) {
        if self.current.is_empty() {
            return;
        }
        if self.in_fence {
            if !self.current.ends_with('\n') {
                self.current.push('\n');
            }
            self.current.push_str(FENCE);
        }
        self.chunks.push(std::mem::take(&mut self.current));
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecError;
    use crate::services::Strategy;
    use crate::updater::RollbackOutcome;

    fn outcome(output: &str, error: Option<ExecError>) -> CommandOutcome {
        CommandOutcome {
            output: output.to_string(),
            timed_out: matches!(error, Some(ExecError::Timeout { .. })),
            error,
            execution_time: Duration::from_millis(3),
        }
    }

    #[test]
    fn test_exec_result_fallbacks() {
        let message = exec_result(&outcome("", None));
        assert!(message.contains("Command executed successfully (no output)."));

        let message = exec_result(&outcome("  \n", Some(ExecError::NonZeroExit { code: Some(2) })));
        assert!(message.contains("Error: command exited with status 2"));

        let message = exec_result(&outcome("hi\n", None));
        assert_eq!(message, "📝 *Output:*\n```\nhi\n```");
    }

    #[test]
    fn test_exec_result_marks_timeout() {
        let message = exec_result(&outcome(
            "tick\n[timed out after 30s, output truncated]",
            Some(ExecError::Timeout { timeout: Duration::from_secs(30) }),
        ));
        assert!(message.contains("tick"));
        assert!(message.contains("⏱ command timed out after 30s"));
    }

    #[test]
    fn test_restart_failure_lists_every_strategy() {
        let attempts = Strategy::ORDER
            .iter()
            .map(|&strategy| StrategyAttempt {
                strategy,
                output: "not found".into(),
                error: Some(ExecError::NonZeroExit { code: Some(1) }),
            })
            .collect();
        let message = restart_result(&Err(ServiceError::AllStrategiesFailed {
            service: "ghost".into(),
            attempts,
        }));

        assert!(message.starts_with("🚨 Manual intervention required"));
        assert!(message.contains("⚠️ systemctl: not found"));
        assert!(message.contains("⚠️ service: not found"));
        assert!(message.contains("⚠️ pkill: not found"));
    }

    #[test]
    fn test_pull_failure_mentions_rollback_and_backup() {
        let error = UpdateError::PullFailed {
            output: "fatal: Not possible to fast-forward".into(),
            error: ExecError::NonZeroExit { code: Some(128) },
            backup_path: PathBuf::from("/srv/asb-backups/backup_20260101_000000"),
            rollback: RollbackOutcome::Restored,
        };
        let message = update_result(&Err(error));

        assert!(message.starts_with("⚠️ Remediated: git pull failed"));
        assert!(message.contains("rollback restored the backup"));
        assert!(message.contains("Backup kept at: `/srv/asb-backups/backup_20260101_000000`"));
    }

    #[test]
    fn test_update_available_message() {
        let message = update_check(&Ok(UpdateCheck::Available {
            current: "abc1234".into(),
            remote: "def5678".into(),
        }));
        assert!(message.contains("`abc1234`"));
        assert!(message.contains("`def5678`"));
        assert!(message.contains("/update now"));
    }

    #[test]
    fn test_low_battery_alert_text() {
        let message = low_battery_alert(&LowBatteryAlert {
            percentage: 15.0,
            temperature: 31.2,
            status: "DISCHARGING".into(),
            threshold: 20.0,
        });
        assert!(message.contains("Current charge: 15.0%"));
        assert!(message.contains("Temperature: 31.2°C"));
        assert!(message.contains("Below the 20% threshold"));
    }

    #[test]
    fn test_watchdog_status_without_reading() {
        let message = watchdog_status(
            &WatchdogStatus {
                uptime: Duration::from_secs(3725),
                interval: Duration::from_secs(300),
                alerted: true,
                last_reading: None,
            },
            20.0,
        );
        assert!(message.contains("Uptime: 1h 2m 5s"));
        assert!(message.contains("Interval: 5m"));
        assert!(message.contains("Alert active: true"));
        assert!(!message.contains("Last reading"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(90_061)), "1d 1h 1m 1s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GB");
    }

    #[test]
    fn test_upload_result() {
        let saved = upload_result(&Ok(PathBuf::from("/home/u/downloads/server/run.sh")));
        assert_eq!(
            saved,
            "✅ File saved and made executable:\n`/home/u/downloads/server/run.sh`\n\nYou can run it from `~/server/run.sh`"
        );

        let failed = upload_result(&Err(StorageError::InvalidName("..".into())));
        assert_eq!(failed, "❌ Error saving file: invalid file name '..'");
    }

    #[test]
    fn test_split_prefers_line_boundaries() {
        let text = "aaaa\nbbbb\ncccc\n";
        let chunks = split_message(text, 10);
        assert_eq!(chunks, vec!["aaaa\nbbbb\n", "cccc\n"]);
    }

    #[test]
    fn test_split_breaks_long_lines() {
        let text = format!("short\n{}\nend", "x".repeat(25));
        let chunks = split_message(&text, 10);

        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_split_keeps_code_blocks_balanced() {
        let output = "line of output\n".repeat(30);
        let message = exec_result(&outcome(&output, None));
        let chunks = split_message(&message, 100);

        assert!(chunks.len() > 2);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 100, "too long: {:?}", chunk);
            assert_eq!(chunk.matches(FENCE).count(), 2, "unbalanced: {:?}", chunk);
        }
        assert!(chunks[0].starts_with("📝 *Output:*\n```\n"));
        assert!(chunks[1].starts_with("```\nline of output\n"));
        let lines: usize = chunks.iter().map(|c| c.matches("line of output").count()).sum();
        assert_eq!(lines, 30);
    }

    #[test]
    fn test_split_at_closing_fence_does_not_reopen() {
        let text = format!("```\n{}```\nafter\n", "0123456789\n".repeat(2));
        let chunks = split_message(&text, 36);

        assert_eq!(chunks, vec!["```\n0123456789\n0123456789\n```", "after\n"]);
    }

    #[test]
    fn test_split_short_message_is_untouched() {
        assert_eq!(split_message("🔋 ok", 4000), vec!["🔋 ok"]);
        assert!(split_message("", 4000).is_empty());
    }
}
