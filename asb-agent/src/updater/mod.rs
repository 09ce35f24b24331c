//! Self-updater using the agent's git working tree
//!
//! Features:
//! - Check upstream for new commits (fetch + divergence)
//! - Mandatory backup of the working tree before any pull
//! - Fast-forward only pull with rollback from the backup on failure
//! - Relaunch of the agent after a successful update
//!
//! Only one update session runs at a time. A concurrent request is rejected
//! with [`UpdateError::SessionBusy`], never queued.

mod backup;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command as AsyncCommand;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::execution::{CommandOutcome, CommandRequest, CommandRunner, ExecError};
use crate::outcome::Severity;

/// Status phrases printed by `git status` when the branch can move forward
const BEHIND_PHRASES: &[&str] = &["Your branch is behind", "can be fast-forwarded"];

/// Result of an update check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheck {
    UpToDate { version: String },
    Available { current: String, remote: String },
}

/// Result of a successful update
#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub old_version: String,
    pub new_version: String,
    /// Kept after success for manual recovery
    pub backup_path: PathBuf,
    pub output: String,
}

impl UpdateReport {
    pub fn changed(&self) -> bool {
        self.old_version != self.new_version
    }
}

/// What happened when restoring after a failed pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    Restored,
    Failed(String),
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackOutcome::Restored => f.write_str("rollback restored the backup"),
            RollbackOutcome::Failed(reason) => write!(f, "rollback failed: {}", reason),
        }
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("{} is not a git repository", .0.display())]
    RepositoryMissing(PathBuf),

    #[error("git fetch failed: {error}")]
    FetchFailed { output: String, error: ExecError },

    #[error("git status failed: {error}")]
    StatusFailed { output: String, error: ExecError },

    #[error("an update is already in progress")]
    SessionBusy,

    #[error("backup to {} failed: {}", .path.display(), .source)]
    BackupFailed { path: PathBuf, source: io::Error },

    #[error("git pull failed: {error} ({rollback})")]
    PullFailed {
        output: String,
        error: ExecError,
        backup_path: PathBuf,
        rollback: RollbackOutcome,
    },
}

impl UpdateError {
    pub fn severity(&self) -> Severity {
        match self {
            UpdateError::PullFailed { rollback: RollbackOutcome::Restored, .. } => Severity::Remediated,
            UpdateError::PullFailed { .. } => Severity::ManualInterventionRequired,
            _ => Severity::Failed,
        }
    }
}

/// Outcome of relaunching the agent
#[derive(Debug, Clone)]
pub struct SelfRestartReport {
    pub success: bool,
    pub diagnostic: String,
}

pub struct UpdateManager {
    runner: Arc<dyn CommandRunner>,
    repo_dir: PathBuf,
    backup_root: PathBuf,
    fetch_timeout: Duration,
    pull_timeout: Duration,
    shell: String,
    relaunch_command: Option<String>,
    relaunch_delay: Duration,
    session: Mutex<()>,
}

impl UpdateManager {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &AgentConfig) -> Self {
        Self {
            runner,
            repo_dir: config.repo_dir(),
            backup_root: config.backup_dir(),
            fetch_timeout: Duration::from_secs(config.update.fetch_timeout_secs),
            pull_timeout: Duration::from_secs(config.update.pull_timeout_secs),
            shell: config.commands.shell.clone(),
            relaunch_command: config.update.relaunch_command.clone(),
            relaunch_delay: Duration::from_secs(config.update.relaunch_delay_secs),
            session: Mutex::new(()),
        }
    }

    /// Check if upstream has commits the working tree lacks
    pub async fn check_for_updates(&self) -> Result<UpdateCheck, UpdateError> {
        let _session = self.session.try_lock().map_err(|_| UpdateError::SessionBusy)?;
        self.ensure_repository()?;
        info!("Checking for updates in {}", self.repo_dir.display());

        let fetch = self.git("git fetch", self.fetch_timeout).await;
        if let Some(error) = fetch.error {
            warn!("git fetch failed: {}", error);
            return Err(UpdateError::FetchFailed { output: fetch.output, error });
        }

        let status = self.git("LC_ALL=C git status -uno", self.fetch_timeout).await;
        if let Some(error) = status.error {
            return Err(UpdateError::StatusFailed { output: status.output, error });
        }

        let current = self.revision("HEAD").await;
        if branch_is_behind(&status.output) {
            let remote = self.revision("'@{u}'").await;
            info!("Update available: {} -> {}", current, remote);
            Ok(UpdateCheck::Available { current, remote })
        } else {
            Ok(UpdateCheck::UpToDate { version: current })
        }
    }

    /// Backup, pull, and roll back on failure
    pub async fn perform_update(&self) -> Result<UpdateReport, UpdateError> {
        let _session = self.session.try_lock().map_err(|_| UpdateError::SessionBusy)?;
        self.ensure_repository()?;
        let old_version = self.revision("HEAD").await;

        let backup_path = backup::backup_path(&self.backup_root);
        if let Err(source) = self.create_backup(&backup_path).await {
            error!(backup = %backup_path.display(), "Backup failed, update aborted: {}", source);
            return Err(UpdateError::BackupFailed { path: backup_path, source });
        }
        info!(backup = %backup_path.display(), "Created backup");

        let pull = self.git("git pull --ff-only", self.pull_timeout).await;
        if let Some(error) = pull.error {
            error!("git pull failed: {}", error);
            let rollback = self.rollback(&backup_path).await;
            return Err(UpdateError::PullFailed {
                output: pull.output,
                error,
                backup_path,
                rollback,
            });
        }

        let new_version = self.revision("HEAD").await;
        info!("Update completed: {} -> {}", old_version, new_version);
        Ok(UpdateReport {
            old_version,
            new_version,
            backup_path,
            output: pull.output,
        })
    }

    /// Start a fresh agent detached from this process.
    ///
    /// The new instance waits `relaunch_delay` before starting so the caller
    /// can shut the current one down and release its broker session.
    pub async fn restart_self(&self) -> SelfRestartReport {
        let target = match &self.relaunch_command {
            Some(command) => command.clone(),
            None => match std::env::current_exe() {
                Ok(exe) => shell_words::quote(&exe.to_string_lossy()).into_owned(),
                Err(e) => {
                    return SelfRestartReport {
                        success: false,
                        diagnostic: format!("cannot locate current executable: {}", e),
                    }
                }
            },
        };
        let line = format!("sleep {}; exec {}", self.relaunch_delay.as_secs(), target);
        info!("Relaunching agent: {}", line);

        let mut command = AsyncCommand::new(&self.shell);
        command
            .arg("-c")
            .arg(&line)
            .current_dir(&self.repo_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        command.process_group(0);

        match command.spawn() {
            Ok(child) => SelfRestartReport {
                success: true,
                diagnostic: format!(
                    "new instance scheduled (pid {})",
                    child.id().map(|p| p.to_string()).unwrap_or_else(|| "?".into())
                ),
            },
            Err(e) => {
                error!("Failed to relaunch agent: {}", e);
                SelfRestartReport {
                    success: false,
                    diagnostic: format!("failed to start new instance: {}", e),
                }
            }
        }
    }

    fn ensure_repository(&self) -> Result<(), UpdateError> {
        if self.repo_dir.join(".git").exists() {
            Ok(())
        } else {
            Err(UpdateError::RepositoryMissing(self.repo_dir.clone()))
        }
    }

    async fn git(&self, line: &str, timeout: Duration) -> CommandOutcome {
        self.runner
            .run(CommandRequest::new(line, timeout).in_dir(&self.repo_dir))
            .await
    }

    async fn revision(&self, rev: &str) -> String {
        let outcome = self
            .git(&format!("git rev-parse --short {}", rev), self.fetch_timeout)
            .await;
        match outcome.error {
            None => outcome.output.trim().to_string(),
            Some(_) => "unknown".to_string(),
        }
    }

    async fn create_backup(&self, target: &Path) -> io::Result<()> {
        let source = self.repo_dir.clone();
        let target = target.to_path_buf();
        let exclude = self.backup_root.clone();
        tokio::task::spawn_blocking(move || backup::snapshot(&source, &target, Some(&exclude)))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
    }

    async fn rollback(&self, backup_path: &Path) -> RollbackOutcome {
        let backup = backup_path.to_path_buf();
        let target = self.repo_dir.clone();
        let restored = tokio::task::spawn_blocking(move || backup::restore(&backup, &target))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
            .and_then(|result| result);

        match restored {
            Ok(()) => {
                info!(backup = %backup_path.display(), "Rollback restored working tree");
                RollbackOutcome::Restored
            }
            Err(e) => {
                error!(backup = %backup_path.display(), "Rollback failed: {}", e);
                RollbackOutcome::Failed(e.to_string())
            }
        }
    }
}

fn branch_is_behind(status: &str) -> bool {
    BEHIND_PHRASES.iter().any(|phrase| status.contains(phrase))
}
