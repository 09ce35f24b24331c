//! Command execution module for the ASB agent
//!
//! Handles bounded execution of system commands:
//! - Shell command execution with a deadline (pipes and redirection honored)
//! - Process group termination when the deadline fires
//! - Combined stdout/stderr capture, partial output kept on timeout
//! - System reboot
//!
//! Command text is handed to the shell verbatim. This is the agent's trust
//! boundary: the only protection is that every caller is the single
//! authenticated admin identity. Nothing here sandboxes or filters commands.

#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command as AsyncCommand};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CommandsConfig;

/// How long output readers may keep running once the process has exited.
/// A detached grandchild can hold the pipes open forever.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Default cap on captured output per command
pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

/// Why a command did not complete successfully
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("command timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("command exited with {}", exit_label(.code))]
    NonZeroExit { code: Option<i32> },

    #[error("failed to run command: {message}")]
    Spawn { message: String },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

/// A single command to run, through the shell or directly
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Shell line, or the quoted rendering of `argv` for direct commands
    pub line: String,
    /// Program and arguments executed without a shell
    pub argv: Option<Vec<String>>,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

impl CommandRequest {
    pub fn new(line: impl Into<String>, timeout: Duration) -> Self {
        Self {
            line: line.into(),
            argv: None,
            timeout,
            working_dir: None,
        }
    }

    /// Run `argv[0]` with the remaining arguments and no shell in between.
    /// Patterns such as `pkill -f` then cannot match a wrapper shell.
    pub fn direct<I, S>(argv: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        Self {
            line: shell_words::join(&argv),
            argv: Some(argv),
            timeout,
            working_dir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Result of one command invocation.
///
/// `timed_out` is true exactly when `error` is [`ExecError::Timeout`]. In that
/// case the process group was killed and `output` holds whatever was produced
/// before the deadline, followed by a truncation marker.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub output: String,
    pub error: Option<ExecError>,
    pub timed_out: bool,
    pub execution_time: Duration,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// Marker appended to the output of a command killed at its deadline
pub fn timeout_marker(timeout: Duration) -> String {
    format!("\n[timed out after {}s, output truncated]", timeout.as_secs())
}

/// Anything able to run a [`CommandRequest`] to completion or deadline.
///
/// No retries happen at this layer; retry policy belongs to the caller.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: CommandRequest) -> CommandOutcome;
}

/// Marker appended when captured output hit the byte cap
pub fn truncation_marker(dropped: usize) -> String {
    format!("\n[output truncated, {} bytes dropped]", dropped)
}

/// Runs commands through `<shell> -c <line>` in their own process group.
///
/// At most `output_limit` bytes of output are kept. The pipes are still read
/// to the end so a chatty command never blocks on a full pipe.
pub struct ShellRunner {
    shell: String,
    output_limit: usize,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = bytes;
        self
    }
}

/// Output shared by the stdout and stderr readers
#[derive(Default)]
struct Captured {
    bytes: Vec<u8>,
    dropped: usize,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, request: CommandRequest) -> CommandOutcome {
        let start_time = Instant::now();
        debug!("Executing shell command: {} (timeout: {:?})", request.line, request.timeout);

        let mut command = match request.argv.as_deref() {
            Some([program, args @ ..]) => {
                let mut command = AsyncCommand::new(program);
                command.args(args);
                command
            }
            Some([]) => {
                return CommandOutcome {
                    output: String::new(),
                    error: Some(ExecError::Spawn { message: "empty command".to_string() }),
                    timed_out: false,
                    execution_time: start_time.elapsed(),
                };
            }
            None => {
                let mut command = AsyncCommand::new(&self.shell);
                command.arg("-c").arg(&request.line);
                command
            }
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn '{}': {}", request.line, e);
                return CommandOutcome {
                    output: String::new(),
                    error: Some(ExecError::Spawn { message: e.to_string() }),
                    timed_out: false,
                    execution_time: start_time.elapsed(),
                };
            }
        };

        // stdout and stderr land in one buffer in arrival order
        let combined = Arc::new(Mutex::new(Captured::default()));
        let limit = self.output_limit;
        let readers = [
            child.stdout.take().map(|pipe| spawn_reader(pipe, combined.clone(), limit)),
            child.stderr.take().map(|pipe| spawn_reader(pipe, combined.clone(), limit)),
        ];

        let (error, timed_out) = match tokio::time::timeout(request.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => (None, false),
            Ok(Ok(status)) => (Some(ExecError::NonZeroExit { code: status.code() }), false),
            Ok(Err(e)) => (
                Some(ExecError::Spawn { message: format!("wait failed: {}", e) }),
                false,
            ),
            Err(_) => {
                info!("Command exceeded {:?}, terminating: {}", request.timeout, request.line);
                terminate(&mut child).await;
                (Some(ExecError::Timeout { timeout: request.timeout }), true)
            }
        };

        for reader in readers.into_iter().flatten() {
            drain(reader).await;
        }

        let mut output = {
            let captured = combined.lock();
            let mut output = String::from_utf8_lossy(&captured.bytes).into_owned();
            if captured.dropped > 0 {
                debug!("Dropped {} bytes of output from '{}'", captured.dropped, request.line);
                output.push_str(&truncation_marker(captured.dropped));
            }
            output
        };
        if timed_out {
            output.push_str(&timeout_marker(request.timeout));
        }

        CommandOutcome {
            output,
            error,
            timed_out,
            execution_time: start_time.elapsed(),
        }
    }
}

fn spawn_reader<R>(mut pipe: R, sink: Arc<Mutex<Captured>>, limit: usize) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut captured = sink.lock();
                    let keep = n.min(limit.saturating_sub(captured.bytes.len()));
                    captured.bytes.extend_from_slice(&chunk[..keep]);
                    captured.dropped += n - keep;
                }
            }
        }
    })
}

async fn drain(reader: JoinHandle<()>) {
    let abort = reader.abort_handle();
    if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
        debug!("Output reader still busy after process exit, abandoning it");
        abort.abort();
    }
}

/// Kill the whole process group, then reap the shell itself
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        signal_group(pid);
    }
    if let Err(e) = child.kill().await {
        debug!("Kill after group signal returned: {}", e);
    }
}

#[cfg(unix)]
fn signal_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        warn!("Failed to signal process group {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32) {}

/// Outcome of a reboot request
#[derive(Debug, Clone)]
pub struct RebootReport {
    pub initiated: bool,
    pub diagnostic: String,
}

/// Operator-facing entry points built on a [`CommandRunner`]
pub struct CommandExecutor {
    runner: Arc<dyn CommandRunner>,
    default_timeout: Duration,
    max_timeout: Duration,
    reboot_command: String,
    reboot_timeout: Duration,
}

impl CommandExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &CommandsConfig) -> Self {
        Self {
            runner,
            default_timeout: Duration::from_secs(config.exec_timeout_secs),
            max_timeout: Duration::from_secs(config.max_exec_timeout_secs),
            reboot_command: config.reboot_command.clone(),
            reboot_timeout: Duration::from_secs(config.reboot_timeout_secs),
        }
    }

    /// Execute an operator command. `timeout` falls back to the configured
    /// default and is capped at the configured maximum.
    pub async fn execute_shell_command(&self, command: &str, timeout: Option<Duration>) -> CommandOutcome {
        let timeout = timeout.unwrap_or(self.default_timeout).min(self.max_timeout);
        info!("Executing operator command (timeout: {:?})", timeout);

        let outcome = self.runner.run(CommandRequest::new(command, timeout)).await;
        debug!(
            "Command finished in {}ms (timed out: {})",
            outcome.execution_time.as_millis(),
            outcome.timed_out
        );
        outcome
    }

    /// Ask the system to reboot.
    ///
    /// The reboot command is not expected to return: a command still running
    /// at the deadline counts as initiated.
    pub async fn reboot(&self) -> RebootReport {
        info!("Executing reboot command: {}", self.reboot_command);
        let outcome = self
            .runner
            .run(CommandRequest::new(&self.reboot_command, self.reboot_timeout))
            .await;

        match &outcome.error {
            None => RebootReport {
                initiated: true,
                diagnostic: outcome.output.trim().to_string(),
            },
            Some(ExecError::Timeout { .. }) => RebootReport {
                initiated: true,
                diagnostic: format!(
                    "reboot command did not return within {}s, shutdown assumed in progress",
                    self.reboot_timeout.as_secs()
                ),
            },
            Some(e) => {
                warn!("Reboot failed: {}", e);
                RebootReport {
                    initiated: false,
                    diagnostic: format!("{}\n{}", e, outcome.output.trim()).trim().to_string(),
                }
            }
        }
    }

    /// Default operator timeout, used for usage text
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}
