//! Scripted [`CommandRunner`] for tests
//!
//! Responses are matched by command-line prefix, first match wins. One-shot
//! responses are consulted first and consumed. Every request is recorded so
//! tests can assert on ordering.

use super::{CommandOutcome, CommandRequest, CommandRunner, ExecError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub fn ok(output: &str) -> CommandOutcome {
    CommandOutcome {
        output: output.to_string(),
        error: None,
        timed_out: false,
        execution_time: Duration::from_millis(1),
    }
}

pub fn failed(output: &str, code: i32) -> CommandOutcome {
    CommandOutcome {
        output: output.to_string(),
        error: Some(ExecError::NonZeroExit { code: Some(code) }),
        timed_out: false,
        execution_time: Duration::from_millis(1),
    }
}

pub fn timed_out(output: &str) -> CommandOutcome {
    CommandOutcome {
        output: output.to_string(),
        error: Some(ExecError::Timeout { timeout: Duration::from_secs(5) }),
        timed_out: true,
        execution_time: Duration::from_secs(5),
    }
}

/// Holds a command until released, to observe work in flight
pub struct Gate {
    prefix: String,
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

pub struct ScriptedRunner {
    responses: Vec<(String, CommandOutcome)>,
    once: Mutex<Vec<(String, CommandOutcome)>>,
    fallback: CommandOutcome,
    gate: Option<Gate>,
    requests: Mutex<Vec<CommandRequest>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            responses: Vec::new(),
            once: Mutex::new(Vec::new()),
            fallback: ok(""),
            gate: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(mut self, prefix: &str, outcome: CommandOutcome) -> Self {
        self.responses.push((prefix.to_string(), outcome));
        self
    }

    /// Answer the next matching command only
    pub fn respond_once(self, prefix: &str, outcome: CommandOutcome) -> Self {
        self.once.lock().push((prefix.to_string(), outcome));
        self
    }

    pub fn otherwise(mut self, outcome: CommandOutcome) -> Self {
        self.fallback = outcome;
        self
    }

    /// Block commands starting with `prefix` until `release` is notified.
    /// Returns the notifiers for entry and release.
    pub fn gated(mut self, prefix: &str) -> (Self, Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        self.gate = Some(Gate {
            prefix: prefix.to_string(),
            entered: entered.clone(),
            release: release.clone(),
        });
        (self, entered, release)
    }

    pub fn requests(&self) -> Vec<CommandRequest> {
        self.requests.lock().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.line.clone()).collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, request: CommandRequest) -> CommandOutcome {
        self.requests.lock().push(request.clone());

        if let Some(gate) = &self.gate {
            if request.line.starts_with(&gate.prefix) {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
        }

        {
            let mut once = self.once.lock();
            if let Some(index) = once.iter().position(|(prefix, _)| request.line.starts_with(prefix.as_str())) {
                return once.remove(index).1;
            }
        }

        self.responses
            .iter()
            .find(|(prefix, _)| request.line.starts_with(prefix.as_str()))
            .map(|(_, outcome)| outcome.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }
}
