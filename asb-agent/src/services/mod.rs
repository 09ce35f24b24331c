//! Service restart with ordered fallback strategies
//!
//! Strategies run strictly one after another, stopping at the first success:
//! 1. `systemctl restart <name>`
//! 2. `service <name> restart`
//! 3. `pkill -f <name>`, trusting a supervisor to relaunch the process
//!
//! No strategy is retried. Every attempt is kept in the report. Strategies
//! run without a shell: the name is passed as one argument and `pkill -f`
//! cannot match a wrapper shell's own command line.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{CommandsConfig, KnownService};
use crate::execution::{CommandRequest, CommandRunner, ExecError};
use crate::outcome::Severity;

/// Restart strategies in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Systemctl,
    ServiceCommand,
    ProcessKill,
}

impl Strategy {
    pub const ORDER: [Strategy; 3] = [Strategy::Systemctl, Strategy::ServiceCommand, Strategy::ProcessKill];

    fn argv(self, name: &str) -> [&str; 3] {
        match self {
            Strategy::Systemctl => ["systemctl", "restart", name],
            Strategy::ServiceCommand => ["service", name, "restart"],
            Strategy::ProcessKill => ["pkill", "-f", name],
        }
    }

    /// A successful kill only means the supervisor should bring it back
    pub fn is_verified(self) -> bool {
        !matches!(self, Strategy::ProcessKill)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Systemctl => "systemctl",
            Strategy::ServiceCommand => "service",
            Strategy::ProcessKill => "pkill",
        };
        f.write_str(name)
    }
}

/// One strategy execution
#[derive(Debug, Clone)]
pub struct StrategyAttempt {
    pub strategy: Strategy,
    pub output: String,
    pub error: Option<ExecError>,
}

impl StrategyAttempt {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// A restart that reached a successful strategy
#[derive(Debug, Clone)]
pub struct RestartReport {
    pub service: String,
    pub strategy_used: Strategy,
    pub attempts: Vec<StrategyAttempt>,
}

impl RestartReport {
    /// False when the restart relies on a supervisor after `pkill`
    pub fn verified(&self) -> bool {
        self.strategy_used.is_verified()
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid service name '{0}'")]
    InvalidName(String),

    #[error("all restart strategies failed for '{service}'")]
    AllStrategiesFailed {
        service: String,
        attempts: Vec<StrategyAttempt>,
    },
}

impl ServiceError {
    pub fn severity(&self) -> Severity {
        match self {
            ServiceError::InvalidName(_) => Severity::Failed,
            ServiceError::AllStrategiesFailed { .. } => Severity::ManualInterventionRequired,
        }
    }
}

pub struct ServiceController {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    known: Vec<KnownService>,
}

impl ServiceController {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &CommandsConfig, known: Vec<KnownService>) -> Self {
        Self {
            runner,
            timeout: Duration::from_secs(config.service_timeout_secs),
            known,
        }
    }

    /// Services offered to the operator, in configured order
    pub fn known_services(&self) -> &[KnownService] {
        &self.known
    }

    pub async fn restart(&self, service: &str) -> Result<RestartReport, ServiceError> {
        let service = service.trim();
        if service.is_empty() || service.starts_with('-') || service.chars().any(char::is_control) {
            return Err(ServiceError::InvalidName(service.to_string()));
        }
        info!(service = %service, "Restarting service");

        let mut attempts = Vec::with_capacity(Strategy::ORDER.len());
        for strategy in Strategy::ORDER {
            let outcome = self
                .runner
                .run(CommandRequest::direct(strategy.argv(service), self.timeout))
                .await;

            let attempt = StrategyAttempt {
                strategy,
                output: outcome.output,
                error: outcome.error,
            };
            let succeeded = attempt.success();
            if let Some(e) = &attempt.error {
                warn!(service = %service, strategy = %strategy, "Restart strategy failed: {}", e);
            }
            attempts.push(attempt);

            if succeeded {
                info!(service = %service, strategy = %strategy, "Service restart succeeded");
                return Ok(RestartReport {
                    service: service.to_string(),
                    strategy_used: strategy,
                    attempts,
                });
            }
        }

        Err(ServiceError::AllStrategiesFailed {
            service: service.to_string(),
            attempts,
        })
    }
}
