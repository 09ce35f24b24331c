//! Battery telemetry from the Termux API

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::execution::{CommandRequest, CommandRunner};

/// Plug states reported while a charger is attached
const CHARGING_PLUGS: &[&str] = &["PLUGGED_AC", "PLUGGED_USB", "PLUGGED_WIRELESS", "PLUGGED_DOCK"];

/// One battery sample, as printed by `termux-battery-status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryReading {
    pub percentage: f64,
    #[serde(default)]
    pub plugged: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub health: String,
}

impl BatteryReading {
    /// True when on any charging source
    pub fn is_charging(&self) -> bool {
        CHARGING_PLUGS.contains(&self.plugged.as_str()) || self.status == "CHARGING"
    }

    pub fn is_low(&self, threshold: f64) -> bool {
        self.percentage < threshold
    }

    /// Parse sensor output. Diagnostics printed around the JSON object (the
    /// runner merges stderr into the output) are ignored.
    pub fn parse(raw: &str) -> Result<Self, SensorError> {
        let object = match (raw.find('{'), raw.rfind('}')) {
            (Some(start), Some(end)) if start < end => &raw[start..=end],
            _ => raw,
        };
        serde_json::from_str(object).map_err(|e| SensorError::Parse(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("battery sensor unavailable: {0}")]
    Unavailable(String),

    #[error("unparsable battery telemetry: {0}")]
    Parse(String),
}

#[async_trait]
pub trait BatterySensor: Send + Sync {
    async fn read(&self) -> Result<BatteryReading, SensorError>;
}

/// Queries the sensor command through the shared runner
pub struct TermuxBatterySensor {
    runner: Arc<dyn CommandRunner>,
    command: String,
    timeout: Duration,
}

impl TermuxBatterySensor {
    pub fn new(runner: Arc<dyn CommandRunner>, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            command: command.into(),
            timeout,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl BatterySensor for TermuxBatterySensor {
    async fn read(&self) -> Result<BatteryReading, SensorError> {
        let outcome = self
            .runner
            .run(CommandRequest::new(&self.command, self.timeout))
            .await;
        if let Some(error) = outcome.error {
            let detail = outcome.output.trim();
            return Err(SensorError::Unavailable(if detail.is_empty() {
                error.to_string()
            } else {
                format!("{}: {}", error, detail)
            }));
        }
        BatteryReading::parse(&outcome.output)
    }
}
