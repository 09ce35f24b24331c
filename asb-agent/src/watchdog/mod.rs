//! Battery health watchdog
//!
//! Polls the battery sensor on a fixed interval and raises one alert per
//! low-battery episode:
//! - Normal -> Alerted: below threshold, not charging, alert delivered
//! - Alerted -> Normal: at/above threshold or charging, silently
//! - A failed delivery leaves the latch down so the next poll retries
//! - A failed poll changes nothing
//!
//! The latch is written only by the polling task and read by status queries.

pub mod battery;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use battery::{BatteryReading, BatterySensor, SensorError};

/// Payload of a low battery alert
#[derive(Debug, Clone, PartialEq)]
pub struct LowBatteryAlert {
    pub percentage: f64,
    pub temperature: f64,
    pub status: String,
    pub threshold: f64,
}

/// Delivers alerts to the fixed admin recipient
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(&self, alert: &LowBatteryAlert) -> anyhow::Result<()>;
}

/// What a single poll did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    AlertSent,
    AlertFailed,
    Recovered,
    Unchanged,
    SensorFailed,
}

/// Read-only snapshot for the status query
#[derive(Debug, Clone)]
pub struct WatchdogStatus {
    pub uptime: Duration,
    pub interval: Duration,
    pub alerted: bool,
    pub last_reading: Option<(BatteryReading, DateTime<Utc>)>,
}

/// State shared between the polling task and status queries
struct WatchdogState {
    interval: Duration,
    started: Instant,
    alerted: AtomicBool,
    last_reading: Mutex<Option<(BatteryReading, DateTime<Utc>)>>,
}

impl WatchdogState {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            started: Instant::now(),
            alerted: AtomicBool::new(false),
            last_reading: Mutex::new(None),
        }
    }

    fn status(&self) -> WatchdogStatus {
        WatchdogStatus {
            uptime: self.started.elapsed(),
            interval: self.interval,
            alerted: self.alerted.load(Ordering::Acquire),
            last_reading: self.last_reading.lock().clone(),
        }
    }
}

pub struct HealthWatchdog {
    state: Arc<WatchdogState>,
    sensor: Arc<dyn BatterySensor>,
    sink: Arc<dyn AlertSink>,
    threshold: f64,
}

impl HealthWatchdog {
    pub fn new(
        sensor: Arc<dyn BatterySensor>,
        sink: Arc<dyn AlertSink>,
        interval: Duration,
        threshold: f64,
    ) -> Self {
        Self {
            state: Arc::new(WatchdogState::new(interval)),
            sensor,
            sink,
            threshold,
        }
    }

    /// Snapshot of uptime, interval and latch; never polls
    pub fn status(&self) -> WatchdogStatus {
        self.state.status()
    }

    /// On-demand battery reading; leaves the latch alone
    pub async fn battery_now(&self) -> Result<BatteryReading, SensorError> {
        self.sensor.read().await
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// One poll step of the state machine
    pub async fn poll_once(&self) -> PollOutcome {
        let reading = match self.sensor.read().await {
            Ok(reading) => reading,
            Err(e) => {
                warn!("Failed to get battery status: {}", e);
                return PollOutcome::SensorFailed;
            }
        };
        *self.state.last_reading.lock() = Some((reading.clone(), Utc::now()));

        let low = reading.is_low(self.threshold) && !reading.is_charging();
        let alerted = self.state.alerted.load(Ordering::Acquire);
        debug!(
            "Battery poll: {:.1}% (charging: {}, alerted: {})",
            reading.percentage,
            reading.is_charging(),
            alerted
        );

        match (low, alerted) {
            (true, false) => {
                let alert = LowBatteryAlert {
                    percentage: reading.percentage,
                    temperature: reading.temperature,
                    status: reading.status.clone(),
                    threshold: self.threshold,
                };
                match self.sink.send_alert(&alert).await {
                    Ok(()) => {
                        info!("Sent low battery alert: {:.1}%", reading.percentage);
                        self.state.alerted.store(true, Ordering::Release);
                        PollOutcome::AlertSent
                    }
                    Err(e) => {
                        error!("Failed to send battery alert: {:#}", e);
                        PollOutcome::AlertFailed
                    }
                }
            }
            (false, true) => {
                info!("Battery recovered: {:.1}%", reading.percentage);
                self.state.alerted.store(false, Ordering::Release);
                PollOutcome::Recovered
            }
            _ => PollOutcome::Unchanged,
        }
    }

    /// Start the periodic polling task. The first poll happens one interval
    /// after start.
    pub fn spawn(self: Arc<Self>) -> WatchdogHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let period = self.state.interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Watchdog started with interval: {:?}", period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.poll_once().await;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Watchdog stopped");
        });

        WatchdogHandle { stop_tx, task }
    }
}

/// Owner of the polling task
pub struct WatchdogHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatchdogHandle {
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            error!("Watchdog task ended abnormally: {}", e);
        }
    }
}
