//! System status collection
//!
//! Provides the `/status` snapshot:
//! - Hostname and system uptime
//! - Free space on the partition holding the storage directory
//! - Current battery reading

use std::path::{Path, PathBuf};
use sysinfo::{Disks, System};
use tracing::debug;

use crate::watchdog::battery::{BatteryReading, BatterySensor, SensorError};

/// Space on one mounted filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpace {
    pub mount_point: PathBuf,
    pub available_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub hostname: String,
    pub uptime_seconds: u64,
    pub storage: Option<DiskSpace>,
    pub battery: Result<BatteryReading, SensorError>,
}

pub struct SystemMonitor {
    storage_path: PathBuf,
}

impl SystemMonitor {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
        }
    }

    /// Collect a status snapshot. Sensor failures are reported, not raised.
    pub async fn snapshot(&self, sensor: &dyn BatterySensor) -> SystemStatus {
        debug!("Collecting system status...");

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        SystemStatus {
            hostname,
            uptime_seconds: System::uptime(),
            storage: self.storage_space(),
            battery: sensor.read().await,
        }
    }

    fn storage_space(&self) -> Option<DiskSpace> {
        let path = self
            .storage_path
            .canonicalize()
            .unwrap_or_else(|_| self.storage_path.clone());
        let disks = Disks::new_with_refreshed_list();
        let mount = deepest_mount(&path, disks.list().iter().map(|d| d.mount_point()))?;

        disks
            .list()
            .iter()
            .find(|d| d.mount_point() == mount)
            .map(|d| DiskSpace {
                mount_point: d.mount_point().to_path_buf(),
                available_bytes: d.available_space(),
                total_bytes: d.total_space(),
            })
    }
}

/// The mount point that contains `path` with the longest prefix
fn deepest_mount<'a>(path: &Path, mounts: impl Iterator<Item = &'a Path>) -> Option<&'a Path> {
    mounts
        .filter(|mount| path.starts_with(mount))
        .max_by_key(|mount| mount.components().count())
}
