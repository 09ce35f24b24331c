//! Storage directory setup
//!
//! Creates `$HOME/<storage_dir>` and points `$HOME/server` at it.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Name of the convenience link created in the home directory
const LINK_NAME: &str = "server";

/// Prepare the storage directory under the user's home. Returns its full path.
pub fn prepare_storage(storage_dir: &Path) -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    prepare_storage_in(&home, storage_dir)
}

pub fn prepare_storage_in(home: &Path, storage_dir: &Path) -> Result<PathBuf> {
    let full_path = home.join(storage_dir);
    std::fs::create_dir_all(&full_path)
        .with_context(|| format!("Failed to create storage directory {}", full_path.display()))?;

    let link = home.join(LINK_NAME);
    if let Err(e) = replace_link(&full_path, &link) {
        warn!("Couldn't create symlink {}: {}", link.display(), e);
    } else {
        info!("Storage ready at {} (linked from {})", full_path.display(), link.display());
    }
    Ok(full_path)
}

#[cfg(unix)]
fn replace_link(target: &Path, link: &Path) -> std::io::Result<()> {
    if let Ok(meta) = std::fs::symlink_metadata(link) {
        if meta.file_type().is_symlink() || meta.is_file() {
            std::fs::remove_file(link)?;
        } else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "a directory is in the way",
            ));
        }
    }
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn replace_link(_target: &Path, _link: &Path) -> std::io::Result<()> {
    Ok(())
}
