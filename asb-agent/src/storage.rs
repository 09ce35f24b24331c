//! Operator file uploads
//!
//! Uploaded files land in the storage directory, marked executable.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid file name '{0}'")]
    InvalidName(String),

    #[error("failed to write {}: {}", .path.display(), .source)]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to set executable permissions on {}: {}", .path.display(), .source)]
    Permissions {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Strip any directory part the sender put in the name
pub fn sanitize_file_name(file_name: &str) -> Result<&str, StorageError> {
    let name = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty() || name == "." || name == ".." || name.chars().any(char::is_control) {
        return Err(StorageError::InvalidName(file_name.to_string()));
    }
    Ok(name)
}

/// Write `content` into `dir` and make it executable. Returns the full path.
pub async fn save_file(dir: &Path, file_name: &str, content: &[u8]) -> Result<PathBuf, StorageError> {
    let path = dir.join(sanitize_file_name(file_name)?);

    tokio::fs::write(&path, content)
        .await
        .map_err(|source| StorageError::Write {
            path: path.clone(),
            source,
        })?;
    make_executable(&path)
        .await
        .map_err(|source| StorageError::Permissions {
            path: path.clone(),
            source,
        })?;

    info!("Saved upload {} ({} bytes)", path.display(), content.len());
    Ok(path)
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
