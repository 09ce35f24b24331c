//! Directory-tree snapshot and restore for the update flow

use chrono::Local;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Timestamped directory under `root` for a fresh backup
pub fn backup_path(root: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let mut path = root.join(format!("backup_{}", stamp));
    let mut n = 1;
    while path.exists() {
        path = root.join(format!("backup_{}_{}", stamp, n));
        n += 1;
    }
    path
}

/// Copy `source` into a new directory `target`.
///
/// Fails if `target` already exists. The target itself and anything at
/// `exclude` are skipped, so a backup root nested inside the working tree
/// never copies itself. Paths are compared after canonicalization. A failed
/// snapshot leaves nothing behind.
pub fn snapshot(source: &Path, target: &Path, exclude: Option<&Path>) -> io::Result<()> {
    if target.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", target.display()),
        ));
    }
    fs::create_dir_all(target)?;

    let result = fs::canonicalize(source).and_then(|source| {
        let mut skip = vec![fs::canonicalize(target)?];
        if let Some(exclude) = exclude.and_then(|path| fs::canonicalize(path).ok()) {
            skip.push(exclude);
        }
        copy_tree(&source, target, &skip)
    });
    if result.is_err() {
        let _ = fs::remove_dir_all(target);
    }
    result
}

/// Copy the backup contents back over the working tree, replacing files.
///
/// Existing files are removed before copying, so read-only files (git objects
/// and packs) are restored too. Files added to the tree after the backup are
/// left in place.
pub fn restore(backup: &Path, target: &Path) -> io::Result<()> {
    if !backup.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("backup {} is missing", backup.display()),
        ));
    }
    copy_tree(backup, target, &[])
}

fn copy_tree(source: &Path, target: &Path, skip: &[PathBuf]) -> io::Result<()> {
    if fs::symlink_metadata(target).is_ok_and(|meta| !meta.is_dir()) {
        fs::remove_file(target)?;
    }
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        if skip.contains(&from) {
            continue;
        }
        let to = target.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copy_tree(&from, &to, skip)?;
        } else {
            clear_destination(&to)?;
            if file_type.is_symlink() {
                copy_symlink(&from, &to)?;
            } else {
                fs::copy(&from, &to)?;
            }
        }
    }
    Ok(())
}

/// Remove whatever sits where a file is about to be written
fn clear_destination(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(from)?, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to).map(|_| ())
}
