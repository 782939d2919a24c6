// kiln-aio/src/fs.rs
//! Primitive synchronous filesystem operations.
use std::fs::{self, Permissions};
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_common::error::{KilnError, Result};
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

/// Creates a directory and all its parent components if they are missing.
pub fn create_dir_all(path: &Path) -> Result<()> {
    debug!("Creating directory recursively: {}", path.display());
    fs::create_dir_all(path).map_err(|e| {
        error!("Failed create dir {}: {}", path.display(), e);
        KilnError::from(e)
    })
}

/// Removes a directory tree. A missing directory is not an error.
pub fn remove_directory_recursive(path: &Path) -> Result<()> {
    debug!("Removing directory recursively: {}", path.display());
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            error!("Failed remove dir_all {}: {}", path.display(), e);
            Err(KilnError::from(e))
        }
    }
}

/// Creates (or replaces) the symbolic link `link` pointing at `target`.
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    debug!("Creating symlink {} -> {}", link.display(), target.display());
    if let Some(parent) = link.parent() {
        create_dir_all(parent)?;
    }
    if link.symlink_metadata().is_ok() {
        if link.is_dir() && !link.is_symlink() {
            return Err(KilnError::IoError(format!(
                "Refusing to replace directory {} with a symlink",
                link.display()
            )));
        }
        fs::remove_file(link)?;
    }
    symlink(target, link).map_err(|e| {
        error!(
            "Failed create symlink {} -> {}: {}",
            link.display(),
            target.display(),
            e
        );
        KilnError::from(e)
    })
}

#[cfg(not(unix))]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    warn!(
        "Symlink creation not supported on this platform: {} -> {}",
        link.display(),
        target.display()
    );
    Err(KilnError::Generic(
        "Symlinks not supported on this platform".to_string(),
    ))
}

/// Sets file permissions (Unix only). Mode is standard Unix octal mode.
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    debug!("Setting permissions on {}: {:o}", path.display(), mode);
    fs::set_permissions(path, Permissions::from_mode(mode)).map_err(|e| {
        error!("Failed set permissions on {}: {}", path.display(), e);
        KilnError::from(e)
    })
}

#[cfg(not(unix))]
pub fn set_permissions(path: &Path, _mode: u32) -> Result<()> {
    warn!(
        "Setting permissions not fully supported on this platform: {}",
        path.display()
    );
    Ok(())
}

/// Copies a regular file, creating the destination's parent directories.
pub fn copy_file(from: &Path, to: &Path) -> Result<u64> {
    debug!("Copying {} -> {}", from.display(), to.display());
    if let Some(parent) = to.parent() {
        create_dir_all(parent)?;
    }
    fs::copy(from, to).map_err(KilnError::from)
}

/// A write that has reached disk in a temporary file next to its target but has not replaced
/// the target yet. Dropping it without `commit` discards the temporary file and leaves the
/// target untouched.
#[derive(Debug)]
pub struct StagedWrite {
    temp_file: NamedTempFile,
    target: PathBuf,
    original_perms: Option<Permissions>,
}

impl StagedWrite {
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_file.path()
    }

    /// Renames the temporary file over the target.
    pub fn commit(self) -> Result<()> {
        let temp_path = self.temp_file.path().to_path_buf();
        self.temp_file.persist(&self.target).map_err(|e| {
            error!(
                "Failed to persist temporary file {} over {}: {}",
                temp_path.display(),
                self.target.display(),
                e.error
            );
            KilnError::Io(Arc::new(e.error))
        })?;

        match self.original_perms {
            Some(perms) => {
                if let Err(e) = fs::set_permissions(&self.target, perms) {
                    warn!(
                        "Failed to restore original permissions on {}: {}",
                        self.target.display(),
                        e
                    );
                }
            }
            None => {
                if let Err(e) = set_permissions(&self.target, 0o644) {
                    warn!(
                        "Failed to set default permissions on new file {}: {}",
                        self.target.display(),
                        e
                    );
                }
            }
        }
        Ok(())
    }
}

/// Writes `content` to a synced temporary file in the target's directory.
pub fn stage_atomic_write(target: &Path, content: &[u8]) -> Result<StagedWrite> {
    let dir = target.parent().ok_or_else(|| {
        KilnError::IoError(format!(
            "Cannot get parent directory for {}",
            target.display()
        ))
    })?;
    create_dir_all(dir)?;

    let original_perms = fs::metadata(target).map(|m| m.permissions()).ok();
    let mut temp_file = NamedTempFile::new_in(dir)?;
    debug!(
        "Staging {} bytes for {} in {}",
        content.len(),
        target.display(),
        temp_file.path().display()
    );
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;

    Ok(StagedWrite {
        temp_file,
        target: target.to_path_buf(),
        original_perms,
    })
}

/// Atomically replaces `target` with `content`. Readers observe either the old or the new
/// content, never a partial write.
pub fn atomic_write_file(target: &Path, content: &[u8]) -> Result<()> {
    stage_atomic_write(target, content)?.commit()
}
