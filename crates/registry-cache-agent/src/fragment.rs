//! Atomic file updates on the host filesystem
//!
//! containerd may read the imports directory at any time, so a fragment is
//! written next to its target and renamed into place. A reader sees either
//! the old content or the new one, never a partial file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to create directory {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create temporary file for {target}")]
    TempFile {
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {target}")]
    Write {
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to sync {target}")]
    Sync {
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to set permissions on {target}")]
    Permissions {
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to rename {from} to {to}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Read the content currently applied at `path`, `None` when absent
pub fn read_applied(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Replace `target` with `content` through a sibling temporary file
pub fn write_atomic(target: &Path, content: &[u8]) -> Result<(), WriteError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|source| WriteError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let temp_path = temp_path_for(target);
    let result = write_temp(&temp_path, target, content).and_then(|()| {
        fs::rename(&temp_path, target).map_err(|source| WriteError::Rename {
            from: temp_path.clone(),
            to: target.to_path_buf(),
            source,
        })
    });

    if let Err(e) = result {
        if let Err(cleanup) = fs::remove_file(&temp_path) {
            if cleanup.kind() != io::ErrorKind::NotFound {
                warn!(path = %temp_path.display(), error = %cleanup, "Failed to remove temporary file");
            }
        }
        return Err(e);
    }

    debug!(path = %target.display(), bytes = content.len(), "Wrote file atomically");
    Ok(())
}

fn write_temp(temp_path: &Path, target: &Path, content: &[u8]) -> Result<(), WriteError> {
    let mut file = fs::File::create(temp_path).map_err(|source| WriteError::TempFile {
        target: target.to_path_buf(),
        source,
    })?;

    file.write_all(content)
        .map_err(|source| WriteError::Write {
            target: target.to_path_buf(),
            source,
        })?;

    file.sync_all().map_err(|source| WriteError::Sync {
        target: target.to_path_buf(),
        source,
    })?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(temp_path, fs::Permissions::from_mode(0o644)).map_err(|source| {
            WriteError::Permissions {
                target: target.to_path_buf(),
                source,
            }
        })?;
    }
    Ok(())
}

// Hidden and without a .toml suffix, so the imports glob never matches it
fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.tmp"))
}
