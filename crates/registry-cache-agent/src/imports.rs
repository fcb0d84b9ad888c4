//! containerd `imports` precondition
//!
//! Fragments in the imports directory only take effect when the base
//! configuration lists that directory. The edit goes through `toml_edit` so
//! the rest of the file keeps its comments and layout.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use toml_edit::{Array, DocumentMut};
use tracing::info;

use crate::fragment::{write_atomic, WriteError};

const IMPORTS_KEY: &str = "imports";

#[derive(Debug, Error)]
pub enum ImportsError {
    #[error("runtime configuration {0} does not exist")]
    MissingConfig(PathBuf),

    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml_edit::TomlError,
    },

    #[error("`imports` in {0} is not an array")]
    NotAnArray(PathBuf),

    #[error("`imports` in {0} holds a value that is not a string")]
    NotAString(PathBuf),

    #[error(transparent)]
    Write(#[from] WriteError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportsChange {
    Unchanged,
    /// The file had no `imports` key
    Added,
    /// The glob was put in front of the existing entries
    Prepended,
}

impl ImportsChange {
    pub fn changed(self) -> bool {
        self != ImportsChange::Unchanged
    }
}

/// Make sure the base configuration at `config_path` imports `glob`
pub fn ensure_imports(config_path: &Path, glob: &str) -> Result<ImportsChange, ImportsError> {
    let original = match fs::read_to_string(config_path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ImportsError::MissingConfig(config_path.to_path_buf()));
        }
        Err(source) => {
            return Err(ImportsError::Read {
                path: config_path.to_path_buf(),
                source,
            });
        }
    };

    let mut doc: DocumentMut = original.parse().map_err(|source| ImportsError::Parse {
        path: config_path.to_path_buf(),
        source,
    })?;

    let change = add_import(&mut doc, glob, config_path)?;
    if change.changed() {
        write_atomic(config_path, doc.to_string().as_bytes())?;
        info!(
            path = %config_path.display(),
            glob,
            change = ?change,
            "Updated runtime configuration imports"
        );
    }

    Ok(change)
}

fn add_import(
    doc: &mut DocumentMut,
    glob: &str,
    config_path: &Path,
) -> Result<ImportsChange, ImportsError> {
    let Some(item) = doc.get_mut(IMPORTS_KEY) else {
        let mut imports = Array::new();
        imports.push(glob);
        doc.insert(IMPORTS_KEY, toml_edit::value(imports));
        return Ok(ImportsChange::Added);
    };

    let imports = item
        .as_array_mut()
        .ok_or_else(|| ImportsError::NotAnArray(config_path.to_path_buf()))?;

    let mut present = false;
    for entry in imports.iter() {
        let entry = entry
            .as_str()
            .ok_or_else(|| ImportsError::NotAString(config_path.to_path_buf()))?;
        present |= entry == glob;
    }

    if present {
        return Ok(ImportsChange::Unchanged);
    }
    imports.insert(0, glob);
    Ok(ImportsChange::Prepended)
}
