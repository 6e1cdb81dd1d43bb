//! The on-disk registry document.
//!
//! A single JSON file holding the ordered record list. Writes go to a
//! sibling staging file that is then renamed over the document, so a crash
//! mid-save leaves the previous checkpoint intact.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::StoreError;
use crate::download::RecordSnapshot;

/// Current document format.
const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    version: u32,
    records: Vec<RecordSnapshot>,
}

/// What was found at the document path.
#[derive(Debug)]
pub(crate) enum Loaded {
    /// A readable document.
    Records(Vec<RecordSnapshot>),
    /// No document, or an empty one.
    Missing,
    /// A document that could not be decoded; it was moved aside.
    Corrupt,
}

/// Reads the registry document at `path`.
///
/// Absent, blank and undecodable documents are not errors. An undecodable
/// one is renamed to `<name>.corrupt` so the next save does not destroy it.
pub(crate) fn read(path: &Path) -> Result<Loaded, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Loaded::Missing);
    }

    match serde_json::from_slice::<Document>(&bytes) {
        Ok(document) => {
            if document.version != DOCUMENT_VERSION {
                warn!(
                    path = %path.display(),
                    version = document.version,
                    "unexpected registry document version, reading anyway"
                );
            }
            Ok(Loaded::Records(document.records))
        }
        Err(error) => {
            let backup = sibling(path, "corrupt");
            warn!(
                path = %path.display(),
                backup = %backup.display(),
                error = %error,
                "registry document is unreadable, starting empty"
            );
            if let Err(e) = std::fs::rename(path, &backup) {
                warn!(error = %e, "could not move unreadable registry document aside");
            }
            Ok(Loaded::Corrupt)
        }
    }
}

/// Writes `records` to `path` through a staging file.
pub(crate) fn write(path: &Path, records: Vec<RecordSnapshot>) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let document = Document {
        version: DOCUMENT_VERSION,
        records,
    };
    let json = serde_json::to_vec_pretty(&document).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;

    let staging = sibling(path, "partial");
    std::fs::write(&staging, json).map_err(|e| StoreError::io(&staging, e))?;
    std::fs::rename(&staging, path).map_err(|e| StoreError::io(path, e))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
