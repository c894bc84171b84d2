//! Versioned component snapshots.
//!
//! Components persist an explicit snapshot structure (not their whole
//! object graph) to a statefile for crash recovery. The envelope carries a
//! format version and the owning component name; both are checked on load
//! so a daemon never starts from a statefile it cannot interpret.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TorusError};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    component: String,
    saved_at: DateTime<Utc>,
    data: T,
}

/// Write a snapshot atomically (temp file in the same directory + rename).
///
/// # Errors
///
/// Returns an IO error if the statefile or its directory is not writable,
/// or a JSON error if the data cannot be serialized.
pub fn save<T: Serialize>(path: &Path, component: &str, data: &T) -> Result<()> {
    let envelope = Envelope {
        version: SNAPSHOT_VERSION,
        component: component.to_string(),
        saved_at: Utc::now(),
        data,
    };
    let content = serde_json::to_vec(&envelope)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a snapshot, returning `None` when the statefile does not exist.
///
/// # Errors
///
/// Returns a snapshot error on a version mismatch, on a statefile owned by
/// a different component, or on undecodable content.
pub fn load<T: DeserializeOwned>(path: &Path, component: &str) -> Result<Option<T>> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let envelope: Envelope<T> = serde_json::from_slice(&content)
        .map_err(|e| TorusError::Snapshot(format!("{}: {}", path.display(), e)))?;

    if envelope.version != SNAPSHOT_VERSION {
        return Err(TorusError::Snapshot(format!(
            "{}: version {} but this daemon writes version {}",
            path.display(),
            envelope.version,
            SNAPSHOT_VERSION
        )));
    }
    if envelope.component != component {
        return Err(TorusError::Snapshot(format!(
            "{}: statefile belongs to component {:?}, not {:?}",
            path.display(),
            envelope.component,
            component
        )));
    }
    Ok(Some(envelope.data))
}
