use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;

use super::snapshot::{EntryKind, Snapshot};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("time format error: {0}")]
    Time(#[from] time::error::Format),
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedEntry {
    pub path: String,
    pub is_folder: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// Writes a listing to disk for inspection between runs. Nothing reads it
/// back during reconciliation.
pub fn save_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), CacheError> {
    let mut entries = Vec::with_capacity(snapshot.len());
    for entry in snapshot.entries() {
        entries.push(match &entry.kind {
            EntryKind::Folder => CachedEntry {
                path: entry.path.clone(),
                is_folder: true,
                client_modified: None,
                size: None,
                content_hash: None,
            },
            EntryKind::File {
                modified,
                size,
                content_hash,
            } => CachedEntry {
                path: entry.path.clone(),
                is_folder: false,
                client_modified: Some(modified.format(&Rfc3339)?),
                size: Some(*size),
                content_hash: content_hash.clone(),
            },
        });
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(&entries)?)?;
    Ok(())
}
