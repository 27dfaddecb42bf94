use std::path::Path;

use time::OffsetDateTime;
use walkdir::WalkDir;

use super::paths::snapshot_path_for;
use super::snapshot::{Entry, Snapshot};

/// Walks everything below `root` (the root itself excluded). Entries that
/// cannot be read are logged and left out.
pub fn scan_local_tree(root: &Path) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for item in WalkDir::new(root).min_depth(1) {
        let item = match item {
            Ok(item) => item,
            Err(err) => {
                tracing::warn!(%err, "skipping unreadable local entry");
                continue;
            }
        };
        let Some(path) = snapshot_path_for(root, item.path()) else {
            continue;
        };
        let file_type = item.file_type();
        if file_type.is_dir() {
            snapshot.insert(Entry::folder(path));
        } else if file_type.is_file() {
            let metadata = match item.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    tracing::warn!(path = %path, %err, "skipping local file without metadata");
                    continue;
                }
            };
            let modified = match metadata.modified() {
                Ok(modified) => OffsetDateTime::from(modified),
                Err(err) => {
                    tracing::warn!(path = %path, %err, "skipping local file without mtime");
                    continue;
                }
            };
            snapshot.insert(Entry::file(path, modified, metadata.len(), None));
        } else {
            tracing::debug!(path = %path, "skipping special local entry");
        }
    }
    snapshot
}
