use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use super::content_hash::content_hash_file;
use super::paths::local_path_for;
use super::snapshot::{EntryKind, Snapshot};

/// What has to happen to the local tree so that it matches the remote one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Remote display paths to fetch, files and folders, in remote key order.
    pub downloads: Vec<String>,
    /// Local display paths to delete.
    pub removals: Vec<String>,
    /// Local path -> remote display path for content that only changed location.
    pub moves: BTreeMap<String, String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty() && self.removals.is_empty() && self.moves.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} to move, {} to remove, and {} to download",
            self.moves.len(),
            self.removals.len(),
            self.downloads.len()
        )
    }
}

/// Classifies every path of both snapshots into download / remove / keep, then
/// turns download+remove pairs with identical content into local moves.
///
/// Local files pending removal are hashed from disk, so this reads file
/// contents under `local_root` but never modifies anything. Unreadable files
/// simply stay in the removal list.
pub fn reconcile(remote: &Snapshot, local: &Snapshot, local_root: &Path) -> Plan {
    let mut satisfied: HashSet<&str> = HashSet::new();
    let mut removals = Vec::new();

    for (key, local_entry) in local {
        let Some(remote_entry) = remote.get(key) else {
            removals.push(local_entry.path.clone());
            continue;
        };
        match (&local_entry.kind, &remote_entry.kind) {
            (EntryKind::Folder, _) => {
                satisfied.insert(key.as_str());
            }
            (
                EntryKind::File {
                    modified: local_modified,
                    ..
                },
                EntryKind::File {
                    modified: remote_modified,
                    ..
                },
            ) => {
                if remote_modified <= local_modified {
                    satisfied.insert(key.as_str());
                }
            }
            (EntryKind::File { .. }, EntryKind::Folder) => {
                tracing::warn!(
                    path = %local_entry.path,
                    "local file shadows a remote folder; folder creation will fail until it is removed"
                );
            }
        }
    }

    let mut downloads: Vec<&str> = remote
        .iter()
        .map(|(key, _)| key.as_str())
        .filter(|key| !satisfied.contains(key))
        .collect();
    tracing::debug!(
        downloads = downloads.len(),
        removals = removals.len(),
        "classified snapshots"
    );

    let mut moves = BTreeMap::new();
    if !removals.is_empty() {
        let mut by_hash: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut candidate_sizes: HashSet<u64> = HashSet::new();
        for key in &downloads {
            let Some(entry) = remote.get(key) else {
                continue;
            };
            if let EntryKind::File {
                size,
                content_hash: Some(hash),
                ..
            } = &entry.kind
            {
                by_hash.entry(hash.as_str()).or_default().push(*key);
                candidate_sizes.insert(*size);
            }
        }

        let mut moved: HashSet<&str> = HashSet::new();
        let pending = std::mem::take(&mut removals);
        for path in pending {
            let matched = if by_hash.is_empty() {
                None
            } else {
                match_moved_file(&path, local_root, &candidate_sizes, &mut by_hash)
            };
            match matched {
                Some(remote_key) => {
                    if let Some(target) = remote.get(remote_key) {
                        tracing::debug!(from = %path, to = %target.path, "detected move");
                        moves.insert(path, target.path.clone());
                        moved.insert(remote_key);
                    } else {
                        removals.push(path);
                    }
                }
                None => removals.push(path),
            }
        }
        downloads.retain(|key| !moved.contains(key));
    }

    Plan {
        downloads: downloads
            .into_iter()
            .filter_map(|key| remote.get(key).map(|entry| entry.path.clone()))
            .collect(),
        removals,
        moves,
    }
}

/// Pops one remote candidate whose content hash equals the on-disk content of
/// `path`. Each candidate is handed out at most once.
fn match_moved_file<'a>(
    path: &str,
    local_root: &Path,
    candidate_sizes: &HashSet<u64>,
    by_hash: &mut HashMap<&str, Vec<&'a str>>,
) -> Option<&'a str> {
    let local_path = local_path_for(local_root, path).ok()?;
    let metadata = std::fs::metadata(&local_path).ok()?;
    if !metadata.is_file() || !candidate_sizes.contains(&metadata.len()) {
        return None;
    }
    let hash = match content_hash_file(&local_path) {
        Ok(hash) => hash,
        Err(err) => {
            tracing::debug!(path, %err, "skipping move detection for unreadable file");
            return None;
        }
    };
    by_hash.get_mut(hash.as_str())?.pop()
}
