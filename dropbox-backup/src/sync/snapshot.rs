use std::collections::BTreeMap;
use std::collections::btree_map;

use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Folder,
    File {
        modified: OffsetDateTime,
        size: u64,
        /// Only known for remote files; local files are hashed on demand.
        content_hash: Option<String>,
    },
}

/// One file or folder, keyed in a [`Snapshot`] by its case-folded path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub kind: EntryKind,
}

impl Entry {
    pub fn folder(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Folder,
        }
    }

    pub fn file(
        path: impl Into<String>,
        modified: OffsetDateTime,
        size: u64,
        content_hash: Option<String>,
    ) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File {
                modified,
                size,
                content_hash,
            },
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.kind, EntryKind::Folder)
    }

    pub fn modified(&self) -> Option<OffsetDateTime> {
        match &self.kind {
            EntryKind::File { modified, .. } => Some(*modified),
            EntryKind::Folder => None,
        }
    }

    pub fn content_hash(&self) -> Option<&str> {
        match &self.kind {
            EntryKind::File { content_hash, .. } => content_hash.as_deref(),
            EntryKind::Folder => None,
        }
    }

    pub fn key(&self) -> String {
        normalize_key(&self.path)
    }
}

/// Storage providers compare paths case-insensitively.
pub fn normalize_key(path: &str) -> String {
    path.to_lowercase()
}

/// Point-in-time view of one side of the backup. Iteration follows key order,
/// so a folder is always visited before anything nested under it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<String, Entry>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: Entry) -> Option<Entry> {
        self.entries.insert(entry.key(), entry)
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn get_by_path(&self, path: &str) -> Option<&Entry> {
        self.entries.get(&normalize_key(path))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove_path(&mut self, path: &str) -> Option<Entry> {
        self.entries.remove(&normalize_key(path))
    }

    /// Moves the entry at `old_path` under the key of `new_path`.
    pub fn rekey(&mut self, old_path: &str, new_path: &str) -> bool {
        let Some(mut entry) = self.remove_path(old_path) else {
            return false;
        };
        entry.path = new_path.to_string();
        self.insert(entry);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Entry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> btree_map::Values<'_, String, Entry> {
        self.entries.values()
    }
}

impl FromIterator<Entry> for Snapshot {
    fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
        let mut snapshot = Snapshot::new();
        for entry in iter {
            snapshot.insert(entry);
        }
        snapshot
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = (&'a String, &'a Entry);
    type IntoIter = btree_map::Iter<'a, String, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
