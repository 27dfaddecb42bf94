use dropbox_core::{Account, DropboxClient, DropboxError, Metadata};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::backoff::Backoff;
use super::paths::{relative_to_remote_root, remote_path_for};
use super::snapshot::{Entry, Snapshot};

/// A Dropbox folder mirrored by this run. Snapshot paths are relative to it.
#[derive(Clone)]
pub struct RemoteTree {
    client: DropboxClient,
    root: String,
    backoff: Backoff,
    retries: u32,
}

impl RemoteTree {
    pub fn new(client: DropboxClient, root: impl Into<String>) -> Self {
        Self {
            client,
            root: root.into(),
            backoff: Backoff::default(),
            retries: 3,
        }
    }

    pub fn with_retries(mut self, backoff: Backoff, retries: u32) -> Self {
        self.backoff = backoff;
        self.retries = retries;
        self
    }

    pub fn client(&self) -> &DropboxClient {
        &self.client
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn remote_path(&self, snapshot_path: &str) -> String {
        remote_path_for(&self.root, snapshot_path)
    }

    pub async fn check_access(&self) -> Result<Account, DropboxError> {
        self.client.get_current_account().await
    }

    /// Lists the whole tree. Access is checked first so that a revoked token
    /// fails before a long listing starts.
    pub async fn snapshot(&self) -> Result<Snapshot, DropboxError> {
        self.check_access().await?;

        let mut snapshot = Snapshot::new();
        let mut page = self
            .backoff
            .retry(self.retries, "list_folder", || {
                self.client.list_folder(&self.root, true)
            })
            .await?;
        let mut pages = 1usize;
        loop {
            for metadata in std::mem::take(&mut page.entries) {
                if let Some(entry) = self.entry_from_metadata(metadata) {
                    snapshot.insert(entry);
                }
            }
            tracing::debug!(pages, entries = snapshot.len(), "listed remote page");
            if !page.has_more {
                break;
            }
            let cursor = page.cursor.clone();
            page = self
                .backoff
                .retry(self.retries, "list_folder/continue", || {
                    self.client.list_folder_continue(&cursor)
                })
                .await?;
            pages += 1;
        }
        tracing::info!(pages, entries = snapshot.len(), root = %self.root, "remote listing complete");
        Ok(snapshot)
    }

    fn entry_from_metadata(&self, metadata: Metadata) -> Option<Entry> {
        let display = metadata.path_display()?;
        let path = relative_to_remote_root(&self.root, display)?;
        match metadata {
            Metadata::Folder(_) => Some(Entry::folder(path)),
            Metadata::File(file) => {
                let modified = match parse_modified(&file.client_modified) {
                    Ok(modified) => modified,
                    Err(err) => {
                        tracing::warn!(path = %path, %err, "skipping remote file with bad timestamp");
                        return None;
                    }
                };
                Some(Entry::file(path, modified, file.size, file.content_hash))
            }
            Metadata::Deleted(_) => None,
        }
    }
}

pub fn parse_modified(value: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(value, &Rfc3339)
}
