//! Applies a [`Plan`](super::reconcile::Plan) to the local tree.
//!
//! Every phase isolates per-item failures and keeps going; only operator
//! cancellation and a rejected credential abort a phase.

use std::collections::BTreeMap;
use std::path::Path;

use dropbox_core::{DropboxError, Metadata};
use filetime::FileTime;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::paths::local_path_for;
use super::remote::RemoteTree;
use super::snapshot::{EntryKind, Snapshot};
use super::transfer::{TransferError, download_file, partial_path};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("cancelled by operator")]
    Cancelled,
    #[error("authentication failed, please issue a new access token: {0}")]
    Auth(#[source] DropboxError),
}

/// Moves that could not be applied, old path -> new path.
pub type MoveFailures = BTreeMap<String, String>;

/// Renames local files whose content reappeared elsewhere remotely. Deepest
/// paths go first so a parent rename never invalidates a pending child.
pub async fn apply_moves(
    moves: &BTreeMap<String, String>,
    local: &mut Snapshot,
    local_root: &Path,
    cancel: &CancellationToken,
) -> Result<MoveFailures, ExecutorError> {
    let mut failed = MoveFailures::new();
    let total = moves.len();
    for (index, (from, to)) in moves.iter().rev().enumerate() {
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        tracing::info!("moving [{}/{total}]: {from} -> {to}", index + 1);
        match move_one(from, to, local_root).await {
            Ok(()) => {
                local.rekey(from, to);
            }
            Err(err) => {
                tracing::warn!(from = %from, to = %to, %err, "move failed");
                failed.insert(from.clone(), to.clone());
            }
        }
    }
    Ok(failed)
}

/// Stamps successfully moved files with the remote modified time, so the next
/// run sees them as current instead of downloading identical content again.
pub fn stamp_moved_files(
    moves: &BTreeMap<String, String>,
    failed: &MoveFailures,
    remote: &Snapshot,
    local: &mut Snapshot,
    local_root: &Path,
) {
    for (from, to) in moves {
        if failed.contains_key(from) {
            continue;
        }
        let Some(modified) = remote.get_by_path(to).and_then(|entry| entry.modified()) else {
            continue;
        };
        let Ok(target) = local_path_for(local_root, to) else {
            continue;
        };
        let stamp = FileTime::from_unix_time(modified.unix_timestamp(), modified.nanosecond());
        if let Err(err) = filetime::set_file_mtime(&target, stamp) {
            tracing::warn!(path = %to, %err, "unable to stamp moved file");
            continue;
        }
        if let Some(mut entry) = local.remove_path(to) {
            if let EntryKind::File { modified: local_modified, .. } = &mut entry.kind {
                *local_modified = modified;
            }
            local.insert(entry);
        }
    }
}

async fn move_one(from: &str, to: &str, local_root: &Path) -> std::io::Result<()> {
    let source = local_path_for(local_root, from).map_err(std::io::Error::other)?;
    let target = local_path_for(local_root, to).map_err(std::io::Error::other)?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(&source, &target).await
}

/// Deletes local-only entries, children before parents. Directories are only
/// removed once empty; a non-empty one is reported, never forced.
pub async fn apply_removals(
    removals: &[String],
    local: &mut Snapshot,
    local_root: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<String>, ExecutorError> {
    let mut ordered = removals.to_vec();
    ordered.sort_unstable_by(|a, b| b.cmp(a));

    let mut failed = Vec::new();
    let total = ordered.len();
    for (index, path) in ordered.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        tracing::info!("removing [{}/{total}]: {path}", index + 1);
        match remove_one(&path, local, local_root).await {
            Ok(()) => {
                local.remove_path(&path);
            }
            Err(err) => {
                tracing::warn!(path = %path, %err, "removal failed");
                failed.push(path);
            }
        }
    }
    Ok(failed)
}

#[derive(Debug, Error)]
enum RemoveError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("not a file or directory on disk")]
    Missing,
    #[error("snapshot and disk disagree on entry kind")]
    KindMismatch,
}

async fn remove_one(path: &str, local: &Snapshot, local_root: &Path) -> Result<(), RemoveError> {
    let target = local_path_for(local_root, path).map_err(std::io::Error::other)?;
    let metadata = tokio::fs::symlink_metadata(&target)
        .await
        .map_err(|_| RemoveError::Missing)?;
    let expected_folder = local.get_by_path(path).map(|entry| entry.is_folder());
    if metadata.is_file() {
        if expected_folder == Some(true) {
            return Err(RemoveError::KindMismatch);
        }
        tokio::fs::remove_file(&target).await?;
    } else if metadata.is_dir() {
        if expected_folder == Some(false) {
            return Err(RemoveError::KindMismatch);
        }
        tokio::fs::remove_dir(&target).await?;
    } else {
        return Err(RemoveError::Missing);
    }
    Ok(())
}

/// Fetches every planned path in order. Folders are created locally, files
/// are streamed and stamped with the remote modified time.
pub async fn apply_downloads(
    downloads: &[String],
    remote: &RemoteTree,
    local_root: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<String>, ExecutorError> {
    let mut failed = Vec::new();
    let total = downloads.len();
    for (index, path) in downloads.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        tracing::info!("downloading [{}/{total}]: {path}", index + 1);
        match download_one(path, remote, local_root, cancel).await {
            Ok(()) => {}
            Err(DownloadError::Cancelled) => return Err(ExecutorError::Cancelled),
            Err(DownloadError::Transfer(TransferError::Api(err))) if err.is_auth() => {
                tracing::error!(path = %path, %err, "authentication rejected during download");
                return Err(ExecutorError::Auth(err));
            }
            Err(err) => {
                tracing::warn!(path = %path, %err, "download failed");
                failed.push(path.clone());
            }
        }
    }
    Ok(failed)
}

#[derive(Debug, Error)]
enum DownloadError {
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Transfer(#[from] TransferError),
    #[error("invalid local path: {0}")]
    Path(#[from] super::paths::PathError),
    #[error("remote entry was deleted")]
    Deleted,
}

impl From<DropboxError> for DownloadError {
    fn from(err: DropboxError) -> Self {
        DownloadError::Transfer(TransferError::Api(err))
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        DownloadError::Transfer(TransferError::Io(err))
    }
}

async fn download_one(
    path: &str,
    remote: &RemoteTree,
    local_root: &Path,
    cancel: &CancellationToken,
) -> Result<(), DownloadError> {
    let target = local_path_for(local_root, path)?;
    let remote_path = remote.remote_path(path);
    match remote.client().get_metadata(&remote_path).await? {
        Metadata::Folder(_) => {
            tokio::fs::create_dir_all(&target).await?;
            Ok(())
        }
        Metadata::File(_) => {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = tokio::fs::remove_file(partial_path(&target)).await;
                    tracing::warn!(path, "download interrupted, partial file removed");
                    Err(DownloadError::Cancelled)
                }
                result = download_file(remote.client(), &remote_path, &target) => {
                    result?;
                    Ok(())
                }
            }
        }
        Metadata::Deleted(_) => Err(DownloadError::Deleted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::content_hash::content_hash_bytes;
    use crate::sync::snapshot::Entry;
    use serde_json::json;
    use tempfile::tempdir;
    use time::OffsetDateTime;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn write(root: &Path, path: &str, content: &[u8]) -> Entry {
        let target = local_path_for(root, path).unwrap();
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, content).unwrap();
        Entry::file(path, OffsetDateTime::UNIX_EPOCH, content.len() as u64, None)
    }

    fn remote_tree(server: &MockServer, root: &str) -> RemoteTree {
        let client = dropbox_core::DropboxClient::with_base_urls(
            &server.uri(),
            &server.uri(),
            "test-token",
        )
        .unwrap();
        RemoteTree::new(client, root)
    }

    async fn mount_file(server: &MockServer, remote_path: &str, body: &[u8]) {
        let metadata = json!({
            ".tag": "file",
            "name": remote_path.rsplit('/').next().unwrap(),
            "path_display": remote_path,
            "client_modified": "2024-05-06T07:08:09Z",
            "size": body.len(),
            "content_hash": content_hash_bytes(body)
        });
        Mock::given(method("POST"))
            .and(path("/2/files/get_metadata"))
            .and(body_json(json!({ "path": remote_path })))
            .respond_with(ResponseTemplate::new(200).set_body_json(metadata.clone()))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/files/download"))
            .and(header(
                "dropbox-api-arg",
                json!({ "path": remote_path }).to_string().as_str(),
            ))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Dropbox-API-Result", metadata.to_string().as_str())
                    .set_body_bytes(body.to_vec()),
            )
            .mount(server)
            .await;
    }

    async fn mount_folder(server: &MockServer, remote_path: &str) {
        Mock::given(method("POST"))
            .and(path("/2/files/get_metadata"))
            .and(body_json(json!({ "path": remote_path })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                ".tag": "folder",
                "name": remote_path.rsplit('/').next().unwrap(),
                "path_display": remote_path
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn moves_files_and_rekeys_snapshot() {
        let dir = tempdir().unwrap();
        let mut local: Snapshot = [write(dir.path(), "/old/c.txt", b"content")]
            .into_iter()
            .collect();
        let moves = BTreeMap::from([("/old/c.txt".to_string(), "/b/c.txt".to_string())]);

        let failed = apply_moves(&moves, &mut local, dir.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(failed.is_empty());
        assert!(!dir.path().join("old/c.txt").exists());
        assert_eq!(std::fs::read(dir.path().join("b/c.txt")).unwrap(), b"content");
        assert!(local.get_by_path("/old/c.txt").is_none());
        assert_eq!(local.get("/b/c.txt").unwrap().path, "/b/c.txt");
    }

    #[tokio::test]
    async fn failed_move_is_reported_and_batch_continues() {
        let dir = tempdir().unwrap();
        let mut local: Snapshot = [write(dir.path(), "/a.txt", b"a")].into_iter().collect();
        let moves = BTreeMap::from([
            ("/a.txt".to_string(), "/moved/a.txt".to_string()),
            ("/missing.txt".to_string(), "/moved/missing.txt".to_string()),
        ]);

        let failed = apply_moves(&moves, &mut local, dir.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            failed,
            BTreeMap::from([("/missing.txt".to_string(), "/moved/missing.txt".to_string())])
        );
        assert!(dir.path().join("moved/a.txt").exists());
    }

    #[tokio::test]
    async fn cancelled_moves_abort_without_touching_files() {
        let dir = tempdir().unwrap();
        let mut local: Snapshot = [write(dir.path(), "/a.txt", b"a")].into_iter().collect();
        let moves = BTreeMap::from([("/a.txt".to_string(), "/b.txt".to_string())]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = apply_moves(&moves, &mut local, dir.path(), &cancel).await;

        assert!(matches!(result, Err(ExecutorError::Cancelled)));
        assert!(dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn removes_children_before_parents() {
        let dir = tempdir().unwrap();
        let mut local: Snapshot = [
            Entry::folder("/dir"),
            Entry::folder("/dir/sub"),
            write(dir.path(), "/dir/sub/x.txt", b"x"),
            write(dir.path(), "/y.txt", b"y"),
        ]
        .into_iter()
        .collect();
        let removals = vec![
            "/dir".to_string(),
            "/dir/sub".to_string(),
            "/y.txt".to_string(),
            "/dir/sub/x.txt".to_string(),
        ];

        let failed = apply_removals(&removals, &mut local, dir.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(failed.is_empty(), "unexpected failures: {failed:?}");
        assert!(!dir.path().join("dir").exists());
        assert!(!dir.path().join("y.txt").exists());
        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn non_empty_directory_is_reported_not_forced() {
        let dir = tempdir().unwrap();
        let mut local: Snapshot = [Entry::folder("/keep"), write(dir.path(), "/keep/a.txt", b"a")]
            .into_iter()
            .collect();

        let failed = apply_removals(
            &["/keep".to_string()],
            &mut local,
            dir.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(failed, vec!["/keep"]);
        assert!(dir.path().join("keep/a.txt").exists());
        assert!(local.get("/keep").is_some());
    }

    #[tokio::test]
    async fn missing_path_is_reported_as_failed_removal() {
        let dir = tempdir().unwrap();
        let mut local = Snapshot::new();

        let failed = apply_removals(
            &["/ghost.txt".to_string()],
            &mut local,
            dir.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(failed, vec!["/ghost.txt"]);
    }

    #[tokio::test]
    async fn downloads_folders_and_files() {
        let server = MockServer::start().await;
        mount_folder(&server, "/Backup/Docs").await;
        mount_file(&server, "/Backup/Docs/A.txt", b"hello").await;

        let dir = tempdir().unwrap();
        let failed = apply_downloads(
            &["/Docs".to_string(), "/Docs/A.txt".to_string()],
            &remote_tree(&server, "/Backup"),
            dir.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(failed.is_empty(), "unexpected failures: {failed:?}");
        assert!(dir.path().join("Docs").is_dir());
        assert_eq!(std::fs::read(dir.path().join("Docs/A.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn per_item_download_failure_does_not_stop_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/files/get_metadata"))
            .and(body_json(json!({ "path": "/broken.txt" })))
            .respond_with(ResponseTemplate::new(409).set_body_string("path/not_found"))
            .mount(&server)
            .await;
        mount_file(&server, "/ok.txt", b"ok").await;

        let dir = tempdir().unwrap();
        let failed = apply_downloads(
            &["/broken.txt".to_string(), "/ok.txt".to_string()],
            &remote_tree(&server, "/"),
            dir.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(failed, vec!["/broken.txt"]);
        assert_eq!(std::fs::read(dir.path().join("ok.txt")).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn auth_failure_aborts_remaining_downloads() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/files/get_metadata"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let result = apply_downloads(
            &["/a.txt".to_string(), "/b.txt".to_string()],
            &remote_tree(&server, "/"),
            dir.path(),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(ExecutorError::Auth(_))));
    }

    #[tokio::test]
    async fn cancelled_downloads_abort_before_fetching() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let dir = tempdir().unwrap();
        let result = apply_downloads(
            &["/a.txt".to_string()],
            &remote_tree(&server, "/"),
            dir.path(),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(ExecutorError::Cancelled)));
        assert!(!dir.path().join("a.txt").exists());
    }

    /// Content host that sends the headers and the first bytes of a larger
    /// body, then stalls with the connection open.
    async fn stalled_content_host(metadata: serde_json::Value) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = socket.read(&mut buf).await.unwrap();
                if read == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..read]);
            }
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: 1048576\r\nDropbox-API-Result: {metadata}\r\n\r\n"
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&[b'x'; 4096]).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            drop(socket);
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn cancelling_mid_stream_removes_partial_and_keeps_old_file() {
        let api = MockServer::start().await;
        let metadata = json!({
            ".tag": "file",
            "name": "a.txt",
            "path_display": "/a.txt",
            "client_modified": "2024-05-06T07:08:09Z",
            "size": 1_048_576
        });
        Mock::given(method("POST"))
            .and(path("/2/files/get_metadata"))
            .and(body_json(json!({ "path": "/a.txt" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(metadata.clone()))
            .mount(&api)
            .await;
        let content_url = stalled_content_host(metadata).await;
        let client =
            dropbox_core::DropboxClient::with_base_urls(&api.uri(), &content_url, "test-token")
                .unwrap();
        let remote = RemoteTree::new(client, "/");

        let dir = tempdir().unwrap();
        write(dir.path(), "/a.txt", b"previous content");
        let target = dir.path().join("a.txt");
        let partial = partial_path(&target);

        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            let partial = partial.clone();
            tokio::spawn(async move {
                while !partial.exists() {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            apply_downloads(&["/a.txt".to_string()], &remote, dir.path(), &cancel),
        )
        .await
        .expect("download should stop once cancelled");
        canceller.await.unwrap();

        assert!(matches!(result, Err(ExecutorError::Cancelled)));
        assert!(!partial.exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"previous content".to_vec());
    }

    #[tokio::test]
    async fn moves_then_rescan_finds_content_at_new_path() {
        let dir = tempdir().unwrap();
        let mut local: Snapshot = [write(dir.path(), "/p/one.txt", b"1")].into_iter().collect();
        local.insert(Entry::folder("/p"));
        let moves = BTreeMap::from([("/p/one.txt".to_string(), "/q/uno.txt".to_string())]);

        apply_moves(&moves, &mut local, dir.path(), &CancellationToken::new())
            .await
            .unwrap();

        let rescanned = crate::sync::local::scan_local_tree(dir.path());
        assert!(rescanned.get("/p/one.txt").is_none());
        assert_eq!(
            std::fs::read(dir.path().join("q/uno.txt")).unwrap(),
            b"1".to_vec()
        );
        assert!(rescanned.get("/q/uno.txt").is_some());
    }

    #[tokio::test]
    async fn moved_files_take_remote_mtime() {
        let dir = tempdir().unwrap();
        let mut local: Snapshot = [write(dir.path(), "/a.txt", b"a")].into_iter().collect();
        let remote_modified = OffsetDateTime::UNIX_EPOCH + time::Duration::days(20_000);
        let remote: Snapshot = [Entry::file("/b.txt", remote_modified, 1, Some("h".into()))]
            .into_iter()
            .collect();
        let moves = BTreeMap::from([("/a.txt".to_string(), "/b.txt".to_string())]);

        let failed = apply_moves(&moves, &mut local, dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        stamp_moved_files(&moves, &failed, &remote, &mut local, dir.path());

        let mtime =
            FileTime::from_last_modification_time(&std::fs::metadata(dir.path().join("b.txt")).unwrap());
        assert_eq!(mtime.unix_seconds(), remote_modified.unix_timestamp());
        assert_eq!(local.get("/b.txt").unwrap().modified(), Some(remote_modified));
    }
}
