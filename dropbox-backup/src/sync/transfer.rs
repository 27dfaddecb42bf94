use std::io;
use std::path::{Path, PathBuf};

use dropbox_core::{DropboxClient, DropboxError, FileMetadata};
use filetime::FileTime;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::content_hash::ContentHasher;
use super::remote::parse_modified;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("api error: {0}")]
    Api(#[from] DropboxError),
    #[error("stream error: {0}")]
    Stream(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("time parse error: {0}")]
    Time(#[from] time::error::Parse),
    #[error("download integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
}

/// Streams `remote_path` into `target` through a sibling `.partial` file,
/// checks it against the remote content hash, moves it into place and stamps
/// it with the remote modified time.
pub async fn download_file(
    client: &DropboxClient,
    remote_path: &str,
    target: &Path,
) -> Result<FileMetadata, TransferError> {
    let download = client.download(remote_path).await?;
    let metadata = download.metadata;
    let modified = parse_modified(&metadata.client_modified)?;

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(target);
    let written = write_partial(download.response, &partial).await;
    let actual = match written {
        Ok(actual) => actual,
        Err(err) => {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err);
        }
    };

    if let Some(expected) = metadata.content_hash.as_deref()
        && expected != actual
    {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(TransferError::IntegrityMismatch {
            expected: expected.to_string(),
            actual,
        });
    }

    tokio::fs::rename(&partial, target).await?;
    filetime::set_file_mtime(
        target,
        FileTime::from_unix_time(modified.unix_timestamp(), modified.nanosecond()),
    )?;
    Ok(metadata)
}

async fn write_partial(response: reqwest::Response, partial: &Path) -> Result<String, TransferError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let mut stream = response.bytes_stream();
    let mut hasher = ContentHasher::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        hasher.update(&chunk);
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(hasher.finalize())
}

pub fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}
