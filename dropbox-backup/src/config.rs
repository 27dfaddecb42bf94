use std::path::{Path, PathBuf};

use dropbox_core::DropboxClient;

const DEFAULT_API_URL: &str = "https://api.dropboxapi.com";
const DEFAULT_CONTENT_URL: &str = "https://content.dropboxapi.com";
const DEFAULT_LIST_RETRIES: u64 = 3;

#[derive(Clone, Debug, Default)]
pub struct BackupConfig {
    /// Preset answers; anything missing is asked interactively.
    pub local_root: Option<PathBuf>,
    pub remote_root: Option<String>,
    pub token: Option<String>,
    pub snapshot_cache: Option<PathBuf>,
    pub api_url: String,
    pub content_url: String,
    pub list_retries: u32,
}

impl BackupConfig {
    pub fn from_env() -> Self {
        let home = dirs::home_dir();
        let expand = |value: String| match &home {
            Some(home) => expand_with_home(&value, home),
            None => PathBuf::from(value),
        };
        Self {
            local_root: read_string_env("DROPBOX_LOCAL_ROOT").map(expand),
            remote_root: read_string_env("DROPBOX_REMOTE_ROOT"),
            token: read_string_env("DROPBOX_TOKEN"),
            snapshot_cache: read_string_env("DROPBOX_SNAPSHOT_CACHE").map(expand),
            api_url: read_string_env("DROPBOX_API_URL")
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            content_url: read_string_env("DROPBOX_CONTENT_URL")
                .unwrap_or_else(|| DEFAULT_CONTENT_URL.to_string()),
            list_retries: read_u64_env("DROPBOX_LIST_RETRIES", DEFAULT_LIST_RETRIES)
                .min(u64::from(u32::MAX)) as u32,
        }
    }

    pub fn client(&self, token: &str) -> Result<DropboxClient, dropbox_core::DropboxError> {
        DropboxClient::with_base_urls(&self.api_url, &self.content_url, token)
    }
}

pub fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
