use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use url::Url;

const DEFAULT_API_URL: &str = "https://api.dropboxapi.com";
const DEFAULT_CONTENT_URL: &str = "https://content.dropboxapi.com";
const API_ARG_HEADER: &str = "Dropbox-API-Arg";
const API_RESULT_HEADER: &str = "Dropbox-API-Result";

#[derive(Debug, Error)]
pub enum DropboxError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("download response is missing the Dropbox-API-Result header")]
    MissingApiResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct DropboxClient {
    http: Client,
    api_url: Url,
    content_url: Url,
    token: String,
}

impl DropboxClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DropboxError> {
        Self::with_base_urls(DEFAULT_API_URL, DEFAULT_CONTENT_URL, token)
    }

    pub fn with_base_urls(
        api_url: &str,
        content_url: &str,
        token: impl Into<String>,
    ) -> Result<Self, DropboxError> {
        Ok(Self {
            http: Client::new(),
            api_url: Url::parse(api_url)?,
            content_url: Url::parse(content_url)?,
            token: token.into(),
        })
    }

    /// Cheap authenticated call used to validate the token before long listings.
    pub async fn get_current_account(&self) -> Result<Account, DropboxError> {
        let url = self.api_url.join("/2/users/get_current_account")?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Metadata for a file or folder. The root folder has no metadata on the
    /// API side, so `""` and `"/"` must not be passed here.
    pub async fn get_metadata(&self, path: &str) -> Result<Metadata, DropboxError> {
        self.rpc("/2/files/get_metadata", &json!({ "path": path }))
            .await
    }

    pub async fn list_folder(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<ListFolderResult, DropboxError> {
        self.rpc(
            "/2/files/list_folder",
            &json!({ "path": api_path(path), "recursive": recursive }),
        )
        .await
    }

    pub async fn list_folder_continue(
        &self,
        cursor: &str,
    ) -> Result<ListFolderResult, DropboxError> {
        self.rpc("/2/files/list_folder/continue", &json!({ "cursor": cursor }))
            .await
    }

    /// Starts a content download. The metadata comes from the response
    /// header; the body is left unread so callers can stream it.
    pub async fn download(&self, path: &str) -> Result<Download, DropboxError> {
        let url = self.content_url.join("/2/files/download")?;
        let arg = header_safe_json(&json!({ "path": path }));
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header(API_ARG_HEADER, arg)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let metadata = parse_api_result(response.headers())?;
        Ok(Download { metadata, response })
    }

    async fn rpc<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<T, DropboxError> {
        let url = self.api_url.join(endpoint)?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn check_status(response: Response) -> Result<Response, DropboxError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DropboxError::Api { status, body })
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: Response,
    ) -> Result<T, DropboxError> {
        let response = Self::check_status(response).await?;
        Ok(response.json::<T>().await?)
    }
}

impl DropboxError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DropboxError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::Auth))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            DropboxError::Request(err) => err.is_timeout() || err.is_connect(),
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if status == StatusCode::UNAUTHORIZED {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn api_path(path: &str) -> &str {
    if path == "/" { "" } else { path }
}

// HTTP header values must be visible ASCII, so DEL and everything above it is
// sent as \u escapes.
fn header_safe_json(value: &serde_json::Value) -> String {
    let raw = value.to_string();
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii() && ch != '\u{7f}' {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

fn parse_api_result(headers: &HeaderMap) -> Result<FileMetadata, DropboxError> {
    let raw = headers
        .get(API_RESULT_HEADER)
        .ok_or(DropboxError::MissingApiResult)?;
    Ok(serde_json::from_slice(raw.as_bytes())?)
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Account {
    pub account_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<AccountName>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AccountName {
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = ".tag", rename_all = "lowercase")]
pub enum Metadata {
    File(FileMetadata),
    Folder(FolderMetadata),
    Deleted(DeletedMetadata),
}

impl Metadata {
    pub fn path_display(&self) -> Option<&str> {
        match self {
            Metadata::File(file) => file.path_display.as_deref(),
            Metadata::Folder(folder) => folder.path_display.as_deref(),
            Metadata::Deleted(deleted) => deleted.path_display.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
    pub client_modified: String,
    #[serde(default)]
    pub server_modified: Option<String>,
    pub size: u64,
    #[serde(default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FolderMetadata {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeletedMetadata {
    pub name: String,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ListFolderResult {
    pub entries: Vec<Metadata>,
    pub cursor: String,
    pub has_more: bool,
}

/// An in-flight download: metadata is already known, the body is not yet read.
pub struct Download {
    pub metadata: FileMetadata,
    pub response: Response,
}
