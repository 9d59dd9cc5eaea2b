use reqwest::{Client, StatusCode};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_API_URL: &str = "https://api.dropboxapi.com";
const DEFAULT_CONTENT_URL: &str = "https://content.dropboxapi.com";

#[derive(Debug, Error)]
pub enum DropboxError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to encode api argument: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
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

    /// Points both the RPC and the content endpoints at the same host.
    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DropboxError> {
        Self::with_base_urls(base_url, base_url, token)
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

    pub async fn upload(&self, path: &str, content: &[u8]) -> Result<FileMetadata, DropboxError> {
        let url = self.content_url.join("/2/files/upload")?;
        let arg = serde_json::to_string(&UploadArg {
            path,
            mode: "overwrite",
            mute: true,
        })?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header("Dropbox-API-Arg", arg)
            .header("Content-Type", "application/octet-stream")
            .body(content.to_vec())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), DropboxError> {
        let _: IgnoredAny = self.rpc("/2/files/delete_v2", &PathArg { path }).await?;
        Ok(())
    }

    pub async fn create_folder(&self, path: &str) -> Result<FolderMetadata, DropboxError> {
        let result: CreateFolderResult = self
            .rpc("/2/files/create_folder_v2", &PathArg { path })
            .await?;
        Ok(result.metadata)
    }

    /// Lists every entry of a folder, following the cursor until the listing is exhausted.
    pub async fn list_folder(&self, path: &str) -> Result<Vec<Entry>, DropboxError> {
        let mut page: ListFolderResult = self.rpc("/2/files/list_folder", &PathArg { path }).await?;
        let mut entries = std::mem::take(&mut page.entries);
        while page.has_more {
            let cursor = std::mem::take(&mut page.cursor);
            page = self
                .rpc("/2/files/list_folder/continue", &CursorArg { cursor: &cursor })
                .await?;
            entries.append(&mut page.entries);
        }
        Ok(entries)
    }

    async fn rpc<A: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        arg: &A,
    ) -> Result<T, DropboxError> {
        let url = self.api_url.join(endpoint)?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(arg)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DropboxError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DropboxError::Api { status, body })
        }
    }
}

#[derive(Serialize)]
struct UploadArg<'a> {
    path: &'a str,
    mode: &'a str,
    mute: bool,
}

#[derive(Serialize)]
struct PathArg<'a> {
    path: &'a str,
}

#[derive(Serialize)]
struct CursorArg<'a> {
    cursor: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateFolderResult {
    metadata: FolderMetadata,
}

#[derive(Debug, Deserialize)]
struct ListFolderResult {
    entries: Vec<Entry>,
    #[serde(default)]
    cursor: String,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FileMetadata {
    pub name: String,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FolderMetadata {
    pub name: String,
    #[serde(default)]
    pub path_lower: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Entry {
    #[serde(rename = ".tag")]
    pub tag: EntryTag,
    pub name: String,
    #[serde(default)]
    pub path_lower: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryTag {
    File,
    Folder,
    Deleted,
}
