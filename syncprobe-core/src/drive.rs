use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,mimeType";
const PAGE_SIZE: &str = "100";

/// Id Google Drive accepts as an alias for "My Drive".
pub const ROOT_FOLDER_ID: &str = "root";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn find_folder(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<DriveFile>, DriveError> {
        let query = format!(
            "'{}' in parents and name = '{}' and mimeType = '{FOLDER_MIME_TYPE}' and trashed = false",
            escape_query(parent_id),
            escape_query(name)
        );
        let mut files = self.list_matching(&query).await?;
        Ok(if files.is_empty() {
            None
        } else {
            Some(files.swap_remove(0))
        })
    }

    pub async fn create_folder(&self, parent_id: &str, name: &str) -> Result<DriveFile, DriveError> {
        self.create_metadata(&NewFile {
            name,
            mime_type: FOLDER_MIME_TYPE,
            parents: [parent_id],
        })
        .await
    }

    /// Creates the file entry first, then sends its content through the media upload endpoint.
    pub async fn upload_text(
        &self,
        parent_id: &str,
        name: &str,
        content: &str,
    ) -> Result<DriveFile, DriveError> {
        let created = self
            .create_metadata(&NewFile {
                name,
                mime_type: "text/plain",
                parents: [parent_id],
            })
            .await?;
        let mut url = self.endpoint(&format!("/upload/drive/v3/files/{}", created.id))?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("fields", FILE_FIELDS);
        let response = self
            .http
            .patch(url)
            .bearer_auth(&self.token)
            .header("Content-Type", "text/plain")
            .body(content.to_string())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_children(&self, parent_id: &str) -> Result<Vec<DriveFile>, DriveError> {
        let query = format!("'{}' in parents and trashed = false", escape_query(parent_id));
        self.list_matching(&query).await
    }

    pub async fn delete(&self, file_id: &str) -> Result<(), DriveError> {
        let url = self.endpoint(&format!("/drive/v3/files/{file_id}"))?;
        let response = self
            .http
            .delete(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(DriveError::Api { status, body })
    }

    async fn list_matching(&self, query: &str) -> Result<Vec<DriveFile>, DriveError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.endpoint("/drive/v3/files")?;
            {
                let mut qp = url.query_pairs_mut();
                qp.append_pair("q", query);
                qp.append_pair("fields", &format!("nextPageToken,files({FILE_FIELDS})"));
                qp.append_pair("pageSize", PAGE_SIZE);
                if let Some(token) = page_token.as_deref() {
                    qp.append_pair("pageToken", token);
                }
            }
            let response = self
                .http
                .get(url)
                .bearer_auth(&self.token)
                .send()
                .await?;
            let page: FileList = Self::handle_response(response).await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(files)
    }

    async fn create_metadata(&self, file: &NewFile<'_>) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        url.query_pairs_mut().append_pair("fields", FILE_FIELDS);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(file)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveError::Api { status, body })
        }
    }
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewFile<'a> {
    name: &'a str,
    mime_type: &'a str,
    parents: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type.as_deref() == Some(FOLDER_MIME_TYPE)
    }
}
