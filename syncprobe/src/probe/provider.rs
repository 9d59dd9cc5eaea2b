use std::future::Future;
use std::path::{Path, PathBuf};

use syncprobe_core::{DriveClient, DriveError, DropboxClient, DropboxError, EntryTag};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("dropbox api error: {0}")]
    Dropbox(#[from] DropboxError),
    #[error("google drive api error: {0}")]
    Drive(#[from] DriveError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A file inside the test folder, with the provider-specific handle needed to delete it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub handle: String,
}

/// Storage a phase performs its timed actions against. Every failure is
/// fatal to the run.
pub trait StorageProvider {
    fn create(
        &self,
        name: &str,
        content: &str,
    ) -> impl Future<Output = Result<(), ProviderError>> + Send;

    fn delete(&self, entry: &RemoteEntry) -> impl Future<Output = Result<(), ProviderError>> + Send;

    fn list_entries(&self) -> impl Future<Output = Result<Vec<RemoteEntry>, ProviderError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Dropbox,
    GoogleDrive,
}

impl ProviderKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dropbox" => Some(Self::Dropbox),
            "gdrive" | "google-drive" | "googledrive" => Some(Self::GoogleDrive),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Dropbox => "DROPBOX",
            Self::GoogleDrive => "GOOGLE DRIVE",
        }
    }

    pub fn perf_folder(self) -> &'static str {
        match self {
            Self::Dropbox => "DropboxPerfTest",
            Self::GoogleDrive => "GoogleDrivePerfTest",
        }
    }

    pub fn default_local_root(self) -> &'static str {
        match self {
            Self::Dropbox => "~/Dropbox",
            Self::GoogleDrive => "~/Google Drive File Stream/My Drive",
        }
    }

    /// Local folder the local-write phase writes into, relative to the sync root.
    ///
    /// Drive does not pull web changes into the local stream, so its local
    /// phase uses a sibling folder that only syncs upwards.
    pub fn local_test_folder(self, test_id: &str) -> PathBuf {
        let relative = format!("{}/{test_id}", self.perf_folder());
        match self {
            Self::Dropbox => PathBuf::from(relative),
            Self::GoogleDrive => PathBuf::from(format!("Local.{relative}")),
        }
    }

    /// Whether remote deletions propagate to the local folder, which the
    /// remote-delete phase relies on.
    pub fn syncs_remote_to_local(self) -> bool {
        matches!(self, Self::Dropbox)
    }

    pub fn web_home_url(self) -> &'static str {
        match self {
            Self::Dropbox => "https://www.dropbox.com/home",
            Self::GoogleDrive => "https://drive.google.com/drive/u/0",
        }
    }
}

pub struct DropboxProvider {
    client: DropboxClient,
    folder: String,
}

impl DropboxProvider {
    /// Ensures `/<perf folder>/<test id>` exists and targets it.
    pub async fn prepare(
        client: DropboxClient,
        perf_folder: &str,
        test_id: &str,
    ) -> Result<Self, ProviderError> {
        let root = client.list_folder("").await?;
        if !root
            .iter()
            .any(|entry| entry.tag == EntryTag::Folder && entry.name == perf_folder)
        {
            info!(folder = perf_folder, "creating perf folder in root");
            client.create_folder(&format!("/{perf_folder}")).await?;
        }
        let folder = format!("/{perf_folder}/{test_id}");
        info!(folder = %folder, "creating test folder");
        client.create_folder(&folder).await?;
        Ok(Self { client, folder })
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn web_folder_url(&self) -> String {
        format!("{}{}", ProviderKind::Dropbox.web_home_url(), self.folder)
    }
}

impl StorageProvider for DropboxProvider {
    async fn create(&self, name: &str, content: &str) -> Result<(), ProviderError> {
        self.client
            .upload(&format!("{}/{name}", self.folder), content.as_bytes())
            .await?;
        Ok(())
    }

    async fn delete(&self, entry: &RemoteEntry) -> Result<(), ProviderError> {
        self.client.delete(&entry.handle).await?;
        Ok(())
    }

    async fn list_entries(&self) -> Result<Vec<RemoteEntry>, ProviderError> {
        let entries = self.client.list_folder(&self.folder).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.tag == EntryTag::File)
            .map(|entry| RemoteEntry {
                handle: entry
                    .path_lower
                    .unwrap_or_else(|| format!("{}/{}", self.folder, entry.name)),
                name: entry.name,
            })
            .collect())
    }
}

pub struct DriveProvider {
    client: DriveClient,
    folder_id: String,
}

impl DriveProvider {
    pub async fn prepare(
        client: DriveClient,
        perf_folder: &str,
        test_id: &str,
    ) -> Result<Self, ProviderError> {
        let perf = match client
            .find_folder(syncprobe_core::ROOT_FOLDER_ID, perf_folder)
            .await?
        {
            Some(folder) => folder,
            None => {
                info!(folder = perf_folder, "creating perf folder in root");
                client
                    .create_folder(syncprobe_core::ROOT_FOLDER_ID, perf_folder)
                    .await?
            }
        };
        info!(folder = %format!("{perf_folder}/{test_id}"), "creating test folder");
        let test_folder = client.create_folder(&perf.id, test_id).await?;
        Ok(Self {
            client,
            folder_id: test_folder.id,
        })
    }

    pub fn web_folder_url(&self) -> String {
        format!(
            "{}/folders/{}",
            ProviderKind::GoogleDrive.web_home_url(),
            self.folder_id
        )
    }
}

impl StorageProvider for DriveProvider {
    async fn create(&self, name: &str, content: &str) -> Result<(), ProviderError> {
        self.client
            .upload_text(&self.folder_id, name, content)
            .await?;
        Ok(())
    }

    async fn delete(&self, entry: &RemoteEntry) -> Result<(), ProviderError> {
        self.client.delete(&entry.handle).await?;
        Ok(())
    }

    async fn list_entries(&self) -> Result<Vec<RemoteEntry>, ProviderError> {
        let files = self.client.list_children(&self.folder_id).await?;
        Ok(files
            .into_iter()
            .filter(|file| !file.is_folder())
            .map(|file| RemoteEntry {
                name: file.name,
                handle: file.id,
            })
            .collect())
    }
}

/// Folder on the local drive watched by the provider's sync client.
#[derive(Debug, Clone)]
pub struct LocalFolder {
    root: PathBuf,
}

impl LocalFolder {
    pub async fn create(root: impl Into<PathBuf>) -> Result<Self, ProviderError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

impl StorageProvider for LocalFolder {
    async fn create(&self, name: &str, content: &str) -> Result<(), ProviderError> {
        tokio::fs::write(self.root.join(name), content).await?;
        Ok(())
    }

    async fn delete(&self, entry: &RemoteEntry) -> Result<(), ProviderError> {
        tokio::fs::remove_file(&entry.handle).await?;
        Ok(())
    }

    async fn list_entries(&self) -> Result<Vec<RemoteEntry>, ProviderError> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            entries.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                handle: entry.path().to_string_lossy().into_owned(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
