mod drive;
mod dropbox;

pub use drive::{DriveClient, DriveError, DriveFile, ROOT_FOLDER_ID};
pub use dropbox::{DropboxClient, DropboxError, Entry, EntryTag, FileMetadata, FolderMetadata};
