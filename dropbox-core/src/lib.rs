mod client;

pub use client::{
    Account, AccountName, ApiErrorClass, DeletedMetadata, Download, DropboxClient, DropboxError,
    FileMetadata, FolderMetadata, ListFolderResult, Metadata,
};
