//! Google Drive document source for corpusflow.
//!
//! Talks to the Drive v3 REST API with `reqwest`, refreshes OAuth tokens from
//! an authorized-user credentials file, and detects changes by polling for
//! files modified after a watermark.

mod client;
mod config;
mod convert;
mod source;
mod token;

pub use client::{DriveClient, DriveFile, DriveOwner, FileList, DEFAULT_BASE_URL};
pub use config::{DriveSourceConfig, DEFAULT_POLL_INTERVAL, DEFAULT_SOURCE_NAME};
pub use convert::{document_type_for_mime, export_mime_for, to_metadata, MIME_TYPE_KEY};
pub use source::{GoogleDriveSource, ACCESS_TOKEN_KEY, CREDENTIALS_FILE_KEY};
pub use token::{AuthorizedUser, TokenProvider, DEFAULT_TOKEN_URI};
