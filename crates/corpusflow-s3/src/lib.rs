//! S3-compatible object store source for corpusflow.
//!
//! [`S3Source`] indexes the objects under a bucket prefix and detects changes
//! by re-listing it on every poll. Reads go through the [`ObjectStore`] trait:
//! [`S3ObjectStore`] talks to AWS S3 or any S3-compatible endpoint,
//! [`MemoryObjectStore`] keeps objects in process.

mod config;
mod memory;
mod s3;
mod source;
mod store;

pub use config::{S3SourceConfig, DEFAULT_POLL_INTERVAL, DEFAULT_REGION, DEFAULT_SOURCE_NAME};
pub use memory::MemoryObjectStore;
pub use s3::{S3ObjectStore, S3Settings};
pub use source::{
    S3Source, ACCESS_KEY_ID_KEY, ENDPOINT_URL_KEY, REGION_KEY, SECRET_ACCESS_KEY_KEY,
    SESSION_TOKEN_KEY,
};
pub use store::{ObjectInfo, ObjectStore, StoreError};
