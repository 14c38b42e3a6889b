//! Local filesystem document source for corpusflow.
//!
//! Indexes a directory tree into the source's metadata cache and watches it
//! either through native filesystem notifications or by periodic rescans.

mod config;
mod native;
mod scan;
mod source;

pub use config::{LocalSourceConfig, DEFAULT_SOURCE_NAME};
pub use source::LocalFileSystemSource;
