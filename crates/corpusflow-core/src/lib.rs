//! Core traits and types for corpusflow document sources.
//!
//! This crate defines the abstractions shared by every repository adapter:
//! - `DocumentSource`: Connect, list, fetch, search and watch one repository
//! - `MetadataCache`: Per-source store of last-known document metadata
//! - `DiffEngine`: Classification of observations into change events
//! - `DocumentManager`: Registry of sources and fan-out of their changes

mod cache;
mod diff;
mod document;
mod error;
mod manager;
mod source;
mod watch;

pub use cache::{CacheConfig, MemoryMetadataCache, MetadataCache, SqliteMetadataCache};
pub use diff::{classify, Decision, DiffEngine, ModifiedPolicy, Observation};
pub use document::{Document, DocumentFilter, DocumentMetadata, DocumentType, MetadataValue};
pub use error::{CacheError, SourceError};
pub use manager::{DocumentManager, WatchCallback};
pub use source::{credential_str, Credentials, DocumentSource};
pub use watch::{
    spawn_poll_loop, EventSink, LoopErrorPolicy, PollCycle, PollSettings, SourceEvent,
    WatchAction, WatchEvent, WatchHandle, WatchSlot, STOP_TIMEOUT,
};
