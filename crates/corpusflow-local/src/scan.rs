//! Directory scanning and per-file metadata extraction.

use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use corpusflow_core::{DocumentMetadata, DocumentType, SourceError};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Document type of a path, from its extension.
pub(crate) fn document_type(path: &Path) -> Option<DocumentType> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(DocumentType::from_extension)
}

/// Build document metadata for a regular file.
///
/// Returns `None` for anything that is not a regular file or whose extension
/// has no document type. The creation time falls back to the modification
/// time on filesystems that do not record it.
pub(crate) fn describe(path: &Path, stat: &Metadata, source: &str) -> Option<DocumentMetadata> {
    if !stat.is_file() {
        return None;
    }
    let doc_type = document_type(path)?;

    let modified_at: DateTime<Utc> = stat
        .modified()
        .map(DateTime::from)
        .unwrap_or_else(|_| Utc::now());
    let created_at = stat.created().map(DateTime::from).unwrap_or(modified_at);

    Some(DocumentMetadata {
        doc_id: path.to_string_lossy().into_owned(),
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        doc_type,
        created_at,
        modified_at,
        source: source.to_string(),
        size: stat.len(),
        additional_metadata: BTreeMap::new(),
    })
}

/// Walk `root` recursively and describe every supported file.
///
/// Blocking; run it on the blocking pool. Entries that vanish or cannot be
/// read mid-walk are skipped.
pub(crate) fn scan_tree(root: &Path, source: &str) -> Vec<DocumentMetadata> {
    let mut found = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.metadata() {
            Ok(stat) => {
                if let Some(metadata) = describe(entry.path(), &stat, source) {
                    found.push(metadata);
                }
            }
            Err(e) => debug!("Cannot stat {}: {}", entry.path().display(), e),
        }
    }

    debug!("Scanned {} documents under {}", found.len(), root.display());
    found
}

/// Run [`scan_tree`] on the blocking pool.
pub(crate) async fn scan_tree_blocking(
    root: PathBuf,
    source: String,
) -> Result<Vec<DocumentMetadata>, SourceError> {
    tokio::task::spawn_blocking(move || scan_tree(&root, &source))
        .await
        .map_err(|e| SourceError::Provider(format!("Directory scan failed: {}", e)))
}
