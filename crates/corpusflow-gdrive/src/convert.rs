//! Mapping of Drive files onto corpusflow documents.

use std::collections::BTreeMap;

use chrono::Utc;
use corpusflow_core::{DocumentMetadata, DocumentType, MetadataValue, SourceError};

use crate::client::DriveFile;

const GOOGLE_APPS_PREFIX: &str = "application/vnd.google-apps.";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

const DOCX_MIME: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const PPTX_MIME: &str = "application/vnd.openxmlformats-officedocument.presentationml.presentation";
const PDF_MIME: &str = "application/pdf";

/// Key under which the native MIME type is kept in `additional_metadata`.
pub const MIME_TYPE_KEY: &str = "mime_type";

/// Map a Drive MIME type to a document type.
///
/// Native Google types without an office equivalent map to `Gdoc`. Folders
/// and unknown non-native types have no mapping.
pub fn document_type_for_mime(mime_type: &str) -> Option<DocumentType> {
    match mime_type {
        "application/vnd.google-apps.document" | DOCX_MIME => Some(DocumentType::Docx),
        "application/vnd.google-apps.spreadsheet" | XLSX_MIME => Some(DocumentType::Xlsx),
        "application/vnd.google-apps.presentation" | PPTX_MIME => Some(DocumentType::Pptx),
        PDF_MIME => Some(DocumentType::Pdf),
        "text/plain" | "application/vnd.google.colaboratory" => Some(DocumentType::Txt),
        FOLDER_MIME => None,
        other if other.starts_with(GOOGLE_APPS_PREFIX) => Some(DocumentType::Gdoc),
        _ => None,
    }
}

/// Export format for native Google documents, `None` for stored files that
/// are downloaded as-is.
pub fn export_mime_for(mime_type: &str) -> Option<&'static str> {
    if !mime_type.starts_with(GOOGLE_APPS_PREFIX) {
        return None;
    }
    if mime_type.contains("spreadsheet") {
        Some(XLSX_MIME)
    } else if mime_type.contains("document") {
        Some(DOCX_MIME)
    } else if mime_type.contains("presentation") {
        Some(PPTX_MIME)
    } else {
        Some(PDF_MIME)
    }
}

/// Convert a Drive file into document metadata stamped with `source`.
pub fn to_metadata(file: &DriveFile, source: &str) -> Result<DocumentMetadata, SourceError> {
    let doc_type = document_type_for_mime(&file.mime_type)
        .ok_or_else(|| SourceError::UnsupportedType(file.mime_type.clone()))?;

    let modified_at = file
        .modified_time
        .or(file.created_time)
        .unwrap_or_else(Utc::now);
    let created_at = file.created_time.unwrap_or(modified_at);
    let size = file
        .size
        .as_deref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let owners: Vec<String> = file
        .owners
        .iter()
        .filter_map(|o| o.email_address.clone())
        .collect();

    let mut extra = BTreeMap::new();
    extra.insert("owners".to_string(), MetadataValue::from(owners));
    extra.insert("shared".to_string(), MetadataValue::from(file.shared));
    extra.insert("starred".to_string(), MetadataValue::from(file.starred));
    extra.insert(
        MIME_TYPE_KEY.to_string(),
        MetadataValue::from(file.mime_type.as_str()),
    );

    Ok(DocumentMetadata {
        doc_id: file.id.clone(),
        name: file.name.clone(),
        doc_type,
        created_at,
        modified_at,
        source: source.to_string(),
        size,
        additional_metadata: extra,
    })
}

/// Native MIME type recorded in cached metadata.
pub fn cached_mime_type(metadata: &DocumentMetadata) -> Option<&str> {
    match metadata.additional_metadata.get(MIME_TYPE_KEY) {
        Some(MetadataValue::Text(mime)) => Some(mime.as_str()),
        _ => None,
    }
}
