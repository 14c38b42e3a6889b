use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// Content kinds recognized by every source.
///
/// Sources map their native type identifiers (file extension, MIME type)
/// onto this set. Items whose native type has no mapping are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Pdf,
    Docx,
    Xlsx,
    Pptx,
    Txt,
    /// Native cloud document without an office equivalent.
    Gdoc,
}

impl DocumentType {
    pub const ALL: [DocumentType; 6] = [
        DocumentType::Pdf,
        DocumentType::Docx,
        DocumentType::Xlsx,
        DocumentType::Pptx,
        DocumentType::Txt,
        DocumentType::Gdoc,
    ];

    /// String tag used in the persisted cache.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Pdf => "pdf",
            DocumentType::Docx => "docx",
            DocumentType::Xlsx => "xlsx",
            DocumentType::Pptx => "pptx",
            DocumentType::Txt => "txt",
            DocumentType::Gdoc => "gdoc",
        }
    }

    /// Map a file extension (without the dot, any case) to a document type.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        Self::ALL.into_iter().find(|t| t.as_str() == ext)
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SourceError::UnsupportedType(s.to_string()))
    }
}

/// Provider-owned auxiliary value attached to a document.
///
/// The engine stores and returns these values but never interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<MetadataValue>),
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Int(v)
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        MetadataValue::Float(v)
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::Text(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::Text(v.to_string())
    }
}

impl<T: Into<MetadataValue>> From<Vec<T>> for MetadataValue {
    fn from(v: Vec<T>) -> Self {
        MetadataValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// Identity and descriptive record of a document within one source.
///
/// `doc_id` is unique within the source and stable across polls; it is the
/// only key the metadata cache uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: String,
    pub name: String,
    pub doc_type: DocumentType,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Name of the owning source
    pub source: String,
    /// Size in bytes
    pub size: u64,
    #[serde(default)]
    pub additional_metadata: BTreeMap<String, MetadataValue>,
}

impl DocumentMetadata {
    /// Whether the descriptive fields differ, comparing timestamps at
    /// one-second granularity.
    pub fn differs_from(&self, other: &DocumentMetadata) -> bool {
        self.name != other.name
            || self.doc_type != other.doc_type
            || self.modified_at.timestamp() != other.modified_at.timestamp()
            || self.size != other.size
            || self.additional_metadata != other.additional_metadata
    }
}

/// A document's metadata together with its materialized content.
#[derive(Debug, Clone)]
pub struct Document {
    pub metadata: DocumentMetadata,
    pub content: Vec<u8>,
}

impl Document {
    pub fn new(metadata: DocumentMetadata, content: Vec<u8>) -> Self {
        Self { metadata, content }
    }
}

/// Optional filter applied by `list_documents` to cached metadata.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub doc_types: Option<Vec<DocumentType>>,
    /// Case-insensitive substring of the document name
    pub name_contains: Option<String>,
    pub modified_after: Option<DateTime<Utc>>,
}

impl DocumentFilter {
    pub fn matches(&self, metadata: &DocumentMetadata) -> bool {
        if let Some(types) = &self.doc_types {
            if !types.contains(&metadata.doc_type) {
                return false;
            }
        }
        if let Some(needle) = &self.name_contains {
            if !metadata
                .name
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        if let Some(after) = self.modified_after {
            if metadata.modified_at <= after {
                return false;
            }
        }
        true
    }

    /// Apply an optional filter to a list of documents.
    pub fn apply(
        filter: Option<&DocumentFilter>,
        documents: Vec<DocumentMetadata>,
    ) -> Vec<DocumentMetadata> {
        match filter {
            Some(f) => documents.into_iter().filter(|d| f.matches(d)).collect(),
            None => documents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(name: &str, doc_type: DocumentType) -> DocumentMetadata {
        DocumentMetadata {
            doc_id: format!("id-{}", name),
            name: name.to_string(),
            doc_type,
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            modified_at: Utc.timestamp_opt(1_700_000_100, 0).unwrap(),
            source: "test".to_string(),
            size: 42,
            additional_metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_document_type_tags() {
        for t in DocumentType::ALL {
            assert_eq!(t.as_str().parse::<DocumentType>().unwrap(), t);
        }
        assert!(matches!(
            "odt".parse::<DocumentType>(),
            Err(SourceError::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_from_extension_is_case_insensitive() {
        assert_eq!(DocumentType::from_extension("PDF"), Some(DocumentType::Pdf));
        assert_eq!(DocumentType::from_extension("docx"), Some(DocumentType::Docx));
        assert_eq!(DocumentType::from_extension("md"), None);
        assert_eq!(DocumentType::from_extension(""), None);
    }

    #[test]
    fn test_metadata_value_json_shape() {
        let value = MetadataValue::from(vec!["a@example.com", "b@example.com"]);
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#"["a@example.com","b@example.com"]"#
        );
        let parsed: MetadataValue = serde_json::from_str("true").unwrap();
        assert_eq!(parsed, MetadataValue::Bool(true));
        let parsed: MetadataValue = serde_json::from_str("12").unwrap();
        assert_eq!(parsed, MetadataValue::Int(12));
    }

    #[test]
    fn test_differs_from_ignores_subsecond_noise() {
        let a = sample("report.pdf", DocumentType::Pdf);
        let mut b = a.clone();
        b.modified_at = a.modified_at + chrono::Duration::milliseconds(400);
        assert!(!a.differs_from(&b));

        b.size = 43;
        assert!(a.differs_from(&b));
    }

    #[test]
    fn test_filter() {
        let docs = vec![
            sample("Report.pdf", DocumentType::Pdf),
            sample("notes.txt", DocumentType::Txt),
        ];

        let by_type = DocumentFilter {
            doc_types: Some(vec![DocumentType::Txt]),
            ..Default::default()
        };
        let out = DocumentFilter::apply(Some(&by_type), docs.clone());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "notes.txt");

        let by_name = DocumentFilter {
            name_contains: Some("report".to_string()),
            ..Default::default()
        };
        let out = DocumentFilter::apply(Some(&by_name), docs.clone());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "Report.pdf");

        assert_eq!(DocumentFilter::apply(None, docs).len(), 2);
    }
}
