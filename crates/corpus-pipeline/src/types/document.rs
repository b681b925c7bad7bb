//! Document types flowing between stages

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::codec::{compressed_bytes, compressed_text};
use crate::error::ErrorKind;

/// Stage-1 source object envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    /// Stable identifier (usually the origin URL)
    pub identifier: String,
    /// Origin of the document (collection or site)
    #[serde(default)]
    pub source: String,
    /// Declared content type, possibly with parameters
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Capture or publication date as recorded by the collector
    #[serde(default)]
    pub date: Option<String>,
    /// Raw bytes
    #[serde(with = "compressed_bytes", default)]
    pub content: Vec<u8>,
    /// Any other collector fields
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SourceDocument {
    pub fn new(identifier: impl Into<String>, format: Option<&str>, content: Vec<u8>) -> Self {
        Self {
            identifier: identifier.into(),
            source: String::new(),
            format: format.map(str::to_string),
            title: None,
            date: None,
            content,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

/// One textual rendering of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Representation {
    /// Filtered content (never empty once written)
    #[serde(with = "compressed_text")]
    pub content: String,
    /// Tokenizer name -> token ids
    #[serde(default)]
    pub tokens: BTreeMap<String, Vec<u32>>,
    pub mime_type: String,
}

impl Representation {
    pub fn new(mime_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tokens: BTreeMap::new(),
            mime_type: mime_type.into(),
        }
    }
}

/// Output of parsing one source document (or one archive member)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub source: String,
    pub identifier: String,
    /// Pointer back to the stage-1 object
    #[serde(default)]
    pub original_uri: Option<String>,
    /// MIME type -> representation
    #[serde(default)]
    pub representations: BTreeMap<String, Representation>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Classification of `error`; absent when the document simply had no content left
    #[serde(skip)]
    pub error_kind: Option<ErrorKind>,
}

impl ParsedDocument {
    /// A successful document with no representations yet
    pub fn new(source: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            identifier: identifier.into(),
            original_uri: None,
            representations: BTreeMap::new(),
            metadata: BTreeMap::new(),
            success: true,
            error: None,
            error_kind: None,
        }
    }

    /// A failed document; failed documents never carry representations
    pub fn failed(
        source: impl Into<String>,
        identifier: impl Into<String>,
        kind: Option<ErrorKind>,
        error: impl Into<String>,
    ) -> Self {
        let mut doc = Self::new(source, identifier);
        doc.mark_failed(kind, error);
        doc
    }

    pub fn mark_failed(&mut self, kind: Option<ErrorKind>, error: impl Into<String>) {
        self.representations.clear();
        self.success = false;
        self.error = Some(error.into());
        self.error_kind = kind;
    }

    pub fn with_original_uri(mut self, uri: Option<&str>) -> Self {
        self.original_uri = uri.map(str::to_string);
        self
    }

    /// Add (or replace) a representation keyed by its MIME type
    pub fn add_representation(&mut self, mime_type: &str, content: impl Into<String>) {
        self.representations
            .insert(mime_type.to_string(), Representation::new(mime_type, content));
    }

    pub fn set_metadata(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Token count per tokenizer across all representations
    pub fn token_totals(&self) -> BTreeMap<String, u64> {
        let mut totals = BTreeMap::new();
        for representation in self.representations.values() {
            for (name, ids) in &representation.tokens {
                *totals.entry(name.clone()).or_insert(0u64) += ids.len() as u64;
            }
        }
        totals
    }
}

/// Stage-2 object body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepresentationsPayload {
    pub documents: Vec<ParsedDocument>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_document_has_no_representations() {
        let mut doc = ParsedDocument::new("src", "id");
        doc.add_representation("text/plain", "body");
        doc.mark_failed(Some(ErrorKind::ExtractionFailed), "boom");
        assert!(!doc.success);
        assert!(doc.representations.is_empty());
        assert_eq!(doc.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_payload_content_is_compressed_on_the_wire() {
        let mut doc = ParsedDocument::new("src", "id");
        doc.add_representation("text/plain", "plain body text");
        doc.representations
            .get_mut("text/plain")
            .unwrap()
            .tokens
            .insert("tok".to_string(), vec![1, 2, 3]);
        let payload = RepresentationsPayload { documents: vec![doc] };

        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("plain body text"));

        let back: RepresentationsPayload = serde_json::from_str(&json).unwrap();
        let rep = &back.documents[0].representations["text/plain"];
        assert_eq!(rep.content, "plain body text");
        assert_eq!(rep.tokens["tok"], vec![1, 2, 3]);
        assert_eq!(back.documents[0].token_totals()["tok"], 3);
    }

    #[test]
    fn test_source_document_keeps_extra_fields() {
        let encoded = crate::types::codec::encode_content(b"<p>hi</p>").unwrap();
        let json = format!(
            r#"{{"identifier":"https://x/a","source":"x","format":"text/html","content":"{}","dataset_id":"x","size":9}}"#,
            encoded
        );
        let doc: SourceDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(doc.content, b"<p>hi</p>");
        assert_eq!(doc.format.as_deref(), Some("text/html"));
        assert_eq!(doc.extra["size"], serde_json::json!(9));
    }
}
