//! Export records

use serde::{Deserialize, Serialize};

use crate::storage::ColumnarRow;
use crate::types::ParsedDocument;

use super::quality::QualityMetrics;

/// One exported document: a single token sequence
///
/// `text`, `score` and `metrics` are filled only when the export decodes
/// records. Text-format output carries `text` and no `tokens`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub identifier: String,
    pub dataset: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tokens: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<QualityMetrics>,
}

impl ExportRecord {
    pub fn new(
        identifier: impl Into<String>,
        dataset: impl Into<String>,
        mime_type: impl Into<String>,
        tokens: Vec<u32>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            dataset: dataset.into(),
            mime_type: mime_type.into(),
            tokens,
            text: None,
            score: None,
            metrics: None,
        }
    }
}

/// Which tokenization of a document to export
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSelector {
    /// Required tokenizer; `None` takes the first one available
    pub tokenizer: Option<String>,
    /// Preferred representation; falls back to the first one
    pub mime_type: Option<String>,
}

impl RecordSelector {
    pub fn new(tokenizer: Option<String>, mime_type: Option<String>) -> Self {
        Self { tokenizer, mime_type }
    }

    /// Pick one `(mime_type, tokenizer, tokens)` candidate
    ///
    /// Candidates must be in representation then tokenizer order.
    fn pick<'a>(&self, candidates: &[(&'a str, &'a str, &'a [u32])]) -> Option<(&'a str, &'a [u32])> {
        let usable: Vec<_> = candidates
            .iter()
            .filter(|(_, tokenizer, _)| {
                self.tokenizer
                    .as_deref()
                    .map_or(true, |wanted| wanted == *tokenizer)
            })
            .collect();

        let chosen = self
            .mime_type
            .as_deref()
            .and_then(|wanted| usable.iter().find(|(mime, _, _)| *mime == wanted))
            .or_else(|| usable.first())?;
        Some((chosen.0, chosen.2))
    }

    /// Records from decoded stage-3 rows, in row order
    pub fn from_rows(&self, dataset: &str, rows: &[ColumnarRow]) -> Vec<ExportRecord> {
        let mut records = Vec::new();
        // Rows of one document are contiguous
        for group in rows.chunk_by(|a, b| a.identifier == b.identifier) {
            let candidates: Vec<_> = group
                .iter()
                .map(|r| (r.mime_type.as_str(), r.tokenizer.as_str(), r.tokens.as_slice()))
                .collect();
            if let Some((mime_type, tokens)) = self.pick(&candidates) {
                records.push(ExportRecord::new(
                    group[0].identifier.clone(),
                    dataset,
                    mime_type,
                    tokens.to_vec(),
                ));
            }
        }
        records
    }

    /// Records from stage-2 documents
    pub fn from_documents(&self, dataset: &str, documents: &[ParsedDocument]) -> Vec<ExportRecord> {
        documents
            .iter()
            .filter(|doc| doc.success)
            .filter_map(|doc| {
                let candidates: Vec<_> = doc
                    .representations
                    .iter()
                    .flat_map(|(mime, rep)| {
                        rep.tokens
                            .iter()
                            .map(move |(tokenizer, ids)| (mime.as_str(), tokenizer.as_str(), ids.as_slice()))
                    })
                    .collect();
                self.pick(&candidates)
                    .map(|(mime_type, tokens)| ExportRecord::new(doc.identifier.clone(), dataset, mime_type, tokens.to_vec()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(identifier: &str, mime: &str, tokenizer: &str, tokens: &[u32]) -> ColumnarRow {
        ColumnarRow {
            identifier: identifier.to_string(),
            mime_type: mime.to_string(),
            tokenizer: tokenizer.to_string(),
            tokens: tokens.to_vec(),
        }
    }

    #[test]
    fn test_one_record_per_document() {
        let rows = vec![
            row("a", "application/json", "base", &[1]),
            row("a", "application/xml", "base", &[2]),
            row("a", "application/xml", "large", &[3]),
            row("b", "text/plain", "large", &[4]),
        ];

        let records = RecordSelector::default().from_rows("edgar", &rows);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].mime_type, "application/json");
        assert_eq!(records[0].tokens, vec![1]);
        assert_eq!(records[1].dataset, "edgar");

        let selector = RecordSelector::new(Some("large".into()), Some("application/xml".into()));
        let records = selector.from_rows("edgar", &rows);
        assert_eq!(records[0].tokens, vec![3]);
        assert_eq!(records[1].tokens, vec![4]);

        // Documents without the required tokenizer are left out
        let selector = RecordSelector::new(Some("base".into()), None);
        assert_eq!(selector.from_rows("edgar", &rows).len(), 1);
    }

    #[test]
    fn test_from_documents_skips_failures() {
        let mut ok = ParsedDocument::new("src", "ok");
        ok.add_representation("text/plain", "body");
        if let Some(rep) = ok.representations.get_mut("text/plain") {
            rep.tokens.insert("base".to_string(), vec![7, 8]);
        }
        let failed = ParsedDocument::failed("src", "bad", None, "empty");

        let records = RecordSelector::default().from_documents("edgar", &[ok, failed]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].identifier, "ok");
        assert_eq!(records[0].tokens, vec![7, 8]);
    }
}
