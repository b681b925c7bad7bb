//! Representation builder
//!
//! Runs every representation of a parsed document through the filter chain
//! and the configured tokenizers. Representations that end up empty are
//! dropped, and a document left with none is marked unsuccessful so it never
//! reaches the representations stage.

use std::sync::Arc;

use crate::config::RepresentationConfig;
use crate::error::Result;
use crate::representation::filters::FilterChain;
use crate::representation::tokenizer::{HfTokenizer, TokenEncoder};
use crate::types::ParsedDocument;

pub struct RepresentationBuilder {
    filters: FilterChain,
    tokenizers: Vec<Arc<dyn TokenEncoder>>,
}

impl RepresentationBuilder {
    pub fn new(filters: FilterChain, tokenizers: Vec<Arc<dyn TokenEncoder>>) -> Self {
        Self { filters, tokenizers }
    }

    pub fn from_config(config: &RepresentationConfig) -> Result<Self> {
        let filters = FilterChain::from_config(config)?;
        let tokenizers = config
            .tokenizers
            .iter()
            .map(|spec| HfTokenizer::from_spec(spec).map(|t| Arc::new(t) as Arc<dyn TokenEncoder>))
            .collect::<Result<Vec<_>>>()?;

        if tokenizers.is_empty() {
            tracing::warn!("No tokenizers configured; representations will carry no token ids");
        }
        Ok(Self::new(filters, tokenizers))
    }

    pub fn tokenizer_names(&self) -> Vec<&str> {
        self.tokenizers.iter().map(|t| t.name()).collect()
    }

    /// Filter and tokenize every representation of `doc`
    pub fn finalize(&self, mut doc: ParsedDocument) -> ParsedDocument {
        if !doc.success {
            return doc;
        }

        let representations = std::mem::take(&mut doc.representations);
        for (mime_type, mut representation) in representations {
            let content = self.filters.apply(&representation.content);
            if content.trim().is_empty() {
                tracing::debug!("[{}] dropping empty {} representation", doc.identifier, mime_type);
                continue;
            }

            for tokenizer in &self.tokenizers {
                match tokenizer.encode(&content) {
                    Ok(ids) => {
                        representation.tokens.insert(tokenizer.name().to_string(), ids);
                    }
                    Err(e) => {
                        tracing::warn!("[{}] {} skipped for {}: {}", doc.identifier, tokenizer.name(), mime_type, e);
                    }
                }
            }

            representation.content = content;
            doc.representations.insert(mime_type, representation);
        }

        if doc.representations.is_empty() {
            // Not an error kind: there was simply nothing left to keep
            doc.mark_failed(None, "no content left after filtering");
        }
        doc
    }
}
