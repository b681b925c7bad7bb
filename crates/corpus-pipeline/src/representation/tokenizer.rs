//! Tokenizers used to fill representation token maps

use std::path::Path;

use crate::config::TokenizerSpec;
use crate::error::{Error, Result};

/// Text to token ids and back
pub trait TokenEncoder: Send + Sync {
    /// Key under which ids are stored in `Representation::tokens`
    fn name(&self) -> &str;

    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Ids back to text, keeping special tokens
    fn decode(&self, ids: &[u32]) -> Result<String>;
}

/// A Hugging Face `tokenizer.json`
pub struct HfTokenizer {
    name: String,
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    pub fn new(name: impl Into<String>, inner: tokenizers::Tokenizer) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }

    pub fn from_file(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let name = name.into();
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            Error::Config(format!("failed to load tokenizer '{}' from {}: {}", name, path.display(), e))
        })?;
        tracing::info!("Loaded tokenizer '{}' from {}", name, path.display());
        Ok(Self { name, inner })
    }

    pub fn from_spec(spec: &TokenizerSpec) -> Result<Self> {
        Self::from_file(spec.name.clone(), &spec.path)
    }
}

impl TokenEncoder for HfTokenizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::tokenize_failed(&self.name, e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| Error::tokenize_failed(&self.name, e.to_string()))
    }
}
