//! Stage model and document identity
//!
//! Every object in the store lives under `{stage}/{dataset_id}/{relative path}`.
//! The relative path is shared by all stages of one document, except that the
//! columnar stage drops the trailing `.json` suffix.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};

const JSON_SUFFIX: &str = ".json";

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Stage 1: raw source objects
    Documents,
    /// Stage 2: parsed, filtered and tokenized representations
    Representations,
    /// Stage 3: columnar token shards
    Parquet,
    /// Manifests describing the other stages
    Index,
}

impl Stage {
    /// Stages that hold one object per document, in pipeline order
    pub const DOCUMENT_STAGES: [Stage; 3] = [Stage::Documents, Stage::Representations, Stage::Parquet];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Documents => "documents",
            Stage::Representations => "representations",
            Stage::Parquet => "parquet",
            Stage::Index => "index",
        }
    }

    /// The stage a document advances into from this one
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Documents => Some(Stage::Representations),
            Stage::Representations => Some(Stage::Parquet),
            Stage::Parquet | Stage::Index => None,
        }
    }

    /// The stage that feeds this one
    pub fn previous(&self) -> Option<Stage> {
        match self {
            Stage::Documents | Stage::Index => None,
            Stage::Representations => Some(Stage::Documents),
            Stage::Parquet => Some(Stage::Representations),
        }
    }

    /// Prefix covering every object of a dataset (and optional sub-collection) in this stage
    ///
    /// A sub-collection is always a directory: `2024` covers `2024/...` but
    /// not `2024-old/...`.
    pub fn dataset_prefix(&self, dataset_id: &str, key_prefix: Option<&str>) -> String {
        match key_prefix.map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => {
                format!("{}/{}/{}/", self.as_str(), dataset_id, prefix)
            }
            _ => format!("{}/{}/", self.as_str(), dataset_id),
        }
    }

    /// Ensure `from -> to` is one of the two valid per-document transitions
    pub fn check_transition(from: Stage, to: Stage) -> Result<()> {
        if from.next() == Some(to) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "documents" | "1" => Ok(Stage::Documents),
            "representations" | "2" => Ok(Stage::Representations),
            "parquet" | "3" => Ok(Stage::Parquet),
            "index" => Ok(Stage::Index),
            other => Err(Error::Config(format!("Unknown stage: {}", other))),
        }
    }
}

/// Identity of one document within a dataset, independent of stage
///
/// `path` is stored in the documents/representations form (with the `.json`
/// suffix when the source object carried one).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    dataset_id: String,
    path: String,
}

impl DocumentKey {
    /// Create a key from a dataset id and a stage-1 relative path
    pub fn new(dataset_id: impl Into<String>, path: impl Into<String>) -> Result<Self> {
        let dataset_id = dataset_id.into();
        let path = path.into();
        validate_dataset_id(&dataset_id)?;
        validate_relative_path(&path)?;
        Ok(Self { dataset_id, path })
    }

    /// Normalize a full key from any document stage into a `DocumentKey`
    pub fn from_stage_key(key: &str) -> Result<(Stage, Self)> {
        let mut parts = key.splitn(3, '/');
        let stage = parts.next().unwrap_or_default();
        let dataset_id = parts.next().unwrap_or_default();
        let relative = parts
            .next()
            .ok_or_else(|| Error::invalid_key(key, "expected {stage}/{dataset}/{path}"))?;

        let stage: Stage = stage
            .parse()
            .map_err(|_| Error::invalid_key(key, format!("unknown stage '{}'", stage)))?;
        if stage == Stage::Index {
            return Err(Error::invalid_key(key, "index objects are not documents"));
        }

        let doc = Self::from_relative(stage, dataset_id, relative)?;
        Ok((stage, doc))
    }

    /// Build a key from a path relative to `{stage}/{dataset_id}/`
    pub fn from_relative(stage: Stage, dataset_id: &str, relative: &str) -> Result<Self> {
        let path = if stage == Stage::Parquet && !relative.ends_with(JSON_SUFFIX) {
            format!("{}{}", relative, JSON_SUFFIX)
        } else {
            relative.to_string()
        };
        Self::new(dataset_id, path)
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    /// Relative path in its stage-1 form
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Relative path as stored in `stage`
    pub fn relative_for(&self, stage: Stage) -> &str {
        match stage {
            Stage::Parquet => self.path.strip_suffix(JSON_SUFFIX).unwrap_or(&self.path),
            _ => &self.path,
        }
    }
}

impl std::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.dataset_id, self.path)
    }
}

/// Full object key of `doc` in `stage`
pub fn stage_key(stage: Stage, doc: &DocumentKey) -> Result<String> {
    if stage == Stage::Index {
        return Err(Error::invalid_key(
            doc.to_string(),
            "index stage has no per-document keys",
        ));
    }
    Ok(format!(
        "{}/{}/{}",
        stage.as_str(),
        doc.dataset_id,
        doc.relative_for(stage)
    ))
}

fn validate_dataset_id(dataset_id: &str) -> Result<()> {
    if dataset_id.is_empty() {
        return Err(Error::invalid_key(dataset_id, "dataset id is empty"));
    }
    if dataset_id.contains('/') || dataset_id.contains('\\') {
        return Err(Error::invalid_key(dataset_id, "dataset id must be a single segment"));
    }
    if dataset_id == "." || dataset_id == ".." {
        return Err(Error::invalid_key(dataset_id, "path traversal"));
    }
    Ok(())
}

fn validate_relative_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::invalid_key(path, "document key is empty"));
    }
    if path.starts_with('/') {
        return Err(Error::invalid_key(path, "document key must be relative"));
    }
    if path.contains('\\') {
        return Err(Error::invalid_key(path, "backslash in document key"));
    }
    for segment in path.split('/') {
        match segment {
            "" => return Err(Error::invalid_key(path, "empty path segment")),
            "." | ".." => return Err(Error::invalid_key(path, "path traversal")),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_keys_share_relative_path() {
        let doc = DocumentKey::new("fdlp", "2024/a/doc-1.json").unwrap();
        assert_eq!(
            stage_key(Stage::Documents, &doc).unwrap(),
            "documents/fdlp/2024/a/doc-1.json"
        );
        assert_eq!(
            stage_key(Stage::Representations, &doc).unwrap(),
            "representations/fdlp/2024/a/doc-1.json"
        );
        assert_eq!(
            stage_key(Stage::Parquet, &doc).unwrap(),
            "parquet/fdlp/2024/a/doc-1"
        );
        assert!(stage_key(Stage::Index, &doc).is_err());
    }

    #[test]
    fn test_from_stage_key_normalizes_any_stage() {
        let (stage, from_docs) = DocumentKey::from_stage_key("documents/usc/x/y.json").unwrap();
        assert_eq!(stage, Stage::Documents);
        let (stage, from_parquet) = DocumentKey::from_stage_key("parquet/usc/x/y").unwrap();
        assert_eq!(stage, Stage::Parquet);
        assert_eq!(from_docs, from_parquet);
        assert_eq!(from_parquet.path(), "x/y.json");
    }

    #[test]
    fn test_rejects_traversal_and_empty_segments() {
        for bad in ["", "../etc/passwd", "a/../b", "a//b", "/abs", "a/./b", "a\\b"] {
            let err = DocumentKey::new("ds", bad).unwrap_err();
            assert!(matches!(err, Error::InvalidKey { .. }), "accepted {:?}", bad);
        }
        assert!(DocumentKey::new("..", "a.json").is_err());
        assert!(DocumentKey::new("a/b", "a.json").is_err());
        assert!(DocumentKey::from_stage_key("documents/ds").is_err());
        assert!(DocumentKey::from_stage_key("index/ds/x.json").is_err());
    }

    #[test]
    fn test_transitions() {
        assert!(Stage::check_transition(Stage::Documents, Stage::Representations).is_ok());
        assert!(Stage::check_transition(Stage::Representations, Stage::Parquet).is_ok());
        assert!(Stage::check_transition(Stage::Documents, Stage::Parquet).is_err());
        assert!(Stage::check_transition(Stage::Parquet, Stage::Index).is_err());
    }

    #[test]
    fn test_dataset_prefix() {
        assert_eq!(Stage::Documents.dataset_prefix("ds", None), "documents/ds/");
        assert_eq!(
            Stage::Parquet.dataset_prefix("ds", Some("2024/")),
            "parquet/ds/2024/"
        );
        assert_eq!(
            Stage::Documents.dataset_prefix("ds", Some("/2024")),
            "documents/ds/2024/"
        );
        assert_eq!(Stage::Documents.dataset_prefix("ds", Some("/")), "documents/ds/");
    }
}
