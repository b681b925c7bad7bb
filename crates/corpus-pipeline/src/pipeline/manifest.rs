//! Stage manifests
//!
//! A manifest is a gzip-compressed JSON listing of every key in one stage of
//! a dataset, stored under `index/`. It may be stale; the store listing is
//! always authoritative.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::types::codec;

use super::stage::Stage;

/// Aggregates recorded alongside the key listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub dataset_id: String,
    #[serde(default)]
    pub key_prefix: Option<String>,
    pub stage: Stage,
    pub count: usize,
    /// Tokenizer name -> tokens across the stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_totals: Option<BTreeMap<String, u64>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Full object keys, sorted
    pub objects: Vec<String>,
    pub metadata: ManifestMetadata,
}

impl Manifest {
    pub fn new(
        dataset_id: &str,
        key_prefix: Option<&str>,
        stage: Stage,
        mut objects: Vec<String>,
        token_totals: Option<BTreeMap<String, u64>>,
    ) -> Self {
        objects.sort();
        objects.dedup();
        Self {
            metadata: ManifestMetadata {
                dataset_id: dataset_id.to_string(),
                key_prefix: key_prefix.map(str::to_string),
                stage,
                count: objects.len(),
                token_totals,
                created_at: Utc::now(),
            },
            objects,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::gzip(&serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(&codec::gunzip(data)?)?)
    }
}

/// Key of the manifest for `stage`
///
/// `index/{dataset}[-{prefix}].json.gz` for representations and
/// `index/{dataset}[-{prefix}].{stage}.json.gz` for every other stage, with
/// `/` in the prefix replaced by `-`.
pub fn manifest_key(dataset_id: &str, key_prefix: Option<&str>, stage: Stage) -> String {
    let mut name = dataset_id.to_string();
    if let Some(prefix) = key_prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        name.push('-');
        name.push_str(&prefix.replace('/', "-"));
    }
    match stage {
        Stage::Representations => format!("{}/{}.json.gz", Stage::Index, name),
        other => format!("{}/{}.{}.json.gz", Stage::Index, name, other),
    }
}
