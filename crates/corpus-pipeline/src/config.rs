//! Configuration for the corpus pipeline

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::ingestion::PdfStrategy;
use crate::pipeline::Stage;

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    /// Object store backend
    pub store: StoreConfig,
    /// Worker pool and per-job limits
    pub processing: ProcessingConfig,
    /// Format detection and extraction
    pub parser: ParserConfig,
    /// Content filters and tokenizers
    pub representation: RepresentationConfig,
    /// Export filters and sinks
    pub export: ExportConfig,
    /// Manifest generation
    pub index: IndexConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("Invalid config: {}", e)))
    }

    /// Override selected values from `CORPUS_PIPELINE_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("CORPUS_PIPELINE_ROOT") {
            self.store.root = PathBuf::from(root);
        }
        if let Ok(bucket) = std::env::var("CORPUS_PIPELINE_BUCKET") {
            self.store.bucket = Some(bucket);
        }
        if let Ok(url) = std::env::var("CORPUS_PIPELINE_CONVERSION_URL") {
            self.parser.conversion.url = url;
            self.parser.conversion.enabled = true;
        }
        if let Ok(key) = std::env::var("CORPUS_PIPELINE_CONVERSION_API_KEY") {
            self.parser.conversion.api_key = Some(key);
        }
    }
}

/// Object store backend selection
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Filesystem rooted at `store.root`
    #[default]
    Local,
    /// In-process map (tests and dry runs)
    Memory,
    /// Google Cloud Storage bucket (requires the `gcp` feature)
    Gcs,
}

/// Object store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Root directory for the local backend
    pub root: PathBuf,
    /// Bucket name for the GCS backend
    pub bucket: Option<String>,
    /// Page size used when listing keys
    pub list_page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        // Use absolute path to avoid depending on the working directory
        let root = dirs::data_local_dir()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")))
            .join("corpus-pipeline")
            .join("store");

        Self {
            backend: StoreBackend::Local,
            root,
            bucket: None,
            list_page_size: 1000,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Number of worker tasks (default: CPU count, max 8)
    pub max_workers: Option<usize>,
    /// Maximum raw document size in bytes (default: 64MB)
    pub max_size: usize,
    /// Per-document deadline in seconds (default: 300 = 5 minutes)
    pub job_timeout_secs: u64,
    /// Keys dispatched between cancellation checks
    pub batch_size: usize,
    /// Bounded queue capacity (default: 4x workers)
    pub queue_capacity: Option<usize>,
    /// Log progress every N completed jobs
    pub progress_interval: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            max_size: 64 * 1024 * 1024, // 64MB
            job_timeout_secs: 300,
            batch_size: 1000,
            queue_capacity: None,
            progress_interval: 100,
        }
    }
}

impl ProcessingConfig {
    /// Effective worker count
    pub fn workers(&self) -> usize {
        self.max_workers
            .unwrap_or_else(|| num_cpus::get().min(8))
            .max(1)
    }

    /// Effective queue capacity
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
            .unwrap_or_else(|| self.workers() * 4)
            .max(1)
    }

    pub fn job_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.job_timeout_secs)
    }
}

/// Parser configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// PDF extraction strategies, tried in order
    pub pdf_fallback: Vec<PdfStrategy>,
    /// Deadline for the in-process PDF extractor in seconds
    pub direct_timeout_secs: u64,
    /// Maximum archive nesting depth (1 = members of the top-level archive only)
    pub max_archive_depth: usize,
    /// Local OCR (pdftoppm + tesseract)
    pub ocr: OcrConfig,
    /// Remote conversion service
    pub conversion: ConversionConfig,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            pdf_fallback: vec![PdfStrategy::Direct, PdfStrategy::Conversion, PdfStrategy::Ocr],
            direct_timeout_secs: 60,
            max_archive_depth: 1,
            ocr: OcrConfig::default(),
            conversion: ConversionConfig::default(),
        }
    }
}

/// OCR configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub enabled: bool,
    /// Pages rasterized per document (default: 50)
    pub max_pages: u32,
    /// Rasterization resolution
    pub dpi: u32,
    /// Tesseract language pack
    pub language: String,
    /// Deadline for the whole OCR pass in seconds
    pub timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_pages: 50,
            dpi: 150, // 150 DPI is good balance of quality and speed
            language: "eng".to_string(),
            timeout_secs: 600,
        }
    }
}

/// Conversion service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub enabled: bool,
    /// Endpoint accepting multipart uploads and returning text elements
    pub url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "https://api.unstructured.io/general/v0/general".to_string(),
            api_key: None,
            timeout_secs: 120,
        }
    }
}

/// A tokenizer loaded from a `tokenizer.json` file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenizerSpec {
    /// Name used as the key in representation token maps
    pub name: String,
    pub path: PathBuf,
}

/// Representation builder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepresentationConfig {
    pub tokenizers: Vec<TokenizerSpec>,
    /// Drop `VerDate ...` print-date boilerplate lines
    pub drop_verdate: bool,
    /// Additional line prefixes to drop
    pub line_prefix_filters: Vec<String>,
    /// Lines matching any of these patterns are dropped
    pub regex_filters: Vec<String>,
}

impl Default for RepresentationConfig {
    fn default() -> Self {
        Self {
            tokenizers: Vec::new(),
            drop_verdate: true,
            line_prefix_filters: Vec::new(),
            regex_filters: Vec::new(),
        }
    }
}

/// Export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Stage read by the export (parquet or representations)
    pub source_stage: Stage,
    /// Tokenizer whose ids are exported (default: first available)
    pub tokenizer: Option<String>,
    /// Preferred representation (default: first available)
    pub mime_type: Option<String>,
    /// Inclusive lower bound on token count
    pub min_tokens: Option<usize>,
    /// Inclusive upper bound on token count
    pub max_tokens: Option<usize>,
    /// Lower percentile bound (0-100) of the sampled token-count distribution
    pub percentile_min: Option<f64>,
    /// Upper percentile bound (0-100)
    pub percentile_max: Option<f64>,
    /// Records sampled to compute percentile bounds
    pub percentile_sample_size: usize,
    pub dedup: bool,
    /// Hash only the first N tokens (default: 1024)
    pub dedup_prefix_tokens: Option<usize>,
    /// Fraction of surviving records kept (0.0-1.0)
    pub sample_rate: Option<f64>,
    pub seed: u64,
    /// Records per write or upload
    pub batch_size: usize,
    /// Stop after this many exported records
    pub max_documents: Option<usize>,
    /// Emit token ids or decoded text
    pub format: ExportFormat,
    /// Drop records whose quality score is above this value
    pub score_threshold: Option<f64>,
    /// Write the quality score with each record
    pub include_score: bool,
    /// Write the full quality metrics with each record
    pub include_metrics: bool,
    pub quality: QualityConfig,
}

impl ExportConfig {
    /// Records must be decoded to text before filtering
    pub fn needs_text(&self) -> bool {
        self.format == ExportFormat::Text
            || self.score_threshold.is_some()
            || self.include_score
            || self.include_metrics
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            source_stage: Stage::Parquet,
            tokenizer: None,
            mime_type: None,
            min_tokens: None,
            max_tokens: None,
            percentile_min: None,
            percentile_max: None,
            percentile_sample_size: 10_000,
            dedup: true,
            dedup_prefix_tokens: Some(1024),
            sample_rate: None,
            seed: 42,
            batch_size: 1000,
            max_documents: None,
            format: ExportFormat::Tokens,
            score_threshold: None,
            include_score: false,
            include_metrics: false,
            quality: QualityConfig::default(),
        }
    }
}

/// Export record payload
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Tokens,
    Text,
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tokens" => Ok(ExportFormat::Tokens),
            "text" => Ok(ExportFormat::Text),
            other => Err(Error::Config(format!("Unknown export format: {}", other))),
        }
    }
}

/// Token ids counted by the quality metrics
///
/// The defaults are the no-space bigram and formatting ids of the
/// `kl3m-004-128k-cased` tokenizer; other vocabularies should override them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QualityConfig {
    pub nospace_bigram_ids: Vec<u32>,
    pub format_token_ids: Vec<u32>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            nospace_bigram_ids: vec![35464, 67042, 108832],
            format_token_ids: vec![
                395, 477, 1819, 2098, 12125, 19220, 25937, 67199, 126985, 126997, 127022, 127034,
            ],
        }
    }
}

/// Manifest configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IndexConfig {
    /// Read every object to compute per-tokenizer token totals
    pub token_totals: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.processing.progress_interval, 100);
        assert_eq!(config.parser.ocr.max_pages, 50);
        assert_eq!(
            config.parser.pdf_fallback,
            vec![PdfStrategy::Direct, PdfStrategy::Conversion, PdfStrategy::Ocr]
        );
        assert_eq!(config.export.source_stage, Stage::Parquet);
        assert!(config.processing.workers() >= 1);
    }

    #[test]
    fn test_partial_toml() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [store]
            backend = "memory"

            [processing]
            max_workers = 3
            job_timeout_secs = 10

            [parser]
            pdf_fallback = ["direct", "ocr"]

            [parser.ocr]
            max_pages = 5

            [[representation.tokenizers]]
            name = "base"
            path = "/models/tokenizer.json"

            [export]
            source_stage = "representations"
            min_tokens = 8000
            format = "text"
            score_threshold = 10.0

            [export.quality]
            format_token_ids = [1, 2]
            "#,
        )
        .unwrap();

        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.processing.workers(), 3);
        assert_eq!(config.processing.queue_capacity(), 12);
        assert_eq!(config.processing.progress_interval, 100);
        assert_eq!(config.parser.pdf_fallback, vec![PdfStrategy::Direct, PdfStrategy::Ocr]);
        assert_eq!(config.parser.ocr.max_pages, 5);
        assert_eq!(config.parser.ocr.language, "eng");
        assert_eq!(config.representation.tokenizers[0].name, "base");
        assert!(config.representation.drop_verdate);
        assert_eq!(config.export.source_stage, Stage::Representations);
        assert_eq!(config.export.min_tokens, Some(8000));
        assert_eq!(config.export.dedup_prefix_tokens, Some(1024));
        assert_eq!(config.export.format, ExportFormat::Text);
        assert_eq!(config.export.score_threshold, Some(10.0));
        assert_eq!(config.export.quality.format_token_ids, vec![1, 2]);
        assert_eq!(config.export.quality.nospace_bigram_ids.len(), 3);
        assert!(config.export.needs_text());
        assert!(!ExportConfig::default().needs_text());
    }

    #[test]
    fn test_invalid_toml() {
        let err = PipelineConfig::from_toml_str("[processing]\nmax_workers = \"many\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
