//! PDF extraction with an ordered fallback chain
//!
//! Each document is classified from a quick byte scan, then the configured
//! strategies run in order until one yields usable text. OCR is only
//! attempted on image-only documents; a PDF with a text layer that the
//! direct extractor cannot read is a parsing problem, not a scanning one.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ParserConfig;
use crate::error::{Error, Result};
use crate::ingestion::external_parser::{ConversionBackend, Extraction, OcrBackend};

/// Text layout of a PDF, judged from its raw bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PdfKind {
    TextNative,
    Mixed,
    ImageOnly,
}

impl PdfKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PdfKind::TextNative => "text_native",
            PdfKind::Mixed => "mixed",
            PdfKind::ImageOnly => "image_only",
        }
    }
}

/// Quick structural scan of PDF bytes, no full parse
#[derive(Debug, Clone, Default)]
pub struct PdfAnalysis {
    pub is_encrypted: bool,
    /// Has ToUnicode CMaps, which the direct extractor handles poorly
    pub has_complex_fonts: bool,
    pub estimated_pages: u32,
    pub image_count: usize,
    /// Number of `BT` (begin text) operators
    pub text_stream_count: usize,
}

fn count(data: &[u8], needle: &[u8]) -> usize {
    data.windows(needle.len()).filter(|w| *w == needle).count()
}

impl PdfAnalysis {
    pub fn analyze(data: &[u8]) -> Self {
        if !data.starts_with(b"%PDF-") {
            return Self::default();
        }

        let image_count = count(data, b"/Image ") + count(data, b"/Image/") + count(data, b"/Image>");
        let text_stream_count = count(data, b"BT ") + count(data, b"BT\n") + count(data, b"BT\r");
        let estimated_pages = (count(data, b"/Page ") + count(data, b"/Page\n") + count(data, b"/Page\r")
            + count(data, b"/Page/") + count(data, b"/Page>")) as u32;

        Self {
            is_encrypted: count(data, b"/Encrypt") > 0,
            has_complex_fonts: count(data, b"/ToUnicode") > 0,
            estimated_pages: estimated_pages.max(1),
            image_count,
            text_stream_count,
        }
    }

    pub fn kind(&self) -> PdfKind {
        match (self.text_stream_count > 0, self.image_count > 0) {
            (false, true) => PdfKind::ImageOnly,
            (true, true) => PdfKind::Mixed,
            _ => PdfKind::TextNative,
        }
    }
}

/// One step of the fallback chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PdfStrategy {
    /// In-process extraction (pdf-extract, then lopdf)
    Direct,
    /// Remote conversion service
    Conversion,
    /// Rasterize and OCR, image-only documents only
    Ocr,
}

impl PdfStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PdfStrategy::Direct => "direct",
            PdfStrategy::Conversion => "conversion",
            PdfStrategy::Ocr => "ocr",
        }
    }
}

impl std::fmt::Display for PdfStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one strategy attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserAttempt {
    pub parser_name: String,
    pub success: bool,
    pub error: Option<String>,
    pub chars_extracted: Option<usize>,
    pub duration_ms: u64,
}

/// Winning text plus the trail of attempts that led to it
#[derive(Debug, Clone)]
pub struct PdfExtraction {
    pub text: String,
    pub method: PdfStrategy,
    pub kind: PdfKind,
    pub attempts: Vec<ParserAttempt>,
}

/// Runs the PDF fallback chain
pub struct PdfExtractor {
    strategies: Vec<PdfStrategy>,
    direct_timeout: Duration,
    ocr_max_pages: u32,
    conversion: Option<Arc<dyn ConversionBackend>>,
    ocr: Option<Arc<dyn OcrBackend>>,
}

impl PdfExtractor {
    pub fn new(
        config: &ParserConfig,
        conversion: Option<Arc<dyn ConversionBackend>>,
        ocr: Option<Arc<dyn OcrBackend>>,
    ) -> Self {
        Self {
            strategies: config.pdf_fallback.clone(),
            direct_timeout: Duration::from_secs(config.direct_timeout_secs),
            ocr_max_pages: config.ocr.max_pages,
            conversion,
            ocr,
        }
    }

    pub async fn extract(&self, identifier: &str, data: &[u8]) -> Result<PdfExtraction> {
        let analysis = PdfAnalysis::analyze(data);
        let kind = analysis.kind();
        let start = Instant::now();
        let mut attempts = Vec::new();

        tracing::debug!(
            "[{}] PDF scan: kind={}, pages~{}, images={}, text_streams={}, encrypted={}",
            identifier,
            kind.as_str(),
            analysis.estimated_pages,
            analysis.image_count,
            analysis.text_stream_count,
            analysis.is_encrypted
        );

        for &strategy in &self.strategies {
            let attempt_start = Instant::now();
            let result = match strategy {
                PdfStrategy::Direct => self.try_direct(data).await,
                PdfStrategy::Conversion => match self.conversion {
                    Some(ref backend) => backend.convert(data, "application/pdf").await,
                    None => {
                        tracing::debug!("[{}] no conversion backend, skipping", identifier);
                        continue;
                    }
                },
                PdfStrategy::Ocr => match self.ocr {
                    Some(ref backend) if kind == PdfKind::ImageOnly => {
                        backend
                            .recognize(data, self.ocr_max_pages)
                            .await
                            .map(|e| match e {
                                Extraction::Text(text) => Extraction::from_text(normalize_ocr_text(&text)),
                                Extraction::NoText => Extraction::NoText,
                            })
                    }
                    Some(_) => {
                        tracing::debug!("[{}] OCR skipped for {} PDF", identifier, kind.as_str());
                        continue;
                    }
                    None => {
                        tracing::debug!("[{}] no OCR backend, skipping", identifier);
                        continue;
                    }
                },
            };
            let duration_ms = attempt_start.elapsed().as_millis() as u64;

            match result {
                Ok(Extraction::Text(text)) => {
                    let chars = text.chars().count();
                    attempts.push(ParserAttempt {
                        parser_name: strategy.to_string(),
                        success: true,
                        error: None,
                        chars_extracted: Some(chars),
                        duration_ms,
                    });
                    tracing::debug!(
                        "[{}] PDF extracted with '{}': {} chars in {}ms",
                        identifier,
                        strategy,
                        chars,
                        duration_ms
                    );
                    return Ok(PdfExtraction {
                        text,
                        method: strategy,
                        kind,
                        attempts,
                    });
                }
                Ok(Extraction::NoText) => {
                    attempts.push(ParserAttempt {
                        parser_name: strategy.to_string(),
                        success: false,
                        error: Some("no text".to_string()),
                        chars_extracted: Some(0),
                        duration_ms,
                    });
                    tracing::debug!("[{}] '{}' found no text", identifier, strategy);
                }
                Err(e) => {
                    attempts.push(ParserAttempt {
                        parser_name: strategy.to_string(),
                        success: false,
                        error: Some(e.to_string()),
                        chars_extracted: None,
                        duration_ms,
                    });
                    tracing::debug!("[{}] '{}' failed: {}", identifier, strategy, e);
                }
            }
        }

        let details = attempts
            .iter()
            .map(|a| {
                format!(
                    "{}: {} ({}ms)",
                    a.parser_name,
                    a.error.as_deref().unwrap_or("no text"),
                    a.duration_ms
                )
            })
            .collect::<Vec<_>>()
            .join("; ");

        Err(Error::extraction_failed(
            identifier,
            format!(
                "{} PDF, {} strategies failed after {}ms [{}]",
                kind.as_str(),
                attempts.len(),
                start.elapsed().as_millis(),
                details
            ),
        ))
    }

    async fn try_direct(&self, data: &[u8]) -> Result<Extraction> {
        let data = data.to_vec();
        let timeout = self.direct_timeout;
        let text = tokio::task::spawn_blocking(move || extract_direct(data, timeout)).await??;
        Ok(Extraction::from_text(cleanup_pdf_text(&text)))
    }
}

/// pdf-extract on its own thread with a deadline, lopdf as the fallback
///
/// pdf-extract can hang or panic on unusual font programs; the thread is
/// abandoned on timeout since it cannot be cancelled.
fn extract_direct(data: Vec<u8>, timeout: Duration) -> Result<String> {
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    let worker_data = data.clone();
    std::thread::spawn(move || {
        let _ = tx.send(pdf_extract::extract_text_from_mem(&worker_data));
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(text)) if !text.trim().is_empty() => Ok(text),
        Ok(Ok(_)) => extract_with_lopdf(&data),
        Ok(Err(e)) => {
            tracing::debug!("pdf-extract failed: {}, trying lopdf", e);
            extract_with_lopdf(&data)
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            tracing::warn!("pdf-extract timed out after {}s, trying lopdf", timeout.as_secs());
            extract_with_lopdf(&data)
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            tracing::warn!("pdf-extract thread crashed, trying lopdf");
            extract_with_lopdf(&data)
        }
    }
}

fn extract_with_lopdf(data: &[u8]) -> Result<String> {
    let doc = lopdf::Document::load_mem(data)
        .map_err(|e| Error::extraction_failed("pdf", format!("Failed to load PDF: {}", e)))?;
    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    doc.extract_text(&pages)
        .map_err(|e| Error::extraction_failed("pdf", format!("lopdf text extraction: {}", e)))
}

/// Glyph names some PDF fonts leak into extracted text
const GLYPH_NAMES: &[(&str, &str)] = &[
    ("uni2010", "-"),
    ("uni2011", "-"),
    ("uni2013", "-"),
    ("uni2014", "--"),
    ("uni2018", "'"),
    ("uni2019", "'"),
    ("uni201C", "\""),
    ("uni201D", "\""),
    ("uni2022", "* "),
    ("uni2026", "..."),
    ("uni00A0", " "),
    ("f_f_i", "ffi"),
    ("f_f_l", "ffl"),
    ("f_i", "fi"),
    ("f_l", "fl"),
    ("f_f", "ff"),
];

/// Fold typographic characters to ASCII, drop NULs and blank lines
pub fn cleanup_pdf_text(text: &str) -> String {
    let mut result = text.replace('\0', "");
    for (glyph, replacement) in GLYPH_NAMES {
        if result.contains(glyph) {
            result = result
                .replace(&format!("({})", glyph), replacement)
                .replace(&format!("<{}>", glyph), replacement);
        }
    }

    let mut folded = String::with_capacity(result.len());
    for c in result.chars() {
        match c {
            '\u{2010}' | '\u{2011}' | '\u{2013}' => folded.push('-'),
            '\u{2014}' => folded.push_str("--"),
            '\u{2018}' | '\u{2019}' => folded.push('\''),
            '\u{201C}' | '\u{201D}' => folded.push('"'),
            '\u{2022}' => folded.push_str("* "),
            '\u{2026}' => folded.push_str("..."),
            '\u{00A0}' => folded.push(' '),
            '\u{FB00}' => folded.push_str("ff"),
            '\u{FB01}' => folded.push_str("fi"),
            '\u{FB02}' => folded.push_str("fl"),
            '\u{FB03}' => folded.push_str("ffi"),
            '\u{FB04}' => folded.push_str("ffl"),
            other => folded.push(other),
        }
    }

    folded
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Tidy OCR output: rejoin hyphenated line breaks, collapse runs of spaces,
/// keep single blank lines between paragraphs and page breaks
pub fn normalize_ocr_text(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut carry = String::new();

    for raw in text.lines() {
        let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        let line = if carry.is_empty() {
            collapsed
        } else {
            format!("{}{}", std::mem::take(&mut carry), collapsed.trim_start())
        };

        if line.ends_with('-') && line.len() > 1 && !line.ends_with(" -") {
            carry = line[..line.len() - 1].to_string();
            continue;
        }
        lines.push(line);
    }
    if !carry.is_empty() {
        lines.push(carry);
    }

    let mut out = String::new();
    let mut blank = false;
    for line in lines {
        if line.is_empty() {
            blank = true;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank { "\n\n" } else { "\n" });
        }
        blank = false;
        out.push_str(&line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{image_only_pdf, StubConversion, StubOcr};

    #[test]
    fn test_pdf_analysis() {
        let analysis = PdfAnalysis::analyze(b"%PDF-1.4\n/Type /Page \nBT (hello) Tj ET");
        assert!(!analysis.is_encrypted);
        assert_eq!(analysis.kind(), PdfKind::TextNative);

        let analysis = PdfAnalysis::analyze(b"%PDF-1.4\n/Encrypt 5 0 R");
        assert!(analysis.is_encrypted);

        assert_eq!(PdfAnalysis::analyze(&image_only_pdf()).kind(), PdfKind::ImageOnly);

        let mixed = b"%PDF-1.4\n/Subtype /Image /Width 4\nBT (caption) Tj ET";
        assert_eq!(PdfAnalysis::analyze(mixed).kind(), PdfKind::Mixed);

        assert_eq!(PdfAnalysis::analyze(b"not a pdf").kind(), PdfKind::TextNative);
    }

    #[test]
    fn test_cleanup_pdf_text() {
        let cleaned = cleanup_pdf_text("  \u{201C}Quoted\u{201D} \u{FB01}nal\0\n\n\u{2022}item  ");
        assert_eq!(cleaned, "\"Quoted\" final\n* item");
    }

    #[test]
    fn test_normalize_ocr_text() {
        let raw = "The  quick  brown\nfox jum-\nped over\n\n\n\nthe lazy dog\n";
        assert_eq!(
            normalize_ocr_text(raw),
            "The quick brown\nfox jumped over\n\nthe lazy dog"
        );
    }

    #[tokio::test]
    async fn test_image_only_pdf_walks_full_chain() {
        let conversion = Arc::new(StubConversion::no_text());
        let ocr = Arc::new(StubOcr::with_text("Scanned   page\ntext"));
        let extractor = PdfExtractor::new(
            &ParserConfig::default(),
            Some(conversion.clone()),
            Some(ocr.clone()),
        );

        let extraction = extractor.extract("scan.pdf", &image_only_pdf()).await.unwrap();

        assert_eq!(extraction.method, PdfStrategy::Ocr);
        assert_eq!(extraction.kind, PdfKind::ImageOnly);
        assert_eq!(extraction.text, "Scanned page\ntext");
        let order: Vec<&str> = extraction.attempts.iter().map(|a| a.parser_name.as_str()).collect();
        assert_eq!(order, vec!["direct", "conversion", "ocr"]);
        assert_eq!(conversion.calls(), 1);
        assert_eq!(ocr.calls(), 1);
    }

    #[tokio::test]
    async fn test_ocr_not_used_for_text_pdfs() {
        let ocr = Arc::new(StubOcr::with_text("should not run"));
        let extractor = PdfExtractor::new(&ParserConfig::default(), None, Some(ocr.clone()));

        let err = extractor
            .extract("broken.pdf", b"%PDF-1.4\nBT (x) Tj ET garbage")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ExtractionFailed { .. }));
        assert_eq!(ocr.calls(), 0);
    }

    #[tokio::test]
    async fn test_all_strategies_exhausted() {
        let extractor = PdfExtractor::new(
            &ParserConfig::default(),
            Some(Arc::new(StubConversion::no_text())),
            Some(Arc::new(StubOcr::no_text())),
        );

        let err = extractor.extract("blank.pdf", &image_only_pdf()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ExtractionFailed);
        assert!(err.to_string().contains("3 strategies failed"));
    }
}
