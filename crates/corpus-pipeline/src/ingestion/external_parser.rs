//! External extraction backends
//!
//! - Conversion service: an Unstructured-compatible HTTP endpoint that turns
//!   arbitrary documents into text elements
//! - OCR: pdftoppm (poppler-utils) rasterizes pages, tesseract reads them

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::config::{ConversionConfig, OcrConfig};
use crate::error::{Error, Result};

/// What an external backend produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Text(String),
    /// The backend ran but found nothing readable
    NoText,
}

impl Extraction {
    /// `NoText` when the text is blank
    pub fn from_text(text: String) -> Self {
        if text.trim().is_empty() {
            Extraction::NoText
        } else {
            Extraction::Text(text)
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Extraction::Text(text) => Some(text),
            Extraction::NoText => None,
        }
    }
}

/// Remote document-to-text conversion
#[async_trait]
pub trait ConversionBackend: Send + Sync {
    async fn convert(&self, data: &[u8], media_type: &str) -> Result<Extraction>;

    fn name(&self) -> &str;
}

/// Optical character recognition over PDF pages
#[async_trait]
pub trait OcrBackend: Send + Sync {
    /// Recognize at most `max_pages` pages
    async fn recognize(&self, pdf: &[u8], max_pages: u32) -> Result<Extraction>;

    fn name(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct UnstructuredElement {
    #[serde(default)]
    text: String,
    metadata: Option<UnstructuredMetadata>,
}

#[derive(Debug, Deserialize)]
struct UnstructuredMetadata {
    page_number: Option<u32>,
}

/// Unstructured-compatible conversion service client
pub struct HttpConversionBackend {
    client: Client,
    url: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl HttpConversionBackend {
    pub fn new(config: &ConversionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            timeout_secs: config.timeout_secs,
        })
    }
}

/// Join element texts, blank line between elements and a marker between pages
fn join_elements(elements: Vec<UnstructuredElement>) -> String {
    let mut content = String::new();
    let mut current_page = None;

    for element in elements {
        if element.text.trim().is_empty() {
            continue;
        }
        let page = element.metadata.as_ref().and_then(|m| m.page_number);
        if !content.is_empty() {
            if page.is_some() && current_page.is_some() && page != current_page {
                content.push_str("\n\n\u{0c}\n\n");
            } else {
                content.push_str("\n\n");
            }
        }
        if page.is_some() {
            current_page = page;
        }
        content.push_str(element.text.trim());
    }

    content
}

#[async_trait]
impl ConversionBackend for HttpConversionBackend {
    async fn convert(&self, data: &[u8], media_type: &str) -> Result<Extraction> {
        let extension = mime_guess::get_mime_extensions_str(media_type)
            .and_then(|exts| exts.first())
            .copied()
            .unwrap_or("bin");

        let part = reqwest::multipart::Part::bytes(data.to_vec())
            .file_name(format!("document.{}", extension))
            .mime_str(media_type)?;
        let form = reqwest::multipart::Form::new().part("files", part);

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(ref api_key) = self.api_key {
            request = request.header("unstructured-api-key", api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(self.timeout_secs)
            } else {
                Error::Http(e)
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!(
                "Conversion service error: {} - {}",
                status, body
            )));
        }

        let elements: Vec<UnstructuredElement> = response.json().await?;
        Ok(Extraction::from_text(join_elements(elements)))
    }

    fn name(&self) -> &str {
        "conversion"
    }
}

/// Local OCR via pdftoppm and tesseract
pub struct TesseractOcr {
    dpi: u32,
    language: String,
    timeout: Duration,
}

impl TesseractOcr {
    pub fn new(config: &OcrConfig) -> Self {
        Self {
            dpi: config.dpi,
            language: config.language.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Check both tools are on PATH
    pub async fn is_available() -> bool {
        for tool in ["pdftoppm", "tesseract"] {
            let found = Command::new(tool)
                .arg("-v")
                .output()
                .await
                .is_ok();
            if !found {
                return false;
            }
        }
        true
    }

    async fn rasterize(&self, pdf_path: &Path, out_dir: &Path, max_pages: u32) -> Result<Vec<PathBuf>> {
        let output = Command::new("pdftoppm")
            .arg("-png")
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg("-f")
            .arg("1")
            .arg("-l")
            .arg(max_pages.max(1).to_string())
            .arg(pdf_path)
            .arg(out_dir.join("page"))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Internal(format!("pdftoppm failed to start: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Internal(format!(
                "pdftoppm error: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut pages = Vec::new();
        let mut entries = tokio::fs::read_dir(out_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "png") {
                pages.push(path);
            }
        }
        // pdftoppm zero-pads page numbers, so lexical order is page order
        pages.sort();
        Ok(pages)
    }

    async fn recognize_pages(&self, pdf: &[u8], max_pages: u32) -> Result<Extraction> {
        let workdir = tempfile::Builder::new().prefix("corpus-ocr-").tempdir()?;
        let pdf_path = workdir.path().join("input.pdf");
        tokio::fs::write(&pdf_path, pdf).await?;

        let pages = self.rasterize(&pdf_path, workdir.path(), max_pages).await?;
        if pages.is_empty() {
            return Ok(Extraction::NoText);
        }

        let mut text = String::new();
        for (i, image) in pages.iter().enumerate() {
            let output = Command::new("tesseract")
                .arg(image)
                .arg("stdout")
                .arg("-l")
                .arg(&self.language)
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| Error::Internal(format!("tesseract failed on page {}: {}", i + 1, e)))?;

            if !output.status.success() {
                tracing::debug!(
                    "tesseract page {} failed: {}",
                    i + 1,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                continue;
            }

            let page_text = String::from_utf8_lossy(&output.stdout);
            if !page_text.trim().is_empty() {
                if !text.is_empty() {
                    text.push_str("\n\u{0c}\n");
                }
                text.push_str(&page_text);
            }
        }

        tracing::debug!("OCR read {} characters from {} pages", text.len(), pages.len());
        Ok(Extraction::from_text(text))
    }
}

#[async_trait]
impl OcrBackend for TesseractOcr {
    async fn recognize(&self, pdf: &[u8], max_pages: u32) -> Result<Extraction> {
        match tokio::time::timeout(self.timeout, self.recognize_pages(pdf, max_pages)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.timeout.as_secs())),
        }
    }

    fn name(&self) -> &str {
        "tesseract"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_from_blank_text() {
        assert_eq!(Extraction::from_text("  \n".to_string()), Extraction::NoText);
        assert_eq!(
            Extraction::from_text("words".to_string()).into_text(),
            Some("words".to_string())
        );
    }

    #[test]
    fn test_join_elements_marks_page_breaks() {
        let elements: Vec<UnstructuredElement> = serde_json::from_str(
            r#"[
                {"type": "Title", "text": "Annual Report", "metadata": {"page_number": 1}},
                {"type": "NarrativeText", "text": "Revenue grew.", "metadata": {"page_number": 1}},
                {"type": "NarrativeText", "text": "  ", "metadata": {"page_number": 2}},
                {"type": "NarrativeText", "text": "Outlook.", "metadata": {"page_number": 2}}
            ]"#,
        )
        .unwrap();

        assert_eq!(
            join_elements(elements),
            "Annual Report\n\nRevenue grew.\n\n\u{0c}\n\nOutlook."
        );
    }

    #[test]
    fn test_http_backend_builds_from_config() {
        let backend = HttpConversionBackend::new(&ConversionConfig::default()).unwrap();
        assert_eq!(backend.name(), "conversion");
    }
}
