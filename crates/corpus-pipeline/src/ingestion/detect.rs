//! Media type detection
//!
//! A declared content type wins when it is recognized. Generic or missing
//! types fall back to magic-byte sniffing, and sniffing that cannot decide
//! yields `Unsupported` rather than a guess.

use serde::{Deserialize, Serialize};

/// Parser-relevant classification of a payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "mime", rename_all = "snake_case")]
pub enum MediaType {
    Html,
    Xml,
    Json,
    Pdf,
    Archive,
    PlainText,
    Markdown,
    Uuencoded,
    /// Declared type with no native handler; routed to the conversion service
    Other(String),
    /// Nothing conclusive
    Unsupported(String),
}

const GENERIC_TYPES: &[&str] = &[
    "application/octet-stream",
    "binary/octet-stream",
    "application/binary",
    "application/unknown",
];

impl MediaType {
    /// Classify a declared content type; `None` when absent or generic
    pub fn from_declared(format: Option<&str>) -> Option<MediaType> {
        let essence = format?
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if essence.is_empty() || GENERIC_TYPES.contains(&essence.as_str()) {
            return None;
        }

        let media = match essence.as_str() {
            "text/html" | "application/xhtml+xml" => MediaType::Html,
            "text/xml" | "application/xml" => MediaType::Xml,
            "application/json" | "text/json" => MediaType::Json,
            "application/pdf" | "application/x-pdf" => MediaType::Pdf,
            "application/zip" | "application/x-zip-compressed" | "application/x-zip" => {
                MediaType::Archive
            }
            "text/plain" => MediaType::PlainText,
            "text/markdown" | "text/x-markdown" => MediaType::Markdown,
            "application/uuencode" | "text/x-uuencode" | "application/x-uuencode" => {
                MediaType::Uuencoded
            }
            other if other.ends_with("+xml") => MediaType::Xml,
            other if other.ends_with("+json") => MediaType::Json,
            other => MediaType::Other(other.to_string()),
        };
        Some(media)
    }

    /// Classify from a file name (archive members, uudecoded payloads)
    pub fn from_filename(name: &str) -> Option<MediaType> {
        let guess = mime_guess::from_path(name).first()?;
        Self::from_declared(Some(guess.essence_str()))
    }

    /// Classify from content bytes alone
    pub fn sniff(data: &[u8]) -> MediaType {
        if data.starts_with(b"%PDF-") {
            return MediaType::Pdf;
        }
        if data.starts_with(b"PK\x03\x04") || data.starts_with(b"PK\x05\x06") {
            return MediaType::Archive;
        }

        let body = skip_bom_and_whitespace(data);
        if body.is_empty() {
            return MediaType::Unsupported("empty content".to_string());
        }
        if is_uuencode_header(body) {
            return MediaType::Uuencoded;
        }

        let head: Vec<u8> = body
            .iter()
            .take(1024)
            .map(|b| b.to_ascii_lowercase())
            .collect();

        if head.starts_with(b"<") {
            if contains(&head, b"<!doctype html") || contains(&head, b"<html") {
                return MediaType::Html;
            }
            if head.starts_with(b"<?xml") || head.get(1).is_some_and(|b| b.is_ascii_alphabetic()) {
                return MediaType::Xml;
            }
        }

        if (body[0] == b'{' || body[0] == b'[')
            && serde_json::from_slice::<serde_json::Value>(body).is_ok()
        {
            return MediaType::Json;
        }

        if looks_like_text(body) {
            return MediaType::PlainText;
        }

        MediaType::Unsupported("unrecognized binary content".to_string())
    }

    /// Declared type first, sniffing when the declaration is absent or generic
    pub fn detect(format: Option<&str>, data: &[u8]) -> MediaType {
        Self::from_declared(format).unwrap_or_else(|| Self::sniff(data))
    }

    /// Canonical MIME type
    pub fn mime(&self) -> &str {
        match self {
            MediaType::Html => "text/html",
            MediaType::Xml => "application/xml",
            MediaType::Json => "application/json",
            MediaType::Pdf => "application/pdf",
            MediaType::Archive => "application/zip",
            MediaType::PlainText => "text/plain",
            MediaType::Markdown => "text/markdown",
            MediaType::Uuencoded => "text/x-uuencode",
            MediaType::Other(mime) => mime,
            MediaType::Unsupported(_) => "application/octet-stream",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Unsupported(reason) => write!(f, "unsupported ({})", reason),
            other => f.write_str(other.mime()),
        }
    }
}

fn skip_bom_and_whitespace(data: &[u8]) -> &[u8] {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    &data[start..]
}

pub(crate) fn is_uuencode_header(data: &[u8]) -> bool {
    // "begin 644 name"
    let Some(rest) = data.strip_prefix(b"begin ") else {
        return false;
    };
    let mode_len = rest.iter().take_while(|b| b.is_ascii_digit()).count();
    (3..=4).contains(&mode_len) && rest.get(mode_len) == Some(&b' ')
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Valid UTF-8 with no control characters besides ordinary whitespace
fn looks_like_text(data: &[u8]) -> bool {
    let sample = &data[..data.len().min(8192)];
    let text = match std::str::from_utf8(sample) {
        Ok(text) => text,
        // A multi-byte character may straddle the sample boundary
        Err(e) if e.error_len().is_none() => match std::str::from_utf8(&sample[..e.valid_up_to()]) {
            Ok(text) => text,
            Err(_) => return false,
        },
        Err(_) => return false,
    };
    !text
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t' | '\u{0c}'))
}
