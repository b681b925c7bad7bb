//! Envelope stripping applied before dispatch
//!
//! Some collectors store PDFs inside `<PDF>...</PDF>` tags, EDGAR filings
//! wrap XML documents in `<XML>...</XML>`, and older filings embed binary
//! attachments as uuencoded text.

use crate::error::{Error, Result};

/// Strip a `<PDF>` wrapper, returning the inner bytes when present
pub fn strip_pdf_wrapper(data: &[u8]) -> Option<&[u8]> {
    strip_tag(data, b"<pdf>", b"</pdf>")
}

/// Strip an EDGAR-style `<XML>` wrapper
pub fn strip_xml_wrapper(text: &str) -> &str {
    match strip_tag(text.as_bytes(), b"<xml>", b"</xml>") {
        // Tag boundaries are ASCII, so the slice stays on char boundaries
        Some(inner) => std::str::from_utf8(inner).unwrap_or(text),
        None => text,
    }
}

fn strip_tag<'a>(data: &'a [u8], open: &[u8], close: &[u8]) -> Option<&'a [u8]> {
    let start = data.iter().position(|b| !b.is_ascii_whitespace())?;
    let trimmed = &data[start..];
    if trimmed.len() < open.len() || !trimmed[..open.len()].eq_ignore_ascii_case(open) {
        return None;
    }
    let mut inner = trim_ascii_end(&trimmed[open.len()..]);
    if inner.len() >= close.len() && inner[inner.len() - close.len()..].eq_ignore_ascii_case(close) {
        inner = trim_ascii_end(&inner[..inner.len() - close.len()]);
    }

    let first = inner
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(inner.len());
    Some(&inner[first..])
}

fn trim_ascii_end(data: &[u8]) -> &[u8] {
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &data[..end]
}

/// A decoded uuencoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UuDecoded {
    /// File name from the `begin` line
    pub name: String,
    pub data: Vec<u8>,
}

/// Decode a uuencoded buffer (`begin <mode> <name>` ... `end`)
pub fn uudecode(input: &[u8]) -> Result<UuDecoded> {
    let text = String::from_utf8_lossy(input);
    let mut lines = text.lines().skip_while(|l| l.trim().is_empty());

    let header = lines
        .next()
        .ok_or_else(|| Error::encoding("uuencode: empty input"))?;
    let mut parts = header.trim().splitn(3, ' ');
    if parts.next() != Some("begin") {
        return Err(Error::encoding("uuencode: missing begin line"));
    }
    let _mode = parts.next();
    let name = parts.next().unwrap_or("file").trim().to_string();

    let mut data = Vec::new();
    let mut terminated = false;
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.trim() == "end" {
            terminated = true;
            break;
        }
        let bytes = line.as_bytes();
        let Some(&count_char) = bytes.first() else {
            continue;
        };
        let count = ((count_char.wrapping_sub(b' ')) & 0x3f) as usize;
        if count == 0 {
            continue;
        }

        let mut decoded = Vec::with_capacity(count + 2);
        for group in bytes[1..].chunks(4) {
            let mut sextets = [0u8; 4];
            for (slot, &c) in sextets.iter_mut().zip(group) {
                *slot = c.wrapping_sub(b' ') & 0x3f;
            }
            decoded.push((sextets[0] << 2) | (sextets[1] >> 4));
            decoded.push((sextets[1] << 4) | (sextets[2] >> 2));
            decoded.push((sextets[2] << 6) | sextets[3]);
        }
        if decoded.len() < count {
            return Err(Error::encoding("uuencode: truncated line"));
        }
        data.extend_from_slice(&decoded[..count]);
    }

    if !terminated && data.is_empty() {
        return Err(Error::encoding("uuencode: no data"));
    }

    Ok(UuDecoded { name, data })
}
