//! Zip archive expansion

use std::io::{Cursor, Read};

use crate::error::Result;

/// One file inside an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path inside the archive
    pub name: String,
    pub data: Vec<u8>,
    /// Uncompressed size declared by the archive
    pub declared_size: u64,
}

/// File names that never carry document content
pub fn is_junk_entry(name: &str) -> bool {
    let file_name = name.rsplit('/').next().unwrap_or(name).to_ascii_lowercase();
    if file_name.is_empty() || name.starts_with("__MACOSX/") {
        return true;
    }
    matches!(file_name.as_str(), "thumbs.db" | ".ds_store" | "desktop.ini")
        || file_name.ends_with(".ini")
        || file_name.ends_with(".db")
}

/// Read every regular file in a zip archive, in archive order
///
/// Members are read up to `max_entry_size + 1` bytes so an oversized entry is
/// still detectable by the caller without inflating it fully.
pub fn read_entries(data: &[u8], max_entry_size: usize) -> Result<Vec<ArchiveEntry>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))?;
    let mut entries = Vec::new();

    for index in 0..archive.len() {
        let file = archive.by_index(index)?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().trim_start_matches('/').to_string();
        if is_junk_entry(&name) {
            tracing::debug!("Skipping archive member {}", name);
            continue;
        }

        let declared_size = file.size();
        let mut buf = Vec::with_capacity((declared_size as usize).min(max_entry_size));
        file.take(max_entry_size as u64 + 1).read_to_end(&mut buf)?;

        entries.push(ArchiveEntry {
            name,
            data: buf,
            declared_size,
        });
    }

    Ok(entries)
}
