//! Compressed payload encoding: base64 over zlib
//!
//! Stage-1 source objects and stage-2 representation content both carry
//! their bytes as `base64(zlib(data))` strings inside JSON.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use std::io::{Read, Write};

use crate::error::{Error, Result};

/// zlib-compress a buffer
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inflate a zlib buffer
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| Error::encoding(format!("zlib: {}", e)))?;
    Ok(decompressed)
}

/// gzip a buffer (manifests)
pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::encoding(format!("gzip: {}", e)))?;
    Ok(out)
}

/// `base64(zlib(data))`
pub fn encode_content(data: &[u8]) -> Result<String> {
    Ok(BASE64.encode(compress(data)?))
}

/// Inverse of [`encode_content`]
pub fn decode_content(encoded: &str) -> Result<Vec<u8>> {
    let compressed = BASE64
        .decode(encoded.trim())
        .map_err(|e| Error::encoding(format!("base64: {}", e)))?;
    decompress(&compressed)
}

/// serde adapter for raw bytes stored as `base64(zlib(bytes))`
pub mod compressed_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = super::encode_content(data).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        if encoded.is_empty() {
            return Ok(Vec::new());
        }
        super::decode_content(&encoded).map_err(serde::de::Error::custom)
    }
}

/// serde adapter for UTF-8 text stored as `base64(zlib(utf8))`
pub mod compressed_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(text: &str, serializer: S) -> Result<S::Ok, S::Error> {
        super::compressed_bytes::serialize(text.as_bytes(), serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        if encoded.is_empty() {
            return Ok(String::new());
        }
        let bytes = super::decode_content(&encoded).map_err(serde::de::Error::custom)?;
        String::from_utf8(bytes).map_err(serde::de::Error::custom)
    }
}
