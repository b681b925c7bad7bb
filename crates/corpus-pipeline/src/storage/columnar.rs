//! Token ids as columnar rows
//!
//! One row per (document, representation, tokenizer). The default encoder
//! writes a single Parquet file per stage-2 object and zlib-wraps it, the
//! same envelope used for stage-1 and stage-2 content.

use arrow::array::{Array, ListArray, ListBuilder, RecordBatch, StringArray, UInt32Array, UInt32Builder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::codec;
use crate::types::ParsedDocument;

/// One tokenized representation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnarRow {
    pub identifier: String,
    pub mime_type: String,
    pub tokenizer: String,
    pub tokens: Vec<u32>,
}

impl ColumnarRow {
    /// Rows for every successful document, in document then key order
    pub fn from_documents(documents: &[ParsedDocument]) -> Vec<ColumnarRow> {
        let mut rows = Vec::new();
        for doc in documents.iter().filter(|d| d.success) {
            for (mime_type, representation) in &doc.representations {
                for (tokenizer, tokens) in &representation.tokens {
                    rows.push(ColumnarRow {
                        identifier: doc.identifier.clone(),
                        mime_type: mime_type.clone(),
                        tokenizer: tokenizer.clone(),
                        tokens: tokens.clone(),
                    });
                }
            }
        }
        rows
    }
}

/// Stage-3 codec
pub trait ColumnarEncoder: Send + Sync {
    /// `None` when there is nothing to write
    fn encode(&self, documents: &[ParsedDocument]) -> Result<Option<Vec<u8>>>;

    fn decode(&self, data: &[u8]) -> Result<Vec<ColumnarRow>>;

    /// Content type recorded in the object metadata
    fn content_type(&self) -> &str;
}

/// Zlib-wrapped Parquet
#[derive(Debug, Clone, Default)]
pub struct ParquetEncoder;

impl ParquetEncoder {
    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("identifier", DataType::Utf8, false),
            Field::new("mime_type", DataType::Utf8, false),
            Field::new("tokenizer", DataType::Utf8, false),
            Field::new(
                "tokens",
                DataType::List(Arc::new(Field::new("item", DataType::UInt32, true))),
                false,
            ),
        ]))
    }

    fn write_parquet(rows: &[ColumnarRow]) -> Result<Vec<u8>> {
        let schema = Self::schema();

        let identifiers: StringArray = rows.iter().map(|r| Some(r.identifier.as_str())).collect();
        let mime_types: StringArray = rows.iter().map(|r| Some(r.mime_type.as_str())).collect();
        let tokenizers: StringArray = rows.iter().map(|r| Some(r.tokenizer.as_str())).collect();
        let mut tokens = ListBuilder::new(UInt32Builder::new());
        for row in rows {
            tokens.values().append_slice(&row.tokens);
            tokens.append(true);
        }

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(identifiers),
                Arc::new(mime_types),
                Arc::new(tokenizers),
                Arc::new(tokens.finish()),
            ],
        )
        .map_err(|e| Error::encoding(format!("Failed to create RecordBatch: {}", e)))?;

        let props = WriterProperties::builder().build();
        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(props))
            .map_err(|e| Error::encoding(format!("Failed to create ArrowWriter: {}", e)))?;
        writer
            .write(&batch)
            .map_err(|e| Error::encoding(format!("Failed to write batch: {}", e)))?;
        writer
            .close()
            .map_err(|e| Error::encoding(format!("Failed to close writer: {}", e)))?;

        Ok(buffer)
    }

    fn read_parquet(data: Bytes) -> Result<Vec<ColumnarRow>> {
        let reader = ParquetRecordBatchReaderBuilder::try_new(data)
            .map_err(|e| Error::encoding(format!("Failed to create Parquet reader: {}", e)))?
            .build()
            .map_err(|e| Error::encoding(format!("Failed to build reader: {}", e)))?;

        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch.map_err(|e| Error::encoding(format!("Failed to read batch: {}", e)))?;

            let strings = |index: usize, name: &str| {
                batch
                    .column(index)
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or_else(|| Error::encoding(format!("Invalid {} column type", name)))
            };
            let identifiers = strings(0, "identifier")?;
            let mime_types = strings(1, "mime_type")?;
            let tokenizers = strings(2, "tokenizer")?;
            let tokens = batch
                .column(3)
                .as_any()
                .downcast_ref::<ListArray>()
                .ok_or_else(|| Error::encoding("Invalid tokens column type"))?;

            for i in 0..batch.num_rows() {
                let values = tokens.value(i);
                let ids = values
                    .as_any()
                    .downcast_ref::<UInt32Array>()
                    .ok_or_else(|| Error::encoding("Invalid token id type"))?;
                rows.push(ColumnarRow {
                    identifier: identifiers.value(i).to_string(),
                    mime_type: mime_types.value(i).to_string(),
                    tokenizer: tokenizers.value(i).to_string(),
                    tokens: ids.values().to_vec(),
                });
            }
        }

        Ok(rows)
    }
}

impl ColumnarEncoder for ParquetEncoder {
    fn encode(&self, documents: &[ParsedDocument]) -> Result<Option<Vec<u8>>> {
        let rows = ColumnarRow::from_documents(documents);
        if rows.is_empty() {
            return Ok(None);
        }
        let parquet = Self::write_parquet(&rows)?;
        codec::compress(&parquet).map(Some)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<ColumnarRow>> {
        let parquet = codec::decompress(data)?;
        Self::read_parquet(Bytes::from(parquet))
    }

    fn content_type(&self) -> &str {
        "application/vnd.apache.parquet+zlib"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenized(identifier: &str, tokens: &[(&str, &str, Vec<u32>)]) -> ParsedDocument {
        let mut doc = ParsedDocument::new("test", identifier);
        for (mime, tokenizer, ids) in tokens {
            doc.add_representation(mime, "content");
            if let Some(rep) = doc.representations.get_mut(*mime) {
                rep.tokens.insert(tokenizer.to_string(), ids.clone());
            }
        }
        doc
    }

    #[test]
    fn test_rows_from_successful_documents_only() {
        let ok = tokenized("a", &[("text/plain", "gpt2", vec![1, 2, 3])]);
        let failed = ParsedDocument::failed("test", "b", None, "nothing left");
        let rows = ColumnarRow::from_documents(&[ok, failed]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].identifier, "a");
    }

    #[test]
    fn test_parquet_preserves_rows() {
        let docs = vec![
            tokenized("a", &[("text/plain", "gpt2", vec![10, 20]), ("text/markdown", "gpt2", vec![])]),
            tokenized("b", &[("application/json", "bert", vec![4_000_000_000])]),
        ];
        let encoder = ParquetEncoder;

        let bytes = encoder.encode(&docs).unwrap().unwrap();
        let rows = encoder.decode(&bytes).unwrap();

        assert_eq!(rows, ColumnarRow::from_documents(&docs));
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_nothing_to_encode() {
        let untokenized = ParsedDocument::new("test", "c");
        assert!(ParquetEncoder.encode(&[untokenized]).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_payload() {
        assert!(ParquetEncoder.decode(b"not zlib").is_err());
    }
}
