//! Columnar encoding of the parquet stage

mod columnar;

pub use columnar::{ColumnarEncoder, ColumnarRow, ParquetEncoder};
