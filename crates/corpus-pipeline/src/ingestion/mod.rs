//! Format detection and parsing of raw stage-1 payloads

pub mod archive;
pub mod detect;
pub mod dispatch;
pub mod external_parser;
pub mod html;
pub mod pdf;
pub mod wrappers;
pub mod xml;

pub use detect::MediaType;
pub use dispatch::{ParseInput, ParserDispatch};
pub use external_parser::{
    ConversionBackend, Extraction, HttpConversionBackend, OcrBackend, TesseractOcr,
};
pub use pdf::{ParserAttempt, PdfAnalysis, PdfExtraction, PdfExtractor, PdfKind, PdfStrategy};
