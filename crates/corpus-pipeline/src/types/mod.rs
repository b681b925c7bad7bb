//! Core data types

pub mod codec;
pub mod document;

pub use document::{ParsedDocument, Representation, RepresentationsPayload, SourceDocument};
