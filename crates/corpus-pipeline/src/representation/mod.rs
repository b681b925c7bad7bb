//! Filtering and tokenization of parsed representations

pub mod builder;
pub mod filters;
pub mod tokenizer;

pub use builder::RepresentationBuilder;
pub use filters::{ContentFilter, FilterChain, LinePrefixFilter, RegexLineFilter, VerDateFilter};
pub use tokenizer::{HfTokenizer, TokenEncoder};
