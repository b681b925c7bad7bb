//! Line-level content filters applied before tokenization

use regex::Regex;

use crate::config::RepresentationConfig;
use crate::error::{Error, Result};

/// A pure text transformation
pub trait ContentFilter: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, text: &str) -> String;
}

fn retain_lines(text: &str, keep: impl Fn(&str) -> bool) -> String {
    text.split('\n').filter(|line| keep(line)).collect::<Vec<_>>().join("\n")
}

/// Drops GPO print-date stamps such as `VerDate Mar<15>2010 16:40 Jun 14, 2010 ...`
#[derive(Debug, Clone, Copy, Default)]
pub struct VerDateFilter;

impl ContentFilter for VerDateFilter {
    fn name(&self) -> &str {
        "verdate"
    }

    fn apply(&self, text: &str) -> String {
        retain_lines(text, |line| !line.starts_with("VerDate"))
    }
}

/// Drops lines starting with any configured prefix
#[derive(Debug, Clone)]
pub struct LinePrefixFilter {
    prefixes: Vec<String>,
}

impl LinePrefixFilter {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }
}

impl ContentFilter for LinePrefixFilter {
    fn name(&self) -> &str {
        "line_prefix"
    }

    fn apply(&self, text: &str) -> String {
        retain_lines(text, |line| !self.prefixes.iter().any(|p| line.starts_with(p.as_str())))
    }
}

/// Drops lines matching any configured pattern
#[derive(Debug, Clone)]
pub struct RegexLineFilter {
    patterns: Vec<Regex>,
}

impl RegexLineFilter {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| Error::Config(format!("invalid filter pattern '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }
}

impl ContentFilter for RegexLineFilter {
    fn name(&self) -> &str {
        "regex_line"
    }

    fn apply(&self, text: &str) -> String {
        retain_lines(text, |line| !self.patterns.iter().any(|re| re.is_match(line)))
    }
}

/// Filters applied in order
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn ContentFilter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Box<dyn ContentFilter>>) -> Self {
        Self { filters }
    }

    pub fn from_config(config: &RepresentationConfig) -> Result<Self> {
        let mut filters: Vec<Box<dyn ContentFilter>> = Vec::new();
        if config.drop_verdate {
            filters.push(Box::new(VerDateFilter));
        }
        if !config.line_prefix_filters.is_empty() {
            filters.push(Box::new(LinePrefixFilter::new(config.line_prefix_filters.clone())));
        }
        if !config.regex_filters.is_empty() {
            filters.push(Box::new(RegexLineFilter::new(&config.regex_filters)?));
        }
        Ok(Self { filters })
    }

    pub fn apply(&self, text: &str) -> String {
        let mut current = text.to_string();
        for filter in &self.filters {
            current = filter.apply(&current);
        }
        current
    }

    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdate_lines_removed() {
        let text = "Title\nVerDate Mar<15>2010 16:40 Jun 14, 2010 Jkt 000000\nBody\n  VerDate kept when indented";
        assert_eq!(
            VerDateFilter.apply(text),
            "Title\nBody\n  VerDate kept when indented"
        );
    }

    #[test]
    fn test_chain_from_config() {
        let config = RepresentationConfig {
            line_prefix_filters: vec!["PAGE ".to_string()],
            regex_filters: vec![r"^\s*\d+\s*$".to_string()],
            ..Default::default()
        };
        let chain = FilterChain::from_config(&config).unwrap();
        assert_eq!(chain.names(), vec!["verdate", "line_prefix", "regex_line"]);
        assert_eq!(
            chain.apply("VerDate x\nPAGE 4\n  12 \nreal text"),
            "real text"
        );
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let config = RepresentationConfig {
            regex_filters: vec!["(unclosed".to_string()],
            ..Default::default()
        };
        assert!(matches!(FilterChain::from_config(&config), Err(Error::Config(_))));
    }
}
