//! Character- and token-level quality metrics
//!
//! A record's score is a weighted sum of how far each metric falls outside
//! its expected range, relative to the violated bound. Zero means every
//! metric is in range; larger is worse. The ranges are the 2nd/98th
//! percentiles of clean statutory and regulatory text.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::config::QualityConfig;

const EPS: f64 = 1e-8;

/// `(metric, weight, lower, upper)` in scoring order
const EXPECTED: [(&str, f64, f64, f64); 16] = [
    ("ratio_whitespace", 1.0, 0.121212, 0.193813),
    ("average_line_length", 1.0, 17.5, 245.0),
    ("average_paragraph_length", 1.0, 35.0, 849.0),
    ("ratio_alphanumeric", 1.0, 0.594595, 0.822884),
    ("ratio_alpha_to_numeric", 0.1, 1.829268, 265.1),
    ("ratio_non_ascii", 2.0, 0.0, 0.034483),
    ("ratio_capital", 1.0, 0.008368, 0.224638),
    ("ratio_punctuation", 1.0, 0.021601, 0.210867),
    ("average_word_length", 1.5, 4.498695, 7.285714),
    ("type_token_ratio", 1.5, 0.387879, 0.66055),
    ("token_entropy", 0.5, 3.38158, 7.855401),
    ("char_entropy", 0.5, 4.066784, 5.017473),
    ("max_token_frequency_ratio", 1.0, 0.04028, 0.153846),
    ("repetition_rate", 1.5, 0.33945, 0.612121),
    ("ratio_format_tokens", 1.0, 0.0, 0.0),
    ("ratio_nospace_bigrams", 2.0, 0.0, 0.0),
];

/// Metrics for one decoded record
///
/// `type_token_ratio` and `token_entropy` are computed over token ids, not
/// whitespace-separated words.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub total_characters: usize,
    pub num_lines: usize,
    pub num_paragraphs: usize,
    pub num_words: usize,
    pub ratio_whitespace: f64,
    pub average_line_length: f64,
    pub average_paragraph_length: f64,
    pub ratio_alphanumeric: f64,
    pub ratio_alpha_to_numeric: f64,
    pub ratio_non_ascii: f64,
    pub ratio_capital: f64,
    pub ratio_punctuation: f64,
    pub average_word_length: f64,
    pub char_entropy: f64,
    pub total_tokens: usize,
    pub unique_tokens: usize,
    pub type_token_ratio: f64,
    pub token_entropy: f64,
    pub max_token_frequency_ratio: f64,
    pub repetition_rate: f64,
    pub ratio_format_tokens: f64,
    pub ratio_nospace_bigrams: f64,
}

fn entropy<'a>(counts: impl Iterator<Item = &'a usize>, total: usize) -> f64 {
    counts
        .map(|&count| {
            let p = count as f64 / total as f64;
            -p * p.log2()
        })
        .sum()
}

impl QualityMetrics {
    /// Measure `text` (the decoded form of `tokens`)
    pub fn measure(text: &str, tokens: &[u32], config: &QualityConfig) -> Self {
        let mut metrics = Self::default();
        metrics.measure_text(text);
        metrics.measure_tokens(tokens, config);
        metrics
    }

    fn measure_text(&mut self, text: &str) {
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        if total == 0 {
            // No digits: the alpha/numeric ratio is undefined and left unscored
            self.ratio_alpha_to_numeric = f64::INFINITY;
            return;
        }

        let mut whitespace = 0usize;
        let mut alpha = 0usize;
        let mut digits = 0usize;
        let mut capitals = 0usize;
        let mut punctuation = 0usize;
        let mut non_ascii = 0usize;
        let mut alphanumeric = 0usize;
        let mut lines = 1usize;
        let mut paragraphs = 1usize;
        let mut char_counts: HashMap<char, usize> = HashMap::new();

        for (i, &c) in chars.iter().enumerate() {
            *char_counts.entry(c).or_insert(0) += 1;
            if c.is_whitespace() {
                whitespace += 1;
                if c == '\n' {
                    lines += 1;
                }
            }
            if c.is_alphabetic() {
                alpha += 1;
                if c.is_uppercase() {
                    capitals += 1;
                }
            } else if c.is_numeric() {
                digits += 1;
            }
            if c.is_alphanumeric() {
                alphanumeric += 1;
            }
            if c.is_ascii_punctuation() {
                punctuation += 1;
            }
            if !c.is_ascii() {
                non_ascii += 1;
            }
            // A sentence end followed by a line break pair opens a paragraph
            if c == '.'
                && i + 2 < total
                && matches!((chars[i + 1], chars[i + 2]), ('\r', '\n') | ('\n', '\n'))
            {
                paragraphs += 1;
            }
        }

        let total_f = total as f64;
        self.total_characters = total;
        self.num_lines = lines;
        self.num_paragraphs = paragraphs;
        self.ratio_whitespace = whitespace as f64 / total_f;
        self.ratio_alphanumeric = alphanumeric as f64 / total_f;
        self.ratio_alpha_to_numeric = if digits > 0 {
            alpha as f64 / digits as f64
        } else {
            f64::INFINITY
        };
        self.ratio_non_ascii = non_ascii as f64 / total_f;
        self.ratio_capital = if alpha > 0 { capitals as f64 / alpha as f64 } else { 0.0 };
        self.ratio_punctuation = punctuation as f64 / total_f;
        self.average_line_length = total_f / lines as f64;
        self.average_paragraph_length = total_f / paragraphs as f64;
        self.char_entropy = entropy(char_counts.values(), total);

        let words: Vec<&str> = text.split_whitespace().collect();
        self.num_words = words.len();
        if !words.is_empty() {
            let letters: usize = words.iter().map(|w| w.chars().count()).sum();
            self.average_word_length = letters as f64 / words.len() as f64;
        }
    }

    fn measure_tokens(&mut self, tokens: &[u32], config: &QualityConfig) {
        let total = tokens.len();
        self.total_tokens = total;
        if total == 0 {
            return;
        }

        let bigram_ids: HashSet<u32> = config.nospace_bigram_ids.iter().copied().collect();
        let format_ids: HashSet<u32> = config.format_token_ids.iter().copied().collect();
        let mut counts: HashMap<u32, usize> = HashMap::new();
        let mut bigrams = 0usize;
        let mut formats = 0usize;
        for id in tokens {
            *counts.entry(*id).or_insert(0) += 1;
            if bigram_ids.contains(id) {
                bigrams += 1;
            }
            if format_ids.contains(id) {
                formats += 1;
            }
        }

        let total_f = total as f64;
        self.unique_tokens = counts.len();
        self.type_token_ratio = counts.len() as f64 / total_f;
        self.token_entropy = entropy(counts.values(), total);
        self.max_token_frequency_ratio = counts.values().copied().max().unwrap_or(0) as f64 / total_f;
        self.repetition_rate = 1.0 - self.type_token_ratio;
        self.ratio_nospace_bigrams = bigrams as f64 / total_f;
        self.ratio_format_tokens = formats as f64 / total_f;
    }

    fn value(&self, metric: &str) -> f64 {
        match metric {
            "ratio_whitespace" => self.ratio_whitespace,
            "average_line_length" => self.average_line_length,
            "average_paragraph_length" => self.average_paragraph_length,
            "ratio_alphanumeric" => self.ratio_alphanumeric,
            "ratio_alpha_to_numeric" => self.ratio_alpha_to_numeric,
            "ratio_non_ascii" => self.ratio_non_ascii,
            "ratio_capital" => self.ratio_capital,
            "ratio_punctuation" => self.ratio_punctuation,
            "average_word_length" => self.average_word_length,
            "type_token_ratio" => self.type_token_ratio,
            "token_entropy" => self.token_entropy,
            "char_entropy" => self.char_entropy,
            "max_token_frequency_ratio" => self.max_token_frequency_ratio,
            "repetition_rate" => self.repetition_rate,
            "ratio_format_tokens" => self.ratio_format_tokens,
            "ratio_nospace_bigrams" => self.ratio_nospace_bigrams,
            _ => f64::NAN,
        }
    }

    /// Weighted out-of-range deviation; non-finite metrics are not scored
    pub fn score(&self) -> f64 {
        EXPECTED
            .iter()
            .map(|&(metric, weight, lower, upper)| {
                let value = self.value(metric);
                if !value.is_finite() {
                    0.0
                } else if lower == upper {
                    let deviation = (value - lower).abs();
                    if deviation > EPS {
                        weight * deviation
                    } else {
                        0.0
                    }
                } else if value < lower {
                    weight * (lower - value) / (lower.abs() + EPS)
                } else if value > upper {
                    weight * (value - upper) / (upper.abs() + EPS)
                } else {
                    0.0
                }
            })
            .sum()
    }

    /// Score per token, comparable across document lengths
    pub fn adjusted_score(&self) -> f64 {
        self.score() / self.total_tokens.max(1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_range() -> QualityMetrics {
        QualityMetrics {
            ratio_whitespace: 0.15,
            average_line_length: 80.0,
            average_paragraph_length: 400.0,
            ratio_alphanumeric: 0.7,
            ratio_alpha_to_numeric: 20.0,
            ratio_non_ascii: 0.0,
            ratio_capital: 0.05,
            ratio_punctuation: 0.05,
            average_word_length: 5.0,
            type_token_ratio: 0.5,
            token_entropy: 5.0,
            char_entropy: 4.5,
            max_token_frequency_ratio: 0.1,
            repetition_rate: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_in_range_scores_zero() {
        assert_eq!(in_range().score(), 0.0);
    }

    #[test]
    fn test_deviation_is_relative_and_weighted() {
        // 50% above the upper bound with weight 1.5
        let metrics = QualityMetrics {
            average_word_length: 7.285714 * 1.5,
            ..in_range()
        };
        assert!((metrics.score() - 0.75).abs() < 1e-6);

        // fixed-value metrics are penalized by absolute difference
        let metrics = QualityMetrics {
            ratio_nospace_bigrams: 0.1,
            total_tokens: 4,
            ..in_range()
        };
        assert!((metrics.score() - 0.2).abs() < 1e-9);
        assert!((metrics.adjusted_score() - 0.05).abs() < 1e-9);

        // an undefined ratio is skipped rather than penalized
        let metrics = QualityMetrics {
            ratio_alpha_to_numeric: f64::INFINITY,
            ..in_range()
        };
        assert_eq!(metrics.score(), 0.0);
    }

    #[test]
    fn test_measure_text() {
        let metrics = QualityMetrics::measure("Ab 12.\n\nCd", &[], &QualityConfig::default());
        assert_eq!(metrics.total_characters, 10);
        assert_eq!(metrics.num_lines, 3);
        assert_eq!(metrics.num_paragraphs, 2);
        assert_eq!(metrics.num_words, 3);
        assert!((metrics.ratio_whitespace - 0.3).abs() < 1e-9);
        assert!((metrics.ratio_alpha_to_numeric - 2.0).abs() < 1e-9);
        assert!((metrics.ratio_capital - 0.5).abs() < 1e-9);
        assert!((metrics.ratio_punctuation - 0.1).abs() < 1e-9);

        let metrics = QualityMetrics::measure("One.\r\nTwo. Three.\nFour", &[], &QualityConfig::default());
        assert_eq!(metrics.num_paragraphs, 2);
        assert_eq!(metrics.num_lines, 3);
    }

    #[test]
    fn test_measure_tokens() {
        let config = QualityConfig {
            nospace_bigram_ids: vec![9],
            format_token_ids: vec![8],
        };
        let metrics = QualityMetrics::measure("", &[1, 1, 2, 9, 8], &config);
        assert_eq!(metrics.unique_tokens, 4);
        assert!((metrics.type_token_ratio - 0.8).abs() < 1e-9);
        assert!((metrics.repetition_rate - 0.2).abs() < 1e-9);
        assert!((metrics.max_token_frequency_ratio - 0.4).abs() < 1e-9);
        assert!((metrics.ratio_nospace_bigrams - 0.2).abs() < 1e-9);
        assert!((metrics.ratio_format_tokens - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_text_scores_high() {
        let config = QualityConfig::default();
        let prose = "The Secretary shall prescribe regulations to carry out this section. \
                     Such regulations shall take effect not later than ninety days after enactment.";
        let tokens: Vec<u32> = (0..24).collect();
        let clean = QualityMetrics::measure(prose, &tokens, &config).score();
        let junk = QualityMetrics::measure("$$$$ #### @@@@ 0000 ---- ****", &[7; 24], &config).score();
        assert!(junk > clean);
    }
}
