//! Export filters
//!
//! Applied per record in a fixed order: empty records, token-count bounds,
//! quality score, percentile bounds, content-hash dedup, then random
//! sampling. A record rejected by an
//! earlier filter never reaches a later one, so it cannot claim a dedup hash
//! or consume a sampling draw.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::config::ExportConfig;

use super::record::ExportRecord;

/// Why a record was kept or dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterDecision {
    Kept,
    /// No tokens, or decoded to empty text
    Empty,
    BelowMin,
    AboveMax,
    /// Quality score above the threshold
    LowQuality,
    OutsidePercentile,
    Duplicate,
    SampledOut,
}

/// Inclusive token-count range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenBounds {
    pub min: Option<usize>,
    pub max: Option<usize>,
}

impl TokenBounds {
    pub fn check(&self, count: usize) -> FilterDecision {
        if self.min.is_some_and(|min| count < min) {
            FilterDecision::BelowMin
        } else if self.max.is_some_and(|max| count > max) {
            FilterDecision::AboveMax
        } else {
            FilterDecision::Kept
        }
    }
}

/// Nearest-rank percentile of a sorted sample (`p` in 0..=100)
pub fn percentile(sorted: &[usize], p: f64) -> Option<usize> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = ((p.clamp(0.0, 100.0) / 100.0) * n as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, n) - 1])
}

/// Percentile bounds resolved to token counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PercentileBounds {
    pub lower: Option<usize>,
    pub upper: Option<usize>,
}

impl PercentileBounds {
    /// Resolve `p_min`/`p_max` against a sample of token counts
    pub fn from_sample(mut counts: Vec<usize>, p_min: Option<f64>, p_max: Option<f64>) -> Self {
        counts.sort_unstable();
        Self {
            lower: p_min.and_then(|p| percentile(&counts, p)),
            upper: p_max.and_then(|p| percentile(&counts, p)),
        }
    }

    pub fn contains(&self, count: usize) -> bool {
        self.lower.map_or(true, |lower| count >= lower) && self.upper.map_or(true, |upper| count <= upper)
    }
}

/// SHA-256 of the little-endian token ids, optionally over a prefix only
pub fn token_hash(tokens: &[u32], prefix: Option<usize>) -> [u8; 32] {
    let tokens = match prefix {
        Some(n) => &tokens[..tokens.len().min(n)],
        None => tokens,
    };
    let mut hasher = Sha256::new();
    for id in tokens {
        hasher.update(id.to_le_bytes());
    }
    hasher.finalize().into()
}

/// First-occurrence-wins dedup over token hashes
#[derive(Debug, Default)]
pub struct Deduplicator {
    prefix: Option<usize>,
    seen: HashSet<[u8; 32]>,
}

impl Deduplicator {
    pub fn new(prefix: Option<usize>) -> Self {
        Self {
            prefix,
            seen: HashSet::new(),
        }
    }

    /// `true` the first time a token sequence is seen
    pub fn insert(&mut self, tokens: &[u32]) -> bool {
        self.seen.insert(token_hash(tokens, self.prefix))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Seeded Bernoulli sampler
#[derive(Debug)]
pub struct Sampler {
    rate: f64,
    rng: StdRng,
}

impl Sampler {
    pub fn new(rate: f64, seed: u64) -> Self {
        Self {
            rate: rate.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn keep(&mut self) -> bool {
        self.rng.gen_bool(self.rate)
    }
}

/// The full filter sequence for one export
#[derive(Debug)]
pub struct ExportFilter {
    bounds: TokenBounds,
    score_threshold: Option<f64>,
    percentile: Option<PercentileBounds>,
    dedup: Option<Deduplicator>,
    sampler: Option<Sampler>,
}

impl ExportFilter {
    pub fn new(
        bounds: TokenBounds,
        percentile: Option<PercentileBounds>,
        dedup: Option<Deduplicator>,
        sampler: Option<Sampler>,
    ) -> Self {
        Self {
            bounds,
            score_threshold: None,
            percentile,
            dedup,
            sampler,
        }
    }

    /// Drop records scoring above `threshold`; unscored records pass
    pub fn with_score_threshold(mut self, threshold: Option<f64>) -> Self {
        self.score_threshold = threshold;
        self
    }

    /// Filters described by `config`, with percentile bounds already resolved
    pub fn from_config(config: &ExportConfig, percentile: Option<PercentileBounds>) -> Self {
        Self::new(
            TokenBounds {
                min: config.min_tokens,
                max: config.max_tokens,
            },
            percentile,
            config
                .dedup
                .then(|| Deduplicator::new(config.dedup_prefix_tokens)),
            config.sample_rate.map(|rate| Sampler::new(rate, config.seed)),
        )
        .with_score_threshold(config.score_threshold)
    }

    pub fn decide(&mut self, record: &ExportRecord) -> FilterDecision {
        let count = record.tokens.len();
        if count == 0 || record.text.as_deref().is_some_and(str::is_empty) {
            return FilterDecision::Empty;
        }

        let decision = self.bounds.check(count);
        if decision != FilterDecision::Kept {
            return decision;
        }
        if let (Some(threshold), Some(score)) = (self.score_threshold, record.score) {
            if score > threshold {
                return FilterDecision::LowQuality;
            }
        }
        if let Some(percentile) = &self.percentile {
            if !percentile.contains(count) {
                return FilterDecision::OutsidePercentile;
            }
        }
        if let Some(dedup) = &mut self.dedup {
            if !dedup.insert(&record.tokens) {
                return FilterDecision::Duplicate;
            }
        }
        if let Some(sampler) = &mut self.sampler {
            if !sampler.keep() {
                return FilterDecision::SampledOut;
            }
        }
        FilterDecision::Kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(identifier: &str, tokens: Vec<u32>) -> ExportRecord {
        ExportRecord::new(identifier, "edgar", "text/plain", tokens)
    }

    #[test]
    fn test_min_tokens_is_inclusive() {
        let bounds = TokenBounds {
            min: Some(8000),
            max: None,
        };
        assert_eq!(bounds.check(7999), FilterDecision::BelowMin);
        assert_eq!(bounds.check(8000), FilterDecision::Kept);

        let bounds = TokenBounds {
            min: None,
            max: Some(10),
        };
        assert_eq!(bounds.check(10), FilterDecision::Kept);
        assert_eq!(bounds.check(11), FilterDecision::AboveMax);
    }

    #[test]
    fn test_nearest_rank_percentile() {
        let sample: Vec<usize> = (1..=10).map(|n| n * 10).collect();
        assert_eq!(percentile(&sample, 0.0), Some(10));
        assert_eq!(percentile(&sample, 10.0), Some(10));
        assert_eq!(percentile(&sample, 50.0), Some(50));
        assert_eq!(percentile(&sample, 95.0), Some(100));
        assert_eq!(percentile(&sample, 100.0), Some(100));
        assert_eq!(percentile(&[], 50.0), None);

        let bounds = PercentileBounds::from_sample(vec![50, 10, 30, 20, 40], Some(20.0), Some(80.0));
        assert_eq!(bounds.lower, Some(10));
        assert_eq!(bounds.upper, Some(40));
        assert!(bounds.contains(40));
        assert!(!bounds.contains(41));
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let mut filter = ExportFilter::new(TokenBounds::default(), None, Some(Deduplicator::new(None)), None);
        let decisions: Vec<_> = ["A", "B", "C"]
            .iter()
            .map(|id| filter.decide(&record(id, vec![1, 2, 3])))
            .collect();
        assert_eq!(
            decisions,
            vec![FilterDecision::Kept, FilterDecision::Duplicate, FilterDecision::Duplicate]
        );
    }

    #[test]
    fn test_dedup_prefix() {
        let mut dedup = Deduplicator::new(Some(2));
        assert!(dedup.insert(&[1, 2, 3]));
        assert!(!dedup.insert(&[1, 2, 4]));
        assert!(dedup.insert(&[1, 3]));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_rejected_records_do_not_claim_hashes() {
        let mut filter = ExportFilter::new(
            TokenBounds {
                min: Some(3),
                max: None,
            },
            None,
            Some(Deduplicator::new(None)),
            None,
        );
        assert_eq!(filter.decide(&record("short", vec![1, 2])), FilterDecision::BelowMin);
        assert_eq!(filter.decide(&record("long", vec![1, 2, 3])), FilterDecision::Kept);
    }

    #[test]
    fn test_score_threshold_follows_token_bounds() {
        let scored = |identifier: &str, tokens: Vec<u32>, score: f64| {
            let mut record = record(identifier, tokens);
            record.score = Some(score);
            record
        };
        let mut filter = ExportFilter::new(
            TokenBounds {
                min: Some(2),
                max: None,
            },
            None,
            Some(Deduplicator::new(None)),
            None,
        )
        .with_score_threshold(Some(5.0));

        assert_eq!(filter.decide(&scored("short", vec![1], 50.0)), FilterDecision::BelowMin);
        assert_eq!(filter.decide(&scored("noisy", vec![1, 2], 5.5)), FilterDecision::LowQuality);
        // equal to the threshold is kept, and the noisy copy never claimed the hash
        assert_eq!(filter.decide(&scored("clean", vec![1, 2], 5.0)), FilterDecision::Kept);
        assert_eq!(filter.decide(&record("unscored", vec![3, 4])), FilterDecision::Kept);
    }

    #[test]
    fn test_empty_records_are_dropped_first() {
        let mut filter = ExportFilter::new(TokenBounds::default(), None, None, None);
        assert_eq!(filter.decide(&record("none", Vec::new())), FilterDecision::Empty);

        let mut blank = record("blank", vec![1]);
        blank.text = Some(String::new());
        assert_eq!(filter.decide(&blank), FilterDecision::Empty);
    }

    #[test]
    fn test_sampling_is_seeded() {
        let draws = |seed| {
            let mut sampler = Sampler::new(0.5, seed);
            (0..64).map(|_| sampler.keep()).collect::<Vec<_>>()
        };
        assert_eq!(draws(7), draws(7));
        assert!(draws(7).iter().any(|k| *k));
        assert!(draws(7).iter().any(|k| !*k));

        assert!((0..32).all(|_| Sampler::new(1.0, 1).keep()));
        let mut never = Sampler::new(0.0, 1);
        assert!((0..32).all(|_| !never.keep()));
    }
}
