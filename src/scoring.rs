//! Similarity scoring between normalized keys.
//!
//! This module contains:
//! - Default field weights and tier thresholds
//! - Token-set and edit-distance similarity components
//! - The combined, symmetric score and its tier mapping
//!
//! Everything here is a pure function of its inputs.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::Tier;
use crate::normalize::NormalizedKey;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_TITLE_WEIGHT: f64 = 0.6;
pub const DEFAULT_ARTIST_WEIGHT: f64 = 0.4;

/// score >= this → exact
pub const EXACT_THRESHOLD: f64 = 0.92;
/// score >= this → high
pub const HIGH_THRESHOLD: f64 = 0.75;
/// score >= this → low; below is unmatched
pub const LOW_THRESHOLD: f64 = 0.55;

const WEIGHT_TOLERANCE: f64 = 1e-9;

// ============================================================================
// Configuration
// ============================================================================

/// Field weights and tier thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub title_weight: f64,
    pub artist_weight: f64,
    pub exact_threshold: f64,
    pub high_threshold: f64,
    pub low_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            title_weight: DEFAULT_TITLE_WEIGHT,
            artist_weight: DEFAULT_ARTIST_WEIGHT,
            exact_threshold: EXACT_THRESHOLD,
            high_threshold: HIGH_THRESHOLD,
            low_threshold: LOW_THRESHOLD,
        }
    }
}

impl ScoringConfig {
    /// Weights must be in [0,1] and sum to 1; thresholds must descend
    /// strictly inside (0,1].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let weights_in_range = (0.0..=1.0).contains(&self.title_weight)
            && (0.0..=1.0).contains(&self.artist_weight);
        if !weights_in_range
            || (self.title_weight + self.artist_weight - 1.0).abs() > WEIGHT_TOLERANCE
        {
            return Err(ConfigError::InvalidWeights {
                title: self.title_weight,
                artist: self.artist_weight,
            });
        }

        let ordered = self.exact_threshold <= 1.0
            && self.exact_threshold > self.high_threshold
            && self.high_threshold > self.low_threshold
            && self.low_threshold > 0.0;
        if !ordered {
            return Err(ConfigError::InvalidThresholds {
                exact: self.exact_threshold,
                high: self.high_threshold,
                low: self.low_threshold,
            });
        }
        Ok(())
    }

    /// Map a score onto its tier using the fixed thresholds.
    pub fn tier_for(&self, score: f64) -> Tier {
        if score >= self.exact_threshold {
            Tier::Exact
        } else if score >= self.high_threshold {
            Tier::High
        } else if score >= self.low_threshold {
            Tier::Low
        } else {
            Tier::None
        }
    }

    /// Weighted title/artist similarity in [0,1]. An empty key on either
    /// side scores 0.
    pub fn score(&self, a: &NormalizedKey, b: &NormalizedKey) -> f64 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let title_sim = component_similarity(&a.title_tokens, &b.title_tokens);
        let artist_sim = component_similarity(&a.artist_tokens, &b.artist_tokens);
        (self.title_weight * title_sim + self.artist_weight * artist_sim).clamp(0.0, 1.0)
    }
}

// ============================================================================
// Similarity Components
// ============================================================================

/// Jaccard similarity on word tokens (0.0 to 1.0).
pub fn token_set_similarity(a: &[String], b: &[String]) -> f64 {
    let tokens_a: FxHashSet<&str> = a.iter().map(String::as_str).collect();
    let tokens_b: FxHashSet<&str> = b.iter().map(String::as_str).collect();

    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let intersection = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();

    intersection as f64 / union as f64
}

/// Normalized Levenshtein ratio on the space-joined tokens (0.0 to 1.0).
pub fn edit_similarity(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    strsim::normalized_levenshtein(&a.join(" "), &b.join(" "))
}

/// One field's similarity: 1.0 on identical tokens, otherwise the mean of
/// the token-set and edit-distance ratios. Either side empty gives 0.0.
pub fn component_similarity(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    (0.5 * token_set_similarity(a, b) + 0.5 * edit_similarity(a, b)).clamp(0.0, 1.0)
}

/// Score with the default weights.
pub fn score(a: &NormalizedKey, b: &NormalizedKey) -> f64 {
    ScoringConfig::default().score(a, b)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;

    #[test]
    fn test_identical_keys_score_one() {
        let a = normalize("Daft Punk", "One More Time");
        let b = normalize("Daft Punk", "One More Time (Radio Edit)");
        assert_eq!(score(&a, &b), 1.0);
        assert_eq!(ScoringConfig::default().tier_for(score(&a, &b)), Tier::Exact);
    }

    #[test]
    fn test_different_title_same_artist_is_unmatched() {
        let a = normalize("Daft Punk", "One More Time");
        let b = normalize("Daft Punk", "Digital Love");
        let s = score(&a, &b);
        assert!(s < LOW_THRESHOLD, "score {s} should be below {LOW_THRESHOLD}");
    }

    #[test]
    fn test_symmetry() {
        let pairs = [
            (normalize("Daft Punk", "One More Time"), normalize("Daft Punk", "Digital Love")),
            (normalize("Aphex Twin", "Windowlicker"), normalize("Aphex Twins", "Window Licker")),
            (normalize("The Beatles", "Let It Be"), normalize("Beatles", "Let It Be Naked")),
            (normalize("", "Intro"), normalize("Someone", "Intro")),
        ];
        for (a, b) in pairs.iter() {
            assert_eq!(score(a, b), score(b, a));
        }
    }

    #[test]
    fn test_empty_marker_forces_zero() {
        let empty = normalize("", "");
        let other = normalize("Artist", "Song");
        assert_eq!(score(&empty, &other), 0.0);
        assert_eq!(score(&empty, &empty), 0.0);
    }

    #[test]
    fn test_bounded() {
        let a = normalize("Orbital", "Halcyon On and On");
        let b = normalize("Orbital", "Halcyon");
        let s = score(&a, &b);
        assert!((0.0..=1.0).contains(&s));
    }

    #[test]
    fn test_token_set_similarity() {
        let a = vec!["one".to_string(), "more".to_string(), "time".to_string()];
        let b = vec!["more".to_string(), "time".to_string()];
        assert!((token_set_similarity(&a, &b) - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(token_set_similarity(&a, &[]), 0.0);
    }

    #[test]
    fn test_tier_boundaries() {
        let config = ScoringConfig::default();
        assert_eq!(config.tier_for(0.92), Tier::Exact);
        assert_eq!(config.tier_for(0.9199), Tier::High);
        assert_eq!(config.tier_for(0.75), Tier::High);
        assert_eq!(config.tier_for(0.7499), Tier::Low);
        assert_eq!(config.tier_for(0.55), Tier::Low);
        assert_eq!(config.tier_for(0.5499), Tier::None);
    }

    #[test]
    fn test_validate() {
        assert!(ScoringConfig::default().validate().is_ok());

        let bad_weights = ScoringConfig {
            title_weight: 0.7,
            ..Default::default()
        };
        assert!(matches!(
            bad_weights.validate(),
            Err(ConfigError::InvalidWeights { .. })
        ));

        let bad_thresholds = ScoringConfig {
            high_threshold: 0.95,
            ..Default::default()
        };
        assert!(matches!(
            bad_thresholds.validate(),
            Err(ConfigError::InvalidThresholds { .. })
        ));
    }

    #[test]
    fn test_custom_weights_shift_score() {
        let a = normalize("Artist One", "Song");
        let b = normalize("Someone Else", "Song");
        let title_heavy = ScoringConfig {
            title_weight: 0.9,
            artist_weight: 0.1,
            ..Default::default()
        };
        assert!(title_heavy.score(&a, &b) > score(&a, &b));
    }
}
