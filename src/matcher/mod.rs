//! Scores an image embedding against the anchor set and decides its labels.

use serde::Serialize;
use std::fmt;

use crate::anchors::AnchorSet;
use crate::clip::cosine_similarity;
use crate::config::{MatchPolicy, MatchingConfig};

/// Slack for margin and threshold comparisons, so decimal inputs such as
/// 0.31 - 0.26 are not rejected by float rounding.
const SCORE_TOLERANCE: f32 = 1e-6;

/// Why an image got (or did not get) its labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rationale {
    BestMatch,
    ThresholdMargin,
    MultiLabel,
    BelowThreshold,
    InsufficientMargin,
    NoAnchors,
}

impl Rationale {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rationale::BestMatch => "best-match",
            Rationale::ThresholdMargin => "threshold-margin",
            Rationale::MultiLabel => "multi-label",
            Rationale::BelowThreshold => "below-threshold",
            Rationale::InsufficientMargin => "insufficient-margin",
            Rationale::NoAnchors => "no-anchors",
        }
    }
}

impl fmt::Display for Rationale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    /// `(category, similarity)` best first; excluded categories are absent.
    pub ranked: Vec<(String, f32)>,
    /// Chosen categories, primary first. Empty means unclassified.
    pub labels: Vec<String>,
    pub rationale: Rationale,
}

impl ClassificationResult {
    pub fn primary(&self) -> Option<&str> {
        self.labels.first().map(String::as_str)
    }

    pub fn top_score(&self) -> Option<f32> {
        self.ranked.first().map(|(_, score)| *score)
    }

    pub fn is_unclassified(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Matcher {
    policy: MatchPolicy,
    min_score: f32,
    min_margin: f32,
}

impl Matcher {
    pub fn new(config: &MatchingConfig) -> Self {
        Self {
            policy: config.policy,
            min_score: config.min_score,
            min_margin: config.min_margin,
        }
    }

    /// Similarity of `embedding` to every eligible anchor, best first.
    /// Equal scores keep anchor insertion order.
    pub fn rank(&self, embedding: &[f32], anchors: &AnchorSet) -> Vec<(String, f32)> {
        let mut ranked: Vec<(String, f32)> = anchors
            .match_candidates()
            .filter_map(|(category, vector, exclusions)| {
                let score = cosine_similarity(embedding, vector);
                let excluded = exclusions
                    .iter()
                    .any(|ex| cosine_similarity(embedding, ex) >= score);
                (!excluded).then(|| (category.to_string(), score))
            })
            .collect();

        // sort_by is stable, which preserves insertion order on ties
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }

    pub fn classify(&self, embedding: &[f32], anchors: &AnchorSet) -> ClassificationResult {
        let ranked = self.rank(embedding, anchors);
        self.decide(ranked, anchors.is_empty())
    }

    /// Apply the configured policy to an existing ranking.
    pub fn decide(&self, ranked: Vec<(String, f32)>, no_anchors: bool) -> ClassificationResult {
        let unclassified = |ranked: Vec<(String, f32)>, rationale| ClassificationResult {
            ranked,
            labels: Vec::new(),
            rationale,
        };

        if no_anchors {
            return unclassified(ranked, Rationale::NoAnchors);
        }
        // Every anchor excluded itself: nothing is eligible.
        let Some((top_name, top_score)) = ranked.first().cloned() else {
            return unclassified(ranked, Rationale::BelowThreshold);
        };

        match self.policy {
            MatchPolicy::BestMatch => ClassificationResult {
                ranked,
                labels: vec![top_name],
                rationale: Rationale::BestMatch,
            },
            MatchPolicy::ThresholdMargin => {
                if top_score + SCORE_TOLERANCE < self.min_score {
                    return unclassified(ranked, Rationale::BelowThreshold);
                }
                if let Some((_, runner_up)) = ranked.get(1) {
                    if top_score - runner_up + SCORE_TOLERANCE < self.min_margin {
                        return unclassified(ranked, Rationale::InsufficientMargin);
                    }
                }
                ClassificationResult {
                    ranked,
                    labels: vec![top_name],
                    rationale: Rationale::ThresholdMargin,
                }
            }
            MatchPolicy::MultiLabel => {
                let labels: Vec<String> = ranked
                    .iter()
                    .take_while(|(_, score)| score + SCORE_TOLERANCE >= self.min_score)
                    .map(|(name, _)| name.clone())
                    .collect();
                if labels.is_empty() {
                    unclassified(ranked, Rationale::BelowThreshold)
                } else {
                    ClassificationResult {
                        ranked,
                        labels,
                        rationale: Rationale::MultiLabel,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchors::Anchor;

    fn matcher(policy: MatchPolicy) -> Matcher {
        Matcher::new(&MatchingConfig {
            policy,
            min_score: 0.25,
            min_margin: 0.05,
        })
    }

    fn ranking(scores: &[(&str, f32)]) -> Vec<(String, f32)> {
        scores.iter().map(|(n, s)| (n.to_string(), *s)).collect()
    }

    fn anchor(name: &str, vector: Vec<f32>) -> Anchor {
        Anchor {
            category: name.to_string(),
            vector,
            exclusions: Vec::new(),
        }
    }

    #[test]
    fn test_threshold_margin_examples() {
        let m = matcher(MatchPolicy::ThresholdMargin);

        let clear = m.decide(ranking(&[("cats", 0.31), ("dogs", 0.22)]), false);
        assert_eq!(clear.labels, vec!["cats".to_string()]);
        assert_eq!(clear.rationale, Rationale::ThresholdMargin);

        let close = m.decide(ranking(&[("cats", 0.28), ("dogs", 0.26)]), false);
        assert!(close.is_unclassified());
        assert_eq!(close.rationale, Rationale::InsufficientMargin);

        let weak = m.decide(ranking(&[("cats", 0.20), ("dogs", 0.01)]), false);
        assert_eq!(weak.rationale, Rationale::BelowThreshold);
    }

    #[test]
    fn test_margin_exactly_at_limit_passes() {
        let m = matcher(MatchPolicy::ThresholdMargin);
        let result = m.decide(ranking(&[("cats", 0.31), ("dogs", 0.26)]), false);
        assert_eq!(result.primary(), Some("cats"));
    }

    #[test]
    fn test_single_anchor_skips_margin() {
        let m = matcher(MatchPolicy::ThresholdMargin);
        let result = m.decide(ranking(&[("cats", 0.26)]), false);
        assert_eq!(result.primary(), Some("cats"));
    }

    #[test]
    fn test_best_match_and_multi_label() {
        let scores = ranking(&[("cats", 0.40), ("dogs", 0.30), ("birds", 0.10)]);

        let best = matcher(MatchPolicy::BestMatch).decide(scores.clone(), false);
        assert_eq!(best.labels, vec!["cats".to_string()]);

        let multi = matcher(MatchPolicy::MultiLabel).decide(scores, false);
        assert_eq!(multi.labels, vec!["cats".to_string(), "dogs".to_string()]);
        assert_eq!(multi.rationale, Rationale::MultiLabel);
    }

    #[test]
    fn test_no_anchors() {
        let result = matcher(MatchPolicy::BestMatch).classify(&[1.0, 0.0], &AnchorSet::new());
        assert!(result.is_unclassified());
        assert_eq!(result.rationale, Rationale::NoAnchors);
    }

    #[test]
    fn test_ties_follow_insertion_order() {
        let mut set = AnchorSet::new();
        set.insert(anchor("first", vec![1.0, 0.0]));
        set.insert(anchor("second", vec![0.0, 1.0]));

        let m = matcher(MatchPolicy::BestMatch);
        let embedding = [std::f32::consts::FRAC_1_SQRT_2; 2];
        for _ in 0..3 {
            let result = m.classify(&embedding, &set);
            assert_eq!(result.primary(), Some("first"));
        }
    }

    #[test]
    fn test_exclusion_removes_category() {
        let mut set = AnchorSet::new();
        let mut dogs = anchor("dogs", vec![1.0, 0.0, 0.0]);
        dogs.exclusions.push(vec![0.0, 1.0, 0.0]);
        set.insert(dogs);
        set.insert(anchor("cats", vec![0.0, 0.0, 1.0]));

        // Closer to the exclusion than to the dog anchor.
        let embedding = [0.5, 0.8, 0.3];
        let ranked = matcher(MatchPolicy::BestMatch).rank(&embedding, &set);
        let names: Vec<&str> = ranked.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["cats"]);
    }
}
