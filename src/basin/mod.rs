//! Basin classification: discrete regime labels over the trajectory.
//!
//! The classifier itself is a stateless function from one turn's metrics
//! snapshot plus lightweight textual signals to a label from a closed set.
//! Labels say nothing about content quality; they name the structural
//! regime the dialogue is moving in. The coherence pattern is the stateful
//! companion: a trailing window of labels read as locked, breathing, or
//! transitional.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::BasinThresholds;
use crate::metrics::{AlphaEstimate, MetricsSnapshot};

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// The closed set of regime labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasinLabel {
    CollaborativeInquiry,
    CognitiveMimicry,
    DeepResonance,
    GenerativeConflict,
    SycophanticConvergence,
    CreativeDilation,
    ReflexivePerformance,
    Dissociation,
    Transitional,
}

impl BasinLabel {
    /// Every label, in a stable order.
    pub const ALL: [BasinLabel; 9] = [
        BasinLabel::CollaborativeInquiry,
        BasinLabel::CognitiveMimicry,
        BasinLabel::DeepResonance,
        BasinLabel::GenerativeConflict,
        BasinLabel::SycophanticConvergence,
        BasinLabel::CreativeDilation,
        BasinLabel::ReflexivePerformance,
        BasinLabel::Dissociation,
        BasinLabel::Transitional,
    ];
}

impl fmt::Display for BasinLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BasinLabel::CollaborativeInquiry => "Collaborative Inquiry",
            BasinLabel::CognitiveMimicry => "Cognitive Mimicry",
            BasinLabel::DeepResonance => "Deep Resonance",
            BasinLabel::GenerativeConflict => "Generative Conflict",
            BasinLabel::SycophanticConvergence => "Sycophantic Convergence",
            BasinLabel::CreativeDilation => "Creative Dilation",
            BasinLabel::ReflexivePerformance => "Reflexive Performance",
            BasinLabel::Dissociation => "Dissociation",
            BasinLabel::Transitional => "Transitional",
        };
        f.write_str(name)
    }
}

/// How basin labels move over a trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoherencePattern {
    /// Labels oscillate among two or more basins.
    Breathing,
    /// One basin holds past the stability threshold.
    Locked,
    /// No stable pattern yet.
    Transitional,
}

// ---------------------------------------------------------------------------
// Textual signals
// ---------------------------------------------------------------------------

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-zA-Z']+").unwrap());
static SENTENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]+").unwrap());

/// Phrases signalling convergent agreement.
static AGREEMENT_PHRASES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "i agree",
        "agreed",
        "exactly",
        "precisely",
        "absolutely",
        "you're right",
        "you are right",
        "that's right",
        "well said",
        "good point",
        "indeed",
        "yes,",
    ]
});

/// Phrases signalling hedged, performative caution.
static HEDGING_PHRASES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "perhaps",
        "maybe",
        "it seems",
        "i think",
        "i suppose",
        "possibly",
        "arguably",
        "in a sense",
        "one might",
        "sort of",
        "kind of",
    ]
});

/// Lightweight per-turn textual signals feeding the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TextSignals {
    /// Question marks per sentence.
    pub question_density: f64,
    /// Agreement-phrase hits per word.
    pub agreement_density: f64,
    /// Hedging-phrase hits per word.
    pub hedging_density: f64,
    /// Word-trigram Jaccard overlap with the prior turn.
    pub prior_overlap: f64,
}

impl TextSignals {
    /// Extract signals from `text`, comparing against the prior turn's
    /// text for the mimicry proxy.
    pub fn extract(text: &str, prior: Option<&str>) -> Self {
        let lower = text.to_lowercase();
        let words: Vec<&str> = WORD_RE.find_iter(&lower).map(|m| m.as_str()).collect();
        let word_count = words.len().max(1) as f64;

        let sentences = SENTENCE_RE.find_iter(text).count().max(1) as f64;
        let questions = text.matches('?').count() as f64;

        let agreement = AGREEMENT_PHRASES
            .iter()
            .map(|p| lower.matches(p).count())
            .sum::<usize>() as f64;
        let hedging = HEDGING_PHRASES
            .iter()
            .map(|p| lower.matches(p).count())
            .sum::<usize>() as f64;

        let prior_overlap = prior.map_or(0.0, |p| trigram_overlap(&lower, &p.to_lowercase()));

        Self {
            question_density: questions / sentences,
            agreement_density: agreement / word_count,
            hedging_density: hedging / word_count,
            prior_overlap,
        }
    }
}

/// Jaccard overlap of word trigrams; falls back to unigrams for turns
/// shorter than three words.
fn trigram_overlap(a: &str, b: &str) -> f64 {
    let grams = |text: &str| -> Vec<String> {
        let words: Vec<&str> = WORD_RE.find_iter(text).map(|m| m.as_str()).collect();
        if words.len() >= 3 {
            words.windows(3).map(|w| w.join(" ")).collect()
        } else {
            words.iter().map(|w| w.to_string()).collect()
        }
    };
    let left: std::collections::HashSet<String> = grams(a).into_iter().collect();
    let right: std::collections::HashSet<String> = grams(b).into_iter().collect();
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let shared = left.intersection(&right).count() as f64;
    let union = left.union(&right).count() as f64;
    shared / union
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Map one turn's metrics and textual signals to a basin label.
///
/// Rules are ordered from the most specific structural signature to the
/// least; anything unmatched, and any turn too early to carry curvature,
/// is Transitional.
pub fn classify(
    snapshot: &MetricsSnapshot,
    signals: &TextSignals,
    thresholds: &BasinThresholds,
) -> BasinLabel {
    let t = thresholds;
    let (velocity, curvature) = match (snapshot.velocity, snapshot.curvature) {
        (Some(v), Some(c)) => (v, c),
        // Mimicry is recognizable from repetition alone even where a
        // zero-length step left curvature undefined.
        (Some(v), None) if v < t.low_velocity && signals.prior_overlap >= t.mimicry_overlap => {
            return BasinLabel::CognitiveMimicry;
        }
        _ => return BasinLabel::Transitional,
    };
    let distinctiveness = snapshot.voice_distinctiveness;

    if velocity < t.low_velocity && signals.prior_overlap >= t.mimicry_overlap {
        return BasinLabel::CognitiveMimicry;
    }

    if curvature < t.low_curvature
        && signals.agreement_density >= t.agreement_signal
        && (velocity < t.low_velocity
            || distinctiveness.is_some_and(|d| d < t.low_distinctiveness))
    {
        return BasinLabel::SycophanticConvergence;
    }

    if curvature >= t.high_curvature
        && signals.question_density >= t.inquiry_signal
        && distinctiveness.is_some_and(|d| d >= t.low_distinctiveness)
    {
        return BasinLabel::CollaborativeInquiry;
    }

    if curvature >= t.high_curvature
        && velocity >= t.high_velocity
        && signals.agreement_density < t.agreement_signal
        && signals.question_density < t.inquiry_signal
    {
        return BasinLabel::GenerativeConflict;
    }

    if signals.hedging_density >= t.hedging_signal
        && signals.question_density >= t.inquiry_signal
        && distinctiveness.is_some_and(|d| d < t.low_distinctiveness)
    {
        return BasinLabel::ReflexivePerformance;
    }

    if velocity >= t.high_velocity
        && matches!(snapshot.alpha, AlphaEstimate::Degenerate { .. })
    {
        return BasinLabel::Dissociation;
    }

    if velocity >= t.high_velocity && curvature >= t.high_curvature {
        return BasinLabel::CreativeDilation;
    }

    if velocity < t.low_velocity
        && curvature < t.low_curvature
        && signals.prior_overlap < t.mimicry_overlap
        && distinctiveness.is_some_and(|d| d >= t.high_distinctiveness)
    {
        return BasinLabel::DeepResonance;
    }

    BasinLabel::Transitional
}

/// Classify the trailing window of basin labels into a coherence pattern.
///
/// The window must be full before anything other than Transitional is
/// reported, and a window dominated by Transitional labels never reads
/// as locked.
pub fn coherence(labels: &[BasinLabel], window: usize, stability_threshold: f64) -> CoherencePattern {
    if labels.len() < window || window == 0 {
        return CoherencePattern::Transitional;
    }
    let tail = &labels[labels.len() - window..];

    let mut counts: std::collections::HashMap<BasinLabel, usize> = std::collections::HashMap::new();
    for label in tail {
        *counts.entry(*label).or_default() += 1;
    }
    let (&dominant, &dominant_count) = counts
        .iter()
        .max_by_key(|(_, count)| **count)
        .expect("window is non-empty");
    let share = dominant_count as f64 / window as f64;

    if dominant != BasinLabel::Transitional && share > stability_threshold {
        return CoherencePattern::Locked;
    }

    let distinct_active = counts
        .keys()
        .filter(|label| **label != BasinLabel::Transitional)
        .count();
    let changes = tail.windows(2).filter(|pair| pair[0] != pair[1]).count();
    if distinct_active >= 2 && changes >= 2 {
        return CoherencePattern::Breathing;
    }

    CoherencePattern::Transitional
}

/// Number of adjacent-index label changes across the whole sequence.
pub fn transition_count(labels: &[BasinLabel]) -> usize {
    labels.windows(2).filter(|pair| pair[0] != pair[1]).count()
}

// ============================================================================
// Tests
// ============================================================================
