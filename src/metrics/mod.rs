//! Semantic trajectory metrics over a growing embedding sequence.
//!
//! The engine is fed one embedding per turn, in strict turn order, and
//! keeps the whole series. Velocity and curvature are O(1) incremental
//! updates; the fractal exponent, entropy shift, and voice distinctiveness
//! are full-series measures. Each turn produces a [`MetricsSnapshot`]
//! carrying the cheap values plus the *running* α estimate; the
//! authoritative full-series numbers are recomputed once by the batch pass
//! at session end and never overwrite the running ones.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::IntegrityThresholds;

pub mod dfa;

pub use dfa::AlphaEstimate;

/// Floor under variance terms so logs stay finite.
const VARIANCE_EPS: f64 = 1e-9;

/// Structural integrity label for the trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityLabel {
    /// Movement is noisy and curvature will not settle.
    Fragmented,
    /// Ordered but still moving: the regime a live dialogue holds.
    Living,
    /// Frozen: curvature has flatlined and the trajectory barely turns.
    Rigid,
}

/// Bounded composite of short-term curvature stability and long-term α.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntegrityScore {
    /// Order parameter in `[0, 1]`; low = fragmented, high = rigid.
    pub score: f64,
    pub label: IntegrityLabel,
}

/// Per-turn metrics bundle.
///
/// `None` fields are explicit "undefined" markers: velocity has no meaning
/// at turn 0, curvature needs two steps (and a zero-length step leaves it
/// undefined at that index), voice distinctiveness needs two voices, and
/// integrity needs a little curvature history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub turn_index: usize,
    pub velocity: Option<f64>,
    pub curvature: Option<f64>,
    /// Running estimate published on the live feed; not the authoritative
    /// end-of-session value.
    pub alpha: AlphaEstimate,
    pub voice_distinctiveness: Option<f64>,
    pub integrity: Option<IntegrityScore>,
}

/// Per-voice centroid accumulator.
#[derive(Debug, Clone)]
struct VoiceCentroid {
    sum: Vec<f64>,
    count: usize,
}

impl VoiceCentroid {
    fn centroid(&self) -> Vec<f64> {
        self.sum.iter().map(|s| s / self.count as f64).collect()
    }
}

/// Accumulates the embedding trajectory for one session.
pub struct MetricsEngine {
    min_alpha_window: usize,
    integrity_window: usize,
    integrity_thresholds: IntegrityThresholds,
    embeddings: Vec<Arc<Vec<f32>>>,
    velocities: Vec<f64>,
    /// Curvature per turn index ≥ 2; `None` marks a zero-length step.
    curvatures: Vec<Option<f64>>,
    voices: HashMap<String, VoiceCentroid>,
}

impl MetricsEngine {
    pub fn new(
        min_alpha_window: usize,
        integrity_window: usize,
        integrity_thresholds: IntegrityThresholds,
    ) -> Self {
        Self {
            min_alpha_window,
            integrity_window,
            integrity_thresholds,
            embeddings: Vec::new(),
            velocities: Vec::new(),
            curvatures: Vec::new(),
            voices: HashMap::new(),
        }
    }

    /// Number of turns observed.
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    /// The velocity series (length `n − 1`).
    pub fn velocities(&self) -> &[f64] {
        &self.velocities
    }

    /// Feed the next turn's embedding and produce its snapshot.
    ///
    /// `voice` is the speaker's voice key, or `None` for synthetic turns
    /// that should not pull any voice centroid.
    pub fn push(&mut self, voice: Option<&str>, embedding: Arc<Vec<f32>>) -> MetricsSnapshot {
        let turn_index = self.embeddings.len();

        if let Some(previous) = self.embeddings.last() {
            self.velocities.push(euclidean(previous, &embedding));
        }
        if self.embeddings.len() >= 2 {
            let n = self.embeddings.len();
            let step_prev = step(&self.embeddings[n - 2], &self.embeddings[n - 1]);
            let step_next = step(&self.embeddings[n - 1], &embedding);
            self.curvatures.push(turning(&step_prev, &step_next));
        }

        if let Some(voice) = voice {
            let entry = self
                .voices
                .entry(voice.to_string())
                .or_insert_with(|| VoiceCentroid {
                    sum: vec![0.0; embedding.len()],
                    count: 0,
                });
            for (acc, x) in entry.sum.iter_mut().zip(embedding.iter()) {
                *acc += *x as f64;
            }
            entry.count += 1;
        }

        self.embeddings.push(embedding);
        self.snapshot_at(turn_index)
    }

    /// Assemble the snapshot for the most recent turn.
    fn snapshot_at(&self, turn_index: usize) -> MetricsSnapshot {
        let velocity = if turn_index >= 1 {
            self.velocities.last().copied()
        } else {
            None
        };
        let curvature = if turn_index >= 2 {
            self.curvatures.last().copied().flatten()
        } else {
            None
        };
        let alpha = self.running_alpha();
        MetricsSnapshot {
            turn_index,
            velocity,
            curvature,
            alpha,
            voice_distinctiveness: self.voice_distinctiveness(),
            integrity: self.integrity(alpha),
        }
    }

    /// Running α over the velocity series.
    pub fn running_alpha(&self) -> AlphaEstimate {
        dfa::alpha(&self.velocities, self.min_alpha_window)
    }

    /// Mean pairwise distance between per-voice centroids; undefined until
    /// at least two distinct voices have spoken.
    pub fn voice_distinctiveness(&self) -> Option<f64> {
        if self.voices.len() < 2 {
            return None;
        }
        let centroids: Vec<Vec<f64>> = self.voices.values().map(VoiceCentroid::centroid).collect();
        let mut total = 0.0;
        let mut pairs = 0usize;
        for i in 0..centroids.len() {
            for j in (i + 1)..centroids.len() {
                total += euclidean_f64(&centroids[i], &centroids[j]);
                pairs += 1;
            }
        }
        Some(total / pairs as f64)
    }

    /// Composite order score from recent curvature stability and α.
    fn integrity(&self, alpha: AlphaEstimate) -> Option<IntegrityScore> {
        let recent: Vec<f64> = self
            .curvatures
            .iter()
            .rev()
            .take(self.integrity_window)
            .filter_map(|c| *c)
            .collect();
        if recent.len() < 2 {
            return None;
        }
        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        let var = recent.iter().map(|c| (c - mean) * (c - mean)).sum::<f64>() / recent.len() as f64;
        let stability = 1.0 / (1.0 + 4.0 * var.sqrt());

        // α folds in as a soft order term: noise sits low, long-range
        // correlation in the middle, over-ordered drift high.
        let alpha_order = match alpha.value() {
            Some(a) => ((a - 0.2) / 1.6).clamp(0.0, 1.0),
            None => 0.5,
        };

        let score = 0.6 * stability + 0.4 * alpha_order;
        let label = if score < self.integrity_thresholds.fragmented_below {
            IntegrityLabel::Fragmented
        } else if score > self.integrity_thresholds.rigid_above {
            IntegrityLabel::Rigid
        } else {
            IntegrityLabel::Living
        };
        Some(IntegrityScore { score, label })
    }

    /// Entropy shift ΔH: split the embedding sequence at its midpoint and
    /// report the signed difference of each half's dispersion entropy
    /// proxy. Full-series; recomputed only when the split point moves.
    pub fn entropy_shift(&self) -> Option<f64> {
        let n = self.embeddings.len();
        if n < 4 {
            return None;
        }
        let mid = n / 2;
        let first = dispersion_entropy(&self.embeddings[..mid]);
        let second = dispersion_entropy(&self.embeddings[mid..]);
        Some(second - first)
    }
}

/// Log-dispersion entropy proxy: ln of mean squared deviation from the
/// sample centroid.
fn dispersion_entropy(embeddings: &[Arc<Vec<f32>>]) -> f64 {
    let count = embeddings.len();
    let dim = embeddings[0].len();
    let mut centroid = vec![0.0f64; dim];
    for e in embeddings {
        for (acc, x) in centroid.iter_mut().zip(e.iter()) {
            *acc += *x as f64;
        }
    }
    for acc in &mut centroid {
        *acc /= count as f64;
    }
    let mut total = 0.0;
    for e in embeddings {
        let mut dist_sq = 0.0;
        for (x, c) in e.iter().zip(centroid.iter()) {
            let d = *x as f64 - c;
            dist_sq += d * d;
        }
        total += dist_sq;
    }
    (total / count as f64 + VARIANCE_EPS).ln()
}

fn euclidean(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = *x as f64 - *y as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

fn euclidean_f64(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

fn step(from: &[f32], to: &[f32]) -> Vec<f64> {
    from.iter()
        .zip(to.iter())
        .map(|(a, b)| *b as f64 - *a as f64)
        .collect()
}

/// Turning measure between consecutive steps: 1 − cosine similarity.
/// A zero-length step leaves the angle undefined.
fn turning(prev: &[f64], next: &[f64]) -> Option<f64> {
    let norm_prev = prev.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_next = next.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_prev == 0.0 || norm_next == 0.0 {
        return None;
    }
    let dot: f64 = prev.iter().zip(next.iter()).map(|(a, b)| a * b).sum();
    Some(1.0 - dot / (norm_prev * norm_next))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> MetricsEngine {
        MetricsEngine::new(16, 6, IntegrityThresholds::default())
    }

    fn vec2(x: f32, y: f32) -> Arc<Vec<f32>> {
        Arc::new(vec![x, y])
    }

    #[test]
    fn test_first_turn_has_no_velocity() {
        let mut m = engine();
        let snap = m.push(Some("a"), vec2(1.0, 0.0));
        assert_eq!(snap.turn_index, 0);
        assert_eq!(snap.velocity, None);
        assert_eq!(snap.curvature, None);
        assert_eq!(snap.alpha, AlphaEstimate::InsufficientData);
    }

    #[test]
    fn test_velocity_is_step_distance() {
        let mut m = engine();
        m.push(Some("a"), vec2(0.0, 0.0));
        let snap = m.push(Some("b"), vec2(3.0, 4.0));
        assert_eq!(snap.velocity, Some(5.0));
    }

    #[test]
    fn test_curvature_straight_line_is_zero() {
        let mut m = engine();
        m.push(Some("a"), vec2(0.0, 0.0));
        m.push(Some("b"), vec2(1.0, 0.0));
        let snap = m.push(Some("a"), vec2(2.0, 0.0));
        let curvature = snap.curvature.unwrap();
        assert!(curvature.abs() < 1e-12, "curvature = {curvature}");
    }

    #[test]
    fn test_curvature_reversal_is_two() {
        let mut m = engine();
        m.push(Some("a"), vec2(0.0, 0.0));
        m.push(Some("b"), vec2(1.0, 0.0));
        let snap = m.push(Some("a"), vec2(0.0, 0.0));
        let curvature = snap.curvature.unwrap();
        assert!((curvature - 2.0).abs() < 1e-12, "curvature = {curvature}");
    }

    #[test]
    fn test_zero_length_step_leaves_curvature_undefined() {
        let mut m = engine();
        m.push(Some("a"), vec2(0.0, 0.0));
        m.push(Some("b"), vec2(1.0, 0.0));
        let snap = m.push(Some("a"), vec2(1.0, 0.0));
        assert_eq!(snap.velocity, Some(0.0));
        assert_eq!(snap.curvature, None);
    }

    #[test]
    fn test_distinctiveness_needs_two_voices() {
        let mut m = engine();
        m.push(Some("a"), vec2(0.0, 0.0));
        m.push(Some("a"), vec2(1.0, 0.0));
        assert_eq!(m.voice_distinctiveness(), None);

        m.push(Some("b"), vec2(5.0, 0.0));
        let d = m.voice_distinctiveness().unwrap();
        // Centroid of a = (0.5, 0), centroid of b = (5, 0).
        assert!((d - 4.5).abs() < 1e-9, "d = {d}");
    }

    #[test]
    fn test_system_turns_pull_no_voice() {
        let mut m = engine();
        m.push(Some("a"), vec2(0.0, 0.0));
        m.push(None, vec2(100.0, 100.0));
        assert_eq!(m.voice_distinctiveness(), None);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn test_entropy_shift_sign_tracks_spread() {
        let mut m = engine();
        // First half tight, second half dispersed.
        m.push(Some("a"), vec2(0.0, 0.0));
        m.push(Some("b"), vec2(0.01, 0.0));
        m.push(Some("a"), vec2(10.0, 0.0));
        m.push(Some("b"), vec2(-10.0, 5.0));
        let shift = m.entropy_shift().unwrap();
        assert!(shift > 0.0, "shift = {shift}");

        let mut narrowing = engine();
        narrowing.push(Some("a"), vec2(10.0, 0.0));
        narrowing.push(Some("b"), vec2(-10.0, 5.0));
        narrowing.push(Some("a"), vec2(0.0, 0.0));
        narrowing.push(Some("b"), vec2(0.01, 0.0));
        assert!(narrowing.entropy_shift().unwrap() < 0.0);
    }

    #[test]
    fn test_entropy_shift_undefined_below_four_turns() {
        let mut m = engine();
        m.push(Some("a"), vec2(0.0, 0.0));
        m.push(Some("b"), vec2(1.0, 0.0));
        m.push(Some("a"), vec2(2.0, 0.0));
        assert_eq!(m.entropy_shift(), None);
    }

    #[test]
    fn test_integrity_rigid_on_parallel_drift() {
        let mut m = engine();
        // Constant tiny steps in one direction: curvature 0 everywhere.
        for i in 0..10 {
            m.push(Some(if i % 2 == 0 { "a" } else { "b" }), vec2(i as f32 * 0.01, 0.0));
        }
        let snap = m.snapshot_at(9);
        let integrity = snap.integrity.unwrap();
        assert_eq!(integrity.label, IntegrityLabel::Rigid);
        assert!(integrity.score > 0.75);
    }

    #[test]
    fn test_integrity_fragmented_on_jittery_turns() {
        let mut m = engine();
        // Alternate hard reversals with straight runs so curvature swings
        // between 0 and 2.
        let xs = [0.0, 1.0, 0.0, 1.0, 2.0, 3.0, 2.0, 1.0, 1.5, 0.5];
        for (i, x) in xs.iter().enumerate() {
            m.push(Some(if i % 2 == 0 { "a" } else { "b" }), vec2(*x, 0.0));
        }
        let integrity = m.snapshot_at(xs.len() - 1).integrity.unwrap();
        assert_eq!(integrity.label, IntegrityLabel::Fragmented);
    }

    #[test]
    fn test_alpha_defined_at_window() {
        let mut m = engine();
        // 17 turns give 16 velocity points, exactly the minimum window.
        let mut x = 0.0f32;
        for i in 0..17 {
            x += if i % 3 == 0 { 1.0 } else { 0.3 };
            let snap = m.push(Some("a"), vec2(x, (i as f32 * 0.7).sin()));
            if i < 16 {
                assert_eq!(snap.alpha, AlphaEstimate::InsufficientData, "turn {i}");
            } else {
                assert!(
                    !matches!(snap.alpha, AlphaEstimate::InsufficientData),
                    "alpha still undefined at the window edge"
                );
            }
        }
    }

    #[test]
    fn test_snapshot_serde_roundtrip() {
        let snap = MetricsSnapshot {
            turn_index: 7,
            velocity: Some(0.4),
            curvature: None,
            alpha: AlphaEstimate::Estimate { alpha: 0.92 },
            voice_distinctiveness: Some(1.3),
            integrity: Some(IntegrityScore {
                score: 0.55,
                label: IntegrityLabel::Living,
            }),
        };
        let json = serde_json::to_string(&snap).unwrap();
        let back: MetricsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }
}
