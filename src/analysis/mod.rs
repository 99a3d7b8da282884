//! End-of-session batch analysis.
//!
//! `end()` replays the full stored turn sequence through a fresh metrics
//! engine and classifier, producing the authoritative Analysis record.
//! The replay is pure: identical turn logs produce identical Analysis
//! output. Live labels published during the session are carried alongside
//! the batch labels rather than being overwritten, so any disagreement
//! between the streaming and batch passes stays visible.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::basin::{self, BasinLabel, CoherencePattern, TextSignals};
use crate::config::EngineConfig;
use crate::metrics::{AlphaEstimate, IntegrityScore, MetricsEngine};
use crate::recorder::TurnMetricsRecord;
use crate::session::Turn;

/// How many turns landed in each coherence pattern over the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoherenceDistribution {
    pub breathing: usize,
    pub locked: usize,
    pub transitional: usize,
}

impl CoherenceDistribution {
    fn record(&mut self, pattern: CoherencePattern) {
        match pattern {
            CoherencePattern::Breathing => self.breathing += 1,
            CoherencePattern::Locked => self.locked += 1,
            CoherencePattern::Transitional => self.transitional += 1,
        }
    }

    /// The pattern holding at session end (the last recorded turn).
    pub fn dominant(&self) -> CoherencePattern {
        let mut best = (CoherencePattern::Transitional, self.transitional);
        if self.locked > best.1 {
            best = (CoherencePattern::Locked, self.locked);
        }
        if self.breathing > best.1 {
            best = (CoherencePattern::Breathing, self.breathing);
        }
        best.0
    }
}

/// Cumulative backend accounting for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Summed generation latency across recorded turns.
    pub total_latency: Duration,
}

/// The authoritative end-of-session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub session_id: Uuid,
    pub provocation: String,
    pub turn_count: usize,
    /// Most frequent batch label and its share of all turns.
    pub dominant_basin: BasinLabel,
    pub dominant_share: f64,
    /// Labels as published turn by turn on the live feed.
    pub live_basins: Vec<BasinLabel>,
    /// Labels from the batch replay; may disagree with `live_basins`.
    pub basins: Vec<BasinLabel>,
    pub basin_transitions: usize,
    pub coherence: CoherenceDistribution,
    /// Coherence pattern holding at the final turn.
    pub final_coherence: CoherencePattern,
    /// Authoritative full-series exponent.
    pub alpha: AlphaEstimate,
    pub entropy_shift: Option<f64>,
    pub voice_distinctiveness: Option<f64>,
    pub integrity: Option<IntegrityScore>,
    pub agent_turn_counts: HashMap<String, usize>,
    pub usage: SessionUsage,
    pub finalized_at: DateTime<Utc>,
}

/// Replay `turns` through a fresh pipeline and assemble the Analysis,
/// together with the recomputed per-turn metrics series that replaces the
/// live one in the store.
pub fn run_batch(
    session_id: Uuid,
    provocation: &str,
    turns: &[Turn],
    live_basins: &[BasinLabel],
    usage: SessionUsage,
    config: &EngineConfig,
) -> (Analysis, Vec<TurnMetricsRecord>) {
    let mut engine = MetricsEngine::new(
        config.min_alpha_window,
        config.integrity_window,
        config.integrity.clone(),
    );

    let mut basins = Vec::with_capacity(turns.len());
    let mut records = Vec::with_capacity(turns.len());
    let mut coherence = CoherenceDistribution::default();
    let mut final_coherence = CoherencePattern::Transitional;
    let mut last_integrity = None;

    for (i, turn) in turns.iter().enumerate() {
        let snapshot = engine.push(
            turn.speaker.voice_key(),
            Arc::new(turn.embedding.clone()),
        );
        let prior = i.checked_sub(1).map(|p| turns[p].text.as_str());
        let signals = TextSignals::extract(&turn.text, prior);
        let label = basin::classify(&snapshot, &signals, &config.basins);
        basins.push(label);
        records.push(TurnMetricsRecord {
            snapshot: snapshot.clone(),
            basin: label,
        });

        let pattern = basin::coherence(
            &basins,
            config.coherence_window,
            config.stability_threshold,
        );
        coherence.record(pattern);
        final_coherence = pattern;
        last_integrity = snapshot.integrity;
    }

    let (dominant_basin, dominant_share) = dominant(&basins);
    let mut agent_turn_counts: HashMap<String, usize> = HashMap::new();
    for turn in turns {
        if let Some(voice) = turn.speaker.voice_key() {
            *agent_turn_counts.entry(voice.to_string()).or_default() += 1;
        }
    }

    let analysis = Analysis {
        session_id,
        provocation: provocation.to_string(),
        turn_count: turns.len(),
        dominant_basin,
        dominant_share,
        live_basins: live_basins.to_vec(),
        basin_transitions: basin::transition_count(&basins),
        basins,
        coherence,
        final_coherence,
        alpha: engine.running_alpha(),
        entropy_shift: engine.entropy_shift(),
        voice_distinctiveness: engine.voice_distinctiveness(),
        integrity: last_integrity,
        agent_turn_counts,
        usage,
        finalized_at: Utc::now(),
    };
    (analysis, records)
}

/// Most frequent label and its share; ties resolve in `BasinLabel::ALL`
/// order so replays stay deterministic.
fn dominant(basins: &[BasinLabel]) -> (BasinLabel, f64) {
    if basins.is_empty() {
        return (BasinLabel::Transitional, 0.0);
    }
    let mut counts: HashMap<BasinLabel, usize> = HashMap::new();
    for label in basins {
        *counts.entry(*label).or_default() += 1;
    }
    let mut best = BasinLabel::Transitional;
    let mut best_count = 0usize;
    for label in BasinLabel::ALL {
        let count = counts.get(&label).copied().unwrap_or(0);
        if count > best_count {
            best = label;
            best_count = count;
        }
    }
    (best, best_count as f64 / basins.len() as f64)
}

// ============================================================================
// Tests
// ============================================================================
