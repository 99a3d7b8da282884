//! Engine configuration.
//!
//! Everything numeric that shapes scheduling or classification lives here:
//! cooldown width, retry budget, analysis windows, basin thresholds. All of
//! it is serde-loadable so experiments can tune cutoffs without recompiling,
//! and `validate()` rejects configurations that would break the analysis
//! invariants (e.g. a zero-wide coherence window).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry discipline for backend calls.
///
/// The scheduler retries a failed generation or embedding call up to
/// `max_retries` extra times, sleeping `initial_backoff * multiplier^k`
/// before attempt `k + 1`. Exhaustion escalates to a fatal session event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Sleep before the first retry.
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,
    /// Backoff growth factor per retry.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(250),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        self.initial_backoff.mul_f64(factor)
    }
}

/// Numeric cutoffs separating basin labels.
///
/// These are calibration parameters, not structural invariants; defaults
/// come from observing scripted dialogues and are expected to be tuned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasinThresholds {
    /// Velocity below which turns read as near-repetition.
    pub low_velocity: f64,
    /// Velocity above which the trajectory is moving hard.
    pub high_velocity: f64,
    /// Curvature below which the path is effectively straight.
    pub low_curvature: f64,
    /// Curvature above which the path is turning sharply.
    pub high_curvature: f64,
    /// Question density marking an inquiry posture (questions per sentence).
    pub inquiry_signal: f64,
    /// Agreement-phrase density marking convergent posture.
    pub agreement_signal: f64,
    /// Hedging-phrase density marking performative caution.
    pub hedging_signal: f64,
    /// Trigram overlap with the prior turn marking mimicry.
    pub mimicry_overlap: f64,
    /// Voice distinctiveness below which voices have collapsed together.
    pub low_distinctiveness: f64,
    /// Voice distinctiveness above which voices are clearly separated.
    pub high_distinctiveness: f64,
}

impl Default for BasinThresholds {
    fn default() -> Self {
        Self {
            low_velocity: 0.15,
            high_velocity: 0.8,
            low_curvature: 0.2,
            high_curvature: 0.7,
            inquiry_signal: 0.25,
            agreement_signal: 0.08,
            hedging_signal: 0.08,
            mimicry_overlap: 0.5,
            low_distinctiveness: 0.2,
            high_distinctiveness: 0.5,
        }
    }
}

/// Cutoffs mapping the integrity score to its label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityThresholds {
    /// Scores below this read as fragmented.
    pub fragmented_below: f64,
    /// Scores above this read as rigid.
    pub rigid_above: f64,
}

impl Default for IntegrityThresholds {
    fn default() -> Self {
        Self {
            fragmented_below: 0.35,
            rigid_above: 0.75,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Turns an agent must sit out after speaking.
    pub cooldown_turns: usize,
    /// How many trailing turns feed the generation prompt.
    pub prompt_window: usize,
    /// Velocity points required before the fractal exponent is defined.
    pub min_alpha_window: usize,
    /// Trailing basin labels examined for the coherence pattern.
    pub coherence_window: usize,
    /// Share one label must exceed for the pattern to read as locked.
    pub stability_threshold: f64,
    /// Trailing curvature points feeding the integrity stability term.
    pub integrity_window: usize,
    /// Bounded capacity of each live-feed subscriber queue.
    pub feed_capacity: usize,
    /// Seed for the deterministic rotation tie-break draw.
    pub rotation_seed: u64,
    /// Hard timeout on a single backend call.
    #[serde(with = "duration_millis")]
    pub backend_timeout: Duration,
    /// Retry discipline for backend calls.
    pub retry: RetryPolicy,
    /// Basin classification cutoffs.
    pub basins: BasinThresholds,
    /// Integrity label cutoffs.
    pub integrity: IntegrityThresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cooldown_turns: 1,
            prompt_window: 8,
            min_alpha_window: 16,
            coherence_window: 5,
            stability_threshold: 0.7,
            integrity_window: 6,
            feed_capacity: 64,
            rotation_seed: 0,
            backend_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            basins: BasinThresholds::default(),
            integrity: IntegrityThresholds::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a YAML document and validate it.
    pub fn from_yaml(text: &str) -> Result<Self, anyhow::Error> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate().map_err(|e| anyhow::anyhow!(e))?;
        Ok(config)
    }

    /// Reject configurations that would break analysis invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.coherence_window == 0 {
            return Err("coherence_window must be at least 1".into());
        }
        if self.min_alpha_window < 8 {
            return Err("min_alpha_window below 8 cannot support a DFA fit".into());
        }
        if !(0.0..=1.0).contains(&self.stability_threshold) {
            return Err("stability_threshold must lie in [0, 1]".into());
        }
        if self.feed_capacity == 0 {
            return Err("feed_capacity must be at least 1".into());
        }
        if self.integrity.fragmented_below >= self.integrity.rigid_above {
            return Err("integrity cutoffs must leave room for the living band".into());
        }
        if self.retry.multiplier < 1.0 {
            return Err("retry multiplier below 1.0 would shrink backoff".into());
        }
        Ok(())
    }
}

/// Serialize `Duration` as integer milliseconds.
mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ============================================================================
// Tests
// ============================================================================
