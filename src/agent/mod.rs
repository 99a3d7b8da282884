//! Agent descriptors and trait modulation.
//!
//! Each synthetic participant is described by an id, display attributes, an
//! epistemic-lens paragraph, and a five-axis trait vector. The trait vector
//! feeds two pure mappings: a textual framing clause injected into the
//! generation request, and the numeric sampling parameters sent to the
//! backend. Both mappings are deterministic so a roster fully determines a
//! session's generation behavior.

use serde::{Deserialize, Serialize};

/// Names for the five trait axes.
pub const TRAIT_AXIS_NAMES: [&str; 5] = [
    "drift",         // willingness to leave the current frame
    "skepticism",    // pressure toward counter-argument
    "warmth",        // orientation toward the other speakers
    "abstraction",   // preference for the general over the particular
    "expansiveness", // how much room a turn takes up
];

/// A five-axis trait vector, each axis in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraitVector(pub [f32; 5]);

impl Default for TraitVector {
    fn default() -> Self {
        Self([0.5; 5])
    }
}

impl TraitVector {
    pub fn drift(&self) -> f32 {
        self.0[0]
    }
    pub fn skepticism(&self) -> f32 {
        self.0[1]
    }
    pub fn warmth(&self) -> f32 {
        self.0[2]
    }
    pub fn abstraction(&self) -> f32 {
        self.0[3]
    }
    pub fn expansiveness(&self) -> f32 {
        self.0[4]
    }

    /// Clamp every axis into `[0, 1]`.
    pub fn clamped(mut self) -> Self {
        for axis in &mut self.0 {
            *axis = axis.clamp(0.0, 1.0);
        }
        self
    }
}

/// Sampling parameters sent to the generation backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Temperature in `[0.3, 1.2]`. Higher = more exploratory.
    pub temperature: f64,
    /// Nucleus sampling mass in `[0.5, 1.0]`.
    pub top_p: f64,
    /// Completion budget in tokens.
    pub max_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.75,
            top_p: 0.75,
            max_tokens: 512,
        }
    }
}

/// One synthetic participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Stable roster id, unique within a session.
    pub id: String,
    /// Display name shown on the feed and in transcripts.
    pub name: String,
    /// Short display attribute, e.g. "the cartographer".
    #[serde(default)]
    pub style: String,
    /// Paragraph describing how this agent sees and argues.
    pub epistemic_lens: String,
    /// Five-axis trait vector.
    #[serde(default)]
    pub traits: TraitVector,
}

impl AgentDescriptor {
    /// Create a descriptor with neutral traits.
    pub fn new(id: impl Into<String>, name: impl Into<String>, lens: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            style: String::new(),
            epistemic_lens: lens.into(),
            traits: TraitVector::default(),
        }
    }

    /// Replace the trait vector, clamping axes into range.
    pub fn with_traits(mut self, traits: TraitVector) -> Self {
        self.traits = traits.clamped();
        self
    }

    /// Textual framing injected into the generation request.
    ///
    /// Only axes far enough from the neutral midpoint contribute a clause,
    /// so a default agent gets an empty framing.
    pub fn framing_clause(&self) -> String {
        let t = &self.traits;
        let mut clauses: Vec<&str> = Vec::new();
        if t.drift() > 0.65 {
            clauses.push("Let the conversation pull you somewhere new rather than circling.");
        } else if t.drift() < 0.35 {
            clauses.push("Stay close to the thread already on the table.");
        }
        if t.skepticism() > 0.65 {
            clauses.push("Press on the weakest claim in the last few turns.");
        } else if t.skepticism() < 0.35 {
            clauses.push("Build on what the others have offered before questioning it.");
        }
        if t.warmth() > 0.65 {
            clauses.push("Address the other speakers directly and generously.");
        } else if t.warmth() < 0.35 {
            clauses.push("Keep your attention on the problem, not the people.");
        }
        if t.abstraction() > 0.65 {
            clauses.push("Reach for the structural pattern behind the examples.");
        } else if t.abstraction() < 0.35 {
            clauses.push("Anchor every point in a concrete case.");
        }
        clauses.join(" ")
    }

    /// Map the trait vector to sampling parameters.
    ///
    /// Drift drives temperature, abstraction drives nucleus mass, and
    /// expansiveness scales the completion budget; skepticism trims
    /// temperature slightly so contrarians stay pointed rather than loose.
    pub fn sampling_params(&self) -> SamplingParams {
        let t = &self.traits;
        let base_temp = 0.3 + t.drift() as f64 * 0.9;
        let skeptic_damp = 1.0 - (t.skepticism() as f64 - 0.5).max(0.0) * 0.2;
        let temperature = (base_temp * skeptic_damp).clamp(0.3, 1.2);

        let top_p = (0.5 + t.abstraction() as f64 * 0.5).clamp(0.5, 1.0);

        let base_tokens: u32 = 256;
        let max_tokens = base_tokens + (t.expansiveness() * 1280.0) as u32;

        SamplingParams {
            temperature,
            top_p,
            max_tokens,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_with(traits: [f32; 5]) -> AgentDescriptor {
        AgentDescriptor::new("a", "A", "sees everything as a ledger")
            .with_traits(TraitVector(traits))
    }

    #[test]
    fn test_axis_names_cover_the_vector() {
        assert_eq!(TRAIT_AXIS_NAMES.len(), TraitVector::default().0.len());
    }

    #[test]
    fn test_neutral_traits_give_empty_framing() {
        let agent = agent_with([0.5; 5]);
        assert!(agent.framing_clause().is_empty());
    }

    #[test]
    fn test_high_drift_raises_temperature() {
        let drifting = agent_with([0.9, 0.5, 0.5, 0.5, 0.5]);
        let anchored = agent_with([0.1, 0.5, 0.5, 0.5, 0.5]);
        assert!(drifting.sampling_params().temperature > anchored.sampling_params().temperature);
    }

    #[test]
    fn test_skepticism_damps_temperature() {
        let skeptic = agent_with([0.9, 1.0, 0.5, 0.5, 0.5]);
        let trusting = agent_with([0.9, 0.2, 0.5, 0.5, 0.5]);
        assert!(skeptic.sampling_params().temperature < trusting.sampling_params().temperature);
    }

    #[test]
    fn test_expansiveness_scales_tokens() {
        let terse = agent_with([0.5, 0.5, 0.5, 0.5, 0.0]);
        let expansive = agent_with([0.5, 0.5, 0.5, 0.5, 1.0]);
        assert!(expansive.sampling_params().max_tokens > terse.sampling_params().max_tokens);
        assert_eq!(terse.sampling_params().max_tokens, 256);
    }

    #[test]
    fn test_params_stay_clamped_at_extremes() {
        let extreme = agent_with([1.0; 5]);
        let params = extreme.sampling_params();
        assert!(params.temperature <= 1.2);
        assert!(params.top_p <= 1.0);
    }

    #[test]
    fn test_traits_clamped_on_construction() {
        let agent = agent_with([1.7, -0.3, 0.5, 0.5, 0.5]);
        assert_eq!(agent.traits.drift(), 1.0);
        assert_eq!(agent.traits.skepticism(), 0.0);
    }

    #[test]
    fn test_descriptor_yaml_roundtrip() {
        let yaml = r#"
id: cartographer
name: The Cartographer
style: maps the terrain
epistemic_lens: treats every claim as a coordinate
traits: [0.8, 0.4, 0.6, 0.9, 0.3]
"#;
        let agent: AgentDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(agent.id, "cartographer");
        assert_eq!(agent.traits.abstraction(), 0.9);
        let back = serde_yaml::to_string(&agent).unwrap();
        let again: AgentDescriptor = serde_yaml::from_str(&back).unwrap();
        assert_eq!(again.traits, agent.traits);
    }
}
