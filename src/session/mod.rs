//! Session data model: turns, speakers, rosters.
//!
//! A session owns an ordered, gapless, append-only turn log. Everything
//! here is a plain serde data carrier; the scheduler is the only writer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentDescriptor;

/// Who produced a turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Speaker {
    /// A roster agent.
    Agent { id: String },
    /// The human participant.
    Human,
    /// A synthetic system turn injected by an operator.
    System,
}

impl Speaker {
    /// The voice key used for centroid accounting; system turns carry no
    /// voice.
    pub fn voice_key(&self) -> Option<&str> {
        match self {
            Speaker::Agent { id } => Some(id),
            Speaker::Human => Some("human"),
            Speaker::System => None,
        }
    }

    /// Display name for the feed and transcripts.
    pub fn display(&self) -> &str {
        match self {
            Speaker::Agent { id } => id,
            Speaker::Human => "human",
            Speaker::System => "system",
        }
    }
}

/// One recorded contribution. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Position in the session, exactly `[0..n-1]` with no gaps.
    pub index: usize,
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Wall-clock latency of the producing call; zero for human and
    /// injected turns.
    pub latency: Duration,
    /// Fixed-dimension embedding of `text`.
    pub embedding: Vec<f32>,
}

/// The fixed roster a session is started with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Roster {
    pub agents: Vec<AgentDescriptor>,
    /// Whether the rotation includes a human slot.
    #[serde(default)]
    pub include_human: bool,
}

impl Roster {
    pub fn new(agents: Vec<AgentDescriptor>) -> Self {
        Self {
            agents,
            include_human: false,
        }
    }

    /// Parse a roster document and validate it.
    pub fn from_yaml(text: &str) -> Result<Self, anyhow::Error> {
        let roster: Self = serde_yaml::from_str(text)?;
        roster.validate().map_err(|e| anyhow::anyhow!(e))?;
        Ok(roster)
    }

    pub fn with_human(mut self) -> Self {
        self.include_human = true;
        self
    }

    pub fn agent(&self, id: &str) -> Option<&AgentDescriptor> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Reject empty rosters and duplicate agent ids.
    pub fn validate(&self) -> Result<(), String> {
        if self.agents.is_empty() {
            return Err("roster needs at least one agent".into());
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if agent.id.is_empty() {
                return Err("agent ids must be non-empty".into());
            }
            if agent.id == "human" || agent.id == "system" {
                return Err(format!("agent id `{}` is reserved", agent.id));
            }
            if !seen.insert(&agent.id) {
                return Err(format!("duplicate agent id `{}`", agent.id));
            }
        }
        Ok(())
    }
}

/// Listing row for the query interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub turn_count: usize,
    pub has_analysis: bool,
    /// First line of the provocation, truncated for listings.
    pub provocation_excerpt: String,
}

/// Truncate a provocation to a listing excerpt.
pub fn excerpt(provocation: &str, max_chars: usize) -> String {
    let first_line = provocation.lines().next().unwrap_or("");
    if first_line.chars().count() <= max_chars {
        return first_line.to_string();
    }
    let cut: String = first_line.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{cut}\u{2026}")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentDescriptor;

    fn roster_of(ids: &[&str]) -> Roster {
        Roster::new(
            ids.iter()
                .map(|id| AgentDescriptor::new(*id, id.to_uppercase(), "lens"))
                .collect(),
        )
    }

    #[test]
    fn test_voice_keys() {
        assert_eq!(
            Speaker::Agent { id: "a".into() }.voice_key(),
            Some("a")
        );
        assert_eq!(Speaker::Human.voice_key(), Some("human"));
        assert_eq!(Speaker::System.voice_key(), None);
    }

    #[test]
    fn test_roster_rejects_duplicates() {
        let roster = roster_of(&["a", "b", "a"]);
        assert!(roster.validate().unwrap_err().contains("duplicate"));
    }

    #[test]
    fn test_roster_rejects_reserved_ids() {
        let roster = roster_of(&["human"]);
        assert!(roster.validate().unwrap_err().contains("reserved"));
    }

    #[test]
    fn test_roster_lookup() {
        let roster = roster_of(&["a", "b"]);
        assert!(roster.validate().is_ok());
        assert!(roster.agent("b").is_some());
        assert!(roster.agent("z").is_none());
    }

    #[test]
    fn test_roster_from_yaml() {
        let yaml = r#"
agents:
  - id: cartographer
    name: The Cartographer
    epistemic_lens: treats claims as coordinates
  - id: auditor
    name: The Auditor
    epistemic_lens: counts every claim
include_human: true
"#;
        let roster = Roster::from_yaml(yaml).unwrap();
        assert_eq!(roster.agents.len(), 2);
        assert!(roster.include_human);

        let duplicated = r#"
agents:
  - {id: a, name: A, epistemic_lens: x}
  - {id: a, name: B, epistemic_lens: y}
"#;
        assert!(Roster::from_yaml(duplicated).is_err());
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        assert_eq!(excerpt("short", 40), "short");
        let long = "What does it mean for a dialogue to have a shape at all?";
        let cut = excerpt(long, 20);
        assert!(cut.chars().count() <= 20);
        assert!(cut.ends_with('\u{2026}'));
    }

    #[test]
    fn test_turn_serde_roundtrip() {
        let turn = Turn {
            index: 3,
            speaker: Speaker::Agent { id: "a".into() },
            text: "the basin deepens".into(),
            timestamp: Utc::now(),
            latency: Duration::from_millis(420),
            embedding: vec![0.1, 0.2, 0.3],
        };
        let json = serde_json::to_string(&turn).unwrap();
        let back: Turn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, turn);
    }
}
