//! Generation prompt assembly.
//!
//! Builds the system and user halves of a generation request from the
//! provocation, a trailing window of transcript, and the speaking agent's
//! lens and trait framing. Plain string assembly; no template engine.

use crate::agent::AgentDescriptor;
use crate::backend::GenerationRequest;
use crate::session::Turn;

/// Assembles generation requests for a session.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    /// How many trailing turns of transcript to include.
    window: usize,
}

impl PromptBuilder {
    pub fn new(window: usize) -> Self {
        Self { window: window.max(1) }
    }

    /// Build the request for `agent` speaking next.
    pub fn build(
        &self,
        provocation: &str,
        turns: &[Turn],
        agent: &AgentDescriptor,
    ) -> GenerationRequest {
        let mut system = format!("You are {}", agent.name);
        if !agent.style.is_empty() {
            system.push_str(&format!(", {}", agent.style));
        }
        system.push_str(", one voice in a small recorded dialogue.\n");
        system.push_str(&agent.epistemic_lens);
        let framing = agent.framing_clause();
        if !framing.is_empty() {
            system.push('\n');
            system.push_str(&framing);
        }
        system.push_str(
            "\nSpeak in your own voice, a single contribution of a few sentences. \
             Do not narrate the dialogue or label your turn.",
        );

        let mut prompt = format!("The dialogue opened with this provocation:\n{provocation}\n");
        let tail_start = turns.len().saturating_sub(self.window);
        let tail = &turns[tail_start..];
        if !tail.is_empty() {
            prompt.push_str("\nThe most recent turns:\n");
            for turn in tail {
                prompt.push_str(&format!("[{}] {}\n", turn.speaker.display(), turn.text));
            }
        }
        prompt.push_str(&format!("\n{}, your turn.", agent.name));

        GenerationRequest {
            system,
            prompt,
            params: agent.sampling_params(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
