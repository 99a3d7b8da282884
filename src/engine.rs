//! The engine facade: session registry plus lifecycle and query surface.
//!
//! One engine owns the backend handles, the store, and a registry of live
//! sessions keyed by id. Sessions share no mutable state with each other;
//! everything per-session lives inside its scheduler task, reached through
//! the registry handle.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::analysis::Analysis;
use crate::backend::{EmbeddingBackend, GenerationBackend};
use crate::config::EngineConfig;
use crate::embedding::EmbeddingAdapter;
use crate::error::EngineError;
use crate::feed::FeedEvent;
use crate::recorder::{SessionStore, TurnMetricsRecord};
use crate::scheduler::{spawn_session, SchedulerState, SessionHandle};
use crate::session::{Roster, SessionSummary, Turn};

/// Top-level entry point for the dialogue trajectory engine.
pub struct DialogueEngine {
    config: EngineConfig,
    generation: Arc<dyn GenerationBackend>,
    embedding: Arc<dyn EmbeddingBackend>,
    store: Arc<dyn SessionStore>,
    sessions: DashMap<Uuid, SessionHandle>,
}

impl DialogueEngine {
    pub fn new(
        config: EngineConfig,
        generation: Arc<dyn GenerationBackend>,
        embedding: Arc<dyn EmbeddingBackend>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config,
            generation,
            embedding,
            store,
            sessions: DashMap::new(),
        }
    }

    /// Start a session around `provocation` and begin scheduling turns.
    ///
    /// Must be called within a tokio runtime; the session runs as its own
    /// task until `end()`.
    pub fn start(&self, provocation: &str, roster: Roster) -> Result<Uuid, EngineError> {
        let id = Uuid::new_v4();
        let adapter = EmbeddingAdapter::new(self.embedding.clone());
        let handle = spawn_session(
            id,
            provocation.to_string(),
            roster,
            self.config.clone(),
            self.generation.clone(),
            adapter,
            self.store.clone(),
        )?;
        self.sessions.insert(id, handle);
        log::info!("started session {id}");
        Ok(id)
    }

    fn handle(&self, id: Uuid) -> Result<SessionHandle, EngineError> {
        self.sessions
            .get(&id)
            .map(|entry| entry.clone())
            .ok_or(EngineError::SessionNotFound { session_id: id })
    }

    /// Current scheduler state of a live session.
    pub fn state(&self, id: Uuid) -> Result<SchedulerState, EngineError> {
        Ok(self.handle(id)?.state())
    }

    /// Freeze scheduling at the next turn boundary.
    pub async fn pause(&self, id: Uuid) -> Result<(), EngineError> {
        self.handle(id)?.pause().await
    }

    /// Resume a paused session.
    pub async fn resume(&self, id: Uuid) -> Result<(), EngineError> {
        self.handle(id)?.resume().await
    }

    /// Finalize: cancel any in-flight generation, run the batch analysis,
    /// persist it exactly once, and return it.
    pub async fn end(&self, id: Uuid) -> Result<Analysis, EngineError> {
        self.handle(id)?.end().await
    }

    /// Submit the human participant's turn; only legal while the session
    /// is awaiting the human slot.
    pub async fn submit_human_turn(&self, id: Uuid, text: &str) -> Result<(), EngineError> {
        self.handle(id)?.submit_human_turn(text.to_string()).await
    }

    /// Queue `agent_id` to speak next, bypassing cooldown.
    pub async fn force_invoke(&self, id: Uuid, agent_id: &str) -> Result<(), EngineError> {
        self.handle(id)?.force_invoke(agent_id.to_string()).await
    }

    /// Append a synthetic system turn without consuming any cooldown slot.
    pub async fn inject_prompt(&self, id: Uuid, text: &str) -> Result<(), EngineError> {
        self.handle(id)?.inject_prompt(text.to_string()).await
    }

    /// Subscribe to a session's live feed.
    pub fn subscribe(&self, id: Uuid) -> Result<mpsc::Receiver<FeedEvent>, EngineError> {
        Ok(self.handle(id)?.subscribe())
    }

    // -- query path ---------------------------------------------------------

    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, EngineError> {
        Ok(self.store.list_sessions()?)
    }

    pub fn turns(&self, id: Uuid) -> Result<Vec<Turn>, EngineError> {
        Ok(self.store.turns(id)?)
    }

    pub fn metrics(&self, id: Uuid) -> Result<Vec<TurnMetricsRecord>, EngineError> {
        Ok(self.store.metrics(id)?)
    }

    /// Fetch the Analysis, or report that it is not yet available.
    pub fn analysis(&self, id: Uuid) -> Result<Analysis, EngineError> {
        self.store
            .analysis(id)?
            .ok_or(EngineError::AnalysisNotReady { session_id: id })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::agent::AgentDescriptor;
    use crate::backend::{GenerationOutput, GenerationRequest, TokenUsage};
    use crate::basin::{BasinLabel, CoherencePattern};
    use crate::config::RetryPolicy;
    use crate::error::BackendError;
    use crate::metrics::IntegrityLabel;
    use crate::recorder::MemoryStore;
    use crate::session::Speaker;

    /// Serves scripted responses in order, then parks forever so the
    /// scheduler sits with one outstanding call.
    struct ScriptedGen {
        responses: Vec<String>,
        calls: AtomicUsize,
        fail_always: bool,
    }

    impl ScriptedGen {
        fn new(responses: Vec<String>) -> Arc<Self> {
            Arc::new(Self {
                responses,
                calls: AtomicUsize::new(0),
                fail_always: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                responses: Vec::new(),
                calls: AtomicUsize::new(0),
                fail_always: true,
            })
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedGen {
        async fn generate(
            &self,
            _request: &GenerationRequest,
        ) -> Result<GenerationOutput, BackendError> {
            if self.fail_always {
                self.calls.fetch_add(1, Ordering::SeqCst);
                return Err(BackendError::Status {
                    status: 500,
                    message: "backend down".into(),
                });
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1)).await;
            match self.responses.get(call) {
                Some(text) => Ok(GenerationOutput {
                    text: text.clone(),
                    latency: Duration::from_millis(1),
                    usage: TokenUsage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                    },
                }),
                // Script exhausted: hang until cancelled.
                None => std::future::pending().await,
            }
        }
    }

    /// Embeds by call order through a fixed trajectory function.
    struct TrajectoryEmbedder {
        calls: AtomicUsize,
        point: fn(usize) -> Vec<f32>,
    }

    impl TrajectoryEmbedder {
        fn new(point: fn(usize) -> Vec<f32>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                point,
            })
        }
    }

    #[async_trait]
    impl EmbeddingBackend for TrajectoryEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, BackendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((self.point)(call))
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy {
                max_retries: 1,
                initial_backoff: Duration::from_millis(2),
                multiplier: 2.0,
            },
            ..EngineConfig::default()
        }
    }

    fn agents(ids: &[&str]) -> Roster {
        Roster::new(
            ids.iter()
                .map(|id| AgentDescriptor::new(*id, id.to_uppercase(), "a lens"))
                .collect(),
        )
    }

    fn engine(
        config: EngineConfig,
        generation: Arc<dyn GenerationBackend>,
        embedding: Arc<dyn EmbeddingBackend>,
    ) -> DialogueEngine {
        DialogueEngine::new(config, generation, embedding, Arc::new(MemoryStore::new()))
    }

    async fn wait_for_turns(engine: &DialogueEngine, id: Uuid, count: usize) {
        for _ in 0..1000 {
            if engine.turns(id).unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("timed out waiting for {count} turns");
    }

    async fn wait_for_state(engine: &DialogueEngine, id: Uuid, state: SchedulerState) {
        for _ in 0..1000 {
            if engine.state(id).unwrap() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("timed out waiting for state {state:?}");
    }

    // -- Scenario A: three turns, one voice ---------------------------------

    #[tokio::test]
    async fn test_single_voice_session_stays_transitional() {
        let generation = ScriptedGen::new(vec![
            "The premise deserves a slower look.".into(),
            "A ledger of claims would clarify things.".into(),
            "Structure emerges from repetition of difference.".into(),
        ]);
        // Moderate, slightly bending drift: mid velocity, mid curvature.
        let embedding = TrajectoryEmbedder::new(|i| match i {
            0 => vec![0.0, 0.0],
            1 => vec![0.4, 0.0],
            _ => vec![0.7, 0.25],
        });
        let engine = engine(test_config(), generation, embedding);
        let id = engine.start("Test", agents(&["solo"])).unwrap();

        wait_for_turns(&engine, id, 3).await;
        let analysis = engine.end(id).await.unwrap();

        assert_eq!(analysis.turn_count, 3);
        assert_eq!(
            analysis.basins,
            vec![BasinLabel::Transitional; 3],
            "pre-window turns must be transitional"
        );
        assert_eq!(analysis.voice_distinctiveness, None);
        assert_eq!(analysis.final_coherence, CoherencePattern::Transitional);

        // Gapless index invariant.
        let turns = engine.turns(id).unwrap();
        for (i, turn) in turns.iter().enumerate() {
            assert_eq!(turn.index, i);
        }
        assert_eq!(analysis.basins.len(), turns.len());
    }

    // -- Scenario B: divergent two-voice dialogue ---------------------------

    #[tokio::test]
    async fn test_divergent_dialogue_breathes() {
        let responses: Vec<String> = (0..20)
            .map(|i| {
                if i % 2 == 0 {
                    format!("Where does claim {i} actually hold?")
                } else {
                    format!("Claim {i} collapses under its own framing.")
                }
            })
            .collect();
        let generation = ScriptedGen::new(responses);
        // Hard swings across the origin: high velocity, high curvature,
        // well-separated voice centroids.
        let embedding = TrajectoryEmbedder::new(|i| {
            vec![i as f32 * 0.5, if i % 2 == 0 { 10.0 } else { -10.0 }]
        });
        let engine = engine(test_config(), generation, embedding);
        let id = engine.start("Does structure precede meaning?", agents(&["a", "b"])).unwrap();

        wait_for_turns(&engine, id, 20).await;
        let analysis = engine.end(id).await.unwrap();

        assert_eq!(analysis.turn_count, 20);
        assert!(matches!(
            analysis.dominant_basin,
            BasinLabel::CollaborativeInquiry | BasinLabel::GenerativeConflict
        ));
        let active = analysis
            .basins
            .iter()
            .filter(|b| {
                matches!(
                    b,
                    BasinLabel::CollaborativeInquiry | BasinLabel::GenerativeConflict
                )
            })
            .count();
        assert!(active >= 14, "expected inquiry/conflict dominance: {:?}", analysis.basins);
        assert_eq!(analysis.final_coherence, CoherencePattern::Breathing);
        assert!(analysis.voice_distinctiveness.unwrap() > 1.0);
    }

    // -- Scenario C: paraphrase loop ----------------------------------------

    #[tokio::test]
    async fn test_paraphrase_loop_locks_rigid() {
        let responses = vec![String::from("We keep circling the very same point again."); 20];
        let generation = ScriptedGen::new(responses);
        // Near-identical embeddings with a parallel crawl.
        let embedding = TrajectoryEmbedder::new(|i| vec![i as f32 * 0.01, 0.0]);
        let engine = engine(test_config(), generation, embedding);
        let id = engine.start("Test", agents(&["a", "b"])).unwrap();

        wait_for_turns(&engine, id, 20).await;
        let analysis = engine.end(id).await.unwrap();

        assert_eq!(analysis.dominant_basin, BasinLabel::CognitiveMimicry);
        assert!(analysis.dominant_share > 0.8);
        assert_eq!(analysis.final_coherence, CoherencePattern::Locked);
        assert_eq!(analysis.integrity.unwrap().label, IntegrityLabel::Rigid);
    }

    // -- Scenario D: pause with an outstanding call, then end ---------------

    #[tokio::test]
    async fn test_inflight_generation_discarded_on_end() {
        let generation = ScriptedGen::new(vec![
            "one".into(),
            "two".into(),
            "three".into(),
        ]);
        let embedding = TrajectoryEmbedder::new(|i| vec![i as f32 * 0.4, 0.1]);
        let engine = engine(test_config(), generation, embedding);
        let id = engine.start("Test", agents(&["a", "b"])).unwrap();

        // Script exhausts after three turns; the fourth call hangs.
        wait_for_turns(&engine, id, 3).await;
        let before = engine.turns(id).unwrap().len();

        engine.pause(id).await.unwrap();
        let analysis = engine.end(id).await.unwrap();

        // The outstanding call never became a turn.
        assert_eq!(analysis.turn_count, before);
        assert_eq!(engine.turns(id).unwrap().len(), before);
    }

    // -- end() idempotence --------------------------------------------------

    #[tokio::test]
    async fn test_second_end_is_rejected() {
        let generation = ScriptedGen::new(vec!["only".into()]);
        let embedding = TrajectoryEmbedder::new(|_| vec![1.0, 0.0]);
        let engine = engine(test_config(), generation, embedding);
        let id = engine.start("Test", agents(&["a"])).unwrap();

        wait_for_turns(&engine, id, 1).await;
        engine.end(id).await.unwrap();
        let err = engine.end(id).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidStateTransition {
                from: SchedulerState::Complete,
                ..
            }
        ));
        // The stored Analysis is still the single original record.
        assert!(engine.analysis(id).is_ok());
    }

    // -- human slot ---------------------------------------------------------

    #[tokio::test]
    async fn test_human_slot_blocks_until_submission() {
        let generation = ScriptedGen::new(
            (0..10).map(|i| format!("agent turn {i}")).collect(),
        );
        let embedding = TrajectoryEmbedder::new(|i| vec![i as f32 * 0.4, 0.0]);
        let engine = engine(test_config(), generation, embedding);
        let id = engine
            .start("Test", agents(&["a"]).with_human())
            .unwrap();

        wait_for_state(&engine, id, SchedulerState::AwaitingHuman).await;
        let before = engine.turns(id).unwrap().len();

        engine
            .submit_human_turn(id, "What about embodiment?")
            .await
            .unwrap();
        wait_for_turns(&engine, id, before + 1).await;

        let turns = engine.turns(id).unwrap();
        assert!(turns.iter().any(|t| t.speaker == Speaker::Human));
        engine.end(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_human_submission_outside_slot_rejected() {
        let generation = ScriptedGen::new(
            (0..50).map(|i| format!("turn {i}")).collect(),
        );
        let embedding = TrajectoryEmbedder::new(|i| vec![i as f32 * 0.4, 0.0]);
        let engine = engine(test_config(), generation, embedding);
        // No human in the roster, so the slot never opens.
        let id = engine.start("Test", agents(&["a"])).unwrap();

        let err = engine.submit_human_turn(id, "hello").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
        engine.end(id).await.unwrap();
    }

    // -- force_invoke and inject_prompt -------------------------------------

    #[tokio::test]
    async fn test_force_invoke_bypasses_cooldown() {
        let generation = ScriptedGen::new(
            (0..30).map(|i| format!("turn {i}")).collect(),
        );
        let embedding = TrajectoryEmbedder::new(|i| vec![i as f32 * 0.4, 0.0]);
        let engine = engine(test_config(), generation, embedding);
        let id = engine.start("Test", agents(&["a", "b"])).unwrap();

        engine.pause(id).await.unwrap();
        wait_for_state(&engine, id, SchedulerState::Paused).await;
        let before = engine.turns(id).unwrap().len();

        for _ in 0..3 {
            engine.force_invoke(id, "a").await.unwrap();
        }
        engine.resume(id).await.unwrap();
        wait_for_turns(&engine, id, before + 3).await;

        let turns = engine.turns(id).unwrap();
        for turn in &turns[before..before + 3] {
            assert_eq!(turn.speaker, Speaker::Agent { id: "a".into() });
        }
        engine.end(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_force_invoke_unknown_agent() {
        let generation = ScriptedGen::new(
            (0..50).map(|i| format!("turn {i}")).collect(),
        );
        let embedding = TrajectoryEmbedder::new(|i| vec![i as f32 * 0.4, 0.0]);
        let engine = engine(test_config(), generation, embedding);
        let id = engine.start("Test", agents(&["a"])).unwrap();

        let err = engine.force_invoke(id, "nobody").await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownAgent { .. }));
        engine.end(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_inject_prompt_appends_system_turn() {
        let generation = ScriptedGen::new(
            (0..50).map(|i| format!("turn {i}")).collect(),
        );
        let embedding = TrajectoryEmbedder::new(|i| vec![i as f32 * 0.4, 0.0]);
        let engine = engine(test_config(), generation, embedding);
        let id = engine.start("Test", agents(&["a", "b"])).unwrap();

        wait_for_turns(&engine, id, 1).await;
        engine.inject_prompt(id, "Consider the opposite.").await.unwrap();

        let turns = engine.turns(id).unwrap();
        let injected = turns
            .iter()
            .find(|t| t.speaker == Speaker::System)
            .expect("system turn recorded");
        assert_eq!(injected.text, "Consider the opposite.");
        assert_eq!(injected.latency, Duration::ZERO);
        engine.end(id).await.unwrap();
    }

    // -- failure escalation -------------------------------------------------

    #[tokio::test]
    async fn test_backend_failure_pauses_with_fatal_event() {
        let generation = ScriptedGen::failing();
        let embedding = TrajectoryEmbedder::new(|_| vec![0.0]);
        let engine = engine(test_config(), generation.clone(), embedding);
        let id = engine.start("Test", agents(&["a"])).unwrap();
        let mut feed = engine.subscribe(id).unwrap();

        wait_for_state(&engine, id, SchedulerState::Paused).await;
        // Initial attempt plus one retry.
        assert_eq!(generation.calls.load(Ordering::SeqCst), 2);
        // No turn was silently skipped or invented.
        assert!(engine.turns(id).unwrap().is_empty());

        let mut saw_fatal = false;
        while let Ok(event) = feed.try_recv() {
            if let FeedEvent::StateChanged {
                state: SchedulerState::Paused,
                error: Some(_),
                ..
            } = event
            {
                saw_fatal = true;
            }
        }
        assert!(saw_fatal, "fatal pause must be visible on the feed");

        // The session is still inspectable and can be finalized.
        let analysis = engine.end(id).await.unwrap();
        assert_eq!(analysis.turn_count, 0);
    }

    // -- misc facade behavior ------------------------------------------------

    #[tokio::test]
    async fn test_analysis_not_ready_before_end() {
        let generation = ScriptedGen::new(vec![]);
        let embedding = TrajectoryEmbedder::new(|_| vec![0.0]);
        let engine = engine(test_config(), generation, embedding);
        let id = engine.start("Test", agents(&["a"])).unwrap();

        let err = engine.analysis(id).unwrap_err();
        assert!(matches!(err, EngineError::AnalysisNotReady { .. }));
        engine.end(id).await.unwrap();
        assert!(engine.analysis(id).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_session_operations() {
        let generation = ScriptedGen::new(vec![]);
        let embedding = TrajectoryEmbedder::new(|_| vec![0.0]);
        let engine = engine(test_config(), generation, embedding);
        let ghost = Uuid::new_v4();
        assert!(matches!(
            engine.pause(ghost).await.unwrap_err(),
            EngineError::SessionNotFound { .. }
        ));
        assert!(engine.state(ghost).is_err());
    }

    #[tokio::test]
    async fn test_listing_reflects_analysis_flag() {
        let generation = ScriptedGen::new(vec!["one".into()]);
        let embedding = TrajectoryEmbedder::new(|i| vec![i as f32, 0.0]);
        let engine = engine(test_config(), generation, embedding);
        let id = engine.start("A provocation about maps", agents(&["a"])).unwrap();

        wait_for_turns(&engine, id, 1).await;
        let listed = engine.list_sessions().unwrap();
        let row = listed.iter().find(|s| s.id == id).unwrap();
        assert!(!row.has_analysis);
        assert!(row.provocation_excerpt.contains("maps"));

        engine.end(id).await.unwrap();
        let listed = engine.list_sessions().unwrap();
        assert!(listed.iter().find(|s| s.id == id).unwrap().has_analysis);
    }
}
