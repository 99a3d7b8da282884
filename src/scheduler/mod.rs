//! Turn scheduling: the per-session state machine.
//!
//! Each live session is one tokio task owning the turn log, the metrics
//! accumulator, and the feed. The task alternates between selecting a
//! speaker, driving exactly one generation call, and funneling the
//! recorded result through embedding, metrics, and classification. All
//! outside interaction arrives on a single command channel drained in
//! arrival order.
//!
//! Suspension discipline: the only await that can take real time is the
//! backend call, and it is raced against the command channel so `end()`
//! can cancel it (discarding the partial result) while `pause()` merely
//! flags a stop at the next turn boundary.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::analysis::{self, Analysis, SessionUsage};
use crate::backend::{GenerationBackend, GenerationOutput};
use crate::basin::{self, BasinLabel, TextSignals};
use crate::config::EngineConfig;
use crate::embedding::EmbeddingAdapter;
use crate::error::{BackendError, EngineError};
use crate::feed::{CouplingIndicators, FeedEvent, LiveFeed};
use crate::metrics::MetricsEngine;
use crate::prompt::PromptBuilder;
use crate::recorder::{SessionStore, TurnMetricsRecord};
use crate::session::{Roster, Speaker, Turn};

/// Roster key for the human participant slot.
const HUMAN_KEY: &str = "human";

/// Command channel depth; overflow simply backpressures callers.
const COMMAND_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// The scheduler's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
    AwaitingHuman,
    Paused,
    /// Terminal; entered exactly once by `end()`.
    Complete,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

enum Command {
    Pause { reply: Reply<()> },
    Resume { reply: Reply<()> },
    SubmitHuman { text: String, reply: Reply<()> },
    ForceInvoke { agent_id: String, reply: Reply<()> },
    InjectPrompt { text: String, reply: Reply<()> },
    End { reply: Reply<Analysis> },
}

/// Handle for one live session; cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SchedulerState>,
    feed: Arc<LiveFeed>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current scheduler state.
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Subscribe to the live feed; only future events arrive.
    pub fn subscribe(&self) -> mpsc::Receiver<FeedEvent> {
        self.feed.subscribe()
    }

    pub async fn pause(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Pause { reply: tx }, "pause").await?;
        self.recv(rx).await
    }

    pub async fn resume(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Resume { reply: tx }, "resume").await?;
        self.recv(rx).await
    }

    pub async fn submit_human_turn(&self, text: String) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(
            Command::SubmitHuman { text, reply: tx },
            "submit_human_turn",
        )
        .await?;
        self.recv(rx).await
    }

    pub async fn force_invoke(&self, agent_id: String) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(
            Command::ForceInvoke {
                agent_id,
                reply: tx,
            },
            "force_invoke",
        )
        .await?;
        self.recv(rx).await
    }

    pub async fn inject_prompt(&self, text: String) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::InjectPrompt { text, reply: tx }, "inject_prompt")
            .await?;
        self.recv(rx).await
    }

    /// Finalize the session: cancel any in-flight generation, run the
    /// batch analysis, and return the Analysis record.
    pub async fn end(&self) -> Result<Analysis, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::End { reply: tx }, "end").await?;
        self.recv(rx).await
    }

    async fn send(&self, command: Command, operation: &'static str) -> Result<(), EngineError> {
        if self.state() == SchedulerState::Complete {
            return Err(EngineError::InvalidStateTransition {
                from: SchedulerState::Complete,
                operation,
            });
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| match self.state() {
                SchedulerState::Complete => EngineError::InvalidStateTransition {
                    from: SchedulerState::Complete,
                    operation,
                },
                _ => EngineError::SessionGone { session_id: self.id },
            })
    }

    async fn recv<T>(&self, rx: oneshot::Receiver<Result<T, EngineError>>) -> Result<T, EngineError> {
        rx.await
            .map_err(|_| EngineError::SessionGone { session_id: self.id })?
    }
}

// ---------------------------------------------------------------------------
// Rotation policy
// ---------------------------------------------------------------------------

/// Cooldown-aware speaker rotation with a seeded tie-break draw.
pub(crate) struct Rotation {
    cooldown: usize,
    rng: StdRng,
}

impl Rotation {
    pub(crate) fn new(cooldown: usize, seed: u64) -> Self {
        Self {
            cooldown,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Pick the next speaker among `keys`.
    ///
    /// Eligible participants are those who have never spoken or whose gap
    /// since last speaking exceeds the cooldown; with everyone cooling
    /// down, the whole roster is reconsidered so the session never stalls.
    /// Least-recently-spoken wins; ties are broken by the seeded draw.
    pub(crate) fn select(
        &mut self,
        keys: &[String],
        last_spoken: &HashMap<String, usize>,
        next_index: usize,
    ) -> String {
        debug_assert!(!keys.is_empty());
        // Never-spoken participants sort ahead of everyone else.
        let priority = |key: &str| -> i64 {
            match last_spoken.get(key) {
                None => -1,
                Some(last) => *last as i64,
            }
        };

        let mut pool: Vec<String> = keys
            .iter()
            .filter(|key| match last_spoken.get(key.as_str()) {
                None => true,
                Some(last) => next_index - last > self.cooldown,
            })
            .cloned()
            .collect();
        if pool.is_empty() {
            pool = keys.to_vec();
        }

        let best = pool
            .iter()
            .map(|k| priority(k))
            .min()
            .expect("pool is non-empty");
        let tied: Vec<String> = pool.into_iter().filter(|k| priority(k) == best).collect();
        let pick = if tied.len() == 1 {
            0
        } else {
            self.rng.gen_range(0..tied.len())
        };
        tied[pick].clone()
    }
}

// ---------------------------------------------------------------------------
// Scheduler task
// ---------------------------------------------------------------------------

enum Flow {
    Continue,
    Terminate,
}

/// Outcome of racing a future against the command channel.
enum Raced<T> {
    Done(T),
    /// `end()` arrived mid-flight; the raced future was dropped.
    End(Reply<Analysis>),
    /// Every handle is gone; the session dies quietly.
    Closed,
}

struct SchedulerTask {
    id: Uuid,
    config: EngineConfig,
    provocation: String,
    roster: Roster,
    participants: Vec<String>,
    prompts: PromptBuilder,
    generation: Arc<dyn GenerationBackend>,
    embedder: EmbeddingAdapter,
    store: Arc<dyn SessionStore>,
    feed: Arc<LiveFeed>,
    commands: mpsc::Receiver<Command>,
    deferred: VecDeque<Command>,
    state: SchedulerState,
    state_tx: watch::Sender<SchedulerState>,
    turns: Vec<Turn>,
    basins: Vec<BasinLabel>,
    metrics: MetricsEngine,
    last_spoken: HashMap<String, usize>,
    rotation: Rotation,
    forced: VecDeque<String>,
    usage: SessionUsage,
    pause_requested: bool,
}

/// Validate the roster, register the session with the store, and spawn
/// its scheduler task.
pub(crate) fn spawn_session(
    id: Uuid,
    provocation: String,
    roster: Roster,
    config: EngineConfig,
    generation: Arc<dyn GenerationBackend>,
    embedder: EmbeddingAdapter,
    store: Arc<dyn SessionStore>,
) -> Result<SessionHandle, EngineError> {
    roster
        .validate()
        .map_err(|detail| EngineError::DataIntegrity { detail })?;
    config
        .validate()
        .map_err(|detail| EngineError::DataIntegrity { detail })?;
    store.create_session(id, &provocation, Utc::now())?;

    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);
    let feed = Arc::new(LiveFeed::new(config.feed_capacity));

    let mut participants: Vec<String> = roster.agents.iter().map(|a| a.id.clone()).collect();
    if roster.include_human {
        participants.push(HUMAN_KEY.to_string());
    }

    let task = SchedulerTask {
        id,
        prompts: PromptBuilder::new(config.prompt_window),
        metrics: MetricsEngine::new(
            config.min_alpha_window,
            config.integrity_window,
            config.integrity.clone(),
        ),
        rotation: Rotation::new(config.cooldown_turns, config.rotation_seed),
        provocation,
        roster,
        participants,
        generation,
        embedder,
        store,
        feed: feed.clone(),
        commands: command_rx,
        deferred: VecDeque::new(),
        state: SchedulerState::Idle,
        state_tx,
        turns: Vec::new(),
        basins: Vec::new(),
        last_spoken: HashMap::new(),
        forced: VecDeque::new(),
        usage: SessionUsage::default(),
        pause_requested: false,
        config,
    };
    tokio::spawn(task.run());

    Ok(SessionHandle {
        id,
        commands: command_tx,
        state: state_rx,
        feed,
    })
}

impl SchedulerTask {
    async fn run(mut self) {
        log::info!("session {} starting with {} agents", self.id, self.roster.agents.len());
        self.set_state(SchedulerState::Running, None, None);

        loop {
            match self.state {
                SchedulerState::Running => {
                    if let Flow::Terminate = self.drain_pending().await {
                        return;
                    }
                    if self.state != SchedulerState::Running {
                        continue;
                    }
                    if let Some(agent_id) = self.forced.pop_front() {
                        if let Flow::Terminate = self.generate_turn(agent_id).await {
                            return;
                        }
                        continue;
                    }
                    let next =
                        self.rotation
                            .select(&self.participants, &self.last_spoken, self.turns.len());
                    if next == HUMAN_KEY {
                        self.set_state(
                            SchedulerState::AwaitingHuman,
                            Some(HUMAN_KEY.to_string()),
                            None,
                        );
                    } else if let Flow::Terminate = self.generate_turn(next).await {
                        return;
                    }
                }
                SchedulerState::AwaitingHuman | SchedulerState::Paused => {
                    match self.commands.recv().await {
                        Some(command) => {
                            if let Flow::Terminate = self.handle_command(command).await {
                                return;
                            }
                        }
                        None => return,
                    }
                }
                SchedulerState::Complete => return,
                SchedulerState::Idle => unreachable!("run() starts in Running"),
            }
        }
    }

    /// Drain already-queued commands without blocking.
    async fn drain_pending(&mut self) -> Flow {
        loop {
            match self.commands.try_recv() {
                Ok(command) => {
                    if let Flow::Terminate = self.handle_command(command).await {
                        return Flow::Terminate;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return Flow::Continue,
                Err(mpsc::error::TryRecvError::Disconnected) => return Flow::Terminate,
            }
        }
    }

    /// Handle one command at a turn boundary.
    async fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Pause { reply } => {
                if self.state == SchedulerState::Running {
                    self.set_state(SchedulerState::Paused, None, None);
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(EngineError::InvalidStateTransition {
                        from: self.state,
                        operation: "pause",
                    }));
                }
            }
            Command::Resume { reply } => {
                if self.state == SchedulerState::Paused {
                    self.set_state(SchedulerState::Running, None, None);
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(EngineError::InvalidStateTransition {
                        from: self.state,
                        operation: "resume",
                    }));
                }
            }
            Command::SubmitHuman { text, reply } => {
                if self.state == SchedulerState::AwaitingHuman {
                    match self.record_turn(Speaker::Human, text, Duration::ZERO).await {
                        Ok(()) => {
                            let _ = reply.send(Ok(()));
                            self.set_state(SchedulerState::Running, None, None);
                        }
                        Err(err) => {
                            self.fatal(&err);
                            let _ = reply.send(Err(err));
                        }
                    }
                } else {
                    let _ = reply.send(Err(EngineError::InvalidStateTransition {
                        from: self.state,
                        operation: "submit_human_turn",
                    }));
                }
            }
            Command::ForceInvoke { agent_id, reply } => {
                if self.roster.agent(&agent_id).is_none() {
                    let _ = reply.send(Err(EngineError::UnknownAgent { agent_id }));
                } else {
                    self.forced.push_back(agent_id);
                    let _ = reply.send(Ok(()));
                }
            }
            Command::InjectPrompt { text, reply } => {
                match self.record_turn(Speaker::System, text, Duration::ZERO).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                    }
                    Err(err) => {
                        self.fatal(&err);
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::End { reply } => {
                self.finalize(reply);
                return Flow::Terminate;
            }
        }
        Flow::Continue
    }

    /// Drive one full generation attempt cycle for `agent_id`, including
    /// retries, and record the resulting turn.
    async fn generate_turn(&mut self, agent_id: String) -> Flow {
        let agent = match self.roster.agent(&agent_id) {
            Some(agent) => agent.clone(),
            None => {
                // Forced ids are validated at enqueue time; a miss here
                // means the roster changed under us, which it cannot.
                log::error!("session {}: unknown agent {agent_id} selected", self.id);
                return Flow::Continue;
            }
        };
        let request = self.prompts.build(&self.provocation, &self.turns, &agent);

        let mut attempts: u32 = 0;
        let output: GenerationOutput = loop {
            attempts += 1;
            let backend = self.generation.clone();
            let req = request.clone();
            let deadline = self.config.backend_timeout;
            let attempt = async move {
                match tokio::time::timeout(deadline, backend.generate(&req)).await {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Transport {
                        message: format!("generation timed out after {deadline:?}"),
                    }),
                }
            };

            match self.race(attempt).await {
                Raced::Done(Ok(output)) => break output,
                Raced::Done(Err(source)) => {
                    if attempts > self.config.retry.max_retries {
                        self.fatal(&EngineError::TransientBackend { source, attempts });
                        return Flow::Continue;
                    }
                    let backoff = self.config.retry.backoff_for(attempts);
                    log::warn!(
                        "session {}: generation attempt {attempts} failed ({source}); retrying in {backoff:?}",
                        self.id
                    );
                    match self.race(tokio::time::sleep(backoff)).await {
                        Raced::Done(()) => continue,
                        Raced::End(reply) => {
                            self.finalize(reply);
                            return Flow::Terminate;
                        }
                        Raced::Closed => return Flow::Terminate,
                    }
                }
                Raced::End(reply) => {
                    // In-flight call dropped; its partial result is never
                    // recorded.
                    log::debug!("session {}: generation cancelled by end()", self.id);
                    self.finalize(reply);
                    return Flow::Terminate;
                }
                Raced::Closed => return Flow::Terminate,
            }
        };

        let latency = output.latency;
        let call_usage = output.usage;
        match self
            .record_turn(Speaker::Agent { id: agent_id }, output.text, latency)
            .await
        {
            Ok(()) => {
                self.usage.prompt_tokens += call_usage.prompt_tokens;
                self.usage.completion_tokens += call_usage.completion_tokens;
                self.usage.total_latency += latency;
            }
            Err(err) => {
                self.fatal(&err);
                return Flow::Continue;
            }
        }

        // Commands that arrived mid-generation, in arrival order.
        while let Some(command) = self.deferred.pop_front() {
            if let Flow::Terminate = self.handle_command(command).await {
                return Flow::Terminate;
            }
        }
        if self.pause_requested {
            self.pause_requested = false;
            if self.state == SchedulerState::Running {
                self.set_state(SchedulerState::Paused, None, None);
            }
        }
        Flow::Continue
    }

    /// Race `fut` against the command channel. Pause and resume flip the
    /// between-turns flag immediately; `end()` wins the race and cancels
    /// `fut` by dropping it; everything else is deferred in arrival order.
    async fn race<F, T>(&mut self, fut: F) -> Raced<T>
    where
        F: Future<Output = T>,
    {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return Raced::Done(out),
                command = self.commands.recv() => match command {
                    Some(Command::End { reply }) => return Raced::End(reply),
                    Some(Command::Pause { reply }) => {
                        self.pause_requested = true;
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Resume { reply }) => {
                        if self.pause_requested {
                            self.pause_requested = false;
                            let _ = reply.send(Ok(()));
                        } else {
                            let _ = reply.send(Err(EngineError::InvalidStateTransition {
                                from: SchedulerState::Running,
                                operation: "resume",
                            }));
                        }
                    }
                    Some(other) => self.deferred.push_back(other),
                    None => return Raced::Closed,
                }
            }
        }
    }

    /// Embed, record, measure, classify, and publish one turn.
    async fn record_turn(
        &mut self,
        speaker: Speaker,
        text: String,
        latency: Duration,
    ) -> Result<(), EngineError> {
        let index = self.turns.len();
        let embedding = self.embed_with_retry(index, &text).await?;

        let turn = Turn {
            index,
            speaker: speaker.clone(),
            text,
            timestamp: Utc::now(),
            latency,
            embedding: embedding.as_ref().clone(),
        };
        self.store.append_turn(self.id, &turn)?;

        let snapshot = self.metrics.push(speaker.voice_key(), embedding);
        let prior = index.checked_sub(1).map(|i| self.turns[i].text.clone());
        let signals = TextSignals::extract(&turn.text, prior.as_deref());
        let label = basin::classify(&snapshot, &signals, &self.config.basins);
        self.basins.push(label);
        let pattern = basin::coherence(
            &self.basins,
            self.config.coherence_window,
            self.config.stability_threshold,
        );

        self.store.append_metrics(
            self.id,
            &TurnMetricsRecord {
                snapshot: snapshot.clone(),
                basin: label,
            },
        )?;

        if let Some(voice) = speaker.voice_key() {
            self.last_spoken.insert(voice.to_string(), index);
        }

        self.feed.publish(FeedEvent::TurnCompleted {
            session_id: self.id,
            turn_index: index,
            speaker: speaker.display().to_string(),
            content: turn.text.clone(),
            latency,
        });
        self.feed.publish(FeedEvent::MetricsUpdated {
            session_id: self.id,
            turn_index: index,
            basin: label,
            integrity_label: snapshot.integrity.map(|i| i.label),
            voice_distinctiveness: snapshot.voice_distinctiveness,
            coupling: CouplingIndicators {
                velocity: snapshot.velocity,
                curvature: snapshot.curvature,
                alpha: snapshot.alpha,
                coherence: pattern,
            },
        });

        self.turns.push(turn);
        log::debug!(
            "session {}: turn {index} by {} classified {label}",
            self.id,
            speaker.display()
        );
        Ok(())
    }

    /// Embedding with the same bounded retry budget as generation; the
    /// adapter guarantees the turn is embedded at most once overall.
    async fn embed_with_retry(
        &self,
        turn_index: usize,
        text: &str,
    ) -> Result<Arc<Vec<f32>>, EngineError> {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.embedder.embed_turn(turn_index, text).await {
                Ok(vector) => return Ok(vector),
                Err(EngineError::TransientBackend { source, .. }) => {
                    if attempts > self.config.retry.max_retries {
                        return Err(EngineError::TransientBackend { source, attempts });
                    }
                    let backoff = self.config.retry.backoff_for(attempts);
                    log::warn!(
                        "session {}: turn {turn_index} not yet embeddable ({source}); retrying in {backoff:?}",
                        self.id
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Run the batch pass, persist the Analysis exactly once, and enter
    /// the terminal state.
    fn finalize(&mut self, reply: Reply<Analysis>) {
        let (analysis, records) = analysis::run_batch(
            self.id,
            &self.provocation,
            &self.turns,
            &self.basins,
            self.usage,
            &self.config,
        );
        let result = self
            .store
            .replace_metrics(self.id, &records)
            .and_then(|()| self.store.write_analysis(self.id, &analysis))
            .map(|()| analysis)
            .map_err(EngineError::Storage);

        match &result {
            Ok(_) => {
                self.set_state(SchedulerState::Complete, None, None);
                log::info!("session {} finalized with {} turns", self.id, self.turns.len());
            }
            Err(err) => log::error!("session {} failed to finalize: {err}", self.id),
        }
        let _ = reply.send(result);
    }

    /// A backend or integrity failure that must not silently skip a turn:
    /// park the session and surface the error on the feed.
    fn fatal(&mut self, err: &EngineError) {
        log::error!("session {}: fatal error, pausing: {err}", self.id);
        self.set_state(SchedulerState::Paused, None, Some(err.to_string()));
    }

    fn set_state(
        &mut self,
        state: SchedulerState,
        next_speaker: Option<String>,
        error: Option<String>,
    ) {
        self.state = state;
        let _ = self.state_tx.send(state);
        self.feed.publish(FeedEvent::StateChanged {
            session_id: self.id,
            state,
            next_speaker,
            error,
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
