//! # polylogue
//!
//! A dialogue trajectory engine: simulates a multi-party dialogue among a
//! fixed roster of synthetic participants and analyzes the resulting
//! utterance sequence as a trajectory through meaning-space.
//!
//! The core is two halves. A turn scheduler sequences who speaks next
//! under cooldown and override rules, with pause/resume, human-in-the-loop
//! interruption, and cancellation of in-flight generation at session end.
//! A metrics and basin-classification pipeline turns the growing embedding
//! sequence into velocity, curvature, a fractal scaling exponent, entropy
//! shift, and voice distinctiveness, and labels each turn with a discrete
//! regime basin. Live per-turn estimates stream to subscribers; the
//! authoritative full-series analysis is computed once at `end()`.

pub mod agent;
pub mod analysis;
pub mod backend;
pub mod basin;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod prompt;
pub mod recorder;
pub mod scheduler;
pub mod server;
pub mod session;

pub use agent::{AgentDescriptor, SamplingParams, TraitVector};
pub use analysis::Analysis;
pub use basin::{BasinLabel, CoherencePattern};
pub use config::EngineConfig;
pub use engine::DialogueEngine;
pub use error::EngineError;
pub use feed::FeedEvent;
pub use metrics::{AlphaEstimate, IntegrityLabel, MetricsSnapshot};
pub use recorder::{MemoryStore, SessionStore, SqliteStore};
pub use scheduler::SchedulerState;
pub use session::{Roster, Speaker, Turn};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
