//! # Hearth
//!
//! Core of the hearth daemon: a long-running local service that gives a
//! conversational coding CLI durable memory, multi-session context
//! reconstruction, background exploration, and orchestrated multi-agent
//! swarms.
//!
//! ## Main modules
//!
//! - [`store`]: SQLite system of record with cosine-similarity vector search
//!   ([`Store`]); sessions, conversations and blocks, context cache,
//!   summaries, entities, project tasks, swarm rows.
//! - [`queue`]: durable prioritized task queue ([`TaskType`], atomic claim,
//!   retry with cap, stats).
//! - [`worker`]: tick-driven pool dispatching queue rows to typed handlers
//!   ([`WorkerPool`], [`WorkerServices`]).
//! - [`context`]: per-session context document assembly ([`ContextBuilder`]).
//! - [`llm`]: LLM client seam ([`LlmClient`], [`Embedder`], [`MockLlm`],
//!   [`ChatOpenAi`]); the SDK contract is a stream of classified
//!   [`SdkEvent`]s plus cancellation.
//! - [`gateway`]: streaming agent gateway ([`Gateway`], per-connection state
//!   machine, permission arbitration, resume-with-replay).
//! - [`swarm`]: DAG orchestration ([`Orchestrator`], validation with cycle
//!   paths, synthesis / supervisor / memory-steward conventions, autonomous
//!   task loops, scratchpad).
//! - [`explore`]: ambient exploration loop ([`Explorer`], structured
//!   findings, promotion via [`FactIntegration`], gap detection).
//! - [`mode`]: mode-session continuity and wellness extraction.
//! - [`protocol`]: WebSocket client messages ([`ClientMessage`]); server
//!   events live in the `stream-event` crate.
//! - [`daemon`]: the wired façade ([`Daemon`]) the serve layer and the
//!   `hearthd` binary drive.
//!
//! Key types are re-exported at the crate root.

pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod explore;
pub mod gateway;
pub mod llm;
pub mod message;
pub mod mode;
pub mod protocol;
pub mod queue;
pub mod store;
pub mod swarm;
pub mod worker;

pub use config::DaemonConfig;
pub use context::{ContextBuilder, ContextMode, ContextRequest};
pub use daemon::{CaptureParams, ContextBuildParams, Daemon, DaemonDeps, SessionId};
pub use error::{ErrorKind, Kinded};
pub use explore::{Explorer, FactIntegration, KnowledgeGraph};
pub use gateway::{Connection, Gateway, GatewayConfig, GatewayError, NullStimulus, StimulusSink};
pub use llm::{ChatOpenAi, Embedder, LlmClient, LlmError, MockEmbedder, MockLlm, SdkEvent};
pub use message::Message;
pub use protocol::{ClientMessage, SessionConfig};
pub use queue::{QueueStats, TaskType};
pub use store::{Store, StoreError};
pub use swarm::{AgentMode, AgentSpec, DependsOnSpec, Orchestrator, SwarmError, SwarmSpec};
pub use worker::{WorkerPool, WorkerServices};
