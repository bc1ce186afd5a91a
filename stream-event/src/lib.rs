//! Gateway stream event protocol: type + data payload + envelope (timestamp, seq).
//!
//! This crate defines the wire shape of a single gateway event, the per-session
//! sequence state, and the bounded replay log. It does not depend on hearth;
//! the gateway bridges its internal events into [`GatewayEvent`] and stamps them
//! via [`SeqState`].

pub mod envelope;
pub mod event;

pub use envelope::{EventEnvelope, EventLog, SeqState, REPLAY_LOG_CAPACITY};
pub use event::{GatewayEvent, QueryTimings};
