//! Envelope (timestamp, seq) per event, plus sequence state and the bounded
//! replay log backing resume-with-replay.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::event::GatewayEvent;

/// How many stamped events each session retains for replay.
pub const REPLAY_LOG_CAPACITY: usize = 500;

/// One stamped event: the payload plus `timestamp` and per-session `seq`.
///
/// Wire shape: `{"type": ..., "data": {...}, "timestamp": "...", "seq": N}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: GatewayEvent,
    /// RFC 3339 stamp taken when the event was sequenced.
    pub timestamp: String,
    /// Monotonic, gap-free sequence number scoped to the session.
    pub seq: u64,
}

/// Per-session sequence counter. Stamps events with strictly increasing,
/// gap-free `seq` starting at 1.
#[derive(Debug)]
pub struct SeqState {
    next_seq: u64,
}

impl SeqState {
    pub fn new() -> Self {
        Self { next_seq: 1 }
    }

    /// Resumes counting after the given last-assigned seq (e.g. from a
    /// persisted session); the next stamp is `last + 1`.
    pub fn resume_after(last: u64) -> Self {
        Self { next_seq: last + 1 }
    }

    /// The seq the next stamped event will carry.
    pub fn peek(&self) -> u64 {
        self.next_seq
    }

    /// Stamps the event with the next seq and the current time.
    pub fn stamp(&mut self, event: GatewayEvent) -> EventEnvelope {
        let seq = self.next_seq;
        self.next_seq += 1;
        EventEnvelope {
            event,
            timestamp: chrono::Utc::now().to_rfc3339(),
            seq,
        }
    }
}

impl Default for SeqState {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded per-session event log backing replay. Keeps the last
/// [`REPLAY_LOG_CAPACITY`] stamped events in seq order.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: VecDeque<EventEnvelope>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stamped event, evicting the oldest entry when full.
    pub fn push(&mut self, envelope: EventEnvelope) {
        if self.entries.len() == REPLAY_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(envelope);
    }

    /// Events with `seq > last_seq`, skipping `session_ready` (a resuming
    /// client already holds its own session-ready state).
    pub fn replay_after(&self, last_seq: u64) -> Vec<EventEnvelope> {
        self.entries
            .iter()
            .filter(|e| e.seq > last_seq && !e.event.is_session_ready())
            .cloned()
            .collect()
    }

    /// Seq of the newest retained event, or 0 when empty.
    pub fn last_seq(&self) -> u64 {
        self.entries.back().map(|e| e.seq).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> GatewayEvent {
        GatewayEvent::Text {
            text: s.to_string(),
        }
    }

    #[test]
    fn seq_is_monotonic_and_gap_free() {
        let mut state = SeqState::new();
        let a = state.stamp(text("a"));
        let b = state.stamp(text("b"));
        let c = state.stamp(text("c"));
        assert_eq!((a.seq, b.seq, c.seq), (1, 2, 3));
    }

    #[test]
    fn envelope_wire_shape_has_all_four_fields() {
        let mut state = SeqState::new();
        let env = state.stamp(text("hello"));
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "text");
        assert_eq!(v["data"]["text"], "hello");
        assert_eq!(v["seq"], 1);
        assert!(v["timestamp"].as_str().is_some());
    }

    #[test]
    fn replay_returns_only_events_after_last_seq() {
        let mut state = SeqState::new();
        let mut log = EventLog::new();
        for i in 0..5 {
            log.push(state.stamp(text(&format!("m{}", i))));
        }
        let replayed = log.replay_after(3);
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].seq, 4);
        assert_eq!(replayed[1].seq, 5);
    }

    #[test]
    fn replay_skips_session_ready() {
        let mut state = SeqState::new();
        let mut log = EventLog::new();
        log.push(state.stamp(GatewayEvent::SessionReady {
            session_id: "s1".to_string(),
        }));
        log.push(state.stamp(text("a")));
        let replayed = log.replay_after(0);
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].seq, 2);
    }

    #[test]
    fn log_is_bounded() {
        let mut state = SeqState::new();
        let mut log = EventLog::new();
        for i in 0..(REPLAY_LOG_CAPACITY + 10) {
            log.push(state.stamp(text(&i.to_string())));
        }
        assert_eq!(log.len(), REPLAY_LOG_CAPACITY);
        // Oldest retained seq is 11; replay after 0 starts there.
        assert_eq!(log.replay_after(0)[0].seq, 11);
        assert_eq!(log.last_seq(), (REPLAY_LOG_CAPACITY + 10) as u64);
    }

    #[test]
    fn resume_after_continues_counting() {
        let mut state = SeqState::resume_after(41);
        assert_eq!(state.peek(), 42);
        assert_eq!(state.stamp(text("x")).seq, 42);
    }
}
