//! Gateway state-machine tests with a scripted LLM.

use std::sync::Arc;
use std::time::Duration;

use stream_event::{EventEnvelope, GatewayEvent};
use tokio::sync::mpsc;

use super::*;
use crate::context::ContextBuilder;
use crate::llm::{MockEmbedder, MockLlm, ScriptEvent, ScriptedTurn};
use crate::protocol::{ClientMessage, SessionConfig};
use crate::store::Store;

const DIM: usize = 8;

struct Harness {
    _dir: tempfile::TempDir,
    store: Store,
    llm: Arc<MockLlm>,
    gateway: Arc<Gateway>,
}

fn harness(llm: MockLlm, config: GatewayConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("t.db"), DIM).unwrap();
    let embedder = Arc::new(MockEmbedder::new(DIM));
    let llm = Arc::new(llm);
    let gateway = Gateway::new(
        store.clone(),
        llm.clone(),
        Arc::new(ContextBuilder::new(store.clone(), embedder)),
        Arc::new(NullStimulus),
        config,
    );
    Harness {
        _dir: dir,
        store,
        llm,
        gateway,
    }
}

fn connect(h: &Harness) -> (Connection, mpsc::Receiver<EventEnvelope>) {
    let (tx, rx) = mpsc::channel(64);
    (h.gateway.open_connection(tx), rx)
}

async fn next_event(rx: &mut mpsc::Receiver<EventEnvelope>) -> EventEnvelope {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

fn config() -> SessionConfig {
    SessionConfig {
        working_dir: "/p".into(),
        personality: Some("tsun".into()),
        ..Default::default()
    }
}

async fn open_session(conn: &mut Connection, rx: &mut mpsc::Receiver<EventEnvelope>) -> String {
    conn.handle(ClientMessage::NewSession { config: config() })
        .await
        .unwrap();
    match next_event(rx).await.event {
        GatewayEvent::SessionReady { session_id } => session_id,
        other => panic!("expected session_ready, got {:?}", other),
    }
}

#[tokio::test]
async fn ping_pongs_without_a_session() {
    let h = harness(MockLlm::new("ok"), GatewayConfig::default());
    let (mut conn, mut rx) = connect(&h);
    conn.handle(ClientMessage::Ping).await.unwrap();
    assert!(matches!(next_event(&mut rx).await.event, GatewayEvent::Pong {}));
}

#[tokio::test]
async fn query_streams_text_then_done_and_persists_turns() {
    let llm = MockLlm::new("").with_turn(ScriptedTurn {
        events: vec![
            ScriptEvent::Text("hel".into()),
            ScriptEvent::Text("lo".into()),
        ],
        response: "hello".into(),
        ..Default::default()
    });
    let h = harness(llm, GatewayConfig::default());
    let (mut conn, mut rx) = connect(&h);
    let session_id = open_session(&mut conn, &mut rx).await;

    conn.handle(ClientMessage::Query {
        prompt: "greet me".into(),
    })
    .await
    .unwrap();

    let mut text = String::new();
    loop {
        let envelope = next_event(&mut rx).await;
        match envelope.event {
            GatewayEvent::Text { text: t } => text.push_str(&t),
            GatewayEvent::Done {
                response_text,
                tool_count,
                ..
            } => {
                assert_eq!(response_text, "hello");
                assert_eq!(tool_count, 0);
                break;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(text, "hello");

    // Both turns persisted, newest first.
    let recent = h.store.recent_conversations(&session_id, 10).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].message_type, "assistant");
    assert_eq!(recent[0].prompt, "hello");
    assert_eq!(recent[1].message_type, "user");
    assert_eq!(recent[1].prompt, "greet me");
}

#[tokio::test]
async fn cancel_mid_stream_yields_cancelled_and_nothing_after() {
    let llm = MockLlm::new("next query answer")
        .with_turn(ScriptedTurn {
            events: vec![
                ScriptEvent::Text("first".into()),
                ScriptEvent::Text("second".into()),
                ScriptEvent::Text("third".into()),
            ],
            response: "essay".into(),
            ..Default::default()
        })
        .with_event_delay(Duration::from_millis(40));
    let h = harness(llm, GatewayConfig::default());
    let (mut conn, mut rx) = connect(&h);
    open_session(&mut conn, &mut rx).await;

    conn.handle(ClientMessage::Query {
        prompt: "write a long essay".into(),
    })
    .await
    .unwrap();

    // Cancel on the first text event.
    loop {
        let envelope = next_event(&mut rx).await;
        if matches!(envelope.event, GatewayEvent::Text { .. }) {
            conn.handle(ClientMessage::Cancel).await.unwrap();
            break;
        }
    }
    // The next event is `cancelled`; no text, tool, or done events follow.
    let envelope = next_event(&mut rx).await;
    assert!(
        matches!(envelope.event, GatewayEvent::Cancelled { .. }),
        "expected cancelled, got {:?}",
        envelope.event
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "no events may follow cancelled");

    // A subsequent query succeeds.
    while conn.is_running() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    conn.handle(ClientMessage::Query {
        prompt: "again".into(),
    })
    .await
    .unwrap();
    loop {
        let envelope = next_event(&mut rx).await;
        if let GatewayEvent::Done { response_text, .. } = envelope.event {
            assert_eq!(response_text, "next query answer");
            break;
        }
    }
}

#[tokio::test]
async fn seq_is_strictly_increasing_and_gap_free() {
    let llm = MockLlm::new("").with_turn(ScriptedTurn {
        events: vec![
            ScriptEvent::Text("a".into()),
            ScriptEvent::Thinking("hm".into()),
            ScriptEvent::Text("b".into()),
        ],
        response: "ab".into(),
        ..Default::default()
    });
    let h = harness(llm, GatewayConfig::default());
    let (mut conn, mut rx) = connect(&h);
    open_session(&mut conn, &mut rx).await;
    conn.handle(ClientMessage::Query { prompt: "go".into() })
        .await
        .unwrap();

    // session_ready consumed seq 1; collect until done.
    let mut last = 1;
    loop {
        let envelope = next_event(&mut rx).await;
        assert_eq!(envelope.seq, last + 1, "gap-free and increasing");
        last = envelope.seq;
        if matches!(envelope.event, GatewayEvent::Done { .. }) {
            break;
        }
    }
}

#[tokio::test]
async fn resume_replays_only_events_after_last_seq() {
    let llm = MockLlm::new("").with_turn(ScriptedTurn {
        events: vec![ScriptEvent::Text("x".into())],
        response: "x".into(),
        ..Default::default()
    });
    let h = harness(llm, GatewayConfig::default());
    let (mut conn, mut rx) = connect(&h);
    let session_id = open_session(&mut conn, &mut rx).await;
    conn.handle(ClientMessage::Query { prompt: "p".into() })
        .await
        .unwrap();

    let mut seen = Vec::new();
    loop {
        let envelope = next_event(&mut rx).await;
        let done = matches!(envelope.event, GatewayEvent::Done { .. });
        seen.push(envelope);
        if done {
            break;
        }
    }
    let cut = seen[0].seq; // client saw the text event, lost the rest

    // New connection resumes after `cut`.
    let (mut conn2, mut rx2) = connect(&h);
    conn2
        .handle(ClientMessage::ResumeSession {
            session_id,
            last_seq: Some(cut),
        })
        .await
        .unwrap();
    let replayed = next_event(&mut rx2).await;
    assert_eq!(replayed.seq, seen[1].seq);
    assert!(matches!(replayed.event, GatewayEvent::Done { .. }));
}

#[tokio::test]
async fn second_query_while_running_is_a_recoverable_error() {
    let llm = MockLlm::new("")
        .with_turn(ScriptedTurn {
            events: vec![ScriptEvent::Text("slow".into())],
            response: "slow".into(),
            ..Default::default()
        })
        .with_event_delay(Duration::from_millis(80));
    let h = harness(llm, GatewayConfig::default());
    let (mut conn, mut rx) = connect(&h);
    open_session(&mut conn, &mut rx).await;

    conn.handle(ClientMessage::Query { prompt: "one".into() })
        .await
        .unwrap();
    conn.handle(ClientMessage::Query { prompt: "two".into() })
        .await
        .unwrap();

    let envelope = next_event(&mut rx).await;
    match envelope.event {
        GatewayEvent::Error {
            message,
            recoverable,
        } => {
            assert!(recoverable);
            assert!(message.contains("already running"));
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn permission_request_roundtrip_allows_tool() {
    let llm = MockLlm::new("").with_turn(ScriptedTurn {
        events: vec![ScriptEvent::Permission {
            tool_name: "Bash".into(),
            tool_input: serde_json::json!({"command": "ls"}),
        }],
        response: "done".into(),
        ..Default::default()
    });
    let h = harness(llm, GatewayConfig::default());
    let (mut conn, mut rx) = connect(&h);
    open_session(&mut conn, &mut rx).await;
    conn.handle(ClientMessage::Query { prompt: "list".into() })
        .await
        .unwrap();

    let request_id = loop {
        let envelope = next_event(&mut rx).await;
        if let GatewayEvent::PermissionRequest {
            request_id,
            tool_name,
            ..
        } = envelope.event
        {
            assert_eq!(tool_name, "Bash");
            break request_id;
        }
    };
    conn.handle(ClientMessage::PermissionResponse {
        request_id,
        allowed: true,
        deny_message: None,
    })
    .await
    .unwrap();

    loop {
        let envelope = next_event(&mut rx).await;
        if matches!(envelope.event, GatewayEvent::Done { .. }) {
            break;
        }
    }
    let decisions = h.llm.decisions();
    assert_eq!(decisions.len(), 1);
    assert!(decisions[0].allowed);
}

#[tokio::test]
async fn unresolved_permission_times_out_to_deny_with_interrupt() {
    let llm = MockLlm::new("").with_turn(ScriptedTurn {
        events: vec![ScriptEvent::Permission {
            tool_name: "Bash".into(),
            tool_input: serde_json::json!({"command": "rm -rf /"}),
        }],
        response: "never".into(),
        ..Default::default()
    });
    let mut cfg = GatewayConfig::default();
    cfg.permission_timeout = Duration::from_millis(50);
    let h = harness(llm, cfg);
    let (mut conn, mut rx) = connect(&h);
    open_session(&mut conn, &mut rx).await;
    conn.handle(ClientMessage::Query { prompt: "danger".into() })
        .await
        .unwrap();

    // Never respond; the deadline denies with interrupt and the turn cancels.
    let mut saw_request = false;
    loop {
        let envelope = next_event(&mut rx).await;
        match envelope.event {
            GatewayEvent::PermissionRequest { .. } => saw_request = true,
            GatewayEvent::Cancelled { .. } => break,
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert!(saw_request);
    let decisions = h.llm.decisions();
    assert_eq!(decisions.len(), 1);
    assert!(!decisions[0].allowed);
    assert!(decisions[0].interrupt);
}

#[tokio::test]
async fn update_config_only_when_idle() {
    let llm = MockLlm::new("fine").with_event_delay(Duration::from_millis(60));
    let h = harness(llm, GatewayConfig::default());
    let (mut conn, mut rx) = connect(&h);
    open_session(&mut conn, &mut rx).await;

    conn.handle(ClientMessage::UpdateConfig { config: config() })
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut rx).await.event,
        GatewayEvent::SessionReady { .. }
    ));
}
