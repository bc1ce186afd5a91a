//! Streaming agent gateway: one stateful duplex channel per connected client.
//!
//! The channel state machine: **Idle** (no session) → `new_session` /
//! `resume_session` → **Ready** → `query` → **Running** → completion or
//! `cancel` → **Ready**. Every outgoing event is stamped with a monotonic
//! per-session sequence number and retained in a bounded replay log, so a
//! resuming client with `last_seq` receives exactly the events it missed.

mod query;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use stream_event::{EventEnvelope, EventLog, GatewayEvent, SeqState};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::context::ContextBuilder;
use crate::error::{ErrorKind, Kinded};
use crate::llm::{LlmClient, PermissionDecision};
use crate::protocol::{ClientMessage, SessionConfig};
use crate::store::session::NewSession;
use crate::store::{Store, StoreError};

/// Hard connection errors. Everything recoverable is reported to the client
/// as an `error` event instead.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("connection closed")]
    Closed,
}

impl Kinded for GatewayError {
    fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Store(e) => e.kind(),
            GatewayError::Closed => ErrorKind::Internal,
        }
    }
}

/// Sink for post-completion stimuli consumed by external subsystems
/// (curiosity detection, the emotion buffer). Failures are the sink's
/// problem; the gateway fires and forgets.
pub trait StimulusSink: Send + Sync {
    fn interaction(&self, session_id: &str, prompt: &str, response: &str);
    fn curiosity(&self, session_id: &str, response: &str);
}

/// Default sink: drops stimuli.
pub struct NullStimulus;

impl StimulusSink for NullStimulus {
    fn interaction(&self, _session_id: &str, _prompt: &str, _response: &str) {}
    fn curiosity(&self, _session_id: &str, _response: &str) {}
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Unresolved permission requests deny-with-interrupt after this.
    pub permission_timeout: Duration,
    /// Cache entries older than this are rebuilt before a query.
    pub context_max_age_minutes: i64,
    pub default_context_depth: usize,
    pub default_max_context_tokens: usize,
    /// Model name recorded on embedding tasks the gateway enqueues.
    pub embed_model: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            permission_timeout: Duration::from_secs(300),
            context_max_age_minutes: 30,
            default_context_depth: 10,
            default_max_context_tokens: 2000,
            embed_model: "text-embedding-3-small".into(),
        }
    }
}

/// Per-session stream state: sequence counter, replay log, and the active
/// configuration. Survives the connection that created it, so a client can
/// resume after a network loss.
pub(crate) struct SessionChannel {
    pub session_id: String,
    pub config: SessionConfig,
    pub seq: SeqState,
    pub log: EventLog,
}

/// Stamps, logs, and delivers events in sequence order.
#[derive(Clone)]
pub(crate) struct Emitter {
    channel: Arc<Mutex<SessionChannel>>,
    out: mpsc::Sender<EventEnvelope>,
}

impl Emitter {
    pub async fn emit(&self, event: GatewayEvent) {
        // Held across the send so delivery order matches seq order.
        let mut channel = self.channel.lock().await;
        let envelope = channel.seq.stamp(event);
        channel.log.push(envelope.clone());
        let _ = self.out.send(envelope).await;
    }
}

/// Shared gateway registry; one per daemon.
pub struct Gateway {
    pub(crate) store: Store,
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) context: Arc<ContextBuilder>,
    pub(crate) stimulus: Arc<dyn StimulusSink>,
    pub(crate) config: GatewayConfig,
    channels: DashMap<String, Arc<Mutex<SessionChannel>>>,
}

impl Gateway {
    pub fn new(
        store: Store,
        llm: Arc<dyn LlmClient>,
        context: Arc<ContextBuilder>,
        stimulus: Arc<dyn StimulusSink>,
        config: GatewayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            llm,
            context,
            stimulus,
            config,
            channels: DashMap::new(),
        })
    }

    /// Opens one connection; `out` receives every stamped event for the
    /// client in order.
    pub fn open_connection(self: &Arc<Self>, out: mpsc::Sender<EventEnvelope>) -> Connection {
        Connection {
            gateway: self.clone(),
            out,
            channel: None,
            fallback_seq: Arc::new(Mutex::new(SeqState::new())),
            active: Arc::new(AtomicBool::new(false)),
            query_cancel: None,
            pending: Arc::new(DashMap::new()),
        }
    }

    fn channel_for(
        &self,
        session_id: &str,
        config: SessionConfig,
        resume_after: u64,
    ) -> Arc<Mutex<SessionChannel>> {
        self.channels
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SessionChannel {
                    session_id: session_id.to_string(),
                    config,
                    seq: SeqState::resume_after(resume_after),
                    log: EventLog::new(),
                }))
            })
            .clone()
    }
}

/// One client connection. Owned by the transport task (the WebSocket read
/// loop); not shared.
pub struct Connection {
    gateway: Arc<Gateway>,
    out: mpsc::Sender<EventEnvelope>,
    channel: Option<Arc<Mutex<SessionChannel>>>,
    /// Stamps pre-session events (pong, early errors); never replayed.
    fallback_seq: Arc<Mutex<SeqState>>,
    active: Arc<AtomicBool>,
    query_cancel: Option<CancellationToken>,
    pending: Arc<DashMap<String, oneshot::Sender<PermissionDecision>>>,
}

impl Connection {
    /// Handles one client message. Recoverable problems become `error`
    /// events; the only hard error is a closed outbound channel.
    pub async fn handle(&mut self, msg: ClientMessage) -> Result<(), GatewayError> {
        match msg {
            ClientMessage::Ping => self.send_unlogged(GatewayEvent::Pong {}).await,
            ClientMessage::NewSession { config } => self.new_session(config).await,
            ClientMessage::ResumeSession {
                session_id,
                last_seq,
            } => self.resume_session(session_id, last_seq).await,
            ClientMessage::UpdateConfig { config } => self.update_config(config).await,
            ClientMessage::Query { prompt } => self.query(prompt).await,
            ClientMessage::Cancel => {
                if let Some(cancel) = &self.query_cancel {
                    cancel.cancel();
                }
                Ok(())
            }
            ClientMessage::PermissionResponse {
                request_id,
                allowed,
                deny_message,
            } => self.permission_response(request_id, allowed, deny_message).await,
        }
    }

    /// Whether a query is currently streaming.
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn new_session(&mut self, config: SessionConfig) -> Result<(), GatewayError> {
        if self.channel.is_some() {
            return self
                .send_error("session already established on this connection", true)
                .await;
        }
        let session_id = self
            .gateway
            .store
            .create_session(NewSession {
                working_dir: config.working_dir.clone(),
                personalities: config.personality.iter().cloned().collect(),
                mcp_servers: config.mcp_servers.clone(),
                medium: config.medium.clone().unwrap_or_else(|| "agent".into()),
                user_id: config.user_id.clone(),
                ..Default::default()
            })
            .await?;
        let channel = self.gateway.channel_for(&session_id, config, 0);
        self.channel = Some(channel);
        self.emit(GatewayEvent::SessionReady { session_id }).await
    }

    async fn resume_session(
        &mut self,
        session_id: String,
        last_seq: Option<u64>,
    ) -> Result<(), GatewayError> {
        let Some(_session) = self.gateway.store.session(&session_id).await? else {
            return self.send_error("unknown session", false).await;
        };
        let last_seq = last_seq.unwrap_or(0);
        let channel =
            self.gateway
                .channel_for(&session_id, SessionConfig::default(), last_seq);
        {
            let guard = channel.lock().await;
            for envelope in guard.log.replay_after(last_seq) {
                self.out
                    .send(envelope)
                    .await
                    .map_err(|_| GatewayError::Closed)?;
            }
        }
        self.channel = Some(channel);
        Ok(())
    }

    async fn update_config(&mut self, config: SessionConfig) -> Result<(), GatewayError> {
        let Some(channel) = &self.channel else {
            return self.send_error("no session to configure", true).await;
        };
        if self.is_running() {
            return self
                .send_error("cannot update config while a query is running", true)
                .await;
        }
        let session_id = {
            let mut guard = channel.lock().await;
            guard.config = config;
            guard.session_id.clone()
        };
        self.emit(GatewayEvent::SessionReady { session_id }).await
    }

    async fn query(&mut self, prompt: String) -> Result<(), GatewayError> {
        let Some(channel) = self.channel.clone() else {
            return self.send_error("no session; send new_session first", true).await;
        };
        if self.active.swap(true, Ordering::SeqCst) {
            return self
                .send_error("a query is already running on this connection", true)
                .await;
        }
        let cancel = CancellationToken::new();
        self.query_cancel = Some(cancel.clone());
        let emitter = Emitter {
            channel,
            out: self.out.clone(),
        };
        let gateway = self.gateway.clone();
        let pending = self.pending.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            query::run_query(gateway, emitter, pending, prompt, cancel).await;
            active.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn permission_response(
        &mut self,
        request_id: String,
        allowed: bool,
        deny_message: Option<String>,
    ) -> Result<(), GatewayError> {
        match self.pending.remove(&request_id) {
            Some((_, reply)) => {
                let decision = if allowed {
                    PermissionDecision::allow()
                } else {
                    PermissionDecision::deny(deny_message, false)
                };
                let _ = reply.send(decision);
                Ok(())
            }
            None => {
                self.send_error("unknown or expired permission request", true)
                    .await
            }
        }
    }

    /// Reports a transport-level problem (e.g. unparseable client JSON) as a
    /// recoverable `error` event.
    pub async fn report_error(&self, message: &str) -> Result<(), GatewayError> {
        self.send_error(message, true).await
    }

    async fn emit(&self, event: GatewayEvent) -> Result<(), GatewayError> {
        match &self.channel {
            Some(channel) => {
                Emitter {
                    channel: channel.clone(),
                    out: self.out.clone(),
                }
                .emit(event)
                .await;
                Ok(())
            }
            None => self.send_unlogged(event).await,
        }
    }

    /// Stamps with the connection-scoped counter; used before a session
    /// exists (and for pong, which has no replay value).
    async fn send_unlogged(&self, event: GatewayEvent) -> Result<(), GatewayError> {
        let envelope = self.fallback_seq.lock().await.stamp(event);
        self.out
            .send(envelope)
            .await
            .map_err(|_| GatewayError::Closed)
    }

    async fn send_error(&self, message: &str, recoverable: bool) -> Result<(), GatewayError> {
        self.emit(GatewayEvent::Error {
            message: message.to_string(),
            recoverable,
        })
        .await
    }
}

#[cfg(test)]
mod tests;
