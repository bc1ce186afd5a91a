//! REST swarm control surface, so external CLIs and MCP tools can drive the
//! orchestrator without multiplexing over the RPC socket.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use hearth::swarm::dag;
use hearth::{ErrorKind, Kinded, SwarmError, SwarmSpec};

use crate::AppState;

type Reply = (StatusCode, Json<Value>);

fn error_reply(e: SwarmError) -> Reply {
    let status = match e.kind() {
        ErrorKind::Validation | ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "error": e.to_string(), "kind": e.kind().as_str() })),
    )
}

fn ok(value: Value) -> Reply {
    (StatusCode::OK, Json(value))
}

fn store_reply(e: hearth::StoreError) -> Reply {
    error_reply(SwarmError::Store(e))
}

pub(crate) async fn create(State(state): State<AppState>, Json(spec): Json<SwarmSpec>) -> Reply {
    match state.daemon.orchestrator.create(spec).await {
        Ok(swarm_id) => ok(json!({ "swarm_id": swarm_id, "status": "created" })),
        Err(e) => error_reply(e),
    }
}

pub(crate) async fn start(State(state): State<AppState>, Path(id): Path<String>) -> Reply {
    match state.daemon.orchestrator.start(&id).await {
        Ok(()) => ok(json!({ "swarm_id": id, "status": "started" })),
        Err(e) => error_reply(e),
    }
}

pub(crate) async fn show(State(state): State<AppState>, Path(id): Path<String>) -> Reply {
    match state.daemon.orchestrator.swarm_view(&id).await {
        Ok((swarm, agents)) => ok(json!({ "swarm": swarm, "agents": agents })),
        Err(e) => error_reply(e),
    }
}

#[derive(Deserialize)]
pub(crate) struct DagQuery {
    #[serde(default)]
    format: Option<String>,
}

pub(crate) async fn dag(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DagQuery>,
) -> Reply {
    match state.daemon.orchestrator.swarm_view(&id).await {
        Ok((swarm, agents)) => match query.format.as_deref() {
            Some("dot") => ok(json!({ "format": "dot", "dag": dag::render_dot(&swarm, &agents) })),
            _ => ok(dag::render_json(&swarm, &agents)),
        },
        Err(e) => error_reply(e),
    }
}

pub(crate) async fn agent(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Reply {
    match state.daemon.store.swarm_agent_by_name(&id, &name).await {
        Ok(Some(agent)) => ok(json!({ "agent": agent })),
        Ok(None) => error_reply(SwarmError::NotFound("agent")),
        Err(e) => store_reply(e),
    }
}

#[derive(Deserialize)]
pub(crate) struct WaitBody {
    #[serde(default = "default_wait")]
    timeout_seconds: u64,
}

fn default_wait() -> u64 {
    300
}

impl Default for WaitBody {
    fn default() -> Self {
        Self {
            timeout_seconds: default_wait(),
        }
    }
}

pub(crate) async fn wait(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<WaitBody>>,
) -> Reply {
    let Json(body) = body.unwrap_or_default();
    match state
        .daemon
        .orchestrator
        .wait(&id, Duration::from_secs(body.timeout_seconds))
        .await
    {
        Ok(status) => ok(json!({ "swarm_id": id, "status": status.as_str() })),
        Err(e) => error_reply(e),
    }
}

pub(crate) async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> Reply {
    match state.daemon.orchestrator.cancel(&id).await {
        Ok(()) => ok(json!({ "swarm_id": id, "status": "cancelling" })),
        Err(e) => error_reply(e),
    }
}

pub(crate) async fn merge(State(state): State<AppState>, Path(id): Path<String>) -> Reply {
    match state.daemon.orchestrator.merge(&id).await {
        Ok(merged) => ok(json!({ "swarm_id": id, "merged": true, "output": merged })),
        Err(e) => error_reply(e),
    }
}

pub(crate) async fn personalities(State(state): State<AppState>) -> Reply {
    match state.daemon.store.known_personalities().await {
        Ok(list) => ok(json!({ "personalities": list })),
        Err(e) => store_reply(e),
    }
}

pub(crate) async fn plugins(State(state): State<AppState>) -> Reply {
    match state.daemon.store.known_plugins().await {
        Ok(list) => ok(json!({ "plugins": list })),
        Err(e) => store_reply(e),
    }
}

// --- scratchpad -----------------------------------------------------------

pub(crate) async fn scratchpad_list(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Reply {
    match state.daemon.store.scratchpad_list(&id).await {
        Ok(entries) => ok(json!({ "entries": entries })),
        Err(e) => store_reply(e),
    }
}

pub(crate) async fn scratchpad_get(
    State(state): State<AppState>,
    Path((id, key)): Path<(String, String)>,
) -> Reply {
    match state.daemon.store.scratchpad_get(&id, &key).await {
        Ok(Some(entry)) => ok(serde_json::to_value(entry).unwrap_or(Value::Null)),
        Ok(None) => error_reply(SwarmError::NotFound("scratchpad key")),
        Err(e) => store_reply(e),
    }
}

#[derive(Deserialize)]
pub(crate) struct ScratchpadPut {
    value: Value,
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    agent_name: String,
}

pub(crate) async fn scratchpad_put(
    State(state): State<AppState>,
    Path((id, key)): Path<(String, String)>,
    Json(body): Json<ScratchpadPut>,
) -> Reply {
    match state
        .daemon
        .store
        .scratchpad_set(&id, &key, body.value, &body.agent_id, &body.agent_name)
        .await
    {
        Ok(()) => ok(json!({ "status": "stored", "key": key })),
        Err(e) => store_reply(e),
    }
}

pub(crate) async fn scratchpad_delete(
    State(state): State<AppState>,
    Path((id, key)): Path<(String, String)>,
) -> Reply {
    match state.daemon.store.scratchpad_delete(&id, &key).await {
        Ok(true) => ok(json!({ "status": "deleted", "key": key })),
        Ok(false) => error_reply(SwarmError::NotFound("scratchpad key")),
        Err(e) => store_reply(e),
    }
}
