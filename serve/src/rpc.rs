//! JSON-RPC 2.0 endpoint: parse, dispatch through a flat method table, and
//! map domain errors onto the standard error codes with a `data.kind` string.

use axum::extract::State;
use axum::Json;
use jsonrpc_core::{Error as RpcError, ErrorCode, Failure, Id, Output, Success, Version};
use serde::Deserialize;
use serde_json::{json, Value};

use hearth::queue::TaskType;
use hearth::{CaptureParams, ContextBuildParams, Kinded, SessionId};

use crate::AppState;

/// One JSON-RPC call as received. Parsed manually so malformed ids and
/// params still produce a well-formed error response.
#[derive(Debug, Deserialize)]
struct Call {
    #[serde(default)]
    jsonrpc: Option<String>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    id: Option<Value>,
}

pub(crate) async fn handle(State(state): State<AppState>, body: String) -> Json<Value> {
    let call: Call = match serde_json::from_str(&body) {
        Ok(c) => c,
        Err(e) => {
            return Json(failure(
                Id::Null,
                RpcError {
                    code: ErrorCode::ParseError,
                    message: format!("parse error: {}", e),
                    data: None,
                },
            ))
        }
    };
    let id = match &call.id {
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Id::Num)
            .unwrap_or(Id::Null),
        Some(Value::String(s)) => Id::Str(s.clone()),
        _ => Id::Null,
    };
    if call.jsonrpc.as_deref() != Some("2.0") || call.method.is_none() {
        return Json(failure(
            id,
            RpcError {
                code: ErrorCode::InvalidRequest,
                message: "invalid request".into(),
                data: None,
            },
        ));
    }
    let method = call.method.unwrap_or_default();
    match dispatch(&state, &method, call.params).await {
        Ok(result) => Json(
            serde_json::to_value(Output::Success(Success {
                jsonrpc: Some(Version::V2),
                result,
                id,
            }))
            .unwrap_or(Value::Null),
        ),
        Err(error) => Json(failure(id, error)),
    }
}

fn failure(id: Id, error: RpcError) -> Value {
    serde_json::to_value(Output::Failure(Failure {
        jsonrpc: Some(Version::V2),
        error,
        id,
    }))
    .unwrap_or(Value::Null)
}

fn invalid_params(e: impl std::fmt::Display) -> RpcError {
    RpcError {
        code: ErrorCode::InvalidParams,
        message: format!("invalid params: {}", e),
        data: Some(json!({ "kind": "invalid_request" })),
    }
}

fn serialize<T: serde::Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError {
        code: ErrorCode::InternalError,
        message: e.to_string(),
        data: None,
    })
}

fn store_error(e: hearth::StoreError) -> RpcError {
    RpcError {
        code: ErrorCode::InternalError,
        message: e.to_string(),
        data: Some(json!({ "kind": e.kind().as_str() })),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(invalid_params)
}

async fn dispatch(state: &AppState, method: &str, params: Value) -> Result<Value, RpcError> {
    let daemon = &state.daemon;
    match method {
        "conversation.capture" => {
            let p: CaptureParams = parse_params(params)?;
            daemon
                .capture_conversation(p)
                .await
                .map_err(store_error)?;
            Ok(json!({ "status": "stored" }))
        }
        "session.end" => {
            #[derive(Deserialize)]
            struct P {
                session_id: SessionId,
                #[serde(default)]
                exit_reason: Option<String>,
                #[serde(default)]
                #[allow(dead_code)]
                duration_seconds: Option<f64>,
            }
            let p: P = parse_params(params)?;
            let result = daemon
                .end_session(&p.session_id.as_string(), p.exit_reason)
                .await
                .map_err(store_error)?;
            serialize(result)
        }
        "status.get" => {
            let snapshot = daemon.status().await.map_err(store_error)?;
            serialize(snapshot)
        }
        "queue.add" => {
            #[derive(Deserialize)]
            struct P {
                task_type: String,
                model_name: String,
                content: String,
                #[serde(default)]
                metadata: Value,
                #[serde(default)]
                priority: i64,
                #[serde(default)]
                session_id: Option<SessionId>,
            }
            let p: P = parse_params(params)?;
            let task_type = TaskType::parse(&p.task_type)
                .ok_or_else(|| invalid_params(format!("unknown task_type: {}", p.task_type)))?;
            let task_id = daemon
                .queue_add(
                    task_type,
                    &p.model_name,
                    &p.content,
                    p.metadata,
                    p.priority,
                    p.session_id.map(|s| s.as_string()),
                )
                .await
                .map_err(store_error)?;
            Ok(json!({ "task_id": task_id, "status": "queued" }))
        }
        "queue.status" => {
            let stats = daemon.store.queue_stats().await.map_err(store_error)?;
            serialize(stats)
        }
        "context.build" => {
            let p: ContextBuildParams = parse_params(params)?;
            let task_id = daemon
                .enqueue_context_build(p)
                .await
                .map_err(store_error)?;
            Ok(json!({ "task_id": task_id, "status": "queued" }))
        }
        "context.get" => {
            #[derive(Deserialize)]
            struct P {
                session_id: SessionId,
                #[serde(default = "default_max_age")]
                max_age_minutes: i64,
            }
            fn default_max_age() -> i64 {
                30
            }
            let p: P = parse_params(params)?;
            let context = daemon
                .get_context(&p.session_id.as_string(), p.max_age_minutes)
                .await
                .map_err(store_error)?;
            Ok(match context {
                Some(context) => json!({ "found": true, "context": context }),
                None => json!({ "found": false }),
            })
        }
        "mode.session.previous" => {
            #[derive(Deserialize)]
            struct P {
                mode: String,
                project_path: String,
                #[serde(default)]
                user_id: Option<String>,
            }
            let p: P = parse_params(params)?;
            let previous = daemon
                .mode
                .previous_session(&p.mode, &p.project_path, p.user_id)
                .await
                .map_err(store_error)?;
            serialize(previous)
        }
        "mode.wellness.extract" => {
            #[derive(Deserialize)]
            struct P {
                mode: String,
                conversation: String,
                session_id: SessionId,
            }
            let p: P = parse_params(params)?;
            let record = daemon
                .mode
                .extract_wellness(&p.mode, &p.conversation, &p.session_id.as_string())
                .await;
            serialize(record)
        }
        _ => Err(RpcError {
            code: ErrorCode::MethodNotFound,
            message: format!("method not found: {}", method),
            data: None,
        }),
    }
}
