//! Axum app: state, router, and route wiring.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use hearth::Daemon;

#[derive(Clone)]
pub struct AppState {
    pub daemon: Arc<Daemon>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/rpc", post(crate::rpc::handle))
        .route("/agent/ws", get(crate::ws::upgrade))
        .route("/swarm/create", post(crate::swarm_routes::create))
        .route("/swarm/personalities", get(crate::swarm_routes::personalities))
        .route("/swarm/plugins", get(crate::swarm_routes::plugins))
        .route("/swarm/{id}", get(crate::swarm_routes::show))
        .route("/swarm/{id}/start", post(crate::swarm_routes::start))
        .route("/swarm/{id}/dag", get(crate::swarm_routes::dag))
        .route("/swarm/{id}/agent/{name}", get(crate::swarm_routes::agent))
        .route("/swarm/{id}/wait", post(crate::swarm_routes::wait))
        .route("/swarm/{id}/cancel", post(crate::swarm_routes::cancel))
        .route("/swarm/{id}/merge", post(crate::swarm_routes::merge))
        .route(
            "/swarm/{id}/scratchpad",
            get(crate::swarm_routes::scratchpad_list),
        )
        .route(
            "/swarm/{id}/scratchpad/{key}",
            get(crate::swarm_routes::scratchpad_get)
                .put(crate::swarm_routes::scratchpad_put)
                .delete(crate::swarm_routes::scratchpad_delete),
        )
        .with_state(state)
}
