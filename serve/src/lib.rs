//! RPC surface for the hearth daemon.
//!
//! One axum app serves three surfaces: JSON-RPC 2.0 on `POST /rpc`, the
//! streaming gateway WebSocket on `/agent/ws`, and the REST swarm control
//! routes under `/swarm`. Production binds a Unix domain socket (mode 0660)
//! in the data directory; tests bind a loopback TCP listener.

mod app;
mod rpc;
mod swarm_routes;
mod ws;

pub use app::{router, AppState};

use std::path::Path;
use std::sync::Arc;

use hearth::Daemon;
use tokio_util::sync::CancellationToken;

/// Serves on a Unix domain socket until `shutdown` fires. A stale socket
/// file from a previous run is removed before binding; the fresh socket is
/// restricted to user and group (0660).
pub async fn run_unix(
    daemon: Arc<Daemon>,
    socket_path: &Path,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = tokio::net::UnixListener::bind(socket_path)?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))?;
    }
    tracing::info!(path = %socket_path.display(), "rpc socket bound");

    let app = router(AppState { daemon });
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Serves on an already-bound TCP listener (tests and loopback debugging).
pub async fn run_tcp(
    daemon: Arc<Daemon>,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(AppState { daemon });
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
