//! WebSocket endpoint for the streaming gateway: one connection per socket,
//! a writer task draining the gateway's event channel, and a read loop
//! dispatching client messages.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use hearth::ClientMessage;
use stream_event::EventEnvelope;

use crate::AppState;

pub(crate) async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (event_tx, mut event_rx) = mpsc::channel::<EventEnvelope>(128);

    let writer = tokio::spawn(async move {
        while let Some(envelope) = event_rx.recv().await {
            let json = match serde_json::to_string(&envelope) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("event serialization failed: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut connection = state.daemon.gateway.open_connection(event_tx);
    while let Some(result) = stream.next().await {
        let message = match result {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("ws read error (client closed?): {}", e);
                break;
            }
        };
        let text = match message {
            Message::Text(t) => t.to_string(),
            Message::Binary(b) => String::from_utf8_lossy(&b).into_owned(),
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(msg) => {
                if connection.handle(msg).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                if connection
                    .report_error(&format!("unparseable message: {}", e))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    // Dropping the connection drops the event sender; the writer drains and
    // exits on its own.
    drop(connection);
    let _ = writer.await;
}
