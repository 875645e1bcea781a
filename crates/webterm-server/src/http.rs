//! HTTP front end: the bootstrap page and the WebSocket message connection.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::{Html, Response};
use axum::routing::get;
use futures_util::{SinkExt as _, StreamExt as _};
use tower_http::services::ServeFile;
use tower_http::trace::TraceLayer;
use webterm_protocol::ClientMessage;

use crate::router::ServerHandle;

const BUILTIN_INDEX: &str = include_str!("../static/index.html");

#[derive(Clone)]
struct AppState {
    server: ServerHandle,
}

/// Routes: `/` serves `index` (or the built-in page), `/ws` upgrades to a
/// message connection.
pub fn router(server: ServerHandle, index: Option<std::path::PathBuf>) -> axum::Router {
    let app = axum::Router::new().route(webterm_protocol::WS_PATH, get(websocket_handler));
    let app = match index {
        Some(path) => app.route_service("/", ServeFile::new(path)),
        None => app.route("/", get(builtin_index)),
    };
    app.with_state(AppState { server })
        .layer(TraceLayer::new_for_http())
}

async fn builtin_index() -> Html<&'static str> {
    Html(BUILTIN_INDEX)
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.server))
}

/// Pump frames between one WebSocket and its router connection.
async fn handle_socket(socket: WebSocket, server: ServerHandle) {
    let (requests, mut messages) = server.connect().split();
    let id = requests.id();
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Ends once the router drops this connection, for example when the
    // client stops reading and its queue fills up.
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(connection = %id, "failed to encode message: {e}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    loop {
        let frame = tokio::select! {
            frame = ws_stream.next() => frame,
            _ = &mut send_task => {
                tracing::debug!(connection = %id, "outbound closed, ending connection");
                break;
            }
        };
        let Some(frame) = frame else {
            break;
        };
        let parsed = match frame {
            Ok(Message::Text(text)) => serde_json::from_str::<ClientMessage>(&text),
            Ok(Message::Binary(data)) => serde_json::from_slice::<ClientMessage>(&data),
            Ok(Message::Close(_)) => break,
            // Ping/Pong handled by axum
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(connection = %id, "websocket error: {e}");
                break;
            }
        };
        match parsed {
            Ok(message) => {
                if requests.send(message).is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!(connection = %id, "invalid message: {e}"),
        }
    }

    // Dropping the request half disconnects the client from the router.
    drop(requests);
    send_task.abort();
}
