//! Websocket transport: one [`Connection`] per socket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tracing::{info, warn};
use twice_core::connection::Connection;
use twice_core::session::{ChannelClient, ClientHandle};

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(websocket_handler))
        .with_state(state)
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (client, mut outbound) = ChannelClient::new();
    let client_id = client.id();
    info!(client = %client_id, "client connected");

    // Forward frames queued by sessions to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut conn = Connection::new(
        Arc::new(client),
        state.registry.clone(),
        Arc::clone(&state.reviews),
    );

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => conn.handle_text(text.as_str()).await,
                    Some(Ok(Message::Close(frame))) => {
                        info!(client = %client_id, ?frame, "client closed connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(client = %client_id, error = %e, "websocket error");
                        break;
                    }
                    None => break,
                }
            }
            _ = &mut send_task => break,
        }
    }

    conn.close().await;
    send_task.abort();
    info!(client = %client_id, "client disconnected");
}
