use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{read_pump, write_pump, Hub};
use crate::bus::Publisher;

/// Largest client message accepted.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

pub fn router<P: Publisher + 'static>(hub: Arc<Hub<P>>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler::<P>))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(hub)
}

/// Serve the hub's HTTP surface until `cancel` fires.
pub async fn serve<P: Publisher + 'static>(
    listener: TcpListener,
    hub: Arc<Hub<P>>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Hub listening");
    }

    axum::serve(listener, router(hub))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn ws_handler<P: Publisher + 'static>(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub<P>>>,
) -> Response {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .max_frame_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| serve_client(socket, hub))
}

async fn serve_client<P: Publisher + 'static>(socket: WebSocket, hub: Arc<Hub<P>>) {
    let (client, outbound) = hub.register_client().await;
    debug!(client = %client, "Client connected");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, outbound));

    read_pump(stream, &hub, client).await;

    if let Err(e) = writer.await {
        debug!(client = %client, error = %e, "Writer task failed");
    }
    debug!(client = %client, "Client disconnected");
}
