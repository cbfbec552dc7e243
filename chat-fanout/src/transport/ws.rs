//! Raw socket transport: WebSocket text frames relayed as-is.
//!
//! Whatever text a client sends is published under the sender name
//! `ws-<connection id>`. WebSocket peers receive only the body of each
//! broadcast, not the sender or the timestamp.

use std::{future::Future, sync::Arc};

use anyhow::Result;
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::{
    hub::{BroadcastHub, Mailbox},
    message::InboundMessage,
};

pub const CHAT_PATH: &str = "/ws/chat";

pub fn router(hub: Arc<BroadcastHub>) -> Router {
    Router::new()
        .route(CHAT_PATH, get(upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

pub async fn serve_until<F>(listener: TcpListener, hub: Arc<BroadcastHub>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(hub))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("websocket listener shut down");
    Ok(())
}

async fn upgrade(ws: WebSocketUpgrade, State(hub): State<Arc<BroadcastHub>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let (sink, mut stream) = socket.split();
    let (peer, mailbox) = hub.attach();
    let sender = format!("ws-{}", peer.id());
    let delivery = tokio::spawn(forward_mailbox(mailbox, sink));

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                peer.publish(InboundMessage::new(sender.clone(), text));
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(bytes)) => {
                debug!(connection = peer.id(), len = bytes.len(), "ignoring binary frame");
            }
            Ok(_) => {}
            Err(err) => {
                // Clients that vanish without a close frame land here.
                debug!(connection = peer.id(), error = ?err, "websocket stream ended");
                break;
            }
        }
    }

    drop(peer);
    delivery.abort();
}

async fn forward_mailbox(mut mailbox: Mailbox, mut sink: SplitSink<WebSocket, Message>) {
    while let Some(message) = mailbox.recv().await {
        if let Err(err) = sink.send(Message::Text(message.message)).await {
            debug!(?err, "failed to deliver message to websocket peer");
            break;
        }
    }
}
