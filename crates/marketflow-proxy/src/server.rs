//! axum server for the browser WebSocket endpoint.
//!
//! Each accepted connection gets two tasks: a writer that drains the
//! client's bounded outbound queue (the only place that touches the send
//! half), and the reader loop below, which handles the subscribe protocol,
//! the inactivity deadline and server-driven heartbeat pings.

use crate::error::ProxyError;
use crate::protocol::{
    ClientMessage, Envelope, ErrorPayload, SubscribedPayload, WelcomePayload,
};
use crate::proxy::{Outbound, WebSocketProxy};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Build the proxy router.
pub fn router(proxy: Arc<WebSocketProxy>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(proxy)
}

/// Bind and serve until the process ends.
pub async fn run_server(proxy: Arc<WebSocketProxy>) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], proxy.config().port));
    info!(port = proxy.config().port, "Starting WebSocket proxy");
    let listener = TcpListener::bind(addr).await?;
    serve(listener, proxy).await
}

/// Serve on an existing listener (used by tests for ephemeral ports).
pub async fn serve(listener: TcpListener, proxy: Arc<WebSocketProxy>) -> std::io::Result<()> {
    axum::serve(listener, router(proxy)).await
}

async fn ws_handler(State(proxy): State<Arc<WebSocketProxy>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, proxy))
}

async fn handle_connection(socket: WebSocket, proxy: Arc<WebSocketProxy>) {
    let Some((client_id, outbound_rx, kill)) = proxy.try_register() else {
        // Over capacity: accept the upgrade only to close with 1013.
        if let Some((code, reason)) = ProxyError::CapacityExceeded.close_frame() {
            let (mut sender, _receiver) = socket.split();
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
        }
        return;
    };

    let (sender, receiver) = socket.split();
    let writer = tokio::spawn(writer_task(
        sender,
        outbound_rx,
        kill.clone(),
        Arc::clone(&proxy),
        client_id,
    ));

    proxy.send_control(
        client_id,
        Envelope::new(
            "welcome",
            WelcomePayload {
                client_id: client_id.to_string(),
                server_time: Utc::now().timestamp_millis(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        ),
    );

    read_loop(receiver, Arc::clone(&proxy), client_id, kill.clone()).await;

    kill.cancel();
    let _ = writer.await;
    proxy.unregister(client_id);
}

/// Drain the outbound queue into the socket. The single writer per
/// connection; nothing else touches the send half.
async fn writer_task(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    kill: CancellationToken,
    proxy: Arc<WebSocketProxy>,
    client_id: Uuid,
) {
    loop {
        tokio::select! {
            _ = kill.cancelled() => {
                let frame = proxy.close_reason(client_id).map(|(code, reason)| {
                    CloseFrame {
                        code,
                        reason: reason.into(),
                    }
                });
                let _ = sender.send(Message::Close(frame)).await;
                return;
            }
            outbound = outbound_rx.recv() => {
                let result = match outbound {
                    Some(Outbound::Text(text)) => sender.send(Message::Text(text.into())).await,
                    Some(Outbound::Ping) => sender.send(Message::Ping(Vec::new().into())).await,
                    None => return,
                };
                if result.is_err() {
                    debug!(client_id = %client_id, "Write failed, client gone");
                    kill.cancel();
                    return;
                }
            }
        }
    }
}

/// Handle inbound frames plus the heartbeat and inactivity deadlines.
async fn read_loop(
    mut receiver: SplitStream<WebSocket>,
    proxy: Arc<WebSocketProxy>,
    client_id: Uuid,
    kill: CancellationToken,
) {
    let heartbeat = Duration::from_millis(proxy.config().heartbeat_interval_ms);
    let idle_timeout = Duration::from_millis(proxy.config().connection_timeout_ms);

    let mut ping_timer = tokio::time::interval(heartbeat);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_timer.tick().await; // consume the immediate first tick

    let mut last_frame = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = kill.cancelled() => return,

            _ = tokio::time::sleep_until(last_frame + idle_timeout) => {
                info!(client_id = %client_id, "Inactivity deadline expired");
                proxy.request_close(client_id, 1000, "connection_timeout");
                return;
            }

            _ = ping_timer.tick() => {
                if awaiting_pong {
                    let error = ProxyError::HeartbeatLost;
                    warn!(client_id = %client_id, %error, "Closing client");
                    if let Some((code, reason)) = error.close_frame() {
                        proxy.request_close(client_id, code, reason);
                    }
                    return;
                }
                proxy.send_ping(client_id);
                awaiting_pong = true;
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_frame = Instant::now();
                        handle_client_text(&proxy, client_id, &text);
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_frame = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // axum answers pings automatically.
                        last_frame = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(client_id = %client_id, "Client closed");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client_id = %client_id, error = %e, "Receive error");
                        return;
                    }
                }
            }
        }
    }
}

/// Dispatch one parsed client message. Entirely non-blocking: replies go
/// through the client's outbound queue.
fn handle_client_text(proxy: &Arc<WebSocketProxy>, client_id: Uuid, text: &str) {
    match ClientMessage::parse(text) {
        Ok(ClientMessage::Ping) => {
            proxy.send_control(client_id, Envelope::new("pong", serde_json::Value::Null));
        }
        Ok(ClientMessage::Subscribe(request)) => {
            let filter_id = proxy.subscribe(client_id, &request);
            proxy.send_control(
                client_id,
                Envelope::new(
                    "subscribed",
                    SubscribedPayload {
                        filter_id: filter_id.to_string(),
                        filter: request,
                    },
                ),
            );
        }
        Ok(ClientMessage::Unsubscribe { filter_id }) => {
            let parsed = filter_id.as_deref().map(Uuid::parse_str);
            match parsed {
                Some(Err(_)) => {
                    send_error(proxy, client_id, "invalid filterId");
                }
                Some(Ok(id)) => {
                    let removed = proxy.unsubscribe(client_id, Some(id));
                    if removed.is_empty() {
                        send_error(proxy, client_id, "unknown filterId");
                    } else {
                        proxy.send_control(
                            client_id,
                            Envelope::new("unsubscribed", json!({ "filterId": id.to_string() })),
                        );
                    }
                }
                None => {
                    proxy.unsubscribe(client_id, None);
                    proxy.send_control(client_id, Envelope::new("unsubscribed", json!({})));
                }
            }
        }
        Ok(ClientMessage::GetStats) => {
            let stats = proxy.stats();
            let payload = json!({
                "connection": {
                    "clientId": client_id.to_string(),
                    "connectedAt": proxy
                        .connected_at(client_id)
                        .map(|t| t.timestamp_millis()),
                },
                "subscription": {
                    "filters": proxy.filter_count(client_id),
                },
                "health": {
                    "healthy": true,
                },
                "pool": {
                    "clients": stats.clients,
                    "maxClients": stats.max_clients,
                    "forwarded": stats.forwarded,
                    "slowConsumerDrops": stats.slow_consumer_drops,
                },
            });
            proxy.send_control(client_id, Envelope::new("stats", payload));
        }
        Err(e) => {
            debug!(client_id = %client_id, error = %e, "Bad client message");
            send_error(proxy, client_id, &e.to_string());
        }
    }
}

fn send_error(proxy: &Arc<WebSocketProxy>, client_id: Uuid, message: &str) {
    proxy.send_control(
        client_id,
        Envelope::new(
            "error",
            ErrorPayload {
                message: message.to_string(),
            },
        ),
    );
}
