//! HTTP and WebSocket surface.
//!
//! | Route              | Kind      | Payload                                            |
//! |--------------------|-----------|----------------------------------------------------|
//! | `/ws/{source}`     | WebSocket | binary JPEG per broadcast frame                    |
//! | `/ws/detections`   | WebSocket | `{"track_history": ...}` then `{"ts", "boxes"}`    |
//! | `/ws`              | WebSocket | legacy alias of `/ws/detections`                   |
//! | `/ws_upload`       | WebSocket | inbound compressed images, `{"error"}` on failure  |
//! | `/track_history`   | GET       | track store snapshot                               |
//! | `/health`          | GET       | per-source liveness and counters                   |
//!
//! Every connection is its own task. Its only effects on shared state are
//! adding itself to a subscriber registry on connect and removing itself on
//! exit, plus publishing into the upload channel for `/ws_upload`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use crate::codec::decode_image;
use crate::config::HubConfig;
use crate::hub::HubState;
use crate::registry::{Subscriber, SubscriberRegistry};

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    hub: Arc<HubState>,
    send_timeout: Duration,
    queue: usize,
    shutdown: watch::Receiver<()>,
}

impl AppState {
    pub fn new(hub: Arc<HubState>, config: &HubConfig, shutdown: watch::Receiver<()>) -> Self {
        Self {
            hub,
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            queue: config.subscriber_queue,
            shutdown,
        }
    }
}

/// Create the HTTP router
pub fn router(state: AppState) -> Router {
    // the viewer is served from another origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/track_history", get(track_history))
        .route("/ws", get(ws_detections))
        .route("/ws/detections", get(ws_detections))
        .route("/ws/{source}", get(ws_source))
        .route("/ws_upload", get(ws_upload))
        .layer(cors)
        .with_state(state)
}

/// Serve `app` until shutdown is signalled.
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<()>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("[http] listening on http://{}", addr);
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    log::info!("[http] server shut down gracefully");
    Ok(())
}

// ── HTTP handlers ──

/// GET /health
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.health())
}

/// GET /track_history
async fn track_history(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.tracks().snapshot())
}

// ── WebSocket handlers ──

async fn ws_source(
    Path(source): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.hub.source(&source).is_none() {
        return (StatusCode::NOT_FOUND, format!("unknown source '{}'", source)).into_response();
    }
    ws.on_upgrade(move |socket| async move {
        if let Some(channel) = state.hub.source(&source) {
            stream_session(
                socket,
                channel.subscribers(),
                &state,
                None::<fn() -> Option<Message>>,
                Message::Binary,
            )
            .await;
        }
    })
}

async fn ws_detections(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let hub = state.hub.clone();
        // registered before the snapshot is taken so no update falls between them
        let greeting = || match hub.track_history_message() {
            Ok(msg) => Some(Message::Text(msg.into())),
            Err(e) => {
                log::warn!("[ws] failed to serialize track history: {}", e);
                None
            }
        };
        stream_session(socket, hub.detections(), &state, Some(greeting), |text: Arc<str>| {
            Message::Text(text.as_ref().into())
        })
        .await;
    })
}

async fn ws_upload(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if state.hub.upload().is_none() {
        return (StatusCode::NOT_FOUND, "upload is disabled").into_response();
    }
    ws.on_upgrade(move |socket| upload_session(socket, state))
}

/// Await `msg` being written to the socket, giving up after `timeout`.
///
/// Every write a session makes goes through here, control frames included,
/// so a client that stops reading cannot hold its task past shutdown.
async fn send_within<S>(sink: &mut S, msg: Message, timeout: Duration) -> Result<(), String>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    match tokio::time::timeout(timeout, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("send timed out after {:?}", timeout)),
    }
}

/// Register on `registry` and forward everything it delivers until the
/// client leaves, a send fails or times out, the hub drops the subscriber,
/// or shutdown is signalled.
async fn stream_session<T, G>(
    socket: WebSocket,
    registry: &SubscriberRegistry<T>,
    state: &AppState,
    greeting: Option<G>,
    into_message: fn(T) -> Message,
) where
    T: Clone,
    G: FnOnce() -> Option<Message>,
{
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (subscriber, mut queue) = Subscriber::channel(state.queue);
    let id = registry.add(subscriber);
    let channel = registry.channel();
    let mut shutdown = state.shutdown.clone();

    if let Some(msg) = greeting.and_then(|g| g()) {
        if let Err(e) = send_within(&mut ws_tx, msg, state.send_timeout).await {
            log::warn!("[ws:{}] subscriber {}: {}", channel, id, e);
            registry.remove(id);
            return;
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = send_within(&mut ws_tx, Message::Close(None), state.send_timeout).await;
                break;
            }
            item = queue.recv() => {
                let Some(item) = item else {
                    // the hub removed this subscriber
                    break;
                };
                if let Err(e) = send_within(&mut ws_tx, into_message(item), state.send_timeout).await {
                    log::warn!("[ws:{}] subscriber {}: {}", channel, id, e);
                    break;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = send_within(&mut ws_tx, Message::Pong(data), state.send_timeout).await {
                            log::warn!("[ws:{}] subscriber {}: {}", channel, id, e);
                            break;
                        }
                    }
                    Some(Err(_)) => break,
                    _ => {} // client messages are ignored
                }
            }
        }
    }

    registry.remove(id);
    log::debug!("[ws:{}] subscriber {} disconnected", channel, id);
}

/// Receive compressed images and publish every Nth one into the upload
/// source's frame channel.
async fn upload_session(socket: WebSocket, state: AppState) {
    let Some(upload) = state.hub.upload() else {
        return;
    };
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut shutdown = state.shutdown.clone();
    let mut received: u64 = 0;

    log::info!("[upload] client connected");

    loop {
        let msg = tokio::select! {
            _ = shutdown.changed() => {
                let _ = send_within(&mut ws_tx, Message::Close(None), state.send_timeout).await;
                break;
            }
            msg = ws_rx.next() => msg,
        };

        let data: Bytes = match msg {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Ping(data))) => {
                if let Err(e) = send_within(&mut ws_tx, Message::Pong(data), state.send_timeout).await {
                    log::warn!("[upload] {}", e);
                    break;
                }
                continue;
            }
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
            Some(Ok(_)) => continue,
        };

        received += 1;
        if received % u64::from(upload.frame_skip) != 0 {
            continue;
        }

        match decode_image(&data, &upload.source) {
            Ok(frame) => {
                upload.frames.publish(frame);
            }
            Err(e) => {
                log::warn!("[upload] {}", e);
                let reply = serde_json::json!({ "error": e.to_string() }).to_string();
                if send_within(&mut ws_tx, Message::Text(reply.into()), state.send_timeout)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    log::info!("[upload] client disconnected after {} messages", received);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// A socket whose peer never reads: nothing is ever accepted.
    struct Stalled;

    impl Sink<Message> for Stalled {
        type Error = axum::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_control_frames_to_stalled_peer_time_out() {
        let timeout = Duration::from_millis(50);
        for msg in [
            Message::Close(None),
            Message::Pong(Bytes::from_static(b"hb")),
            Message::Binary(Bytes::from_static(&[0xFF, 0xD8])),
        ] {
            let started = std::time::Instant::now();
            let result = tokio::time::timeout(
                Duration::from_secs(2),
                send_within(&mut Stalled, msg, timeout),
            )
            .await
            .expect("send_within ignored its timeout");
            assert!(result.unwrap_err().contains("timed out"));
            assert!(started.elapsed() >= timeout);
        }
    }

    #[tokio::test]
    async fn test_send_to_reading_peer_succeeds() {
        let (tx, mut rx) = futures::channel::mpsc::unbounded::<Message>();
        let mut sink = tx.sink_map_err(axum::Error::new);
        send_within(&mut sink, Message::Close(None), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(matches!(rx.next().await, Some(Message::Close(None))));
    }
}
