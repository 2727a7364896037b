//! HTTP surface: live subscriber WebSocket, health and status
//!
//! Each WebSocket connection gets an outbox drained by its own writer task;
//! the outbox is what the hub delivers to, and pings are answered through
//! the same outbox so replies stay in order with broadcasts. When the hub
//! drops a subscriber the session ends and the socket is closed.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use warp::ws::{Message, WebSocket};
use warp::{Filter, Reply};

use crate::forward::ForwardQueue;
use crate::hub::{reply_to, FanoutHub, OutboxSink, SubscriberSink};
use crate::link::LinkState;

/// How long a closing session waits for its writer to flush and send the
/// close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind HTTP server: {0}")]
    Bind(#[from] warp::Error),
}

/// Operational snapshot served at `/status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub clients: usize,
    pub queue_depth: usize,
    pub dropped: u64,
    pub uploaded: u64,
    pub link: LinkState,
}

#[derive(Clone)]
pub struct ServerState {
    pub hub: Arc<FanoutHub>,
    pub queue: Arc<ForwardQueue>,
    pub link: watch::Receiver<LinkState>,
    pub outbox_depth: usize,
    /// Closes open WebSocket sessions when the bridge stops.
    pub shutdown: broadcast::Sender<()>,
}

impl ServerState {
    pub async fn status(&self) -> StatusSnapshot {
        let link = *self.link.borrow();
        StatusSnapshot {
            clients: self.hub.subscriber_count().await,
            queue_depth: self.queue.len(),
            dropped: self.queue.dropped(),
            uploaded: self.queue.uploaded(),
            link,
        }
    }
}

fn with_state(state: ServerState) -> impl Filter<Extract = (ServerState,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

pub fn routes(state: ServerState) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let ws = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_state(state.clone()))
        .map(|ws: warp::ws::Ws, state: ServerState| {
            ws.on_upgrade(move |socket| client_session(socket, state))
        });

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_health);

    let status = warp::path("status")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state))
        .and_then(handle_status);

    ws.or(health).or(status)
}

async fn handle_health(state: ServerState) -> Result<impl Reply, warp::Rejection> {
    let clients = state.hub.subscriber_count().await;
    Ok(warp::reply::json(&json!({"ok": true, "clients": clients})))
}

async fn handle_status(state: ServerState) -> Result<impl Reply, warp::Rejection> {
    Ok(warp::reply::json(&state.status().await))
}

/// Bind `addr` and return the bound address plus the server future, which
/// completes once `signal` fires and open requests have finished.
pub fn bind(
    addr: SocketAddr,
    state: ServerState,
    signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, impl Future<Output = ()> + 'static), ServerError> {
    let (bound, server) = warp::serve(routes(state)).try_bind_with_graceful_shutdown(addr, signal)?;
    log::info!("[http] listening on {}", bound);
    Ok((bound, server))
}

async fn client_session(socket: WebSocket, state: ServerState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (sink, mut outbox) = OutboxSink::new(state.outbox_depth);
    let sink = Arc::new(sink);
    let mut shutdown = state.shutdown.subscribe();

    let mut writer = tokio::spawn(async move {
        while let Some(text) = outbox.recv().await {
            if let Err(e) = ws_tx.send(Message::text(text.to_string())).await {
                log::debug!("[http] websocket write failed: {}", e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let handle = state.hub.attach(Arc::clone(&sink) as Arc<dyn SubscriberSink>).await;

    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            _ = shutdown.recv() => break,
            _ = sink.detached() => {
                log::info!("[http] subscriber dropped by hub, closing socket");
                break;
            }
        };
        match msg {
            Some(Ok(msg)) if msg.is_close() => break,
            Some(Ok(msg)) => {
                let reply = msg.to_str().ok().and_then(reply_to);
                if let Some(reply) = reply {
                    if sink.send(Arc::from(reply)).await.is_err() {
                        break;
                    }
                }
            }
            Some(Err(e)) => {
                log::debug!("[http] websocket read failed: {}", e);
                break;
            }
            None => break,
        }
    }

    state.hub.detach(handle).await;
    // Last sender gone: the writer drains what is queued and closes.
    drop(sink);
    if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::types::Record;
    use serde_json::Value;

    fn state() -> (ServerState, watch::Sender<LinkState>) {
        let (link_tx, link_rx) = watch::channel(LinkState::Disconnected);
        let (shutdown, _) = broadcast::channel(1);
        (
            ServerState {
                hub: FanoutHub::new(Duration::from_secs(2)),
                queue: ForwardQueue::new(QueueConfig::default()),
                link: link_rx,
                outbox_depth: 16,
                shutdown,
            },
            link_tx,
        )
    }

    fn body_json(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_clients() {
        let (state, _link) = state();
        let res = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&routes(state))
            .await;
        assert_eq!(res.status(), 200);
        assert_eq!(body_json(res.body()), json!({"ok": true, "clients": 0}));
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let (state, link) = state();
        state.queue.enqueue(Record::new(1, json!({}))).unwrap();
        state.queue.enqueue(Record::new(2, json!({}))).unwrap();
        link.send(LinkState::Streaming).unwrap();

        let res = warp::test::request()
            .method("GET")
            .path("/status")
            .reply(&routes(state))
            .await;
        assert_eq!(
            body_json(res.body()),
            json!({"clients": 0, "queueDepth": 2, "dropped": 0, "uploaded": 0, "link": "streaming"})
        );
    }

    #[tokio::test]
    async fn test_unknown_path_is_rejected() {
        let (state, _link) = state();
        let res = warp::test::request().path("/nope").reply(&routes(state)).await;
        assert_eq!(res.status(), 404);
    }

    #[tokio::test]
    async fn test_websocket_status_ping_and_records() {
        let (state, _link) = state();
        let hub = Arc::clone(&state.hub);
        let mut client = warp::test::ws()
            .path("/ws")
            .handshake(routes(state))
            .await
            .unwrap();

        let first = client.recv().await.unwrap();
        assert_eq!(
            body_json(first.to_str().unwrap().as_bytes()),
            json!({"type": "status", "clients": 1})
        );

        client.send_text("ping").await;
        assert_eq!(client.recv().await.unwrap().to_str(), Ok("pong"));

        // Anything else is ignored.
        client.send_text("hello").await;
        let record = Record::new(7, json!({"battery": 80}));
        assert_eq!(hub.publish(&record).await, 1);
        let got = client.recv().await.unwrap();
        assert_eq!(body_json(got.to_str().unwrap().as_bytes()), json!({"ts": 7, "data": {"battery": 80}}));
    }

    #[tokio::test]
    async fn test_websocket_close_detaches() {
        let (state, _link) = state();
        let hub = Arc::clone(&state.hub);
        let mut client = warp::test::ws()
            .path("/ws")
            .handshake(routes(state))
            .await
            .unwrap();
        client.recv().await.unwrap();
        assert_eq!(hub.subscriber_count().await, 1);

        client.send(Message::close()).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.subscriber_count().await != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_socket_closed_when_hub_drops_subscriber() {
        let (state, _link) = state();
        let hub = Arc::clone(&state.hub);
        let mut client = warp::test::ws()
            .path("/ws")
            .handshake(routes(state))
            .await
            .unwrap();
        client.recv().await.unwrap();
        assert_eq!(hub.subscriber_count().await, 1);

        hub.detach_all().await;
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client.recv().await {
                    Ok(msg) if msg.is_close() => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "socket stayed open after the hub dropped it");
        assert_eq!(hub.subscriber_count().await, 0);
    }
}
