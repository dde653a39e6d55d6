//! Scripted CometD server for tests.
//!
//! Serves one websocket at `/cometd/:pin/:token` plus the reservation endpoint. Packets the
//! client sends are queued for [`MockServer::next_packet`], and frames pushed with
//! [`MockServer::push`] are delivered to the client in order.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use quizwire_types::Packet;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

#[derive(Clone)]
pub struct MockReservation {
    pub status: StatusCode,
    pub token: Option<String>,
    pub body: Value,
}

enum Outbound {
    Frame(String),
    Close,
}

struct Shared {
    inbound: mpsc::UnboundedSender<Packet>,
    outbound: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    path: std::sync::Mutex<Option<String>>,
    reservation: std::sync::Mutex<Option<MockReservation>>,
    reserve_requests: std::sync::Mutex<Vec<String>>,
}

pub struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    inbound: Mutex<mpsc::UnboundedReceiver<Packet>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inbound: inbound_tx,
            outbound: Mutex::new(Some(outbound_rx)),
            path: std::sync::Mutex::new(None),
            reservation: std::sync::Mutex::new(None),
            reserve_requests: std::sync::Mutex::new(Vec::new()),
        });

        let router = Router::new()
            .route("/cometd/:pin/:token", get(upgrade))
            .route("/reserve/session/:pin/", get(reserve))
            .with_state(shared.clone());

        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router.into_make_service())
                .await
                .unwrap();
        });

        Self {
            addr,
            shared,
            inbound: Mutex::new(inbound_rx),
            outbound: outbound_tx,
            handle,
        }
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn socket_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn url(&self, pin: &str, token: &str) -> String {
        format!("{}/cometd/{pin}/{token}", self.socket_url())
    }

    pub fn set_reservation(&self, reservation: MockReservation) {
        *self.shared.reservation.lock().unwrap() = Some(reservation);
    }

    /// Path and query of every reservation request, in arrival order.
    pub fn reserve_requests(&self) -> Vec<String> {
        self.shared.reserve_requests.lock().unwrap().clone()
    }

    /// Raw, still percent-encoded path of the socket the client opened.
    pub fn connected_path(&self) -> Option<String> {
        self.shared.path.lock().unwrap().clone()
    }

    /// Queue one packet as a single-element frame.
    pub fn push(&self, packet: Value) {
        self.push_raw(&Value::Array(vec![packet]).to_string());
    }

    pub fn push_raw(&self, frame: &str) {
        self.outbound
            .send(Outbound::Frame(frame.to_string()))
            .unwrap();
    }

    /// Send a close frame and drop the socket.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    pub async fn next_packet(&self) -> Packet {
        let mut inbound = self.inbound.lock().await;
        tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .expect("timed out waiting for a client packet")
            .expect("mock server stopped")
    }

    /// Next packet on `channel`, discarding anything else (heartbeats, acks).
    pub async fn next_on(&self, channel: &str) -> Packet {
        loop {
            let packet = self.next_packet().await;
            if packet.is_channel(channel) {
                return packet;
            }
        }
    }

    pub fn try_next_packet(&self) -> Option<Packet> {
        self.inbound.try_lock().ok()?.try_recv().ok()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    uri: Uri,
    State(shared): State<Arc<Shared>>,
) -> Response {
    *shared.path.lock().unwrap() = Some(uri.path().to_string());
    ws.on_upgrade(move |socket| serve_socket(socket, shared))
}

async fn serve_socket(socket: WebSocket, shared: Arc<Shared>) {
    let Some(mut outbound) = shared.outbound.lock().await.take() else {
        return;
    };
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    for packet in Packet::parse_frame(&text).unwrap_or_default() {
                        let _ = shared.inbound.send(packet);
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            command = outbound.recv() => match command {
                Some(Outbound::Frame(frame)) => {
                    if sink.send(WsMessage::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            },
        }
    }
}

async fn reserve(uri: Uri, State(shared): State<Arc<Shared>>) -> Response {
    shared.reserve_requests.lock().unwrap().push(uri.to_string());
    let Some(reservation) = shared.reservation.lock().unwrap().clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mut response = (reservation.status, Json(reservation.body)).into_response();
    if let Some(token) = reservation.token {
        response.headers_mut().insert(
            "x-kahoot-session-token",
            HeaderValue::from_str(&token).unwrap(),
        );
    }
    response
}
