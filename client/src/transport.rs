//! The live socket.
//!
//! Sends are serialised by the writer lock: the packet id is stamped from the message
//! counter and the counter advanced only while the lock is held, so the heartbeat task and
//! the caller can never interleave ids. Receives hold the reader lock for at most the
//! configured timeout.
//!
//! The ack counter is only advanced here, by an inbound `/meta/connect` packet that carries
//! `ext.ack`. Outbound heartbeats read it and never modify it.

use crate::audit::{Direction, PacketLog};
use crate::config::ClientConfig;
use crate::messages::MessageFactory;
use crate::session::SessionContext;
use crate::{Error, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use quizwire_types::{channel, Packet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One successfully received frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Packet(Packet),
    /// The frame decoded to an empty array. Callers treat it as a no-op.
    Empty,
}

pub struct Transport {
    session: Arc<SessionContext>,
    open: AtomicBool,
    writer: Mutex<Option<SplitSink<Socket, Message>>>,
    reader: Mutex<Option<SplitStream<Socket>>>,
    heartbeat: std::sync::Mutex<Option<JoinHandle<()>>>,
    heartbeat_interval: Duration,
    receive_timeout: Duration,
    packet_log: Option<PacketLog>,
}

impl Transport {
    pub fn new(session: Arc<SessionContext>, config: &ClientConfig) -> Self {
        Self {
            session,
            open: AtomicBool::new(false),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            heartbeat: std::sync::Mutex::new(None),
            heartbeat_interval: config.heartbeat_interval,
            receive_timeout: config.receive_timeout,
            packet_log: config.packet_log.as_deref().map(PacketLog::start),
        }
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Open the socket and start the heartbeat. Failures are reported, never retried.
    pub async fn connect(self: &Arc<Self>, url: &str) -> Result<()> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|source| Error::Connection {
                url: url.to_string(),
                source,
            })?;
        let (sink, stream) = socket.split();
        *self.writer.lock().await = Some(sink);
        *self.reader.lock().await = Some(stream);
        self.open.store(true, Ordering::SeqCst);

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::downgrade(self),
            self.heartbeat_interval,
        ));
        let previous = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(heartbeat);
        if let Some(previous) = previous {
            previous.abort();
        }

        info!(url, "socket connected");
        Ok(())
    }

    pub async fn send(&self, mut packet: Packet) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(Error::NotConnected)?;

        packet.id = self.session.message_counter().to_string();
        let frame = packet.to_frame()?;
        trace!(%frame, "sending frame");
        sink.send(Message::Text(frame)).await?;
        self.session.advance_message_counter();
        drop(writer);

        debug!(channel = %packet.channel, id = %packet.id, "sent packet");
        self.record(Direction::Sent, &packet);
        Ok(())
    }

    /// Wait up to the receive timeout for one frame.
    ///
    /// `None` covers timeouts, closed sockets and undecodable frames alike. A closed socket
    /// also marks the transport closed, which is what ends the caller's receive loop.
    pub async fn receive(&self) -> Option<Inbound> {
        let mut reader = self.reader.lock().await;
        let stream = reader.as_mut()?;
        let next = tokio::time::timeout(self.receive_timeout, stream.next()).await;
        drop(reader);

        let message = match next {
            Err(_) => return None,
            Ok(None) => {
                self.mark_closed("socket stream ended");
                return None;
            }
            Ok(Some(Err(
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
            ))) => {
                self.mark_closed("socket closed");
                return None;
            }
            Ok(Some(Err(err))) => {
                warn!(?err, "socket receive failed");
                return None;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(frame) => self.decode(&frame),
            Message::Close(frame) => {
                debug!(?frame, "close frame received");
                self.mark_closed("server closed the socket");
                None
            }
            other => {
                trace!(?other, "ignoring non-text frame");
                None
            }
        }
    }

    fn decode(&self, frame: &str) -> Option<Inbound> {
        trace!(frame, "received frame");
        let packets = match Packet::parse_frame(frame) {
            Ok(packets) => packets,
            Err(err) => {
                warn!(?err, "undecodable frame");
                return None;
            }
        };
        let Some(packet) = packets.into_iter().next() else {
            return Some(Inbound::Empty);
        };

        if packet.is_channel(channel::CONNECT) {
            if let Some(ack) = packet.ack() {
                self.session.observe_ack(ack);
                debug!(received = ack, next = self.session.ack(), "ack advanced");
            }
        }
        debug!(channel = %packet.channel, id = %packet.id, "received packet");
        self.record(Direction::Received, &packet);
        Some(Inbound::Packet(packet))
    }

    fn mark_closed(&self, reason: &'static str) {
        if self.open.swap(false, Ordering::SeqCst) {
            info!(reason, "transport closed");
        }
    }

    fn record(&self, direction: Direction, packet: &Packet) {
        if let Some(log) = &self.packet_log {
            log.record(direction, packet);
        }
    }

    /// Stop the heartbeat, then close the socket. Safe to call more than once.
    pub async fn disconnect(&self) {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        let heartbeat = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
            let _ = heartbeat.await;
        }

        if let Some(mut sink) = self.writer.lock().await.take() {
            if let Err(err) = sink.close().await {
                debug!(?err, "socket close failed");
            }
        }
        self.reader.lock().await.take();

        if was_open {
            info!("transport disconnected");
        }
    }

    #[cfg(test)]
    pub(crate) fn into_packet_log(mut self) -> Option<PacketLog> {
        self.packet_log.take()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let heartbeat = self
            .heartbeat
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }
    }
}

/// Periodic `/meta/connect` echoing the current ack. Skipped until a client id is assigned.
async fn heartbeat_loop(transport: Weak<Transport>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(transport) = transport.upgrade() else {
            break;
        };
        if !transport.is_open() {
            break;
        }
        if transport.session.client_id().is_none() {
            continue;
        }

        let packet = MessageFactory::new(&transport.session).heartbeat();
        let ack = packet.ack();
        if let Err(err) = transport.send(packet).await {
            warn!(?err, "heartbeat send failed; stopping heartbeat");
            break;
        }
        debug!(?ack, "sent heartbeat");
    }
}
