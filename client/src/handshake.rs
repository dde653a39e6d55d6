//! The fixed exchange that takes a fresh socket to an active, logged-in player.
//!
//! Each step sends, then polls the transport a bounded number of times for the matching
//! reply, discarding unrelated packets. The server dictates the order, so this is a straight
//! line rather than a general state machine.

use crate::messages::MessageFactory;
use crate::transport::{Inbound, Transport};
use crate::{Error, Result};
use quizwire_types::{channel, Packet};
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, warn};

const ACTIVE_STATUS: &str = "ACTIVE";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStage {
    Handshake,
    Connect,
    Login,
    Status,
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandshakeStage::Handshake => "handshake",
            HandshakeStage::Connect => "connect",
            HandshakeStage::Login => "login",
            HandshakeStage::Status => "status",
        })
    }
}

/// Identity established by a completed handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub client_id: String,
    pub cid: String,
    /// `data` of the first player-channel packet, when one arrived before the phases ended.
    pub player_data: Option<Value>,
}

/// What a post-login polling phase does with one packet.
enum Step {
    Continue,
    Done,
}

pub struct HandshakeCoordinator<'a> {
    transport: &'a Transport,
    login_polls: usize,
    phase_polls: usize,
}

impl<'a> HandshakeCoordinator<'a> {
    pub fn new(transport: &'a Transport, login_polls: usize, phase_polls: usize) -> Self {
        Self {
            transport,
            login_polls,
            phase_polls,
        }
    }

    fn factory(&self) -> MessageFactory<'_> {
        MessageFactory::new(self.transport.session())
    }

    pub async fn perform(&self) -> Result<Handshake> {
        let session = self.transport.session();
        session.reset_counters();

        // Handshake: the reply assigns the client id.
        self.transport.send(self.factory().handshake_request()).await?;
        let reply = self
            .await_channel(channel::HANDSHAKE, self.login_polls)
            .await
            .filter(Packet::is_successful)
            .ok_or(Error::Handshake {
                stage: HandshakeStage::Handshake,
            })?;
        let client_id = reply
            .client_id
            .filter(|id| !id.is_empty())
            .ok_or(Error::Handshake {
                stage: HandshakeStage::Handshake,
            })?;
        session.set_client_id(client_id.clone());
        info!(client_id = %client_id, "handshake accepted");

        // Initial connect with ack 0; the reply seeds the ack sequence.
        self.transport.send(self.factory().initial_connect()).await?;
        let reply = self
            .await_channel(channel::CONNECT, self.login_polls)
            .await
            .filter(Packet::is_successful)
            .ok_or(Error::Handshake {
                stage: HandshakeStage::Connect,
            })?;
        let ack = reply.ack().unwrap_or(0).saturating_add(1);
        session.set_ack(ack);
        debug!(ack, "ack sequence established");

        self.transport.send(self.factory().connect(ack)).await?;
        self.transport.send(self.factory().login_request()).await?;

        let cid = self.await_cid().await.ok_or(Error::Handshake {
            stage: HandshakeStage::Login,
        })?;
        session.set_cid(cid.clone());
        info!(cid = %cid, "login accepted");

        self.transport.send(self.factory().client_ready()?).await?;

        self.phase("controller", |packet| {
            Ok(if packet.is_channel(channel::CONTROLLER) {
                Step::Done
            } else {
                Step::Continue
            })
        })
        .await?;

        self.phase("status", |packet| {
            if !packet.is_channel(channel::STATUS) {
                return Ok(Step::Continue);
            }
            match packet.status() {
                Some(ACTIVE_STATUS) => {
                    debug!("game is active");
                    Ok(Step::Continue)
                }
                status => {
                    warn!(?status, "game is not active");
                    Err(Error::Handshake {
                        stage: HandshakeStage::Status,
                    })
                }
            }
        })
        .await?;

        let mut player_data = None;
        self.phase("player", |packet| {
            if packet.is_channel(channel::PLAYER) && player_data.is_none() {
                player_data = packet.data.clone();
            }
            Ok(Step::Continue)
        })
        .await?;

        info!(client_id = %client_id, cid = %cid, "handshake complete");
        Ok(Handshake {
            client_id,
            cid,
            player_data,
        })
    }

    /// Poll for a packet on `channel`, discarding others.
    async fn await_channel(&self, channel: &str, polls: usize) -> Option<Packet> {
        for _ in 0..polls {
            match self.transport.receive().await {
                Some(Inbound::Packet(packet)) if packet.is_channel(channel) => {
                    return Some(packet)
                }
                Some(Inbound::Packet(packet)) => {
                    debug!(channel = %packet.channel, "discarding packet during handshake");
                }
                Some(Inbound::Empty) => debug!("empty frame during handshake"),
                None if !self.transport.is_open() => return None,
                None => {}
            }
        }
        None
    }

    /// Poll for the login reply. Interleaved heartbeats advance the ack in the transport.
    async fn await_cid(&self) -> Option<String> {
        for _ in 0..self.login_polls {
            match self.transport.receive().await {
                Some(Inbound::Packet(packet)) => {
                    if let Some(cid) = packet.cid() {
                        return Some(cid);
                    }
                    debug!(channel = %packet.channel, "waiting for login reply");
                }
                Some(Inbound::Empty) => {}
                None if !self.transport.is_open() => return None,
                None => {}
            }
        }
        None
    }

    /// One bounded post-login phase. A heartbeat ends the phase early, as does `on_packet`
    /// returning `Done`, and only an early end is acknowledged. Exhausting the budget is
    /// not an error.
    async fn phase<F>(&self, name: &'static str, mut on_packet: F) -> Result<()>
    where
        F: FnMut(&Packet) -> Result<Step>,
    {
        for _ in 0..self.phase_polls {
            let packet = match self.transport.receive().await {
                Some(Inbound::Packet(packet)) => packet,
                Some(Inbound::Empty) => continue,
                None if !self.transport.is_open() => return Err(Error::NotConnected),
                None => continue,
            };
            let done = packet.is_channel(channel::CONNECT)
                || matches!(on_packet(&packet)?, Step::Done);
            if done {
                debug!(phase = name, channel = %packet.channel, "handshake phase complete");
                self.transport.send(self.factory().acknowledgement()).await?;
                return Ok(());
            }
        }
        debug!(phase = name, "handshake phase budget exhausted");
        Ok(())
    }
}
