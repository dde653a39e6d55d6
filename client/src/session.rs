//! Per-connection session state.
//!
//! One [`SessionContext`] exists per engine instance and is shared (behind an `Arc`) by the
//! transport, the handshake, the game tracker and every block context it hands out. Counters
//! are atomics so the heartbeat task and the receive loop can read them without locking; the
//! message counter is only advanced by [`crate::Transport::send`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Ack value a fresh session starts from, before any exchange overwrites it.
pub const INITIAL_ACK: i64 = 2;

#[derive(Debug)]
pub struct SessionContext {
    game_pin: String,
    player_name: String,
    host: String,
    client_id: Mutex<Option<String>>,
    cid: Mutex<Option<String>>,
    message_counter: AtomicU64,
    ack_counter: AtomicI64,
    score: AtomicI64,
    rank: AtomicI64,
}

impl SessionContext {
    pub fn new(
        game_pin: impl Into<String>,
        player_name: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            game_pin: game_pin.into(),
            player_name: player_name.into(),
            host: host.into(),
            client_id: Mutex::new(None),
            cid: Mutex::new(None),
            message_counter: AtomicU64::new(1),
            ack_counter: AtomicI64::new(INITIAL_ACK),
            score: AtomicI64::new(0),
            rank: AtomicI64::new(0),
        }
    }

    pub fn game_pin(&self) -> &str {
        &self.game_pin
    }

    pub fn player_name(&self) -> &str {
        &self.player_name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_client_id(&self, client_id: impl Into<String>) {
        *self.client_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(client_id.into());
    }

    pub fn cid(&self) -> Option<String> {
        self.cid.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_cid(&self, cid: impl Into<String>) {
        *self.cid.lock().unwrap_or_else(PoisonError::into_inner) = Some(cid.into());
    }

    /// Id the next outbound packet will carry.
    pub fn message_counter(&self) -> u64 {
        self.message_counter.load(Ordering::SeqCst)
    }

    pub(crate) fn advance_message_counter(&self) {
        self.message_counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn ack(&self) -> i64 {
        self.ack_counter.load(Ordering::SeqCst)
    }

    pub(crate) fn set_ack(&self, ack: i64) {
        self.ack_counter.store(ack, Ordering::SeqCst);
    }

    /// Record an ack received from the server; the next ack sent is one past it.
    pub(crate) fn observe_ack(&self, received: i64) {
        self.set_ack(received.saturating_add(1));
    }

    /// Start of a handshake: message ids restart at 1 and the ack sequence at 0.
    pub(crate) fn reset_counters(&self) {
        self.message_counter.store(1, Ordering::SeqCst);
        self.ack_counter.store(0, Ordering::SeqCst);
    }

    pub fn score(&self) -> i64 {
        self.score.load(Ordering::SeqCst)
    }

    pub fn rank(&self) -> i64 {
        self.rank.load(Ordering::SeqCst)
    }

    /// Apply the standing reported by the server. Absent fields leave the current value.
    pub(crate) fn record_standing(&self, total_score: Option<i64>, rank: Option<i64>) {
        if let Some(score) = total_score {
            self.score.store(score, Ordering::SeqCst);
        }
        if let Some(rank) = rank {
            self.rank.store(rank, Ordering::SeqCst);
        }
    }
}
