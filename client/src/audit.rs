//! Append-only packet audit log.
//!
//! Every packet the transport sends or receives is queued to a writer thread which appends
//! one JSON line per packet. Logging never blocks the socket: when the queue is full the
//! entry is dropped with a warning.

use crate::now_ms;
use quizwire_types::Packet;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{error, warn};

const QUEUE_DEPTH: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Serialize)]
struct Entry<'a> {
    ts: i64,
    direction: Direction,
    channel: &'a str,
    packet: &'a Packet,
}

pub struct PacketLog {
    sender: mpsc::Sender<String>,
    worker: Option<JoinHandle<()>>,
}

impl PacketLog {
    pub fn start(path: &Path) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_DEPTH);
        let path = path.to_path_buf();
        let worker = std::thread::spawn(move || audit_worker(path, receiver));
        Self {
            sender,
            worker: Some(worker),
        }
    }

    pub fn record(&self, direction: Direction, packet: &Packet) {
        let entry = Entry {
            ts: now_ms(),
            direction,
            channel: &packet.channel,
            packet,
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(err) => {
                warn!(?err, "failed to encode audit entry");
                return;
            }
        };
        match self.sender.try_send(line) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(channel = %packet.channel, "packet audit queue full; dropping entry");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("packet audit writer stopped; dropping entry");
            }
        }
    }

    /// Flush queued entries and wait for the writer to exit.
    pub fn close(mut self) {
        let worker = self.worker.take();
        drop(self);
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("packet audit writer panicked");
            }
        }
    }
}

fn audit_worker(path: PathBuf, mut receiver: mpsc::Receiver<String>) {
    let file = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => file,
        Err(err) => {
            error!(path = %path.display(), "packet audit log open failed: {err}");
            return;
        }
    };
    let mut writer = BufWriter::new(file);

    while let Some(line) = receiver.blocking_recv() {
        let written = writeln!(writer, "{line}").and_then(|_| writer.flush());
        if let Err(err) = written {
            error!(path = %path.display(), "packet audit write failed: {err}");
        }
    }
}
