//! Bayeux envelope exchanged over the socket.
//!
//! Every frame on the wire is a JSON array. Outbound frames always carry exactly one
//! [`Packet`]; inbound frames are read as a list and only the first element is used.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Channels this protocol uses. Anything else is logged and ignored.
pub mod channel {
    pub const HANDSHAKE: &str = "/meta/handshake";
    pub const CONNECT: &str = "/meta/connect";
    pub const DISCONNECT: &str = "/meta/disconnect";
    pub const CONTROLLER: &str = "/service/controller";
    pub const STATUS: &str = "/service/status";
    pub const PLAYER: &str = "/service/player";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Ext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The `ext` block: ack sequencing plus time synchronisation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<Ack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timesync: Option<TimeSync>,
    /// Server timestamp attached to game-channel packets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timetrack: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The handshake advertises ack support with a flag; every later exchange carries a sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Ack {
    Enabled(bool),
    Seq(i64),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSync {
    #[serde(default)]
    pub tc: i64,
    #[serde(default)]
    pub l: i64,
    #[serde(default)]
    pub o: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TimeSync {
    /// Client-side timesync stamp with zero latency and offset.
    pub fn at(tc: i64) -> Self {
        Self {
            tc,
            l: 0,
            o: 0,
            extra: Map::new(),
        }
    }
}

impl Packet {
    pub fn new(id: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            channel: channel.into(),
            ..Self::default()
        }
    }

    /// Encode as a one-element JSON array, the only frame shape the server accepts.
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(std::slice::from_ref(self))
    }

    /// Decode an inbound frame. An empty array is valid and yields no packets.
    pub fn parse_frame(frame: &str) -> serde_json::Result<Vec<Packet>> {
        serde_json::from_str(frame)
    }

    pub fn is_channel(&self, channel: &str) -> bool {
        self.channel == channel
    }

    pub fn is_successful(&self) -> bool {
        self.successful == Some(true)
    }

    /// Sequence value of `ext.ack`, if the packet carries one.
    pub fn ack(&self) -> Option<i64> {
        match self.ext.as_ref()?.ack? {
            Ack::Seq(seq) => Some(seq),
            Ack::Enabled(_) => None,
        }
    }

    pub fn timetrack(&self) -> Option<i64> {
        self.ext.as_ref()?.timetrack
    }

    pub fn data_field(&self, key: &str) -> Option<&Value> {
        self.data.as_ref()?.get(key)
    }

    /// Inner message type (`data.id`) on the game channels.
    pub fn inner_type(&self) -> Option<i64> {
        self.data_field("id")?.as_i64()
    }

    /// Connection id assigned at login. Numeric ids are rendered as strings.
    pub fn cid(&self) -> Option<String> {
        match self.data_field("cid")? {
            Value::String(cid) if !cid.is_empty() => Some(cid.clone()),
            Value::Number(cid) => Some(cid.to_string()),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<&str> {
        self.data_field("status")?.as_str()
    }

    /// The JSON-encoded inner `content` string.
    pub fn content(&self) -> Option<&str> {
        self.data_field("content")?.as_str()
    }
}
