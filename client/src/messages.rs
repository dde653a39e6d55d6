//! Builders for every outbound packet.
//!
//! [`MessageFactory`] only reads the [`SessionContext`]. The id it stamps is the current
//! message counter, and [`crate::Transport::send`] re-stamps it under the send lock so ids
//! stay contiguous when the heartbeat and the caller send concurrently.

use crate::{now_ms, session::SessionContext, Result};
use quizwire_types::{
    channel, Ack, ControllerContent, Ext, NameratorContent, Packet, TimeSync,
};
use serde::Serialize;
use serde_json::json;

const CONNECTION_TYPE: &str = "websocket";
const BAYEUX_VERSION: &str = "1.0";
const SUPPORTED_CONNECTION_TYPES: [&str; 3] = ["websocket", "long-polling", "callback-polling"];

pub struct MessageFactory<'a> {
    session: &'a SessionContext,
}

impl<'a> MessageFactory<'a> {
    pub fn new(session: &'a SessionContext) -> Self {
        Self { session }
    }

    fn packet(&self, channel: &str) -> Packet {
        let mut packet = Packet::new(self.session.message_counter().to_string(), channel);
        packet.client_id = self.session.client_id();
        packet
    }

    fn timesync_ext(ack: Ack) -> Ext {
        Ext {
            ack: Some(ack),
            timesync: Some(TimeSync::at(now_ms())),
            ..Ext::default()
        }
    }

    fn connect_packet(&self, ack: i64) -> Packet {
        let mut packet = self.packet(channel::CONNECT);
        packet.connection_type = Some(CONNECTION_TYPE.to_string());
        packet.ext = Some(Self::timesync_ext(Ack::Seq(ack)));
        packet
    }

    /// `/service/controller` message envelope with JSON-encoded `content`.
    fn controller_message(&self, message_id: u32, content: &impl Serialize) -> Result<Packet> {
        let mut packet = self.packet(channel::CONTROLLER);
        packet.data = Some(json!({
            "gameid": self.session.game_pin(),
            "type": "message",
            "host": self.session.host(),
            "id": message_id,
            "content": serde_json::to_string(content)?,
        }));
        packet.ext = Some(Ext::default());
        Ok(packet)
    }

    fn controller(&self, content: ControllerContent) -> Result<Packet> {
        self.controller_message(ControllerContent::MESSAGE_ID, &content)
    }

    pub fn handshake_request(&self) -> Packet {
        let mut packet = Packet::new(
            self.session.message_counter().to_string(),
            channel::HANDSHAKE,
        );
        packet.version = Some(BAYEUX_VERSION.to_string());
        packet.minimum_version = Some(BAYEUX_VERSION.to_string());
        packet.supported_connection_types = Some(
            SUPPORTED_CONNECTION_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect(),
        );
        packet.advice = Some(json!({"timeout": 60000, "interval": 0}));
        packet.ext = Some(Self::timesync_ext(Ack::Enabled(true)));
        packet
    }

    pub fn initial_connect(&self) -> Packet {
        let mut packet = self.connect_packet(0);
        packet.advice = Some(json!({"timeout": 0}));
        packet
    }

    pub fn connect(&self, ack: i64) -> Packet {
        self.connect_packet(ack)
    }

    /// Connect packet echoing the current ack. Never advances it.
    pub fn acknowledgement(&self) -> Packet {
        self.connect_packet(self.session.ack())
    }

    pub fn heartbeat(&self) -> Packet {
        self.acknowledgement()
    }

    pub fn login_request(&self) -> Packet {
        let mut packet = self.packet(channel::CONTROLLER);
        packet.data = Some(json!({
            "type": "login",
            "gameid": self.session.game_pin(),
            "host": self.session.host(),
            "name": self.session.player_name(),
            "content": "{}",
        }));
        packet.ext = Some(Ext::default());
        packet
    }

    pub fn client_ready(&self) -> Result<Packet> {
        self.controller_message(
            NameratorContent::MESSAGE_ID,
            &NameratorContent {
                using_namerator: false,
                new_name: None,
            },
        )
    }

    pub fn classic_answer(&self, question_index: u32, choice: u32) -> Result<Packet> {
        self.controller(ControllerContent::Quiz {
            choice,
            question_index,
        })
    }

    pub fn multiple_select_answer(&self, question_index: u32, choices: Vec<u32>) -> Result<Packet> {
        self.controller(ControllerContent::MultipleSelectQuiz {
            choice: choices,
            question_index,
        })
    }

    pub fn slider_answer(&self, question_index: u32, value: f64) -> Result<Packet> {
        self.controller(ControllerContent::Slider {
            choice: value,
            question_index,
        })
    }

    pub fn open_ended_answer(&self, question_index: u32, text: impl Into<String>) -> Result<Packet> {
        self.controller(ControllerContent::OpenEnded {
            text: text.into(),
            question_index,
        })
    }

    pub fn jumble_answer(&self, question_index: u32, order: Vec<u32>) -> Result<Packet> {
        self.controller(ControllerContent::Jumble {
            choice: order,
            question_index,
        })
    }

    pub fn join_team(&self, team_name: impl Into<String>) -> Result<Packet> {
        self.controller(ControllerContent::TeamAccept {
            team_name: team_name.into(),
        })
    }

    pub fn leave_team(&self) -> Result<Packet> {
        self.controller(ControllerContent::TeamLeave)
    }

    pub fn reaction(&self, reaction: impl Into<String>) -> Result<Packet> {
        self.controller(ControllerContent::Reaction {
            reaction: reaction.into(),
        })
    }

    pub fn nickname_change(&self, new_name: impl Into<String>) -> Result<Packet> {
        self.controller_message(
            NameratorContent::MESSAGE_ID,
            &NameratorContent {
                using_namerator: true,
                new_name: Some(new_name.into()),
            },
        )
    }

    pub fn disconnect(&self) -> Packet {
        self.packet(channel::DISCONNECT)
    }
}
