use serde::{Deserialize, Serialize};

use crate::topics::{
    TOPIC_PLANTS_MEASUREMENT0, TOPIC_PLANTS_MEASUREMENT1, TOPIC_PLANTS_MEASUREMENT2,
    TOPIC_PLANTS_MEASUREMENT3,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Plants,
    Bedroom,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plants => "plants",
            Self::Bedroom => "bedroom",
        }
    }

    /// Hostname announced by the OTA listener and used as the client id prefix.
    pub fn hostname(self) -> &'static str {
        match self {
            Self::Plants => "ESPlant",
            Self::Bedroom => "ESPBedroom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Encodes a flag the way the nodes report it on the wire: `"0"` or `"1"`.
    pub fn flag(topic: &str, on: bool) -> Self {
        Self::new(topic, if on { "1" } else { "0" })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    Valve,
    StatusLed,
}

impl Output {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valve => "valve",
            Self::StatusLed => "status-led",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAction {
    Publish(Publish),
    SetOutput { output: Output, on: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handled,
    /// The topic is recognised but the node defines no behaviour for it yet.
    Unimplemented,
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub disposition: Disposition,
    pub actions: Vec<NodeAction>,
}

impl Dispatch {
    pub fn handled(actions: Vec<NodeAction>) -> Self {
        Self {
            disposition: Disposition::Handled,
            actions,
        }
    }

    pub fn unimplemented() -> Self {
        Self {
            disposition: Disposition::Unimplemented,
            actions: Vec::new(),
        }
    }

    pub fn unrecognized() -> Self {
        Self {
            disposition: Disposition::Unrecognized,
            actions: Vec::new(),
        }
    }
}

/// One position of the analog multiplexer: the three select-line levels
/// and the topic its raw reading is published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxChannel {
    pub index: u8,
    pub select: [bool; 3],
    pub topic: &'static str,
}

pub const MUX_CHANNELS: [MuxChannel; 4] = [
    MuxChannel {
        index: 0,
        select: [false, false, false],
        topic: TOPIC_PLANTS_MEASUREMENT0,
    },
    MuxChannel {
        index: 1,
        select: [true, false, false],
        topic: TOPIC_PLANTS_MEASUREMENT1,
    },
    MuxChannel {
        index: 2,
        select: [false, true, false],
        topic: TOPIC_PLANTS_MEASUREMENT2,
    },
    MuxChannel {
        index: 3,
        select: [true, true, false],
        topic: TOPIC_PLANTS_MEASUREMENT3,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelReading {
    pub channel: MuxChannel,
    pub raw: i32,
}
