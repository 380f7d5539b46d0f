use crate::{
    config::BedroomConfig,
    control_loop::NodeBehavior,
    topics::TOPIC_BEDROOM_IR_COMMAND,
    types::{ChannelReading, Dispatch, InboundMessage, MuxChannel, NodeAction, NodeKind},
};

/// A command received on the infrared topic. No payload format is defined
/// yet, so this only keeps the trimmed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrCommand(String);

impl IrCommand {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(payload);
        let text = text.trim();
        if text.is_empty() {
            None
        } else {
            Some(Self(text.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct BedroomEngine {
    config: BedroomConfig,
    last_command: Option<IrCommand>,
}

impl BedroomEngine {
    pub fn new(mut config: BedroomConfig) -> Self {
        config.ir.sanitize();
        Self {
            config,
            last_command: None,
        }
    }

    pub fn config(&self) -> &BedroomConfig {
        &self.config
    }

    pub fn last_command(&self) -> Option<&IrCommand> {
        self.last_command.as_ref()
    }
}

impl NodeBehavior for BedroomEngine {
    fn kind(&self) -> NodeKind {
        NodeKind::Bedroom
    }

    fn subscriptions(&self) -> Vec<&'static str> {
        vec![TOPIC_BEDROOM_IR_COMMAND]
    }

    fn channels(&self) -> &[MuxChannel] {
        &[]
    }

    fn sample_interval_ms(&self) -> u64 {
        self.config.sample_interval_ms
    }

    fn handle_message(&mut self, message: &InboundMessage) -> Dispatch {
        if message.topic != TOPIC_BEDROOM_IR_COMMAND {
            return Dispatch::unrecognized();
        }

        // TODO: map commands to RMT transmissions once the remote's codes are captured.
        self.last_command = IrCommand::parse(&message.payload);
        Dispatch::unimplemented()
    }

    fn sensor_pass(&mut self, _readings: &[ChannelReading]) -> Vec<NodeAction> {
        Vec::new()
    }
}
