use crate::{
    config::PlantsConfig,
    control_loop::NodeBehavior,
    topics::{
        TOPIC_PLANTS_AUTO_SET, TOPIC_PLANTS_AUTO_STATUS, TOPIC_PLANTS_VALVE_SET,
        TOPIC_PLANTS_VALVE_STATUS,
    },
    types::{
        ChannelReading, Dispatch, InboundMessage, MuxChannel, NodeAction, NodeKind, Output,
        Publish, MUX_CHANNELS,
    },
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlantsState {
    pub valve_open: bool,
    pub auto_mode: bool,
}

/// Only the first byte of a command payload is significant; an empty
/// payload reads as off.
pub fn payload_flag(payload: &[u8]) -> bool {
    payload.first() == Some(&b'1')
}

/// Applies one inbound command to `state`.
pub fn dispatch(state: PlantsState, topic: &str, payload: &[u8]) -> (PlantsState, Dispatch) {
    let on = payload_flag(payload);

    match topic {
        TOPIC_PLANTS_VALVE_SET => {
            let next = PlantsState {
                valve_open: on,
                ..state
            };
            let actions = vec![
                NodeAction::SetOutput {
                    output: Output::Valve,
                    on,
                },
                NodeAction::SetOutput {
                    output: Output::StatusLed,
                    on,
                },
                NodeAction::Publish(Publish::flag(TOPIC_PLANTS_VALVE_STATUS, on)),
            ];
            (next, Dispatch::handled(actions))
        }
        TOPIC_PLANTS_AUTO_SET => {
            let next = PlantsState {
                auto_mode: on,
                ..state
            };
            let actions = vec![NodeAction::Publish(Publish::flag(
                TOPIC_PLANTS_AUTO_STATUS,
                on,
            ))];
            (next, Dispatch::handled(actions))
        }
        _ => (state, Dispatch::unrecognized()),
    }
}

/// Integer mean, truncating toward zero. `None` when nothing was read.
pub fn mean(values: &[i32]) -> Option<i32> {
    if values.is_empty() {
        return None;
    }
    let sum: i64 = values.iter().map(|value| i64::from(*value)).sum();
    Some((sum / values.len() as i64) as i32)
}

/// Valve command requested by the moisture thresholds, published to the
/// valve-set topic rather than applied directly so it takes the same path
/// as a remote command.
pub fn threshold_command(config: &PlantsConfig, mean: i32) -> Option<Publish> {
    if mean < config.moisture_min {
        Some(Publish::flag(TOPIC_PLANTS_VALVE_SET, true))
    } else if mean > config.moisture_max {
        Some(Publish::flag(TOPIC_PLANTS_VALVE_SET, false))
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct PlantsEngine {
    config: PlantsConfig,
    state: PlantsState,
    readings: Vec<ChannelReading>,
    failsafe_armed: bool,
}

impl PlantsEngine {
    pub fn new(mut config: PlantsConfig) -> Self {
        config.sanitize();
        Self {
            config,
            state: PlantsState::default(),
            readings: Vec::new(),
            failsafe_armed: false,
        }
    }

    pub fn config(&self) -> &PlantsConfig {
        &self.config
    }

    pub fn state(&self) -> PlantsState {
        self.state
    }

    /// Readings of the most recent sensor pass.
    pub fn readings(&self) -> &[ChannelReading] {
        &self.readings
    }

    pub fn is_failsafe_armed(&self) -> bool {
        self.failsafe_armed
    }
}

impl NodeBehavior for PlantsEngine {
    fn kind(&self) -> NodeKind {
        NodeKind::Plants
    }

    fn subscriptions(&self) -> Vec<&'static str> {
        vec![TOPIC_PLANTS_VALVE_SET, TOPIC_PLANTS_AUTO_SET]
    }

    fn channels(&self) -> &[MuxChannel] {
        &MUX_CHANNELS[..usize::from(self.config.enabled_channels)]
    }

    fn sample_interval_ms(&self) -> u64 {
        self.config.sample_interval_ms
    }

    fn handle_message(&mut self, message: &InboundMessage) -> Dispatch {
        let (next, dispatch) = dispatch(self.state, &message.topic, &message.payload);
        self.state = next;
        dispatch
    }

    fn on_connected(&mut self) -> Vec<NodeAction> {
        if !self.failsafe_armed {
            return Vec::new();
        }
        self.failsafe_armed = false;
        vec![NodeAction::Publish(Publish::flag(
            TOPIC_PLANTS_VALVE_SET,
            false,
        ))]
    }

    fn on_connect_failed(&mut self, _attempt: u32) -> Vec<NodeAction> {
        // Nothing can be published while the broker is down; the valve-off
        // goes out once the session is back.
        self.failsafe_armed = true;
        Vec::new()
    }

    fn sensor_pass(&mut self, readings: &[ChannelReading]) -> Vec<NodeAction> {
        self.readings = readings.to_vec();

        let values: Vec<i32> = readings
            .iter()
            .map(|reading| self.config.calibration.apply(reading.raw))
            .collect();

        let mut actions: Vec<NodeAction> = readings
            .iter()
            .zip(&values)
            .map(|(reading, value)| {
                NodeAction::Publish(Publish::new(reading.channel.topic, value.to_string()))
            })
            .collect();

        if self.state.auto_mode {
            if let Some(command) = mean(&values).and_then(|m| threshold_command(&self.config, m)) {
                actions.push(NodeAction::Publish(command));
            }
        }

        actions
    }
}
