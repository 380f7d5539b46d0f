use log::{debug, info, warn};

use crate::{
    clock::{Clock, PassTimer},
    ota::{FirmwareSink, OtaService},
    session::{Broker, ClientIdGenerator, RetryPolicy, Session, SessionError},
    types::{
        ChannelReading, Disposition, Dispatch, InboundMessage, MuxChannel, NodeAction, NodeKind,
        Output,
    },
};

const IDLE_SLEEP_MS: u64 = 10;

/// Node-specific behaviour plugged into the shared control loop.
pub trait NodeBehavior {
    fn kind(&self) -> NodeKind;

    /// Topics (re)subscribed after every successful connect.
    fn subscriptions(&self) -> Vec<&'static str>;

    /// Multiplexer channels read on each sensor pass, in order.
    fn channels(&self) -> &[MuxChannel];

    fn sample_interval_ms(&self) -> u64;

    fn handle_message(&mut self, message: &InboundMessage) -> Dispatch;

    fn on_connected(&mut self) -> Vec<NodeAction> {
        Vec::new()
    }

    /// Called once per failed connect attempt; `attempt` restarts at 1 for
    /// every outage.
    fn on_connect_failed(&mut self, _attempt: u32) -> Vec<NodeAction> {
        Vec::new()
    }

    fn sensor_pass(&mut self, readings: &[ChannelReading]) -> Vec<NodeAction>;
}

pub trait NodeHardware {
    fn set_output(&mut self, output: Output, on: bool) -> anyhow::Result<()>;

    fn select_channel(&mut self, _select: [bool; 3]) -> anyhow::Result<()> {
        anyhow::bail!("board has no analog multiplexer")
    }

    fn read_analog(&mut self) -> anyhow::Result<i32> {
        anyhow::bail!("board has no analog input")
    }
}

pub struct ControlLoop<N, B, H, C, S> {
    node: N,
    broker: B,
    hardware: H,
    clock: C,
    ota: OtaService<S>,
    session: Session,
    retry: RetryPolicy,
    timer: PassTimer,
    idle_ms: u64,
}

impl<N, B, H, C, S> ControlLoop<N, B, H, C, S>
where
    N: NodeBehavior,
    B: Broker,
    H: NodeHardware,
    C: Clock,
    S: FirmwareSink,
{
    pub fn new(
        node: N,
        broker: B,
        hardware: H,
        clock: C,
        ota: OtaService<S>,
        ids: ClientIdGenerator,
        retry: RetryPolicy,
    ) -> Self {
        let timer = PassTimer::new(node.sample_interval_ms());
        Self {
            node,
            broker,
            hardware,
            clock,
            ota,
            session: Session::new(ids),
            retry,
            timer,
            idle_ms: IDLE_SLEEP_MS,
        }
    }

    pub fn node(&self) -> &N {
        &self.node
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn ota(&self) -> &OtaService<S> {
        &self.ota
    }

    /// Runs iterations until the retry policy gives up, which the default
    /// unbounded policy never does.
    pub fn run(&mut self) -> Result<(), SessionError> {
        info!(
            "{} node running, sensor pass every {} ms",
            self.node.kind().as_str(),
            self.timer.interval_ms()
        );

        loop {
            self.service_once()?;
            self.clock.sleep_ms(self.idle_ms);
        }
    }

    /// One loop iteration: OTA, session, inbound messages, then the sensor
    /// pass if its interval has elapsed.
    pub fn service_once(&mut self) -> Result<(), SessionError> {
        match self.ota.service() {
            Some(Ok(bytes)) => debug!("firmware push of {bytes} bytes applied"),
            Some(Err(err)) => debug!("firmware push rejected ({}), continuing", err.code()),
            None => {}
        }
        self.ensure_session()?;
        self.drain_messages();
        self.sensor_pass_if_due();
        Ok(())
    }

    fn ensure_session(&mut self) -> Result<(), SessionError> {
        if self.broker.is_connected() {
            return Ok(());
        }

        self.session.link_lost();

        loop {
            let client_id = self.session.begin_attempt();
            info!("Attempting MQTT connection as `{client_id}`...");

            match self.broker.connect(&client_id) {
                Ok(()) => {
                    self.session.attempt_succeeded();
                    info!("connected as `{client_id}`");

                    for topic in self.node.subscriptions() {
                        if let Err(err) = self.broker.subscribe(topic) {
                            warn!("failed to subscribe to {topic}: {err}");
                        }
                    }

                    let actions = self.node.on_connected();
                    self.execute(actions);
                    return Ok(());
                }
                Err(err) => {
                    let attempt = self.session.attempt_failed();
                    warn!(
                        "failed, {err}, try again in {} seconds",
                        self.retry.interval_ms / 1_000
                    );

                    let actions = self.node.on_connect_failed(attempt);
                    self.execute(actions);

                    if !self.retry.allows_another(attempt) {
                        return Err(SessionError::RetriesExhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }

                    self.clock.sleep_ms(self.retry.interval_ms);
                }
            }
        }
    }

    fn drain_messages(&mut self) {
        for message in self.broker.poll() {
            info!(
                "Message arrived [{}] {}",
                message.topic,
                message.payload_lossy()
            );

            let dispatch = self.node.handle_message(&message);
            match dispatch.disposition {
                Disposition::Handled => {}
                Disposition::Unimplemented => {
                    info!("no action defined for [{}]", message.topic)
                }
                Disposition::Unrecognized => {
                    info!("ignoring unrecognized topic [{}]", message.topic)
                }
            }

            self.execute(dispatch.actions);
        }
    }

    fn sensor_pass_if_due(&mut self) {
        if !self.timer.due(self.clock.now_ms()) {
            return;
        }

        let channels = self.node.channels().to_vec();
        let mut readings = Vec::with_capacity(channels.len());

        for channel in channels {
            let raw = self
                .hardware
                .select_channel(channel.select)
                .and_then(|_| self.hardware.read_analog());

            match raw {
                Ok(raw) => {
                    debug!("channel {} raw={raw}", channel.index);
                    readings.push(ChannelReading { channel, raw });
                }
                Err(err) => warn!("failed to read channel {}: {err:#}", channel.index),
            }
        }

        let actions = self.node.sensor_pass(&readings);
        self.execute(actions);
    }

    fn execute(&mut self, actions: Vec<NodeAction>) {
        for action in actions {
            match action {
                NodeAction::Publish(publish) => {
                    info!(
                        "publish [{}] {}",
                        publish.topic,
                        String::from_utf8_lossy(&publish.payload)
                    );
                    if let Err(err) = self.broker.publish(&publish.topic, &publish.payload) {
                        warn!("failed to publish to {}: {err}", publish.topic);
                    }
                }
                NodeAction::SetOutput { output, on } => {
                    if let Err(err) = self.hardware.set_output(output, on) {
                        warn!("failed to drive {}: {err:#}", output.as_str());
                    }
                }
            }
        }
    }
}
