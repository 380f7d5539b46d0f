use anyhow::Context;
use tracing::{info, warn};

use home_node_common::{
    associate,
    host::{data_dir, load_runtime_config, FileFirmwareSink, RumqttBroker, SimulatedLink},
    BedroomEngine, ClientIdGenerator, ControlLoop, NodeHardware, NodeKind, OtaListener,
    OtaService, Output, RetryPolicy, RuntimeConfig, SystemClock,
};

/// Desktop stand-in for the bedroom board; infrared commands are only logged
/// by the control loop.
struct SimulatedBoard;

impl NodeHardware for SimulatedBoard {
    fn set_output(&mut self, output: Output, on: bool) -> anyhow::Result<()> {
        info!(output = output.as_str(), on, "pin write");
        Ok(())
    }
}

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = load_runtime_config(NodeKind::Bedroom).unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        let mut runtime = RuntimeConfig::for_node(NodeKind::Bedroom);
        runtime.sanitize();
        runtime
    });

    info!(
        "bedroom node: mqtt=`{}:{}`, ir carrier {}kHz",
        runtime.network.mqtt_host, runtime.network.mqtt_port, runtime.bedroom.ir.carrier_khz,
    );

    let mut clock = SystemClock;
    let association = associate(&mut SimulatedLink::default(), &mut clock, &runtime.network)
        .context("wifi startup failed")?;

    let ota = OtaService::new(
        OtaListener::start(&runtime.ota),
        FileFirmwareSink::new(data_dir(), &runtime.ota.hostname),
    );

    let mut node = ControlLoop::new(
        BedroomEngine::new(runtime.bedroom.clone()),
        RumqttBroker::new(&runtime),
        SimulatedBoard,
        clock,
        ota,
        ClientIdGenerator::new(runtime.session.client_id_prefix.clone(), association.seed),
        RetryPolicy::from_config(&runtime.session),
    );

    node.run().context("mqtt session abandoned")
}
