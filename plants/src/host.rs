use anyhow::Context;
use tracing::{debug, info, warn};

use home_node_common::{
    associate,
    host::{data_dir, load_runtime_config, FileFirmwareSink, RumqttBroker, SimulatedLink},
    ClientIdGenerator, ControlLoop, NodeHardware, NodeKind, OtaListener, OtaService, Output,
    PlantsEngine, RetryPolicy, RuntimeConfig, SystemClock,
};

/// Desktop stand-in for the irrigation board. Pin writes are logged and the
/// moisture probes wander slowly around a per-channel baseline.
struct SimulatedBoard {
    selected: usize,
    samples: u64,
}

impl SimulatedBoard {
    fn new() -> Self {
        Self {
            selected: 0,
            samples: 0,
        }
    }
}

impl NodeHardware for SimulatedBoard {
    fn set_output(&mut self, output: Output, on: bool) -> anyhow::Result<()> {
        info!(output = output.as_str(), on, "pin write");
        Ok(())
    }

    fn select_channel(&mut self, select: [bool; 3]) -> anyhow::Result<()> {
        self.selected = select
            .iter()
            .enumerate()
            .filter(|(_, level)| **level)
            .map(|(bit, _)| 1 << bit)
            .sum();
        debug!(channel = self.selected, ?select, "mux select");
        Ok(())
    }

    fn read_analog(&mut self) -> anyhow::Result<i32> {
        self.samples = self.samples.wrapping_add(1);
        let baseline = 520 + 40 * self.selected as i32;
        let drift = (self.samples % 9) as i32 * 3 - 12;
        Ok(baseline + drift)
    }
}

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = load_runtime_config(NodeKind::Plants).unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        let mut runtime = RuntimeConfig::for_node(NodeKind::Plants);
        runtime.sanitize();
        runtime
    });

    info!(
        "plants node: mqtt=`{}:{}`, channels={}, thresholds={}..={}",
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
        runtime.plants.enabled_channels,
        runtime.plants.moisture_min,
        runtime.plants.moisture_max,
    );

    let mut clock = SystemClock;
    let association = associate(&mut SimulatedLink::default(), &mut clock, &runtime.network)
        .context("wifi startup failed")?;

    let ota = OtaService::new(
        OtaListener::start(&runtime.ota),
        FileFirmwareSink::new(data_dir(), &runtime.ota.hostname),
    );

    let mut node = ControlLoop::new(
        PlantsEngine::new(runtime.plants.clone()),
        RumqttBroker::new(&runtime),
        SimulatedBoard::new(),
        clock,
        ota,
        ClientIdGenerator::new(runtime.session.client_id_prefix.clone(), association.seed),
        RetryPolicy::from_config(&runtime.session),
    );

    node.run().context("mqtt session abandoned")
}
