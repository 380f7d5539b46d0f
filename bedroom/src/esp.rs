use anyhow::Context;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop, hal::prelude::Peripherals, log::EspLogger,
    nvs::EspDefaultNvsPartition, wifi::EspWifi,
};
use log::{info, warn};

use home_node_common::{
    associate,
    esp::{compiled_runtime_config, mark_running_slot_valid, EspBroker, EspFirmwareSink, EspLink},
    BedroomEngine, ClientIdGenerator, ControlLoop, NodeHardware, NodeKind, OtaListener,
    OtaService, Output, RetryPolicy, SystemClock,
};

use crate::ir::{init_ir_emitter, IrEmitter};

/// The bedroom board only carries the infrared emitter; the climate sensor
/// topics are reserved but nothing is wired to them yet.
struct BedroomBoard {
    _ir: IrEmitter,
}

impl NodeHardware for BedroomBoard {
    fn set_output(&mut self, output: Output, _on: bool) -> anyhow::Result<()> {
        anyhow::bail!("{} is not wired on the bedroom board", output.as_str())
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let runtime = compiled_runtime_config(NodeKind::Bedroom);
    info!(
        "bedroom node: ssid=`{}`, mqtt=`{}:{}`",
        runtime.network.wifi_ssid, runtime.network.mqtt_host, runtime.network.mqtt_port,
    );

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, rmt, .. } = Peripherals::take()?;

    let ir = match init_ir_emitter(rmt, &runtime.bedroom.ir) {
        Ok(emitter) => {
            info!(
                "IR emitter idle on RMT channel{} / GPIO{} @ {}kHz",
                runtime.bedroom.ir.rmt_channel,
                runtime.bedroom.ir.tx_pin,
                emitter.carrier_khz()
            );
            emitter
        }
        Err(err) => {
            warn!("failed to initialize IR emitter, running disabled: {err:#}");
            IrEmitter::disabled(runtime.bedroom.ir.carrier_khz)
        }
    };
    if !ir.is_enabled() {
        warn!("IR commands will be logged only");
    }

    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;
    let mut link = EspLink::new(wifi, &runtime.ota.hostname)?;
    let mut clock = SystemClock;
    let association =
        associate(&mut link, &mut clock, &runtime.network).context("wifi startup failed")?;

    mark_running_slot_valid();

    let sink = EspFirmwareSink::new().context("failed to start OTA writer")?;
    let ota = OtaService::new(OtaListener::start(&runtime.ota), sink);

    let mut node = ControlLoop::new(
        BedroomEngine::new(runtime.bedroom.clone()),
        EspBroker::new(&runtime),
        BedroomBoard { _ir: ir },
        clock,
        ota,
        ClientIdGenerator::new(runtime.session.client_id_prefix.clone(), association.seed),
        RetryPolicy::from_config(&runtime.session),
    );

    let result = node.run().context("mqtt session abandoned");
    drop(link);
    result
}
