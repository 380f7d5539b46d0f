use anyhow::Context;
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    gpio::{AnyOutputPin, Gpio34, Output as PinOutput, OutputPin, PinDriver},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop, hal::prelude::Peripherals, log::EspLogger,
    nvs::EspDefaultNvsPartition, wifi::EspWifi,
};
use log::info;

use home_node_common::{
    associate,
    esp::{compiled_runtime_config, mark_running_slot_valid, EspBroker, EspFirmwareSink, EspLink},
    ClientIdGenerator, ControlLoop, NodeHardware, NodeKind, OtaListener, OtaService, Output,
    PlantsEngine, RetryPolicy, SystemClock,
};

type OutputPinDriver = PinDriver<'static, AnyOutputPin, PinOutput>;
type MoistureProbe = AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>;

/// Valve relay on GPIO16, status LED on GPIO2 (lit when low), multiplexer
/// select lines on GPIO5/4/18 and the shared probe input on GPIO34.
struct PlantsBoard {
    valve: OutputPinDriver,
    status_led: OutputPinDriver,
    select: [OutputPinDriver; 3],
    probe: MoistureProbe,
}

impl NodeHardware for PlantsBoard {
    fn set_output(&mut self, output: Output, on: bool) -> anyhow::Result<()> {
        match output {
            Output::Valve => self.valve.set_level(on.into())?,
            Output::StatusLed => self.status_led.set_level((!on).into())?,
        }
        Ok(())
    }

    fn select_channel(&mut self, select: [bool; 3]) -> anyhow::Result<()> {
        for (pin, level) in self.select.iter_mut().zip(select) {
            pin.set_level(level.into())?;
        }
        Ok(())
    }

    fn read_analog(&mut self) -> anyhow::Result<i32> {
        let raw = self.probe.read().context("adc read failed")?;
        Ok(i32::from(raw))
    }
}

fn output_pin(pin: impl OutputPin + 'static) -> anyhow::Result<OutputPinDriver> {
    Ok(PinDriver::output(pin.downgrade_output())?)
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let runtime = compiled_runtime_config(NodeKind::Plants);
    info!(
        "plants node: ssid=`{}`, mqtt=`{}:{}`, channels={}",
        runtime.network.wifi_ssid,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
        runtime.plants.enabled_channels,
    );

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    let mut board = PlantsBoard {
        valve: output_pin(pins.gpio16)?,
        status_led: output_pin(pins.gpio2)?,
        select: [
            output_pin(pins.gpio5)?,
            output_pin(pins.gpio4)?,
            output_pin(pins.gpio18)?,
        ],
        probe: AdcChannelDriver::new(
            AdcDriver::new(peripherals.adc1)?,
            pins.gpio34,
            &AdcChannelConfig {
                attenuation: DB_11,
                ..Default::default()
            },
        )
        .context("failed to init moisture probe ADC")?,
    };
    board.set_output(Output::Valve, false)?;
    board.set_output(Output::StatusLed, false)?;

    let wifi = EspWifi::new(peripherals.modem, sys_loop, Some(nvs_partition))?;
    let mut link = EspLink::new(wifi, &runtime.ota.hostname)?;
    let mut clock = SystemClock;
    let association =
        associate(&mut link, &mut clock, &runtime.network).context("wifi startup failed")?;

    mark_running_slot_valid();

    let sink = EspFirmwareSink::new().context("failed to start OTA writer")?;
    let ota = OtaService::new(OtaListener::start(&runtime.ota), sink);

    let mut node = ControlLoop::new(
        PlantsEngine::new(runtime.plants.clone()),
        EspBroker::new(&runtime),
        board,
        clock,
        ota,
        ClientIdGenerator::new(runtime.session.client_id_prefix.clone(), association.seed),
        RetryPolicy::from_config(&runtime.session),
    );

    let result = node.run().context("mqtt session abandoned");
    drop(link);
    result
}
