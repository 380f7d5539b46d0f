use anyhow::{anyhow, Context};
use esp_idf_hal::{
    gpio::{AnyOutputPin, OutputPin},
    peripheral::Peripheral,
    rmt::{
        config::{CarrierConfig, DutyPercent, TransmitConfig},
        PinState, RmtChannel, TxRmtDriver, RMT,
    },
    units::FromValueType,
};

use home_node_common::IrHardwareConfig;

const IR_TICK_DIVIDER: u8 = 80;

/// RMT channel driving the infrared LED. It is configured and held idle
/// (low); no command set has been captured for the bedroom remotes yet.
pub struct IrEmitter {
    tx: Option<TxRmtDriver<'static>>,
    carrier_khz: u32,
}

impl IrEmitter {
    pub fn new_with_carrier<C, P>(
        channel: impl Peripheral<P = C> + 'static,
        pin: impl Peripheral<P = P> + 'static,
        carrier_khz: u32,
    ) -> anyhow::Result<Self>
    where
        C: RmtChannel,
        P: OutputPin,
    {
        let carrier = CarrierConfig::new()
            .frequency(carrier_khz.kHz().into())
            .carrier_level(PinState::High)
            .duty_percent(DutyPercent::new(33)?);

        let config = TransmitConfig::new()
            .clock_divider(IR_TICK_DIVIDER)
            .carrier(Some(carrier))
            .idle(Some(PinState::Low));

        let tx = TxRmtDriver::new(channel, pin, &config).context("failed to init RMT IR driver")?;

        Ok(Self {
            tx: Some(tx),
            carrier_khz,
        })
    }

    pub fn disabled(carrier_khz: u32) -> Self {
        Self {
            tx: None,
            carrier_khz,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn carrier_khz(&self) -> u32 {
        self.carrier_khz
    }
}

pub fn init_ir_emitter(rmt: RMT, ir: &IrHardwareConfig) -> anyhow::Result<IrEmitter> {
    if ir.tx_pin < 0 {
        return Err(anyhow!("invalid tx pin: {}", ir.tx_pin));
    }

    let pin = ir.tx_pin;
    let carrier_khz = ir.carrier_khz;

    match ir.rmt_channel {
        0 => unsafe {
            IrEmitter::new_with_carrier(rmt.channel0, AnyOutputPin::new(pin), carrier_khz)
        },
        1 => unsafe {
            IrEmitter::new_with_carrier(rmt.channel1, AnyOutputPin::new(pin), carrier_khz)
        },
        2 => unsafe {
            IrEmitter::new_with_carrier(rmt.channel2, AnyOutputPin::new(pin), carrier_khz)
        },
        3 => unsafe {
            IrEmitter::new_with_carrier(rmt.channel3, AnyOutputPin::new(pin), carrier_khz)
        },
        #[cfg(any(esp32, esp32s3))]
        4 => unsafe {
            IrEmitter::new_with_carrier(rmt.channel4, AnyOutputPin::new(pin), carrier_khz)
        },
        #[cfg(any(esp32, esp32s3))]
        5 => unsafe {
            IrEmitter::new_with_carrier(rmt.channel5, AnyOutputPin::new(pin), carrier_khz)
        },
        #[cfg(any(esp32, esp32s3))]
        6 => unsafe {
            IrEmitter::new_with_carrier(rmt.channel6, AnyOutputPin::new(pin), carrier_khz)
        },
        #[cfg(any(esp32, esp32s3))]
        7 => unsafe {
            IrEmitter::new_with_carrier(rmt.channel7, AnyOutputPin::new(pin), carrier_khz)
        },
        _ => Err(anyhow!("unsupported RMT channel: {}", ir.rmt_channel)),
    }
}
