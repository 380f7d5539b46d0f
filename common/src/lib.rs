pub mod bedroom;
pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod control_loop;
pub mod ota;
pub mod plants;
pub mod session;
pub mod topics;
pub mod types;

#[cfg(feature = "esp32")]
pub mod esp;
#[cfg(feature = "host")]
pub mod host;

pub use bedroom::{BedroomEngine, IrCommand};
pub use bootstrap::{associate, Association, BootstrapError, Link};
pub use clock::{Clock, PassTimer, SystemClock};
pub use config::{
    BedroomConfig, Calibration, IrHardwareConfig, NetworkConfig, OtaConfig, PlantsConfig,
    RuntimeConfig, SessionConfig,
};
pub use control_loop::{ControlLoop, NodeBehavior, NodeHardware};
pub use ota::{FirmwareSink, ImageKind, OtaError, OtaEvent, OtaListener, OtaService};
pub use plants::{PlantsEngine, PlantsState};
pub use session::{Broker, BrokerError, ClientIdGenerator, RetryPolicy, Session, SessionError};
pub use topics::*;
pub use types::{
    ChannelReading, ConnectionState, Dispatch, Disposition, InboundMessage, MuxChannel,
    NodeAction, NodeKind, Output, Publish, MUX_CHANNELS,
};
