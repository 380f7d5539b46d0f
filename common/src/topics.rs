pub const TOPIC_PLANTS_VALVE_STATUS: &str = "home/plants/valve";
pub const TOPIC_PLANTS_VALVE_SET: &str = "home/plants/valve/set";
pub const TOPIC_PLANTS_AUTO_STATUS: &str = "home/plants/auto";
pub const TOPIC_PLANTS_AUTO_SET: &str = "home/plants/auto/set";

pub const TOPIC_PLANTS_MEASUREMENT0: &str = "home/plants/measurement";
pub const TOPIC_PLANTS_MEASUREMENT1: &str = "home/plants/measurement1";
pub const TOPIC_PLANTS_MEASUREMENT2: &str = "home/plants/measurement2";
pub const TOPIC_PLANTS_MEASUREMENT3: &str = "home/plants/measurement3";

pub const TOPIC_BEDROOM_IR_COMMAND: &str = "home/bedroom/IR/command";
// Reserved for the bedroom climate sensor; nothing publishes here yet.
pub const TOPIC_BEDROOM_TEMPERATURE: &str = "home/bedroom/sensor/temperature";
pub const TOPIC_BEDROOM_HUMIDITY: &str = "home/bedroom/sensor/humidity";
