//! Desktop adapters: a rumqttc broker, a simulated Wi-Fi link and a
//! file-backed firmware sink, plus the JSON/env configuration loader.

use std::{
    fs,
    io::{ErrorKind, Write},
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::Context;
use log::{info, warn};
use rumqttc::{
    Client, ConnectReturnCode, Connection, ConnectionError, Event, MqttOptions, Packet, QoS,
};

use crate::{
    bootstrap::Link,
    config::RuntimeConfig,
    ota::{FirmwareSink, ImageKind},
    session::{Broker, BrokerError},
    types::{InboundMessage, NodeKind},
};

const MQTT_REQUEST_CAPACITY: usize = 32;
const MQTT_POLL_WINDOW: Duration = Duration::from_millis(10);
const MAX_EVENTS_PER_POLL: usize = 64;

pub struct RumqttBroker {
    host: String,
    port: u16,
    user: String,
    pass: String,
    keep_alive: Duration,
    connect_timeout: Duration,
    session: Option<(Client, Connection)>,
}

impl RumqttBroker {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            host: config.network.mqtt_host.clone(),
            port: config.network.mqtt_port,
            user: config.network.mqtt_user.clone(),
            pass: config.network.mqtt_pass.clone(),
            keep_alive: Duration::from_secs(config.session.keep_alive_secs),
            connect_timeout: Duration::from_millis(config.session.connect_timeout_ms),
            session: None,
        }
    }

    fn drop_session(&mut self) {
        if let Some((client, _)) = self.session.take() {
            let _ = client.disconnect();
        }
    }
}

impl Broker for RumqttBroker {
    fn connect(&mut self, client_id: &str) -> Result<(), BrokerError> {
        self.drop_session();

        let mut options = MqttOptions::new(client_id, self.host.as_str(), self.port);
        options.set_keep_alive(self.keep_alive);
        if !self.user.is_empty() {
            options.set_credentials(self.user.as_str(), self.pass.as_str());
        }

        let (client, mut connection) = Client::new(options, MQTT_REQUEST_CAPACITY);
        let deadline = Instant::now() + self.connect_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BrokerError::Timeout);
            }

            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(BrokerError::Refused(format!("{:?}", ack.code)));
                    }
                    self.session = Some((client, connection));
                    return Ok(());
                }
                Ok(Ok(_)) => {}
                Ok(Err(ConnectionError::ConnectionRefused(code))) => {
                    return Err(BrokerError::Refused(format!("{code:?}")));
                }
                Ok(Err(err)) => return Err(BrokerError::Transport(err.to_string())),
                Err(_) => return Err(BrokerError::Timeout),
            }
        }
    }

    fn is_connected(&mut self) -> bool {
        self.session.is_some()
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let (client, _) = self.session.as_mut().ok_or(BrokerError::NotConnected)?;
        client
            .subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| BrokerError::Transport(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let (client, _) = self.session.as_mut().ok_or(BrokerError::NotConnected)?;
        client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|err| BrokerError::Transport(err.to_string()))
    }

    fn poll(&mut self) -> Vec<InboundMessage> {
        let mut messages = Vec::new();
        let mut lost = false;

        if let Some((_, connection)) = self.session.as_mut() {
            for _ in 0..MAX_EVENTS_PER_POLL {
                match connection.recv_timeout(MQTT_POLL_WINDOW) {
                    Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                        messages.push(InboundMessage::new(publish.topic, publish.payload.to_vec()));
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        warn!("mqtt connection lost: {err}");
                        lost = true;
                        break;
                    }
                    Err(_) => break,
                }
            }
        }

        if lost {
            self.drop_session();
        }
        messages
    }
}

/// Stand-in for the station radio; the desktop is always online.
#[derive(Debug, Default)]
pub struct SimulatedLink {
    ssid: Option<String>,
}

impl Link for SimulatedLink {
    fn begin(&mut self, ssid: &str, _passphrase: &str) -> anyhow::Result<()> {
        self.ssid = Some(ssid.to_string());
        Ok(())
    }

    fn is_associated(&mut self) -> bool {
        self.ssid.is_some()
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        Some(Ipv4Addr::LOCALHOST)
    }
}

/// Stages pushed images under the data directory instead of flashing them.
pub struct FileFirmwareSink {
    dir: PathBuf,
    hostname: String,
    pending: Option<(fs::File, PathBuf, PathBuf)>,
    staged: Option<PathBuf>,
}

impl FileFirmwareSink {
    pub fn new(dir: impl Into<PathBuf>, hostname: &str) -> Self {
        Self {
            dir: dir.into(),
            hostname: hostname.to_string(),
            pending: None,
            staged: None,
        }
    }

    pub fn staged(&self) -> Option<&Path> {
        self.staged.as_deref()
    }

    fn image_path(&self, kind: ImageKind) -> PathBuf {
        let suffix = match kind {
            ImageKind::Flash => "firmware",
            ImageKind::Filesystem => "fs",
        };
        self.dir.join(format!("{}-{suffix}.bin", self.hostname))
    }
}

impl FirmwareSink for FileFirmwareSink {
    fn begin(&mut self, kind: ImageKind, _size: u64) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let target = self.image_path(kind);
        let partial = target.with_extension("bin.part");
        let file = fs::File::create(&partial)
            .with_context(|| format!("failed to create {}", partial.display()))?;

        self.pending = Some((file, partial, target));
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        let (file, partial, _) = self.pending.as_mut().context("no update in progress")?;
        file.write_all(chunk)
            .with_context(|| format!("failed writing {}", partial.display()))
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        let (file, partial, target) = self.pending.take().context("no update in progress")?;
        file.sync_all()?;
        drop(file);
        fs::rename(&partial, &target)
            .with_context(|| format!("failed to stage {}", target.display()))?;
        self.staged = Some(target);
        Ok(())
    }

    fn abort(&mut self) {
        if let Some((file, partial, _)) = self.pending.take() {
            drop(file);
            if let Err(err) = fs::remove_file(&partial) {
                warn!("failed to remove {}: {err}", partial.display());
            }
        }
    }

    fn activate(&mut self) {
        if let Some(path) = &self.staged {
            info!("image staged at {}; restart the node to run it", path.display());
        }
    }
}

pub fn data_dir() -> PathBuf {
    std::env::var("HOME_NODE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.home-node"))
}

/// Node defaults, overlaid by `$HOME_NODE_CONFIG` (JSON) and then by the
/// individual environment variables.
pub fn load_runtime_config(kind: NodeKind) -> anyhow::Result<RuntimeConfig> {
    let mut runtime = match std::env::var("HOME_NODE_CONFIG") {
        Ok(path) => read_config_file(Path::new(&path), kind)?,
        Err(_) => RuntimeConfig::for_node(kind),
    };

    apply_env_overrides(&mut runtime, |key| std::env::var(key).ok());
    runtime.sanitize();
    Ok(runtime)
}

fn read_config_file(path: &Path, kind: NodeKind) -> anyhow::Result<RuntimeConfig> {
    match fs::read(path) {
        Ok(raw) => parse_runtime_config(&raw, kind)
            .with_context(|| format!("invalid config in {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!("{} not found, using defaults", path.display());
            Ok(RuntimeConfig::for_node(kind))
        }
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Parses a JSON config, keeping the node's hostname defaults for anything
/// the document leaves out.
pub fn parse_runtime_config(raw: &[u8], kind: NodeKind) -> anyhow::Result<RuntimeConfig> {
    let mut value: serde_json::Value = serde_json::from_slice(raw)?;
    let defaults = serde_json::to_value(RuntimeConfig::for_node(kind))?;
    merge_missing(&mut value, defaults);
    Ok(serde_json::from_value(value)?)
}

fn merge_missing(target: &mut serde_json::Value, defaults: serde_json::Value) {
    if let (serde_json::Value::Object(target), serde_json::Value::Object(defaults)) =
        (target, defaults)
    {
        for (key, default) in defaults {
            match target.get_mut(&key) {
                Some(existing) => merge_missing(existing, default),
                None => {
                    target.insert(key, default);
                }
            }
        }
    }
}

pub fn apply_env_overrides<F>(runtime: &mut RuntimeConfig, var: F)
where
    F: Fn(&str) -> Option<String>,
{
    let network = &mut runtime.network;
    if let Some(value) = var("WIFI_SSID") {
        network.wifi_ssid = value;
    }
    if let Some(value) = var("WIFI_PASS") {
        network.wifi_pass = value;
    }
    if let Some(value) = var("MQTT_HOST") {
        network.mqtt_host = value;
    }
    if let Some(port) = var("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        network.mqtt_port = port;
    }
    if let Some(value) = var("MQTT_USER") {
        network.mqtt_user = value;
    }
    if let Some(value) = var("MQTT_PASS") {
        network.mqtt_pass = value;
    }
    if let Some(port) = var("OTA_PORT").and_then(|value| value.parse::<u16>().ok()) {
        runtime.ota.port = port;
    }
    if let Some(value) = var("OTA_PASSWORD") {
        runtime.ota.password = value;
    }
}
