//! ESP-IDF adapters: MQTT client, station Wi-Fi, OTA partition writer and
//! the compile-time credential loader.

use std::{
    net::Ipv4Addr,
    sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError},
    thread,
    time::Duration,
};

use anyhow::anyhow;
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    ota::{EspOta, EspOtaUpdate},
    sys,
    wifi::EspWifi,
};
use log::{info, warn};

use crate::{
    bootstrap::Link,
    config::RuntimeConfig,
    ota::{FirmwareSink, ImageKind},
    session::{Broker, BrokerError},
    types::{InboundMessage, NodeKind},
};

const MQTT_RX_STACK_SIZE: usize = 6 * 1024;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const RESTART_DELAY_MS: u64 = 100;
const OTA_WRITER_STACK_SIZE: usize = 8 * 1024;

enum MqttEvent {
    Connected,
    Disconnected,
    Message(InboundMessage),
    Error(String),
}

pub struct EspBroker {
    url: String,
    user: String,
    pass: String,
    keep_alive: Duration,
    connect_timeout: Duration,
    client: Option<EspMqttClient<'static>>,
    events: Option<Receiver<MqttEvent>>,
    connected: bool,
}

impl EspBroker {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            url: format!(
                "mqtt://{}:{}",
                config.network.mqtt_host, config.network.mqtt_port
            ),
            user: config.network.mqtt_user.clone(),
            pass: config.network.mqtt_pass.clone(),
            keep_alive: Duration::from_secs(config.session.keep_alive_secs),
            connect_timeout: Duration::from_millis(config.session.connect_timeout_ms),
            client: None,
            events: None,
            connected: false,
        }
    }

    fn drop_client(&mut self) {
        self.connected = false;
        self.client = None;
        self.events = None;
    }
}

impl Broker for EspBroker {
    fn connect(&mut self, client_id: &str) -> Result<(), BrokerError> {
        self.drop_client();

        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            username: (!self.user.is_empty()).then_some(self.user.as_str()),
            password: (!self.pass.is_empty()).then_some(self.pass.as_str()),
            keep_alive_interval: Some(self.keep_alive),
            ..Default::default()
        };

        let (client, connection) = EspMqttClient::new(self.url.as_str(), &conf)
            .map_err(|err| BrokerError::Transport(err.to_string()))?;
        let events = spawn_mqtt_receiver(connection)
            .map_err(|err| BrokerError::Transport(format!("{err:#}")))?;

        loop {
            match events.recv_timeout(self.connect_timeout) {
                Ok(MqttEvent::Connected) => break,
                Ok(MqttEvent::Disconnected) => {
                    return Err(BrokerError::Refused("disconnected".to_string()))
                }
                Ok(MqttEvent::Error(err)) => return Err(BrokerError::Transport(err)),
                Ok(MqttEvent::Message(_)) => {}
                Err(RecvTimeoutError::Timeout) => return Err(BrokerError::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BrokerError::Transport("mqtt receiver stopped".to_string()))
                }
            }
        }

        self.client = Some(client);
        self.events = Some(events);
        self.connected = true;
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.connected
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let client = self.client.as_mut().ok_or(BrokerError::NotConnected)?;
        client
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|err| BrokerError::Transport(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let client = self.client.as_mut().ok_or(BrokerError::NotConnected)?;
        client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .map(|_| ())
            .map_err(|err| BrokerError::Transport(err.to_string()))
    }

    fn poll(&mut self) -> Vec<InboundMessage> {
        let mut messages = Vec::new();
        let mut lost = false;

        if let Some(events) = &self.events {
            loop {
                match events.try_recv() {
                    Ok(MqttEvent::Message(message)) => messages.push(message),
                    Ok(MqttEvent::Connected) => {}
                    Ok(MqttEvent::Disconnected) => {
                        warn!("mqtt disconnected");
                        lost = true;
                    }
                    Ok(MqttEvent::Error(err)) => warn!("mqtt error: {err}"),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        lost = true;
                        break;
                    }
                }
            }
        }

        if lost {
            self.drop_client();
        }
        messages
    }
}

fn spawn_mqtt_receiver(mut conn: EspMqttConnection) -> anyhow::Result<Receiver<MqttEvent>> {
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(MQTT_RX_STACK_SIZE)
        .spawn(move || {
            while let Ok(event) = conn.next() {
                let forwarded = match event.payload() {
                    EventPayload::Connected(_) => MqttEvent::Connected,
                    EventPayload::Disconnected => MqttEvent::Disconnected,
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => {
                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!("dropping {} byte payload on {topic}", data.len());
                            continue;
                        }
                        MqttEvent::Message(InboundMessage::new(topic, data))
                    }
                    EventPayload::Error(err) => MqttEvent::Error(format!("{err:?}")),
                    _ => continue,
                };

                if tx.send(forwarded).is_err() {
                    break;
                }
            }
        })?;

    Ok(rx)
}

pub struct EspLink {
    wifi: EspWifi<'static>,
}

impl EspLink {
    /// Names the station interface so DHCP and the OTA pusher see `hostname`.
    pub fn new(mut wifi: EspWifi<'static>, hostname: &str) -> anyhow::Result<Self> {
        wifi.sta_netif_mut()
            .set_hostname(hostname)
            .map_err(|err| anyhow!("failed to set hostname `{hostname}`: {err:?}"))?;
        Ok(Self { wifi })
    }

    pub fn into_inner(self) -> EspWifi<'static> {
        self.wifi
    }
}

impl Link for EspLink {
    fn begin(&mut self, ssid: &str, passphrase: &str) -> anyhow::Result<()> {
        let auth_method = if passphrase.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
                password: passphrase
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))?;

        self.wifi.start()?;
        self.wifi.connect()?;
        Ok(())
    }

    fn is_associated(&mut self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.wifi.sta_netif().is_up().unwrap_or(false)
    }

    fn rejoin(&mut self) -> anyhow::Result<()> {
        let _ = self.wifi.disconnect();
        self.wifi.connect()?;
        Ok(())
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        self.wifi.sta_netif().get_ip_info().ok().map(|info| info.ip)
    }
}

enum OtaRequest {
    Begin,
    Write(Vec<u8>),
    Finish,
    Abort,
}

type OtaReply = Result<(), String>;

/// Writes pushed application images into the inactive OTA slot. The `EspOta`
/// handle and its in-flight update live on a writer thread, so an update
/// spans several listener calls without outliving its borrow.
pub struct EspFirmwareSink {
    requests: SyncSender<OtaRequest>,
    replies: Receiver<OtaReply>,
    active: bool,
}

impl EspFirmwareSink {
    pub fn new() -> anyhow::Result<Self> {
        let (requests, request_rx) = mpsc::sync_channel(1);
        let (reply_tx, replies) = mpsc::sync_channel(1);

        thread::Builder::new()
            .name("ota-writer".into())
            .stack_size(OTA_WRITER_STACK_SIZE)
            .spawn(move || run_ota_writer(&request_rx, &reply_tx))?;

        Ok(Self {
            requests,
            replies,
            active: false,
        })
    }

    fn request(&self, request: OtaRequest) -> anyhow::Result<()> {
        self.requests
            .send(request)
            .map_err(|_| anyhow!("OTA writer stopped"))?;
        self.replies
            .recv()
            .map_err(|_| anyhow!("OTA writer stopped"))?
            .map_err(|err| anyhow!(err))
    }
}

impl FirmwareSink for EspFirmwareSink {
    fn begin(&mut self, kind: ImageKind, _size: u64) -> anyhow::Result<()> {
        if kind == ImageKind::Filesystem {
            anyhow::bail!("filesystem images are not supported on this board");
        }

        self.request(OtaRequest::Begin)?;
        self.active = true;
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        if !self.active {
            anyhow::bail!("no update in progress");
        }
        self.request(OtaRequest::Write(chunk.to_vec()))
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if !self.active {
            anyhow::bail!("no update in progress");
        }
        self.active = false;
        self.request(OtaRequest::Finish)
    }

    fn abort(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Err(err) = self.request(OtaRequest::Abort) {
            warn!("failed to abort OTA update: {err:#}");
        }
    }

    fn activate(&mut self) {
        info!("rebooting into new image");
        thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
        unsafe { sys::esp_restart() };
    }
}

fn run_ota_writer(requests: &Receiver<OtaRequest>, replies: &SyncSender<OtaReply>) {
    while let Ok(request) = requests.recv() {
        let reply = match request {
            OtaRequest::Begin => match EspOta::new() {
                Ok(mut ota) => match ota.initiate_update() {
                    Ok(update) => {
                        if replies.send(Ok(())).is_err() {
                            return;
                        }
                        drive_update(update, requests, replies);
                        continue;
                    }
                    Err(err) => Err(format!("failed to initiate OTA update: {err:?}")),
                },
                Err(err) => Err(format!("failed to acquire OTA: {err:?}")),
            },
            OtaRequest::Abort => Ok(()),
            OtaRequest::Write(_) | OtaRequest::Finish => Err("no update in progress".to_string()),
        };

        if replies.send(reply).is_err() {
            return;
        }
    }
}

fn drive_update(
    mut update: EspOtaUpdate<'_>,
    requests: &Receiver<OtaRequest>,
    replies: &SyncSender<OtaReply>,
) {
    loop {
        let Ok(request) = requests.recv() else {
            let _ = update.abort();
            return;
        };

        match request {
            OtaRequest::Write(chunk) => {
                let reply = update
                    .write(&chunk)
                    .map(|_| ())
                    .map_err(|err| format!("failed writing OTA data: {err:?}"));
                let _ = replies.send(reply);
            }
            OtaRequest::Finish => {
                let reply = update
                    .complete()
                    .map_err(|err| format!("failed finalizing OTA image: {err:?}"));
                let _ = replies.send(reply);
                return;
            }
            OtaRequest::Abort => {
                let reply = update
                    .abort()
                    .map_err(|err| format!("failed aborting OTA image: {err:?}"));
                let _ = replies.send(reply);
                return;
            }
            OtaRequest::Begin => {
                let _ = replies.send(Err("update already in progress".to_string()));
            }
        }
    }
}

pub fn mark_running_slot_valid() {
    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }
}

/// Node defaults overlaid with credentials baked in at build time.
pub fn compiled_runtime_config(kind: NodeKind) -> RuntimeConfig {
    let mut runtime = RuntimeConfig::for_node(kind);
    let network = &mut runtime.network;

    if let Some(ssid) = option_env!("WIFI_SSID") {
        network.wifi_ssid = ssid.to_string();
    }
    if let Some(pass) = option_env!("WIFI_PASS") {
        network.wifi_pass = pass.to_string();
    }
    if let Some(host) = option_env!("MQTT_HOST") {
        network.mqtt_host = host.to_string();
    }
    if let Some(port) = option_env!("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        network.mqtt_port = port;
    }
    if let Some(user) = option_env!("MQTT_USER") {
        network.mqtt_user = user.to_string();
    }
    if let Some(pass) = option_env!("MQTT_PASS") {
        network.mqtt_pass = pass.to_string();
    }
    if let Some(port) = option_env!("OTA_PORT").and_then(|value| value.parse::<u16>().ok()) {
        runtime.ota.port = port;
    }
    if let Some(password) = option_env!("OTA_PASSWORD") {
        runtime.ota.password = password.to_string();
    }

    runtime.sanitize();
    runtime
}
