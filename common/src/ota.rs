//! Firmware push listener.
//!
//! A pusher connects to the update port and sends one header line followed
//! by the raw image:
//!
//! ```text
//! <flash|fs> <size> <sha256-hex> [password]\n
//! <size bytes of image>
//! ```
//!
//! The node answers `OK <bytes>` once the image is verified and handed to
//! the [`FirmwareSink`], or `ERR <reason>` on failure. The listener is polled
//! from the control loop; an accepted push is received to completion before
//! the poll returns.

use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    str::FromStr,
    time::Duration,
};

use log::{error, info, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::OtaConfig;

const OTA_CHUNK_SIZE: usize = 4096;
const MAX_HEADER_BYTES: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Flash,
    Filesystem,
}

impl ImageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flash => "sketch",
            Self::Filesystem => "filesystem",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("empty push header")]
    Empty,
    #[error("unknown image kind `{0}`")]
    UnknownKind(String),
    #[error("missing or invalid image size")]
    InvalidSize,
    #[error("image digest must be 64 hex characters")]
    InvalidDigest,
    #[error("unexpected trailing fields in push header")]
    TrailingFields,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushHeader {
    pub kind: ImageKind,
    pub size: u64,
    pub sha256: String,
    pub password: Option<String>,
}

impl FromStr for PushHeader {
    type Err = HeaderError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut fields = line.split_whitespace();

        let kind = match fields.next() {
            None => return Err(HeaderError::Empty),
            Some(kind) if kind.eq_ignore_ascii_case("flash") => ImageKind::Flash,
            Some(kind) if kind.eq_ignore_ascii_case("fs") => ImageKind::Filesystem,
            Some(other) => return Err(HeaderError::UnknownKind(other.to_string())),
        };

        let size = fields
            .next()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|size| *size > 0)
            .ok_or(HeaderError::InvalidSize)?;

        let sha256 = fields
            .next()
            .filter(|digest| digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()))
            .map(|digest| digest.to_ascii_lowercase())
            .ok_or(HeaderError::InvalidDigest)?;

        let password = fields.next().map(str::to_string);
        if fields.next().is_some() {
            return Err(HeaderError::TrailingFields);
        }

        Ok(Self {
            kind,
            size,
            sha256,
            password,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("Auth Failed")]
    Auth,
    #[error("Begin Failed: {0}")]
    Begin(String),
    #[error("Connect Failed: {0}")]
    Connect(String),
    #[error("Receive Failed: {0}")]
    Receive(String),
    #[error("End Failed: {0}")]
    End(String),
}

impl OtaError {
    pub fn code(&self) -> u8 {
        match self {
            Self::Auth => 0,
            Self::Begin(_) => 1,
            Self::Connect(_) => 2,
            Self::Receive(_) => 3,
            Self::End(_) => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaEvent {
    Start { kind: ImageKind, size: u64 },
    Progress { received: u64, total: u64, percent: u8 },
    End { bytes: u64, sha256: String },
    Error(OtaError),
}

/// Destination of a pushed image.
pub trait FirmwareSink {
    fn begin(&mut self, kind: ImageKind, size: u64) -> anyhow::Result<()>;

    fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()>;

    fn finish(&mut self) -> anyhow::Result<()>;

    fn abort(&mut self);

    /// Switches to the finished image; on hardware this reboots.
    fn activate(&mut self);
}

pub fn progress_percent(received: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (received.saturating_mul(100) / total).min(100) as u8
}

pub fn log_event(event: &OtaEvent) {
    match event {
        OtaEvent::Start { kind, size } => {
            info!("Start updating {} ({size} bytes)", kind.as_str())
        }
        OtaEvent::Progress { percent, .. } => info!("Progress: {percent}%"),
        OtaEvent::End { bytes, sha256 } => info!("End ({bytes} bytes, sha256 {sha256})"),
        OtaEvent::Error(err) => error!("Error[{}]: {err}", err.code()),
    }
}

pub struct OtaListener {
    listener: Option<TcpListener>,
    password: String,
    read_timeout: Duration,
    hostname: String,
}

impl OtaListener {
    pub fn bind(config: &OtaConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)))?;
        listener.set_nonblocking(true)?;

        Ok(Self {
            listener: Some(listener),
            password: config.password.clone(),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            hostname: config.hostname.clone(),
        })
    }

    /// Binds the listener, or logs the failure and runs without updates.
    pub fn start(config: &OtaConfig) -> Self {
        match Self::bind(config) {
            Ok(listener) => {
                info!(
                    "OTA Ready: `{}` listening on port {}",
                    config.hostname,
                    listener.local_port().unwrap_or(config.port)
                );
                listener
            }
            Err(err) => {
                warn!(
                    "failed to bind OTA listener on port {}, updates disabled: {err}",
                    config.port
                );
                Self::disabled(config)
            }
        }
    }

    pub fn disabled(config: &OtaConfig) -> Self {
        Self {
            listener: None,
            password: config.password.clone(),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            hostname: config.hostname.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.listener.is_some()
    }

    pub fn local_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .map(|addr| addr.port())
    }

    /// Accepts at most one pending push. Returns `None` when nobody is
    /// pushing, otherwise the outcome of the update attempt. The sink is
    /// aborted on failure; activating a finished image is left to the caller.
    pub fn poll<S, F>(&mut self, sink: &mut S, mut observer: F) -> Option<Result<u64, OtaError>>
    where
        S: FirmwareSink,
        F: FnMut(&OtaEvent),
    {
        let listener = self.listener.as_ref()?;

        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return None,
            Err(err) => {
                let err = OtaError::Connect(err.to_string());
                observer(&OtaEvent::Error(err.clone()));
                return Some(Err(err));
            }
        };

        info!("firmware push from {peer}");

        let mut begun = false;
        let result = self.receive(&stream, sink, &mut begun, &mut observer);

        let reply = match &result {
            Ok(bytes) => format!("OK {bytes}\n"),
            Err(err) => {
                if begun {
                    sink.abort();
                }
                observer(&OtaEvent::Error(err.clone()));
                format!("ERR {err}\n")
            }
        };
        if let Err(err) = (&stream).write_all(reply.as_bytes()) {
            warn!("failed to answer firmware push from {peer}: {err}");
        }

        Some(result)
    }

    fn receive<S, F>(
        &self,
        stream: &TcpStream,
        sink: &mut S,
        begun: &mut bool,
        observer: &mut F,
    ) -> Result<u64, OtaError>
    where
        S: FirmwareSink,
        F: FnMut(&OtaEvent),
    {
        stream
            .set_nonblocking(false)
            .and_then(|_| stream.set_read_timeout(Some(self.read_timeout)))
            .map_err(|err| OtaError::Connect(err.to_string()))?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        let read = (&mut reader)
            .take(MAX_HEADER_BYTES)
            .read_line(&mut line)
            .map_err(|err| OtaError::Connect(err.to_string()))?;
        if read == 0 {
            return Err(OtaError::Connect(
                "connection closed before header".to_string(),
            ));
        }

        let header: PushHeader = line
            .trim()
            .parse()
            .map_err(|err: HeaderError| OtaError::Begin(err.to_string()))?;

        if !self.password.is_empty() && header.password.as_deref() != Some(self.password.as_str())
        {
            return Err(OtaError::Auth);
        }

        sink.begin(header.kind, header.size)
            .map_err(|err| OtaError::Begin(format!("{err:#}")))?;
        *begun = true;
        observer(&OtaEvent::Start {
            kind: header.kind,
            size: header.size,
        });

        let mut hasher = Sha256::new();
        let mut received = 0_u64;
        let mut last_percent = 0_u8;
        let mut chunk = [0_u8; OTA_CHUNK_SIZE];

        while received < header.size {
            let want = (header.size - received).min(OTA_CHUNK_SIZE as u64) as usize;
            let read = reader
                .read(&mut chunk[..want])
                .map_err(|err| OtaError::Receive(err.to_string()))?;
            if read == 0 {
                return Err(OtaError::Receive(format!(
                    "connection closed after {received} of {} bytes",
                    header.size
                )));
            }

            sink.write(&chunk[..read])
                .map_err(|err| OtaError::Receive(format!("{err:#}")))?;
            hasher.update(&chunk[..read]);
            received += read as u64;

            let percent = progress_percent(received, header.size);
            if percent != last_percent {
                last_percent = percent;
                observer(&OtaEvent::Progress {
                    received,
                    total: header.size,
                    percent,
                });
            }
        }

        let digest = hex_digest(&hasher.finalize());
        if digest != header.sha256 {
            return Err(OtaError::End(format!(
                "sha256 mismatch (expected {}, got {digest})",
                header.sha256
            )));
        }

        sink.finish()
            .map_err(|err| OtaError::End(format!("{err:#}")))?;

        info!("`{}` accepted {} image", self.hostname, header.kind.as_str());
        observer(&OtaEvent::End {
            bytes: received,
            sha256: digest,
        });

        Ok(received)
    }
}

/// Listener paired with the sink it writes into.
pub struct OtaService<S> {
    listener: OtaListener,
    sink: S,
}

impl<S: FirmwareSink> OtaService<S> {
    pub fn new(listener: OtaListener, sink: S) -> Self {
        Self { listener, sink }
    }

    pub fn listener(&self) -> &OtaListener {
        &self.listener
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Polls for a push, logs its events and activates a verified image.
    pub fn service(&mut self) -> Option<Result<u64, OtaError>> {
        let outcome = self.listener.poll(&mut self.sink, log_event)?;
        if outcome.is_ok() {
            self.sink.activate();
        }
        Some(outcome)
    }
}

pub fn hex_digest(bytes: &[u8]) -> String {
    use core::fmt::Write as _;

    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct MemorySink {
        kind: Option<ImageKind>,
        image: Vec<u8>,
        finished: bool,
        aborted: bool,
        refuse_begin: bool,
        activations: u32,
    }

    impl FirmwareSink for MemorySink {
        fn begin(&mut self, kind: ImageKind, _size: u64) -> anyhow::Result<()> {
            if self.refuse_begin {
                anyhow::bail!("no update partition");
            }
            self.kind = Some(kind);
            Ok(())
        }

        fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
            self.image.extend_from_slice(chunk);
            Ok(())
        }

        fn finish(&mut self) -> anyhow::Result<()> {
            self.finished = true;
            Ok(())
        }

        fn abort(&mut self) {
            self.aborted = true;
        }

        fn activate(&mut self) {
            self.activations += 1;
        }
    }

    fn config(password: &str) -> OtaConfig {
        OtaConfig {
            hostname: "ESPlant".to_string(),
            port: 0,
            password: password.to_string(),
            read_timeout_ms: 2_000,
        }
    }

    fn digest_of(image: &[u8]) -> String {
        hex_digest(&Sha256::digest(image))
    }

    /// Pushes `header` + `body` from a helper thread and returns the reply.
    fn push(port: u16, header: String, body: Vec<u8>) -> thread::JoinHandle<String> {
        thread::spawn(move || {
            let mut stream = match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => stream,
                Err(_) => return String::new(),
            };
            let _ = stream.write_all(header.as_bytes());
            let _ = stream.write_all(&body);
            let _ = stream.shutdown(std::net::Shutdown::Write);
            let mut reply = String::new();
            let _ = stream.read_to_string(&mut reply);
            reply
        })
    }

    fn poll_until_outcome(
        listener: &mut OtaListener,
        sink: &mut MemorySink,
        events: &mut Vec<OtaEvent>,
    ) -> Result<u64, OtaError> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(outcome) = listener.poll(sink, |event| events.push(event.clone())) {
                return outcome;
            }
            assert!(Instant::now() < deadline, "no push arrived");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn service_until_outcome(service: &mut OtaService<MemorySink>) -> Result<u64, OtaError> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(outcome) = service.service() {
                return outcome;
            }
            assert!(Instant::now() < deadline, "no push arrived");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn parses_push_header() {
        let digest = "AB".repeat(32);
        let header: PushHeader = format!("flash 1024 {digest} hunter2").parse().unwrap();

        assert_eq!(
            header,
            PushHeader {
                kind: ImageKind::Flash,
                size: 1024,
                sha256: "ab".repeat(32),
                password: Some("hunter2".to_string()),
            }
        );

        let fs: PushHeader = format!("fs 10 {}", "0".repeat(64)).parse().unwrap();
        assert_eq!(fs.kind, ImageKind::Filesystem);
        assert_eq!(fs.password, None);
    }

    #[test]
    fn rejects_malformed_headers() {
        let digest = "0".repeat(64);

        assert_eq!("".parse::<PushHeader>(), Err(HeaderError::Empty));
        assert_eq!(
            format!("eeprom 10 {digest}").parse::<PushHeader>(),
            Err(HeaderError::UnknownKind("eeprom".to_string()))
        );
        assert_eq!(
            format!("flash 0 {digest}").parse::<PushHeader>(),
            Err(HeaderError::InvalidSize)
        );
        assert_eq!(
            "flash 10 abc".parse::<PushHeader>(),
            Err(HeaderError::InvalidDigest)
        );
        assert_eq!(
            format!("flash 10 {digest} pw extra").parse::<PushHeader>(),
            Err(HeaderError::TrailingFields)
        );
    }

    #[test]
    fn progress_never_divides_by_zero() {
        assert_eq!(progress_percent(0, 0), 0);
        assert_eq!(progress_percent(5, 50), 10);
        assert_eq!(progress_percent(49, 99), 49);
        assert_eq!(progress_percent(200, 100), 100);
    }

    #[test]
    fn error_codes_follow_taxonomy() {
        assert_eq!(OtaError::Auth.code(), 0);
        assert_eq!(OtaError::Begin(String::new()).code(), 1);
        assert_eq!(OtaError::Connect(String::new()).code(), 2);
        assert_eq!(OtaError::Receive(String::new()).code(), 3);
        assert_eq!(OtaError::End(String::new()).code(), 4);
        assert_eq!(OtaError::Auth.to_string(), "Auth Failed");
    }

    #[test]
    fn idle_listener_returns_none() {
        let mut listener = OtaListener::bind(&config("")).unwrap();
        let mut sink = MemorySink::default();

        assert!(listener.poll(&mut sink, |_| {}).is_none());

        let mut disabled = OtaListener::disabled(&config(""));
        assert!(!disabled.is_enabled());
        assert!(disabled.poll(&mut sink, |_| {}).is_none());
    }

    #[test]
    fn accepts_verified_push() {
        let mut listener = OtaListener::bind(&config("")).unwrap();
        let port = listener.local_port().unwrap();
        let image: Vec<u8> = (0..10_000_u32).map(|i| (i % 251) as u8).collect();
        let header = format!("flash {} {}\n", image.len(), digest_of(&image));

        let pusher = push(port, header, image.clone());
        let mut sink = MemorySink::default();
        let mut events = Vec::new();
        let outcome = poll_until_outcome(&mut listener, &mut sink, &mut events);

        assert_eq!(outcome, Ok(10_000));
        assert_eq!(sink.kind, Some(ImageKind::Flash));
        assert_eq!(sink.image, image);
        assert!(sink.finished);
        assert!(!sink.aborted);
        assert_eq!(
            events.first(),
            Some(&OtaEvent::Start {
                kind: ImageKind::Flash,
                size: 10_000,
            })
        );
        assert!(matches!(
            events.iter().rev().nth(1),
            Some(OtaEvent::Progress { percent: 100, .. })
        ));
        assert!(matches!(events.last(), Some(OtaEvent::End { bytes: 10_000, .. })));
        assert_eq!(pusher.join().unwrap(), "OK 10000\n");
    }

    #[test]
    fn digest_mismatch_is_an_end_failure() {
        let mut listener = OtaListener::bind(&config("")).unwrap();
        let port = listener.local_port().unwrap();
        let header = format!("flash 4 {}\n", "0".repeat(64));

        let pusher = push(port, header, b"abcd".to_vec());
        let mut sink = MemorySink::default();
        let mut events = Vec::new();
        let outcome = poll_until_outcome(&mut listener, &mut sink, &mut events);

        assert!(matches!(outcome, Err(OtaError::End(_))));
        assert!(sink.aborted);
        assert!(!sink.finished);
        assert!(matches!(events.last(), Some(OtaEvent::Error(OtaError::End(_)))));
        assert!(pusher.join().unwrap().starts_with("ERR End Failed"));
    }

    #[test]
    fn wrong_password_is_an_auth_failure() {
        let mut listener = OtaListener::bind(&config("letmein")).unwrap();
        let port = listener.local_port().unwrap();
        let image = b"firmware".to_vec();
        let header = format!("flash {} {} guess\n", image.len(), digest_of(&image));

        let pusher = push(port, header, image);
        let mut sink = MemorySink::default();
        let mut events = Vec::new();
        let outcome = poll_until_outcome(&mut listener, &mut sink, &mut events);

        assert_eq!(outcome, Err(OtaError::Auth));
        assert_eq!(sink.kind, None);
        assert!(!sink.aborted);
        assert_eq!(events, vec![OtaEvent::Error(OtaError::Auth)]);
        let _ = pusher.join();
    }

    #[test]
    fn truncated_image_is_a_receive_failure() {
        let mut listener = OtaListener::bind(&config("")).unwrap();
        let port = listener.local_port().unwrap();
        let header = format!("flash 100 {}\n", "0".repeat(64));

        let pusher = push(port, header, vec![7_u8; 10]);
        let mut sink = MemorySink::default();
        let mut events = Vec::new();
        let outcome = poll_until_outcome(&mut listener, &mut sink, &mut events);

        assert!(matches!(outcome, Err(OtaError::Receive(_))));
        assert!(sink.aborted);
        assert_eq!(sink.image.len(), 10);
        let _ = pusher.join();
    }

    #[test]
    fn sink_refusal_is_a_begin_failure() {
        let mut listener = OtaListener::bind(&config("")).unwrap();
        let port = listener.local_port().unwrap();
        let header = format!("fs 4 {}\n", digest_of(b"abcd"));

        let pusher = push(port, header, b"abcd".to_vec());
        let mut sink = MemorySink {
            refuse_begin: true,
            ..MemorySink::default()
        };
        let mut events = Vec::new();
        let outcome = poll_until_outcome(&mut listener, &mut sink, &mut events);

        assert!(matches!(outcome, Err(OtaError::Begin(_))));
        assert!(!sink.aborted);
        let _ = pusher.join();
    }

    #[test]
    fn service_activates_only_verified_images() {
        let listener = OtaListener::bind(&config("")).unwrap();
        let port = listener.local_port().unwrap();
        let mut service = OtaService::new(listener, MemorySink::default());

        let pusher = push(port, format!("flash 4 {}\n", "0".repeat(64)), b"abcd".to_vec());
        let outcome = service_until_outcome(&mut service);
        assert!(matches!(outcome, Err(OtaError::End(_))));
        assert!(service.sink().aborted);
        assert!(!service.sink().finished);
        assert_eq!(service.sink().activations, 0);
        let _ = pusher.join();

        let image = b"replacement firmware".to_vec();
        let header = format!("flash {} {}\n", image.len(), digest_of(&image));
        let pusher = push(port, header, image.clone());
        let outcome = service_until_outcome(&mut service);
        assert_eq!(outcome, Ok(image.len() as u64));
        assert!(service.sink().finished);
        assert_eq!(service.sink().activations, 1);
        assert_eq!(pusher.join().unwrap(), format!("OK {}\n", image.len()));
    }
}
