use log::debug;
use thiserror::Error;

use crate::{
    config::SessionConfig,
    types::{ConnectionState, InboundMessage},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("not connected to broker")]
    NotConnected,
    #[error("broker refused connection, rc={0}")]
    Refused(String),
    #[error("broker transport error: {0}")]
    Transport(String),
    #[error("timed out waiting for broker")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("gave up after {attempts} failed connection attempts: {last}")]
    RetriesExhausted { attempts: u32, last: BrokerError },
}

/// Publish/subscribe transport the control loop drives. Implementations
/// must not block in `poll` beyond a short service window.
pub trait Broker {
    fn connect(&mut self, client_id: &str) -> Result<(), BrokerError>;

    fn is_connected(&mut self) -> bool;

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Services the transport and returns the messages received since the
    /// previous call, in arrival order.
    fn poll(&mut self) -> Vec<InboundMessage>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval_ms: u64,
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn fixed(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            max_attempts: None,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            interval_ms: config.retry_interval_ms,
            max_attempts: config.max_attempts,
        }
    }

    pub fn allows_another(&self, failed_attempts: u32) -> bool {
        self.max_attempts
            .map(|max| failed_attempts < max)
            .unwrap_or(true)
    }
}

const XORSHIFT_FALLBACK_SEED: u32 = 0x9E37_79B9;

/// Pseudo-random client identifiers of the form `<prefix>-<hex>`, with the
/// numeric part drawn from `0..0xffff`.
#[derive(Debug, Clone)]
pub struct ClientIdGenerator {
    prefix: String,
    state: u32,
}

impl ClientIdGenerator {
    pub fn new(prefix: impl Into<String>, seed: u64) -> Self {
        let folded = (seed ^ (seed >> 32)) as u32;
        Self {
            prefix: prefix.into(),
            state: if folded == 0 {
                XORSHIFT_FALLBACK_SEED
            } else {
                folded
            },
        }
    }

    pub fn next_id(&mut self) -> String {
        let n = self.next_u32() % 0xffff;
        format!("{}-{n:x}", self.prefix)
    }

    fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    state: ConnectionState,
    ids: ClientIdGenerator,
    failed_attempts: u32,
    connects: u64,
    client_id: Option<String>,
}

impl Session {
    pub fn new(ids: ClientIdGenerator) -> Self {
        Self {
            state: ConnectionState::Idle,
            ids,
            failed_attempts: 0,
            connects: 0,
            client_id: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Failed attempts since the last successful connect.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn connects(&self) -> u64 {
        self.connects
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    fn enter(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("mqtt session {} -> {}", self.state.as_str(), next.as_str());
            self.state = next;
        }
    }

    pub fn link_lost(&mut self) {
        if self.state == ConnectionState::Connected {
            self.enter(ConnectionState::Reconnecting);
        }
    }

    /// Enters `Connecting` with a freshly drawn client id.
    pub fn begin_attempt(&mut self) -> String {
        if self.state != ConnectionState::Reconnecting {
            self.enter(ConnectionState::Connecting);
        }
        let id = self.ids.next_id();
        self.client_id = Some(id.clone());
        id
    }

    pub fn attempt_succeeded(&mut self) {
        self.enter(ConnectionState::Connected);
        self.failed_attempts = 0;
        self.connects = self.connects.saturating_add(1);
    }

    /// Returns the failure count of the current outage, starting at 1.
    pub fn attempt_failed(&mut self) -> u32 {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        self.failed_attempts
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn client_ids_use_prefix_and_bounded_hex() {
        let mut ids = ClientIdGenerator::new("ESPlant", 123_456);

        for _ in 0..200 {
            let id = ids.next_id();
            let suffix = id.strip_prefix("ESPlant-").unwrap();
            let value = u32::from_str_radix(suffix, 16).unwrap();
            assert!(value < 0xffff);
            assert_eq!(suffix, suffix.to_ascii_lowercase());
        }
    }

    #[test]
    fn client_ids_are_reproducible_per_seed() {
        let mut first = ClientIdGenerator::new("node", 42);
        let mut second = ClientIdGenerator::new("node", 42);
        let mut other = ClientIdGenerator::new("node", 43);

        let a: Vec<String> = (0..5).map(|_| first.next_id()).collect();
        let b: Vec<String> = (0..5).map(|_| second.next_id()).collect();
        let c: Vec<String> = (0..5).map(|_| other.next_id()).collect();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn zero_seed_still_produces_varied_ids() {
        let mut ids = ClientIdGenerator::new("node", 0);
        let first = ids.next_id();
        let second = ids.next_id();
        assert_ne!(first, second);
    }

    #[test]
    fn retry_policy_is_unbounded_by_default() {
        let policy = RetryPolicy::from_config(&SessionConfig::default());

        assert_eq!(policy.interval_ms, 5_000);
        assert!(policy.allows_another(u32::MAX - 1));

        let bounded = RetryPolicy {
            interval_ms: 5_000,
            max_attempts: Some(3),
        };
        assert!(bounded.allows_another(2));
        assert!(!bounded.allows_another(3));
    }

    #[test]
    fn session_walks_connection_states() {
        let mut session = Session::new(ClientIdGenerator::new("node", 7));
        assert_eq!(session.state(), ConnectionState::Idle);

        let first_id = session.begin_attempt();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(session.client_id(), Some(first_id.as_str()));
        assert_eq!(session.attempt_failed(), 1);
        assert_eq!(session.attempt_failed(), 2);

        session.begin_attempt();
        session.attempt_succeeded();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.failed_attempts(), 0);
        assert_eq!(session.connects(), 1);

        session.link_lost();
        assert_eq!(session.state(), ConnectionState::Reconnecting);
        session.begin_attempt();
        assert_eq!(session.state(), ConnectionState::Reconnecting);
        assert_eq!(session.attempt_failed(), 1);
    }

    #[test]
    fn transitions_are_reported_by_state_name() {
        let mut session = Session::new(ClientIdGenerator::new("node", 7));
        let mut seen = vec![session.state().as_str()];

        session.begin_attempt();
        seen.push(session.state().as_str());
        session.attempt_succeeded();
        seen.push(session.state().as_str());
        session.link_lost();
        seen.push(session.state().as_str());

        assert_eq!(seen, vec!["IDLE", "CONNECTING", "CONNECTED", "RECONNECTING"]);
    }

    #[test]
    fn link_lost_is_ignored_before_first_connect() {
        let mut session = Session::new(ClientIdGenerator::new("node", 7));
        session.link_lost();
        assert_eq!(session.state(), ConnectionState::Idle);
    }
}
