use std::net::Ipv4Addr;

use log::{debug, info, warn};
use thiserror::Error;

use crate::{clock::Clock, config::NetworkConfig};

const REJOIN_EVERY_POLLS: u32 = 20;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("wifi link failed to start: {0:#}")]
    Link(anyhow::Error),
    #[error("wifi association with `{ssid}` timed out after {elapsed_ms} ms")]
    Timeout { ssid: String, elapsed_ms: u64 },
}

/// Station-mode radio link.
pub trait Link {
    fn begin(&mut self, ssid: &str, passphrase: &str) -> anyhow::Result<()>;

    fn is_associated(&mut self) -> bool;

    /// Re-issues the join request after a stalled association.
    fn rejoin(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn local_ip(&self) -> Option<Ipv4Addr>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub ip: Option<Ipv4Addr>,
    pub elapsed_ms: u64,
    pub polls: u32,
    /// Timing-derived seed for the session client id generator.
    pub seed: u64,
}

/// Joins the configured access point, polling every `wifi_poll_ms`.
/// Blocks forever unless `wifi_timeout_ms` is set.
pub fn associate<L, C>(
    link: &mut L,
    clock: &mut C,
    network: &NetworkConfig,
) -> Result<Association, BootstrapError>
where
    L: Link,
    C: Clock,
{
    info!("connecting to `{}`", network.wifi_ssid);

    link.begin(&network.wifi_ssid, &network.wifi_pass)
        .map_err(BootstrapError::Link)?;

    let started_ms = clock.now_ms();
    let mut polls = 0_u32;

    while !link.is_associated() {
        let elapsed_ms = clock.now_ms().saturating_sub(started_ms);
        if let Some(timeout_ms) = network.wifi_timeout_ms {
            if elapsed_ms >= timeout_ms {
                return Err(BootstrapError::Timeout {
                    ssid: network.wifi_ssid.clone(),
                    elapsed_ms,
                });
            }
        }

        clock.sleep_ms(network.wifi_poll_ms);
        polls = polls.saturating_add(1);
        debug!(".");

        if polls % REJOIN_EVERY_POLLS == 0 {
            info!(
                "still waiting for `{}` after {} ms",
                network.wifi_ssid,
                clock.now_ms().saturating_sub(started_ms)
            );
            if let Err(err) = link.rejoin() {
                warn!("wifi rejoin failed: {err:#}");
            }
        }
    }

    let association = Association {
        ip: link.local_ip(),
        elapsed_ms: clock.now_ms().saturating_sub(started_ms),
        polls,
        seed: clock.now_us(),
    };

    match association.ip {
        Some(ip) => info!("wifi connected, IP address: {ip}"),
        None => info!("wifi connected"),
    }

    Ok(association)
}
