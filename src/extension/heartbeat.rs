//! Heartbeat extension
//!
//! Each side serves `rpc.heartbeat/ping` and pings its peer every interval.
//! A pong that does not arrive within the timeout closes the connection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{Extension, ExtensionFactory};
use crate::protocol::ServiceCallIdentifier;
use crate::rpc::{ClientTransport, ServiceRegistry};

pub const HEARTBEAT_EXTENSION: &str = "heartbeat";
pub const HEARTBEAT_SERVICE: &str = "rpc.heartbeat";

/// Shortest ping interval; smaller values are raised to it
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub nonce: u64,
}

fn ping_call() -> ServiceCallIdentifier {
    ServiceCallIdentifier::new(HEARTBEAT_SERVICE, "ping")
}

/// Round-trip figures shared by every connection a factory serves
#[derive(Debug, Default)]
pub struct HeartbeatStats {
    beats: AtomicU64,
    last_rtt_us: AtomicU64,
}

impl HeartbeatStats {
    /// Pongs received so far
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    /// Most recent round trip, if any pong arrived
    pub fn last_rtt(&self) -> Option<Duration> {
        match self.beats() {
            0 => None,
            _ => Some(Duration::from_micros(self.last_rtt_us.load(Ordering::Relaxed))),
        }
    }

    fn record(&self, rtt: Duration) {
        self.last_rtt_us
            .store(rtt.as_micros().min(u64::MAX as u128) as u64, Ordering::Relaxed);
        self.beats.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct HeartbeatFactory {
    interval: Duration,
    timeout: Duration,
    stats: Arc<HeartbeatStats>,
}

impl HeartbeatFactory {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        if interval < MIN_HEARTBEAT_INTERVAL {
            warn!(?interval, "heartbeat interval too short; using {:?}", MIN_HEARTBEAT_INTERVAL);
        }
        Self {
            interval: interval.max(MIN_HEARTBEAT_INTERVAL),
            timeout,
            stats: Arc::new(HeartbeatStats::default()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stats(&self) -> Arc<HeartbeatStats> {
        self.stats.clone()
    }
}

impl From<&crate::config::Config> for HeartbeatFactory {
    fn from(config: &crate::config::Config) -> Self {
        Self::new(
            Duration::from_millis(config.heartbeat.interval_ms),
            Duration::from_millis(config.heartbeat.timeout_ms),
        )
    }
}

impl ExtensionFactory for HeartbeatFactory {
    fn name(&self) -> &str {
        HEARTBEAT_EXTENSION
    }

    fn create(&self) -> Arc<dyn Extension> {
        Arc::new(Heartbeat {
            interval: self.interval,
            timeout: self.timeout,
            stats: self.stats.clone(),
        })
    }
}

struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    stats: Arc<HeartbeatStats>,
}

#[async_trait]
impl Extension for Heartbeat {
    fn name(&self) -> &str {
        HEARTBEAT_EXTENSION
    }

    fn register_services(self: Arc<Self>, registry: &mut ServiceRegistry) {
        registry.register_unary(ping_call(), |ping: Ping| async move { Ok(Pong { nonce: ping.nonce }) });
    }

    async fn run(self: Arc<Self>, transport: ClientTransport) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        let call = ping_call();
        let mut nonce = 0u64;
        loop {
            ticker.tick().await;
            nonce += 1;

            let sent_at = Instant::now();
            let outcome =
                tokio::time::timeout(self.timeout, transport.unary::<_, Pong>(&call, &Ping { nonce })).await;

            match outcome {
                Ok(Ok(pong)) if pong.nonce == nonce => {
                    let rtt = sent_at.elapsed();
                    self.stats.record(rtt);
                    debug!(nonce, rtt_us = rtt.as_micros() as u64, "heartbeat");
                }
                Ok(Ok(pong)) => {
                    anyhow::bail!("heartbeat answered with nonce {} instead of {}", pong.nonce, nonce);
                }
                Ok(Err(e)) if e.is_connection_closed() => return Ok(()),
                Ok(Err(e)) => {
                    warn!(error = %e, "heartbeat failed; closing connection");
                    transport.close().await;
                    return Err(e.into());
                }
                Err(_) => {
                    warn!(timeout_ms = self.timeout.as_millis() as u64, "peer missed heartbeat; closing connection");
                    transport.close().await;
                    anyhow::bail!("no pong within {:?}", self.timeout);
                }
            }
        }
    }
}
