//! Client configuration.
//! Retry budget, per-attempt timeouts and socket addresses, loadable from JSON.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use tokio::time::Duration;

/// Attempts per exchange (UDP is best-effort).
pub const DEFAULT_RETRIES: u32 = 3;
/// How long each attempt waits for a reply.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
/// How long each discovery attempt collects replies.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(1);
/// Age after which a subscription must be renewed before a control request.
pub const DEFAULT_SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings shared by every exchange a [`Client`](crate::Client) performs.
///
/// Durations are (de)serialized as fractional seconds, and missing fields
/// fall back to their defaults:
///
/// ```
/// let config = orvibo::Config::from_json(r#"{ "retries": 5, "timeout": 0.5 }"#).unwrap();
/// assert_eq!(config.retries, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Send attempts per exchange. Zero means exchanges fail without sending.
    pub retries: u32,
    /// Reply wait per attempt for subscribe and control exchanges
    #[serde(with = "seconds")]
    pub timeout: Duration,
    /// Reply wait per attempt for discovery broadcasts
    #[serde(with = "seconds")]
    pub discovery_timeout: Duration,
    /// Maximum age of a subscription that still authorizes control requests
    #[serde(with = "seconds")]
    pub subscription_timeout: Duration,
    /// Local address the protocol port is bound on
    pub bind_addr: IpAddr,
    /// Destination of discovery broadcasts
    pub broadcast_addr: Ipv4Addr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            timeout: DEFAULT_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            subscription_timeout: DEFAULT_SUBSCRIPTION_TIMEOUT,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_addr: Ipv4Addr::BROADCAST,
        }
    }
}

impl Config {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the number of attempts per exchange.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the per-attempt reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the per-attempt discovery window.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set how long a subscription stays valid.
    pub fn with_subscription_timeout(mut self, timeout: Duration) -> Self {
        self.subscription_timeout = timeout;
        self
    }

    /// Set the local bind address.
    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the broadcast destination (e.g. a subnet-directed broadcast).
    pub fn with_broadcast_addr(mut self, addr: Ipv4Addr) -> Self {
        self.broadcast_addr = addr;
        self
    }

    /// Worst-case time one exchange can block.
    pub fn max_exchange_time(&self) -> Duration {
        self.timeout * self.retries
    }

    /// How long an unconsumed datagram is kept: the longest window any
    /// exchange or discovery can still be collecting in.
    pub fn slot_retention(&self) -> Duration {
        self.timeout.max(self.discovery_timeout) * self.retries
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use tokio::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
