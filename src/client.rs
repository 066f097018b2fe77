//! Entry point tying the transport, registry and sessions together.
//! Provides discovery of plugs on the local segment and session creation.

use crate::config::Config;
use crate::device::Device;
use crate::error::{OrviboError, Result};
use crate::protocol::{Command, PORT, encode_discovery_request};
use crate::registry::{Registry, StateEvent};
use crate::transaction::TransactionEngine;
use crate::transport::{Transport, UdpTransport};
use futures_core::stream::Stream;
use futures_util::StreamExt;
use futures_util::future::join_all;
use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Duration;

/// A client for Orvibo S20 plugs sharing one UDP endpoint.
///
/// All sessions opened from a client share its transport. Dropping the client
/// and every session it opened stops the background receive task.
#[derive(Clone)]
pub struct Client {
    config: Config,
    engine: TransactionEngine,
}

impl Client {
    /// Bind the protocol port and start receiving.
    ///
    /// Must be called within a tokio runtime. Fails if the port cannot be bound.
    pub fn bind(config: Config) -> Result<Self> {
        let transport = UdpTransport::bind(&config)?;
        Ok(Self::with_transport(Arc::new(transport), config))
    }

    /// Use an already constructed transport.
    pub fn with_transport(transport: Arc<dyn Transport>, config: Config) -> Self {
        let registry = Registry::start(transport, config.slot_retention());
        Self {
            engine: TransactionEngine::new(registry, config.retries),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        self.engine.registry()
    }

    /// Discover plugs on the local network using the configured window.
    pub async fn discover(&self) -> BTreeSet<IpAddr> {
        self.discover_with_timeout(self.config.discovery_timeout).await
    }

    /// Discover plugs, waiting `timeout` after each of the `retries` broadcasts.
    ///
    /// Collects for the whole window rather than stopping at the first answer.
    pub async fn discover_with_timeout(&self, timeout: Duration) -> BTreeSet<IpAddr> {
        info!("Discovering S20 plugs on port {}...", PORT);
        let hosts: BTreeSet<IpAddr> = self.discover_stream_with_timeout(timeout).collect().await;
        info!("Discovery finished. Found {} plugs.", hosts.len());
        hosts
    }

    /// Yield each plug as soon as it first answers a discovery broadcast.
    pub fn discover_stream(&self) -> impl Stream<Item = IpAddr> + Send + 'static {
        self.discover_stream_with_timeout(self.config.discovery_timeout)
    }

    fn discover_stream_with_timeout(
        &self,
        timeout: Duration,
    ) -> impl Stream<Item = IpAddr> + Send + 'static {
        self.engine.enumerate(
            encode_discovery_request(),
            Command::DiscoveryResponse,
            timeout,
        )
    }

    /// Open a session with the plug at `host` (an IP address or a resolvable name).
    pub async fn open_session(&self, host: &str) -> Result<Device> {
        let addr = resolve(host).await?;
        Device::connect(self.engine.clone(), host, addr, &self.config).await
    }

    /// Discover all plugs and open a session with each one that responds.
    pub async fn open_all(&self) -> BTreeMap<IpAddr, Device> {
        let hosts = self.discover().await;
        let opened = join_all(hosts.into_iter().map(|addr| {
            Device::connect(self.engine.clone(), addr.to_string(), addr, &self.config)
        }))
        .await;

        let mut devices = BTreeMap::new();
        for res in opened {
            match res {
                Ok(device) => {
                    info!("Discovered S20 plug on {}", device.addr());
                    devices.insert(device.addr(), device);
                }
                Err(e) => warn!("Skipping plug: {}", e),
            }
        }
        info!("{} plugs opened in total", devices.len());
        devices
    }

    /// State changes reported by any plug, including local button presses.
    ///
    /// Ends when the client is shut down.
    pub fn watch(&self) -> impl Stream<Item = StateEvent> + Send + 'static {
        let mut rx = self.registry().events();
        let stop_token = self.registry().stop_token();
        async_stream::stream! {
            loop {
                let res = tokio::select! {
                    _ = stop_token.cancelled() => break,
                    res = rx.recv() => res,
                };
                match res {
                    Ok(event) => yield event,
                    Err(RecvError::Lagged(missed)) => {
                        warn!("State watcher lagged, skipped {} events", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// Stop receiving. Open sessions will fail their next exchange.
    pub fn shutdown(&self) {
        self.registry().shutdown();
    }
}

async fn resolve(host: &str) -> Result<IpAddr> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Ok(addr);
    }
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, PORT))
        .await
        .map_err(|_| OrviboError::Resolve(host.to_string()))?
        .map(|sa| sa.ip())
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or(addrs.first())
        .copied()
        .ok_or_else(|| OrviboError::Resolve(host.to_string()))
}
