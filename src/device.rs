//! Per-plug session: identity, subscription freshness and power state.
//!
//! A [`Device`] only exists once its MAC address has been discovered, so
//! subscribe and control requests can never be built without one.

use crate::config::Config;
use crate::error::{OrviboError, Result};
use crate::protocol::{
    Command, Frame, MacAddress, encode_control_request, encode_discovery_request,
    encode_subscribe_request,
};
use crate::transaction::{Destination, TransactionEngine};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Snapshot of a session, suitable for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub host: String,
    pub addr: IpAddr,
    pub mac: MacAddress,
    pub on: Option<bool>,
    pub subscribed: bool,
}

/// Controls one Orvibo S20 WiFi smart plug.
///
/// Clones share the same subscription. The known power state is whatever the
/// plug last reported to the registry, so a switch pressed on the plug itself
/// is seen as soon as the plug pushes it.
#[derive(Clone)]
pub struct Device {
    host: String,
    addr: IpAddr,
    mac: MacAddress,
    mac_reversed: MacAddress,
    engine: TransactionEngine,
    timeout: Duration,
    subscription_timeout: Duration,
    last_subscribed: Arc<Mutex<Option<Instant>>>,
}

impl Device {
    /// Discover the MAC address of the plug at `addr` and subscribe to it.
    ///
    /// Discovery is a broadcast that every plug answers; only the reply from
    /// `addr` is used. Failing to discover is fatal for the session. The
    /// initial subscription is not: if it gets no answer the session is still
    /// returned, and the next control request subscribes first.
    pub async fn connect(
        engine: TransactionEngine,
        host: impl Into<String>,
        addr: IpAddr,
        config: &Config,
    ) -> Result<Self> {
        let host = host.into();
        let (mac, mac_reversed) = engine
            .exchange(
                &encode_discovery_request(),
                Destination::Broadcast,
                addr,
                Command::DiscoveryResponse,
                config.discovery_timeout,
                |frame| match frame {
                    Frame::DiscoveryResponse { mac, mac_reversed } => Some((mac, mac_reversed)),
                    _ => None,
                },
            )
            .await
            .ok_or_else(|| OrviboError::Discovery(host.clone()))?;
        debug!("Discovered MAC of {}: {}", host, mac);

        let device = Self {
            host,
            addr,
            mac,
            mac_reversed,
            engine,
            timeout: config.timeout,
            subscription_timeout: config.subscription_timeout,
            last_subscribed: Arc::new(Mutex::new(None)),
        };

        if let Err(e) = device.subscribe().await {
            warn!("Initial subscription failed: {}", e);
        }
        info!("Opened session with {} ({})", device.host, device.mac);
        Ok(device)
    }

    /// Host name or address the session was opened with.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Address replies are correlated by.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn mac_reversed(&self) -> MacAddress {
        self.mac_reversed
    }

    /// State last reported by the plug: a subscription reply, a control ack
    /// or a push after a local switch.
    pub fn cached_state(&self) -> Option<bool> {
        self.engine.registry().reported_state(self.addr, self.mac)
    }

    pub fn last_subscribed(&self) -> Option<Instant> {
        *self.last_subscribed.lock()
    }

    /// Whether the last subscription is recent enough to authorize control.
    pub fn subscription_is_fresh(&self) -> bool {
        self.last_subscribed()
            .is_some_and(|at| at.elapsed() < self.subscription_timeout)
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            host: self.host.clone(),
            addr: self.addr,
            mac: self.mac,
            on: self.cached_state(),
            subscribed: self.last_subscribed().is_some(),
        }
    }

    /// Query the power state.
    ///
    /// Always asks the plug (a subscription doubles as a state query), which
    /// also renews the subscription.
    pub async fn get_state(&self) -> Result<bool> {
        self.subscribe().await
    }

    /// Switch the plug on (`true`) or off (`false`).
    ///
    /// A stale subscription is renewed first. When the known state already
    /// equals `on`, nothing is sent. Otherwise the plug must acknowledge
    /// exactly the requested state; acks for the other state are retried and
    /// never accepted.
    pub async fn set_state(&self, on: bool) -> Result<()> {
        let current = if self.subscription_is_fresh() {
            self.cached_state()
        } else {
            Some(self.subscribe().await?)
        };

        if current == Some(on) {
            debug!("{} is already {}, not sending control", self.host, on_off(on));
            return Ok(());
        }

        debug!("Sending new state to {}: {}", self.host, on_off(on));
        let acked = self
            .engine
            .exchange(
                &encode_control_request(&self.mac, on),
                Destination::Unicast(self.addr),
                self.addr,
                Command::ControlResponse,
                self.timeout,
                |frame| match frame {
                    Frame::ControlResponse { on: ack, .. } if ack == on => Some(()),
                    _ => None,
                },
            )
            .await;

        match acked {
            Some(()) => {
                debug!("Received state ack from {}, state: {}", self.host, on_off(on));
                Ok(())
            }
            None => {
                self.engine.registry().forget_state(self.addr);
                Err(OrviboError::ControlAck(self.host.clone()))
            }
        }
    }

    pub async fn turn_on(&self) -> Result<()> {
        self.set_state(true).await
    }

    pub async fn turn_off(&self) -> Result<()> {
        self.set_state(false).await
    }

    /// Subscribe to the plug: reports its state and authorizes control
    /// requests for a while.
    async fn subscribe(&self) -> Result<bool> {
        let on = self
            .engine
            .exchange(
                &encode_subscribe_request(&self.mac, &self.mac_reversed),
                Destination::Unicast(self.addr),
                self.addr,
                Command::SubscribeResponse,
                self.timeout,
                |frame| match frame {
                    Frame::SubscribeResponse { on, .. } => Some(on),
                    _ => None,
                },
            )
            .await
            .ok_or_else(|| OrviboError::Subscription(self.host.clone()))?;

        debug!("Successfully subscribed to {}, state: {}", self.host, on_off(on));
        let now = Instant::now();
        let mut last = self.last_subscribed.lock();
        *last = Some(last.map_or(now, |at| at.max(now)));
        Ok(on)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("host", &self.host)
            .field("addr", &self.addr)
            .field("mac", &self.mac)
            .finish_non_exhaustive()
    }
}

fn on_off(on: bool) -> &'static str {
    if on { "ON" } else { "OFF" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::testing::{FakeNetwork, FakePlug, host};

    fn config() -> Config {
        Config::default()
            .with_timeout(Duration::from_millis(500))
            .with_discovery_timeout(Duration::from_millis(500))
    }

    async fn open(plug: &Arc<FakePlug>, others: Vec<Arc<FakePlug>>) -> Result<Device> {
        let mut plugs = vec![plug.clone()];
        plugs.extend(others);
        open_on(FakeNetwork::new(plugs), plug).await
    }

    async fn open_on(network: Arc<FakeNetwork>, plug: &FakePlug) -> Result<Device> {
        let config = config();
        let registry = Registry::start(network, config.slot_retention());
        let engine = TransactionEngine::new(registry, config.retries);
        Device::connect(engine, plug.addr.to_string(), plug.addr, &config).await
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_discovers_own_mac_among_many() {
        let plug = Arc::new(FakePlug::new(30, true));
        let other = Arc::new(FakePlug::new(31, false));
        let device = open(&plug, vec![other.clone()]).await.unwrap();

        assert_eq!(device.mac(), plug.mac);
        assert_eq!(device.mac_reversed(), plug.mac.reversed());
        assert_eq!(device.cached_state(), Some(true));
        assert!(device.subscription_is_fresh());
        assert_eq!(plug.subscribe_requests(), 1);
        assert_eq!(other.subscribe_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_fails_without_discovery_reply() {
        let plug = Arc::new(FakePlug::new(30, true).silent());
        let err = open(&plug, Vec::new()).await.unwrap_err();
        assert_eq!(err, OrviboError::Discovery(host(30).to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_survives_failed_initial_subscription() {
        let plug = Arc::new(FakePlug::new(30, true).muting_subscribe());
        let device = open(&plug, Vec::new()).await.unwrap();

        assert_eq!(plug.discovery_requests(), 1);
        assert_eq!(device.last_subscribed(), None);
        assert_eq!(device.cached_state(), None);
        assert!(!device.subscription_is_fresh());

        plug.set_subscribe_muted(false);
        assert!(device.get_state().await.unwrap());
        assert!(device.last_subscribed().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_state_always_queries() {
        let plug = Arc::new(FakePlug::new(30, false));
        let device = open(&plug, Vec::new()).await.unwrap();
        let first = device.last_subscribed().unwrap();

        plug.set_on(true);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(device.get_state().await.unwrap());
        assert_eq!(plug.subscribe_requests(), 2);
        assert!(device.last_subscribed().unwrap() > first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_state_fails_when_plug_goes_quiet() {
        let plug = Arc::new(FakePlug::new(30, false));
        let device = open(&plug, Vec::new()).await.unwrap();

        // Dropped requests look the same as a plug that stopped answering.
        plug.drop_next(3);
        let err = device.get_state().await.unwrap_err();
        assert_eq!(err, OrviboError::Subscription(host(30).to_string()));
        assert!(err.is_recoverable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_state_to_current_state_sends_no_control() {
        let plug = Arc::new(FakePlug::new(30, true));
        let device = open(&plug, Vec::new()).await.unwrap();

        device.set_state(true).await.unwrap();
        assert_eq!(plug.control_requests(), 0);
        assert!(device.get_state().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_state_switches_plug() {
        let plug = Arc::new(FakePlug::new(30, false));
        let device = open(&plug, Vec::new()).await.unwrap();

        device.turn_on().await.unwrap();
        assert_eq!(plug.control_requests(), 1);
        assert!(plug.is_on());
        assert_eq!(device.cached_state(), Some(true));
        assert!(device.get_state().await.unwrap());

        device.turn_off().await.unwrap();
        assert_eq!(plug.control_requests(), 2);
        assert!(!plug.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_ack_is_not_success() {
        let plug = Arc::new(FakePlug::new(30, false).inverting_acks());
        let device = open(&plug, Vec::new()).await.unwrap();

        let err = device.set_state(true).await.unwrap_err();
        assert_eq!(err, OrviboError::ControlAck(host(30).to_string()));
        assert_eq!(plug.control_requests(), 3);
        assert_eq!(device.cached_state(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_subscription_is_renewed_before_control() {
        let plug = Arc::new(FakePlug::new(30, false));
        let device = open(&plug, Vec::new()).await.unwrap();
        assert_eq!(plug.subscribe_requests(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!device.subscription_is_fresh());

        device.set_state(true).await.unwrap();
        assert_eq!(plug.subscribe_requests(), 2);
        assert_eq!(plug.control_requests(), 1);
        assert!(device.subscription_is_fresh());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_reveals_state_already_reached() {
        let plug = Arc::new(FakePlug::new(30, false));
        let device = open(&plug, Vec::new()).await.unwrap();

        plug.set_on(true);
        tokio::time::advance(Duration::from_secs(61)).await;
        device.set_state(true).await.unwrap();
        assert_eq!(plug.subscribe_requests(), 2);
        assert_eq!(plug.control_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_subscription_is_not_renewed() {
        let plug = Arc::new(FakePlug::new(30, false));
        let device = open(&plug, Vec::new()).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        device.set_state(true).await.unwrap();
        assert_eq!(plug.subscribe_requests(), 1);
        assert_eq!(plug.control_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_info_snapshot() {
        let plug = Arc::new(FakePlug::new(30, true));
        let device = open(&plug, Vec::new()).await.unwrap();

        let info = device.info();
        assert_eq!(info.addr, host(30));
        assert_eq!(info.on, Some(true));
        assert!(info.subscribed);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["mac"], "ACCF2300001E");
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_switch_is_seen_before_control() {
        let plug = Arc::new(FakePlug::new(30, false));
        let network = FakeNetwork::new(vec![plug.clone()]);
        let device = open_on(network.clone(), &plug).await.unwrap();
        assert_eq!(device.cached_state(), Some(false));

        // Someone presses the button; the plug pushes its new state.
        plug.set_on(true);
        network.inject(
            plug.addr,
            Frame::ControlResponse {
                mac: plug.mac,
                on: true,
            }
            .encode(),
        );
        settle().await;
        assert_eq!(device.cached_state(), Some(true));
        assert!(device.subscription_is_fresh());

        device.set_state(false).await.unwrap();
        assert_eq!(plug.control_requests(), 1);
        assert!(!plug.is_on());
        assert!(!device.get_state().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_for_another_plug_is_ignored() {
        let plug = Arc::new(FakePlug::new(30, true));
        let network = FakeNetwork::new(vec![plug.clone()]);
        let device = open_on(network.clone(), &plug).await.unwrap();

        network.inject(
            plug.addr,
            Frame::ControlResponse {
                mac: MacAddress::default(),
                on: false,
            }
            .encode(),
        );
        settle().await;
        assert_eq!(device.cached_state(), None);

        // With the state unknown the control request goes out.
        device.set_state(true).await.unwrap();
        assert_eq!(plug.control_requests(), 1);
        assert!(plug.is_on());
    }
}
