//! In-memory network of simulated plugs, used in place of the UDP socket.

use crate::error::{OrviboError, Result};
use crate::protocol::{Frame, MacAddress};
use crate::transport::{Datagram, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

pub(crate) fn host(last_octet: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 168, 1, last_octet))
}

/// A simulated S20 answering the requests addressed to it.
pub(crate) struct FakePlug {
    pub addr: IpAddr,
    pub mac: MacAddress,
    on: Mutex<bool>,
    silent: bool,
    invert_acks: bool,
    duplicate_replies: bool,
    subscribe_muted: AtomicBool,
    drop_remaining: AtomicUsize,
    discovery_requests: AtomicUsize,
    subscribe_requests: AtomicUsize,
    control_requests: AtomicUsize,
}

impl FakePlug {
    pub fn new(last_octet: u8, on: bool) -> Self {
        Self {
            addr: host(last_octet),
            mac: MacAddress::new([0xAC, 0xCF, 0x23, 0x00, 0x00, last_octet]),
            on: Mutex::new(on),
            silent: false,
            invert_acks: false,
            duplicate_replies: false,
            subscribe_muted: AtomicBool::new(false),
            drop_remaining: AtomicUsize::new(0),
            discovery_requests: AtomicUsize::new(0),
            subscribe_requests: AtomicUsize::new(0),
            control_requests: AtomicUsize::new(0),
        }
    }

    /// Never answers anything.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Ignores the first `count` requests it receives.
    pub fn dropping_first(self, count: usize) -> Self {
        self.drop_next(count);
        self
    }

    /// Ignores the next `count` requests it receives.
    pub fn drop_next(&self, count: usize) {
        self.drop_remaining.store(count, Ordering::SeqCst);
    }

    /// Answers discovery but ignores subscribe requests.
    pub fn muting_subscribe(self) -> Self {
        self.set_subscribe_muted(true);
        self
    }

    pub fn set_subscribe_muted(&self, muted: bool) {
        self.subscribe_muted.store(muted, Ordering::SeqCst);
    }

    /// Acknowledges control requests with the opposite state.
    pub fn inverting_acks(mut self) -> Self {
        self.invert_acks = true;
        self
    }

    /// Sends every reply twice.
    pub fn duplicating(mut self) -> Self {
        self.duplicate_replies = true;
        self
    }

    pub fn is_on(&self) -> bool {
        *self.on.lock()
    }

    pub fn set_on(&self, on: bool) {
        *self.on.lock() = on;
    }

    pub fn discovery_requests(&self) -> usize {
        self.discovery_requests.load(Ordering::SeqCst)
    }

    pub fn subscribe_requests(&self) -> usize {
        self.subscribe_requests.load(Ordering::SeqCst)
    }

    pub fn control_requests(&self) -> usize {
        self.control_requests.load(Ordering::SeqCst)
    }

    fn respond(&self, request: Frame) -> Option<Frame> {
        match request {
            Frame::DiscoveryRequest => {
                self.discovery_requests.fetch_add(1, Ordering::SeqCst);
                Some(Frame::DiscoveryResponse {
                    mac: self.mac,
                    mac_reversed: self.mac.reversed(),
                })
            }
            Frame::SubscribeRequest { .. } if self.subscribe_muted.load(Ordering::SeqCst) => None,
            Frame::SubscribeRequest { mac, .. } if mac == self.mac => {
                self.subscribe_requests.fetch_add(1, Ordering::SeqCst);
                Some(Frame::SubscribeResponse {
                    mac: self.mac,
                    on: self.is_on(),
                })
            }
            Frame::ControlRequest { mac, on } if mac == self.mac => {
                self.control_requests.fetch_add(1, Ordering::SeqCst);
                if self.invert_acks {
                    return Some(Frame::ControlResponse { mac, on: !on });
                }
                self.set_on(on);
                Some(Frame::ControlResponse { mac, on })
            }
            _ => None,
        }
    }
}

/// A [`Transport`] whose peers are [`FakePlug`]s; replies are queued instantly.
pub(crate) struct FakeNetwork {
    plugs: Vec<Arc<FakePlug>>,
    inbound_tx: mpsc::UnboundedSender<Datagram>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    sends: AtomicUsize,
}

impl FakeNetwork {
    pub fn new(plugs: Vec<Arc<FakePlug>>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            plugs,
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            sends: AtomicUsize::new(0),
        })
    }

    /// Total datagrams sent through this network, unicast and broadcast.
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Deliver an arbitrary datagram as if `source` had sent it.
    pub fn inject(&self, source: IpAddr, payload: Vec<u8>) {
        let _ = self.inbound_tx.send(Datagram { source, payload });
    }

    fn deliver(&self, plug: &FakePlug, payload: &[u8]) {
        if plug.silent {
            return;
        }
        let Some(request) = Frame::parse(payload) else {
            return;
        };
        let dropped = plug
            .drop_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            return;
        }
        if let Some(reply) = plug.respond(request) {
            let bytes = reply.encode();
            if plug.duplicate_replies {
                self.inject(plug.addr, bytes.clone());
            }
            self.inject(plug.addr, bytes);
        }
    }
}

#[async_trait]
impl Transport for FakeNetwork {
    async fn send_to(&self, host: IpAddr, payload: &[u8]) -> Result<()> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if let Some(plug) = self.plugs.iter().find(|p| p.addr == host) {
            self.deliver(plug, payload);
        }
        Ok(())
    }

    async fn send_broadcast(&self, payload: &[u8]) -> Result<()> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        for plug in &self.plugs {
            self.deliver(plug, payload);
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Datagram> {
        self.inbound_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(OrviboError::Closed)
    }
}
