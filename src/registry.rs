//! Demultiplexing of datagrams arriving on the shared transport.
//!
//! A background task drains the [`Transport`] and stores each datagram in a
//! per-host mailbox slot. A slot holds only the latest unconsumed datagram
//! from its host: a newer datagram overwrites an unread one. This is a
//! deliberate lossy cache, not a queue. Exchanges are request/response and
//! only ever care about the current reply, so "latest value wins" is the
//! semantics control-ack matching relies on. The cost is that, under unlucky
//! timing, an unrelated datagram can overwrite a reply before its waiter
//! reads it; the waiting exchange then falls through to its next attempt.
//!
//! Slots nobody consumed (discovery replies, the echo of our own broadcasts,
//! strangers talking to the port) are pruned once they are older than the
//! retention window, which callers set to the longest exchange they run.
//!
//! The drain task also remembers the last power state each host reported,
//! whether in a subscription reply, a control ack, or pushed after a local
//! button press.

use crate::error::OrviboError;
use crate::protocol::{Frame, MacAddress};
use crate::transport::{Datagram, Transport};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, broadcast};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Pause after a failed receive before draining again.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);
const EVENT_CAPACITY: usize = 32;

/// A state change reported by a plug, either as a control acknowledgement or
/// pushed unsolicited after the plug was switched locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateEvent {
    pub host: IpAddr,
    pub mac: MacAddress,
    pub on: bool,
}

struct Slot {
    payload: Vec<u8>,
    received_at: Instant,
}

/// Per-host single-slot store with change notification.
pub(crate) struct Mailbox {
    slots: Mutex<HashMap<IpAddr, Slot>>,
    notify: Notify,
    retention: Duration,
}

impl Mailbox {
    fn new(retention: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            retention,
        }
    }

    /// Store `payload` as the current datagram of `host` and wake all waiters.
    ///
    /// Slots older than the retention window are dropped on the way.
    pub(crate) fn put(&self, host: IpAddr, payload: Vec<u8>) {
        let now = Instant::now();
        {
            let mut slots = self.slots.lock();
            let before = slots.len();
            slots.retain(|_, slot| now.duration_since(slot.received_at) <= self.retention);
            if slots.len() < before {
                trace!("Pruned {} expired datagrams", before - slots.len());
            }
            let previous = slots.insert(
                host,
                Slot {
                    payload,
                    received_at: now,
                },
            );
            if previous.is_some() {
                trace!("Overwrote unconsumed datagram from {}", host);
            }
        }
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Consume the current datagram of `host`.
    pub(crate) fn take(&self, host: IpAddr) -> Option<Vec<u8>> {
        self.slots.lock().remove(&host).map(|slot| slot.payload)
    }

    /// Drop whatever `host` left behind. Returns whether anything was dropped.
    pub(crate) fn discard(&self, host: IpAddr) -> bool {
        self.slots.lock().remove(&host).is_some()
    }

    /// Copies of all datagrams that arrived at or after `since`, left in place.
    pub(crate) fn received_since(&self, since: Instant) -> Vec<(IpAddr, Vec<u8>)> {
        self.slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.received_at >= since)
            .map(|(host, slot)| (*host, slot.payload.clone()))
            .collect()
    }

    /// A future completing on the next `put`.
    ///
    /// It observes every `put` made after this call returns, even before it is
    /// first polled, so create it before inspecting the slots.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

/// Owner of the shared transport and of the task that drains it.
///
/// Cloning is cheap; the drain task stops when the last clone is dropped or
/// [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    transport: Arc<dyn Transport>,
    mailbox: Arc<Mailbox>,
    states: Arc<StateBook>,
    events: broadcast::Sender<StateEvent>,
    cancel_token: CancellationToken,
}

/// Last state reported by each host.
type StateBook = Mutex<HashMap<IpAddr, StateEvent>>;

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl Registry {
    /// Start draining `transport`, keeping unconsumed datagrams for `retention`.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(transport: Arc<dyn Transport>, retention: Duration) -> Self {
        let mailbox = Arc::new(Mailbox::new(retention));
        let states = Arc::new(StateBook::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cancel_token = CancellationToken::new();

        tokio::spawn(drain(
            transport.clone(),
            mailbox.clone(),
            states.clone(),
            events.clone(),
            cancel_token.clone(),
        ));

        Self {
            inner: Arc::new(RegistryInner {
                transport,
                mailbox,
                states,
                events,
                cancel_token,
            }),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub(crate) fn mailbox(&self) -> &Arc<Mailbox> {
        &self.inner.mailbox
    }

    /// Subscribe to state changes reported by any plug.
    pub fn events(&self) -> broadcast::Receiver<StateEvent> {
        self.inner.events.subscribe()
    }

    /// The power state `host` last reported for the plug `mac`, if any.
    pub fn reported_state(&self, host: IpAddr, mac: MacAddress) -> Option<bool> {
        self.inner
            .states
            .lock()
            .get(&host)
            .filter(|event| event.mac == mac)
            .map(|event| event.on)
    }

    /// Forget what `host` reported, e.g. after it failed to acknowledge a change.
    pub fn forget_state(&self, host: IpAddr) {
        self.inner.states.lock().remove(&host);
    }

    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.inner.cancel_token.clone()
    }

    /// Stop the drain task. Pending and future exchanges will time out.
    pub fn shutdown(&self) {
        debug!("Stopping response registry");
        self.inner.cancel_token.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.inner.cancel_token.is_cancelled()
    }
}

async fn drain(
    transport: Arc<dyn Transport>,
    mailbox: Arc<Mailbox>,
    states: Arc<StateBook>,
    events: broadcast::Sender<StateEvent>,
    cancel_token: CancellationToken,
) {
    debug!("Starting response drain loop...");
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            res = transport.recv() => match res {
                Ok(Datagram { source, payload }) => {
                    match Frame::parse(&payload) {
                        Some(Frame::SubscribeResponse { mac, on }) => {
                            states.lock().insert(source, StateEvent { host: source, mac, on });
                        }
                        Some(Frame::ControlResponse { mac, on }) => {
                            let event = StateEvent { host: source, mac, on };
                            states.lock().insert(source, event);
                            let _ = events.send(event);
                        }
                        _ => {}
                    }
                    mailbox.put(source, payload);
                }
                Err(OrviboError::Closed) => {
                    warn!("Transport closed, response drain loop exiting");
                    break;
                }
                Err(e) => {
                    debug!("Receive failed: {}", e);
                    tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        _ = tokio::time::sleep(RECV_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
    }
    debug!("Response drain loop stopped");
}
