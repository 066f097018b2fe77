//! Send-retry-await-match exchanges over the shared transport.
//!
//! UDP is stateless and not guaranteed, so every exchange sends its request
//! up to `retries` times and, after each send, waits up to `timeout` for a
//! datagram that decodes as the expected response and passes the caller's
//! match. Frames that fail either check are dropped without failing the
//! exchange; only running out of attempts does that.

use crate::error::Result;
use crate::protocol::{Command, Frame};
use crate::registry::Registry;
use futures_core::stream::Stream;
use log::{debug, trace, warn};
use std::collections::HashSet;
use std::net::IpAddr;
use tokio::time::{Duration, Instant, timeout_at};

/// Where a request is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Unicast(IpAddr),
    Broadcast,
}

/// Runs exchanges against the mailbox of a [`Registry`].
#[derive(Clone)]
pub struct TransactionEngine {
    registry: Registry,
    retries: u32,
}

impl TransactionEngine {
    pub fn new(registry: Registry, retries: u32) -> Self {
        Self { registry, retries }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Send `request` to `destination` and wait for a reply from `reply_from`.
    ///
    /// A reply is accepted once it decodes as `expected` and `accept` maps the
    /// frame to `Some`. Returns the first accepted value as soon as it arrives,
    /// or `None` once every attempt has waited out its `timeout`.
    pub async fn exchange<T, F>(
        &self,
        request: &[u8],
        destination: Destination,
        reply_from: IpAddr,
        expected: Command,
        timeout: Duration,
        mut accept: F,
    ) -> Option<T>
    where
        F: FnMut(Frame) -> Option<T>,
    {
        let mailbox = self.registry.mailbox();

        // A leftover datagram belongs to some earlier exchange.
        if mailbox.discard(reply_from) {
            debug!("Dropped stale datagram from {}", reply_from);
        }

        for attempt in 1..=self.retries {
            if let Err(e) = self.send(destination, request).await {
                warn!("Failed to send {:?} to {:?}: {}", expected, destination, e);
            }

            let deadline = Instant::now() + timeout;
            loop {
                let notified = mailbox.notified();
                if let Some(payload) = mailbox.take(reply_from) {
                    match Frame::decode(&payload, expected).and_then(&mut accept) {
                        Some(value) => return Some(value),
                        None => {
                            trace!("Ignoring unmatched datagram from {}", reply_from);
                            continue;
                        }
                    }
                }
                if timeout_at(deadline, notified).await.is_err() {
                    break;
                }
            }

            debug!(
                "No {:?} from {} (attempt {}/{})",
                expected, reply_from, attempt, self.retries
            );
        }

        None
    }

    /// Broadcast `request` and yield every distinct host that answers with
    /// `expected` while the full `retries` x `timeout` window runs.
    pub fn enumerate(
        &self,
        request: Vec<u8>,
        expected: Command,
        timeout: Duration,
    ) -> impl Stream<Item = IpAddr> + Send + 'static {
        let engine = self.clone();
        async_stream::stream! {
            let mailbox = engine.registry.mailbox().clone();
            let started = Instant::now();
            let mut seen = HashSet::new();

            for attempt in 1..=engine.retries {
                if let Err(e) = engine.send(Destination::Broadcast, &request).await {
                    warn!("Failed to send {:?} broadcast: {}", expected, e);
                }
                trace!("Collecting {:?} replies (attempt {}/{})", expected, attempt, engine.retries);

                let deadline = Instant::now() + timeout;
                loop {
                    let notified = mailbox.notified();
                    for (host, payload) in mailbox.received_since(started) {
                        if seen.contains(&host) || Frame::decode(&payload, expected).is_none() {
                            continue;
                        }
                        debug!("Discovered device at {}", host);
                        seen.insert(host);
                        yield host;
                    }
                    if timeout_at(deadline, notified).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn send(&self, destination: Destination, request: &[u8]) -> Result<()> {
        let transport = self.registry.transport();
        match destination {
            Destination::Unicast(host) => transport.send_to(host, request).await,
            Destination::Broadcast => transport.send_broadcast(request).await,
        }
    }
}
