// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Retransmit scheduler behind reliable sends.
//!
//! A single scanner task wakes at T1 resolution and reissues every due
//! entry, doubling its interval up to the entry's cap. The owning
//! transaction supplies an observer callback so the A/E/G backoff semantics
//! and give-up decisions stay with the transaction layer; the scheduler only
//! moves bytes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Endpoint, Transport};

/// Snapshot handed to the observer after each retransmission.
#[derive(Debug, Clone, Copy)]
pub struct RetransmitEvent {
    pub id: u64,
    /// Retransmissions performed so far (the initial send not included).
    pub attempts: u32,
    /// Whether the last transmission failed at the transport.
    pub delivery_failed: bool,
}

type Observer = Box<dyn Fn(RetransmitEvent) + Send + Sync>;

struct Entry {
    endpoint: Endpoint,
    payload: Bytes,
    next_due: Instant,
    interval: Duration,
    cap: Duration,
    attempts: u32,
}

struct QueueInner {
    entries: DashMap<u64, Entry>,
    observers: DashMap<u64, Observer>,
    /// Ids released by owners; reaped at the top of each scan. Releasing
    /// through a side table lets observers release from inside the callback
    /// without re-entering the entry maps.
    released: DashMap<u64, ()>,
    next_id: AtomicU64,
    resolution: Duration,
    cancel: CancellationToken,
}

/// Owner-side handle; dropping it releases the entry.
pub struct RetransmitHandle {
    id: u64,
    inner: Arc<QueueInner>,
}

impl RetransmitHandle {
    /// Stops retransmission of this entry.
    pub fn release(&self) {
        self.inner.released.insert(self.id, ());
    }

    /// The entry's identifier, matching [`RetransmitEvent::id`].
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for RetransmitHandle {
    fn drop(&mut self) {
        self.release();
    }
}

pub(crate) struct RetransmitQueue {
    inner: Arc<QueueInner>,
}

impl RetransmitQueue {
    pub(crate) fn new(resolution: Duration, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                entries: DashMap::new(),
                observers: DashMap::new(),
                released: DashMap::new(),
                next_id: AtomicU64::new(1),
                resolution,
                cancel,
            }),
        }
    }

    /// Stores bytes for periodic retransmission starting one interval from
    /// now (the caller performs the initial send).
    pub(crate) fn enqueue(
        &self,
        endpoint: Endpoint,
        payload: Bytes,
        initial_interval: Duration,
        cap: Duration,
        observer: Option<Observer>,
    ) -> RetransmitHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.entries.insert(
            id,
            Entry {
                endpoint,
                payload,
                next_due: Instant::now() + initial_interval,
                interval: initial_interval,
                cap,
                attempts: 0,
            },
        );
        if let Some(observer) = observer {
            self.inner.observers.insert(id, observer);
        }
        RetransmitHandle {
            id,
            inner: self.inner.clone(),
        }
    }

    /// Spawns the scanner task. Called once by the owning transport.
    pub(crate) fn start(&self, transport: Transport) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(inner.resolution);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = inner.cancel.cancelled() => break,
                }
                Self::reap_released(&inner);
                Self::scan_once(&inner, &transport).await;
            }
            inner.entries.clear();
            inner.observers.clear();
        });
    }

    fn reap_released(inner: &QueueInner) {
        let ids: Vec<u64> = inner.released.iter().map(|e| *e.key()).collect();
        for id in ids {
            inner.released.remove(&id);
            inner.entries.remove(&id);
            inner.observers.remove(&id);
        }
    }

    async fn scan_once(inner: &Arc<QueueInner>, transport: &Transport) {
        let now = Instant::now();
        let due: Vec<(u64, Endpoint, Bytes)> = inner
            .entries
            .iter()
            .filter(|e| e.next_due <= now)
            .map(|e| (*e.key(), e.endpoint, e.payload.clone()))
            .collect();

        for (id, endpoint, payload) in due {
            let failed = match transport
                .transmit(
                    endpoint.transport,
                    endpoint.addr,
                    payload.clone(),
                    endpoint.connection_id,
                )
                .await
            {
                Ok(()) => {
                    transport.trace_retransmit(&endpoint, &payload);
                    false
                }
                Err(e) => {
                    warn!(%endpoint, %e, "retransmission failed");
                    true
                }
            };

            let event = {
                let Some(mut entry) = inner.entries.get_mut(&id) else {
                    continue;
                };
                entry.attempts += 1;
                entry.interval = (entry.interval * 2).min(entry.cap);
                entry.next_due = now + entry.interval;
                RetransmitEvent {
                    id,
                    attempts: entry.attempts,
                    delivery_failed: failed,
                }
            };

            if let Some(observer) = inner.observers.get(&id) {
                observer(event);
            }
            debug!(id, attempts = event.attempts, "retransmitted");
        }
    }

    /// Number of live entries (test hook).
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TransportConfig, TransportKind};
    use sipwire_dns::{LookupService, StaticBackend};
    use std::sync::atomic::AtomicUsize;

    async fn udp_pair() -> (Transport, tokio::net::UdpSocket, Endpoint) {
        let dns = LookupService::new(Arc::new(StaticBackend::new()));
        let mut config = TransportConfig::default();
        config.t1 = Duration::from_millis(20);
        let (transport, _rx) = Transport::new(config, dns);
        transport
            .add_udp("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new(TransportKind::Udp, peer.local_addr().unwrap());
        (transport, peer, endpoint)
    }

    #[tokio::test]
    async fn retransmits_with_backoff_until_released() {
        let (transport, peer, endpoint) = udp_pair().await;
        let count = Arc::new(AtomicUsize::new(0));
        let observer_count = count.clone();

        let handle = transport.send_reliable(
            endpoint,
            Bytes::from_static(b"ping"),
            Duration::from_millis(20),
            Duration::from_millis(80),
            Some(Box::new(move |event| {
                observer_count.store(event.attempts as usize, Ordering::SeqCst);
            })),
        );

        // Collect a few retransmissions off the wire.
        let mut seen = 0;
        let mut buf = [0u8; 64];
        for _ in 0..3 {
            let recv =
                tokio::time::timeout(Duration::from_millis(500), peer.recv_from(&mut buf)).await;
            if recv.is_ok() {
                seen += 1;
            }
        }
        assert!(seen >= 2, "expected periodic retransmissions, saw {seen}");
        assert!(count.load(Ordering::SeqCst) >= 2);

        handle.release();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let final_count = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            count.load(Ordering::SeqCst),
            final_count,
            "released entry must stop retransmitting"
        );
        transport.shutdown();
    }

    #[tokio::test]
    async fn dropping_the_handle_releases_the_entry() {
        let (transport, _peer, endpoint) = udp_pair().await;
        {
            let _handle = transport.send_reliable(
                endpoint,
                Bytes::from_static(b"once"),
                Duration::from_millis(20),
                Duration::from_millis(80),
                None,
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.inner.retransmit.len(), 0);
        transport.shutdown();
    }
}
