// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Non-blocking DNS resolution for SIP.
//!
//! [`LookupService`] fronts a pluggable backend with a bounded worker pool,
//! in-flight deduplication, and a TTL-respecting cache. [`resolve_uri`]
//! layers RFC 3263 target selection (NAPTR → SRV → A/AAAA) on top of it.
//!
//! Lookups never block signaling: [`LookupService::lookup_cached`] returns a
//! cached answer or `None` while queueing the query in the background — SIP
//! retransmissions give callers a natural retry cadence.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use rand::Rng;
use sipwire_core::SipUri;
use smol_str::SmolStr;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use trust_dns_resolver::{
    config::{ResolverConfig, ResolverOpts},
    proto::rr::{RData, RecordType},
    TokioAsyncResolver,
};

mod rfc3263;

pub use rfc3263::{resolve_uri, DnsTarget, TargetTransport};

/// Default number of concurrent lookup workers.
pub const DEFAULT_WORKERS: usize = 5;

/// Default lookup timeout for SRV/NAPTR queries.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default lookup timeout for address (A/AAAA) queries.
pub const DEFAULT_HOST_TIMEOUT: Duration = Duration::from_secs(15);

/// TTL applied to synthetic answers for IP-literal hostnames.
const LITERAL_TTL: Duration = Duration::from_secs(3600);

/// DNS query kinds used by SIP routing.
///
/// In-flight deduplication compares these variants directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    A,
    Aaaa,
    Srv,
    Naptr,
}

impl QueryKind {
    fn record_type(self) -> RecordType {
        match self {
            QueryKind::A => RecordType::A,
            QueryKind::Aaaa => RecordType::AAAA,
            QueryKind::Srv => RecordType::SRV,
            QueryKind::Naptr => RecordType::NAPTR,
        }
    }

    fn is_address(self) -> bool {
        matches!(self, QueryKind::A | QueryKind::Aaaa)
    }
}

/// One resource record in an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsRecord {
    Ip(IpAddr),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: SmolStr,
    },
    Naptr {
        order: u16,
        preference: u16,
        service: SmolStr,
        replacement: SmolStr,
    },
}

/// A completed lookup: records plus the smallest TTL seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub records: Vec<DnsRecord>,
    pub ttl: Duration,
}

impl DnsAnswer {
    /// Returns the IP addresses contained in this answer.
    pub fn ips(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.records.iter().filter_map(|r| match r {
            DnsRecord::Ip(ip) => Some(*ip),
            _ => None,
        })
    }
}

/// Backend performing the actual wire queries; swapped out in tests.
#[async_trait::async_trait]
pub trait DnsBackend: Send + Sync + 'static {
    async fn query(&self, name: &str, kind: QueryKind) -> Result<DnsAnswer>;
}

/// Backend using the system resolver configuration.
pub struct SystemBackend {
    resolver: TokioAsyncResolver,
}

impl SystemBackend {
    /// Creates a backend from the system DNS configuration.
    pub fn from_system() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }

    /// Creates a backend with explicit resolver configuration.
    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

#[async_trait::async_trait]
impl DnsBackend for SystemBackend {
    async fn query(&self, name: &str, kind: QueryKind) -> Result<DnsAnswer> {
        let fqdn = format!("{}.", name.trim_end_matches('.'));
        let lookup = self.resolver.lookup(fqdn, kind.record_type()).await?;

        let mut ttl = u32::MAX;
        let mut records = Vec::new();
        for record in lookup.records() {
            ttl = ttl.min(record.ttl());
            match record.data() {
                Some(RData::A(a)) => records.push(DnsRecord::Ip(IpAddr::V4(a.0))),
                Some(RData::AAAA(aaaa)) => records.push(DnsRecord::Ip(IpAddr::V6(aaaa.0))),
                Some(RData::SRV(srv)) => records.push(DnsRecord::Srv {
                    priority: srv.priority(),
                    weight: srv.weight(),
                    port: srv.port(),
                    target: SmolStr::new(srv.target().to_utf8().trim_end_matches('.')),
                }),
                Some(RData::NAPTR(naptr)) => records.push(DnsRecord::Naptr {
                    order: naptr.order(),
                    preference: naptr.preference(),
                    service: SmolStr::new(String::from_utf8_lossy(naptr.services()).as_ref()),
                    replacement: SmolStr::new(
                        naptr.replacement().to_utf8().trim_end_matches('.'),
                    ),
                }),
                _ => {}
            }
        }

        if records.is_empty() {
            return Err(anyhow!("no {:?} records for {}", kind, name));
        }
        Ok(DnsAnswer {
            records,
            ttl: Duration::from_secs(u64::from(ttl.min(86_400))),
        })
    }
}

struct CacheEntry {
    answer: DnsAnswer,
    expires_at: Instant,
}

type LookupKey = (SmolStr, QueryKind);

struct ServiceInner {
    backend: Arc<dyn DnsBackend>,
    workers: Arc<Semaphore>,
    cache: DashMap<LookupKey, CacheEntry>,
    in_flight: DashMap<LookupKey, broadcast::Sender<Option<DnsAnswer>>>,
    timeout: Duration,
    host_timeout: Duration,
    shutdown: CancellationToken,
}

/// Process-wide lookup service with bounded concurrency and deduplication.
///
/// For any (hostname, kind) there is at most one in-progress query; callers
/// arriving while one is outstanding attach to it and are signalled when it
/// completes.
#[derive(Clone)]
pub struct LookupService {
    inner: Arc<ServiceInner>,
}

impl LookupService {
    /// Creates a service over the given backend with default limits.
    pub fn new(backend: Arc<dyn DnsBackend>) -> Self {
        Self::with_limits(backend, DEFAULT_WORKERS, DEFAULT_TIMEOUT, DEFAULT_HOST_TIMEOUT)
    }

    /// Creates a service with explicit worker count and timeouts.
    pub fn with_limits(
        backend: Arc<dyn DnsBackend>,
        workers: usize,
        timeout: Duration,
        host_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                backend,
                workers: Arc::new(Semaphore::new(workers.max(1))),
                cache: DashMap::new(),
                in_flight: DashMap::new(),
                timeout,
                host_timeout,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Creates a service over the system resolver.
    pub fn from_system() -> Self {
        Self::new(Arc::new(SystemBackend::from_system()))
    }

    /// Cancels in-flight lookups; blocked callers observe `None`.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Resolves with a completion wait bounded at twice the query timeout.
    ///
    /// Returns `None` on timeout, lookup failure, or shutdown.
    pub async fn lookup(&self, name: &str, kind: QueryKind) -> Option<DnsAnswer> {
        if let Some(answer) = self.literal_answer(name, kind) {
            return Some(answer);
        }
        if let Some(answer) = self.cached(name, kind) {
            return Some(answer);
        }

        let mut rx = self.attach_or_start(name, kind);
        let ceiling = self.query_timeout(kind) * 2;
        match tokio::time::timeout(ceiling, rx.recv()).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => None,
            Err(_) => {
                warn!(name, ?kind, "lookup wait ceiling reached");
                None
            }
        }
    }

    /// Returns a cached answer immediately, queueing a background lookup on a
    /// miss. Callers retry on their own cadence.
    pub fn lookup_cached(&self, name: &str, kind: QueryKind) -> Option<DnsAnswer> {
        if let Some(answer) = self.literal_answer(name, kind) {
            return Some(answer);
        }
        if let Some(answer) = self.cached(name, kind) {
            return Some(answer);
        }
        drop(self.attach_or_start(name, kind));
        None
    }

    /// IP literals bypass cache and backend with a synthetic answer.
    fn literal_answer(&self, name: &str, kind: QueryKind) -> Option<DnsAnswer> {
        if !kind.is_address() {
            return None;
        }
        let ip: IpAddr = name.parse().ok()?;
        Some(DnsAnswer {
            records: vec![DnsRecord::Ip(ip)],
            ttl: LITERAL_TTL,
        })
    }

    fn cached(&self, name: &str, kind: QueryKind) -> Option<DnsAnswer> {
        let key = (SmolStr::new(name), kind);
        if let Some(entry) = self.inner.cache.get(&key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.answer.clone());
            }
        }
        // Expired entries are dropped lazily.
        self.inner
            .cache
            .remove_if(&key, |_, e| e.expires_at <= Instant::now());
        None
    }

    fn query_timeout(&self, kind: QueryKind) -> Duration {
        if kind.is_address() {
            self.inner.host_timeout
        } else {
            self.inner.timeout
        }
    }

    /// Attaches to the in-flight query for (name, kind), starting one if none
    /// exists. Matching is by enum equality on the kind.
    fn attach_or_start(&self, name: &str, kind: QueryKind) -> broadcast::Receiver<Option<DnsAnswer>> {
        use dashmap::mapref::entry::Entry;

        let key = (SmolStr::new(name), kind);
        match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(existing) => {
                debug!(name, ?kind, "attaching to in-flight lookup");
                existing.get().subscribe()
            }
            Entry::Vacant(slot) => {
                let (tx, rx) = broadcast::channel(1);
                slot.insert(tx.clone());
                self.spawn_worker(key, tx);
                rx
            }
        }
    }

    fn spawn_worker(&self, key: LookupKey, tx: broadcast::Sender<Option<DnsAnswer>>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let (name, kind) = key.clone();
            let timeout = if kind.is_address() {
                inner.host_timeout
            } else {
                inner.timeout
            };

            let permit = tokio::select! {
                permit = inner.workers.clone().acquire_owned() => permit,
                _ = inner.shutdown.cancelled() => {
                    inner.in_flight.remove(&key);
                    let _ = tx.send(None);
                    return;
                }
            };
            let _permit = match permit {
                Ok(p) => p,
                Err(_) => return,
            };

            let result = tokio::select! {
                result = tokio::time::timeout(timeout, inner.backend.query(&name, kind)) => result,
                _ = inner.shutdown.cancelled() => {
                    inner.in_flight.remove(&key);
                    let _ = tx.send(None);
                    return;
                }
            };

            let answer = match result {
                Ok(Ok(answer)) => {
                    inner.cache.insert(
                        key.clone(),
                        CacheEntry {
                            answer: answer.clone(),
                            expires_at: Instant::now() + answer.ttl,
                        },
                    );
                    Some(answer)
                }
                Ok(Err(e)) => {
                    debug!(%name, ?kind, error = %e, "lookup failed");
                    None
                }
                Err(_) => {
                    warn!(%name, ?kind, "lookup timed out");
                    None
                }
            };

            inner.in_flight.remove(&key);
            let _ = tx.send(answer);
        });
    }
}

/// Selects SRV targets by weight per RFC 2782.
pub(crate) fn select_by_weight(mut records: Vec<(u16, SmolStr, u16)>) -> Vec<(SmolStr, u16)> {
    let mut rng = rand::thread_rng();
    let mut result = Vec::with_capacity(records.len());

    while !records.is_empty() {
        let total_weight: u32 = records.iter().map(|(w, _, _)| u32::from(*w)).sum();
        let idx = if total_weight == 0 {
            rng.gen_range(0..records.len())
        } else {
            let pick = rng.gen_range(0..total_weight);
            let mut cumulative = 0u32;
            records
                .iter()
                .position(|(w, _, _)| {
                    cumulative += u32::from(*w);
                    cumulative > pick
                })
                .unwrap_or(0)
        };
        let (_, host, port) = records.remove(idx);
        result.push((host, port));
    }
    result
}

/// Fixed-answer backend for tests and static deployments.
pub struct StaticBackend {
    answers: DashMap<LookupKey, DnsAnswer>,
    queries: std::sync::atomic::AtomicUsize,
    delay: Duration,
}

impl StaticBackend {
    pub fn new() -> Self {
        Self {
            answers: DashMap::new(),
            queries: std::sync::atomic::AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Adds an artificial per-query delay; lets tests overlap lookups.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Registers the answer returned for (name, kind).
    pub fn insert(&self, name: &str, kind: QueryKind, answer: DnsAnswer) {
        self.answers.insert((SmolStr::new(name), kind), answer);
    }

    /// Number of queries that reached this backend.
    pub fn query_count(&self) -> usize {
        self.queries.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for StaticBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DnsBackend for StaticBackend {
    async fn query(&self, name: &str, kind: QueryKind) -> Result<DnsAnswer> {
        self.queries
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.answers
            .get(&(SmolStr::new(name), kind))
            .map(|a| a.value().clone())
            .ok_or_else(|| anyhow!("no answer configured for {} {:?}", name, kind))
    }
}

/// Convenience: resolves a URI to socket addresses using RFC 3263 selection
/// followed by A/AAAA lookups for non-literal targets.
pub async fn resolve_addrs(
    service: &LookupService,
    uri: &SipUri,
) -> Result<Vec<(std::net::SocketAddr, TargetTransport)>> {
    let targets = resolve_uri(service, uri).await?;
    let mut out = Vec::new();
    for target in targets {
        if let Ok(ip) = target.host.parse::<IpAddr>() {
            out.push((std::net::SocketAddr::new(ip, target.port), target.transport));
            continue;
        }
        if let Ok(ips) = rfc3263::lookup_addresses(service, &target.host).await {
            for ip in ips {
                out.push((std::net::SocketAddr::new(ip, target.port), target.transport));
            }
        }
    }
    if out.is_empty() {
        return Err(anyhow!("no addresses for {}", uri.as_str()));
    }
    Ok(out)
}
