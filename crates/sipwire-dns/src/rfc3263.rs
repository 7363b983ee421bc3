// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3263 server location: NAPTR → SRV → A/AAAA.

use anyhow::{anyhow, Result};
use sipwire_core::{SipUri, UriScheme};
use smol_str::SmolStr;
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::{select_by_weight, DnsRecord, LookupService, QueryKind};

/// Transport protocol selected for a resolved target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TargetTransport {
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl TargetTransport {
    /// Underlying protocol label for SRV lookups.
    fn srv_proto(self) -> &'static str {
        match self {
            TargetTransport::Udp => "udp",
            _ => "tcp",
        }
    }

    /// SRV service prefix; secured transports advertise under `_sips`.
    fn srv_service(self, sips: bool) -> &'static str {
        match self {
            TargetTransport::Tls | TargetTransport::Wss => "_sips",
            _ if sips => "_sips",
            _ => "_sip",
        }
    }
}

/// Endpoint candidate produced by RFC 3263 selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsTarget {
    pub host: SmolStr,
    pub port: u16,
    pub transport: TargetTransport,
    pub priority: u16,
}

impl DnsTarget {
    pub fn new(host: impl Into<SmolStr>, port: u16, transport: TargetTransport) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
            priority: 0,
        }
    }

    fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct NaptrEntry {
    order: u16,
    preference: u16,
    transport: TargetTransport,
}

/// Determines the transport implied by the URI alone.
pub fn default_transport(uri: &SipUri) -> TargetTransport {
    match uri.scheme {
        UriScheme::Ws => return TargetTransport::Ws,
        UriScheme::Wss => return TargetTransport::Wss,
        UriScheme::Sips => return TargetTransport::Tls,
        UriScheme::Sip => {}
    }
    match uri.transport_param().map(|t| t.to_ascii_lowercase()) {
        Some(t) if t == "tcp" => TargetTransport::Tcp,
        Some(t) if t == "tls" => TargetTransport::Tls,
        Some(t) if t == "ws" => TargetTransport::Ws,
        Some(t) if t == "wss" => TargetTransport::Wss,
        _ => TargetTransport::Udp,
    }
}

/// Resolves a URI to prioritized endpoint candidates per RFC 3263 §4.
///
/// Numeric IP hosts are used directly; an explicit port skips SRV; otherwise
/// NAPTR chooses transports, SRV chooses hosts, and A/AAAA is the fallback.
pub async fn resolve_uri(service: &LookupService, uri: &SipUri) -> Result<Vec<DnsTarget>> {
    let host = uri.host.as_str();
    let sips = uri.scheme.is_secure();

    if host.parse::<IpAddr>().is_ok() {
        return Ok(vec![DnsTarget::new(
            host,
            uri.port_or_default(),
            default_transport(uri),
        )]);
    }

    if let Some(port) = uri.port {
        let ips = lookup_addresses(service, host).await?;
        return Ok(ips
            .into_iter()
            .map(|ip| DnsTarget::new(ip.to_string(), port, default_transport(uri)))
            .collect());
    }

    let transports = match naptr_transports(service, host).await {
        Some(transports) if !transports.is_empty() => transports,
        _ => vec![default_transport(uri)],
    };

    let mut targets = Vec::new();
    for transport in transports {
        targets.extend(srv_targets(service, host, transport, sips).await);
    }

    if targets.is_empty() {
        let port = if sips { 5061 } else { 5060 };
        for ip in lookup_addresses(service, host).await? {
            targets.push(DnsTarget::new(
                ip.to_string(),
                port,
                default_transport(uri),
            ));
        }
    }

    if targets.is_empty() {
        Err(anyhow!("no DNS targets for {}", host))
    } else {
        Ok(targets)
    }
}

/// NAPTR service tokens mapped to transports, in order/preference order.
async fn naptr_transports(
    service: &LookupService,
    host: &str,
) -> Option<Vec<TargetTransport>> {
    let answer = service.lookup(host, QueryKind::Naptr).await?;
    let mut entries = Vec::new();
    for record in &answer.records {
        if let DnsRecord::Naptr {
            order,
            preference,
            service: svc,
            ..
        } = record
        {
            let svc = svc.to_ascii_uppercase();
            let transport = if svc.contains("SIPS+D2T") {
                Some(TargetTransport::Tls)
            } else if svc.contains("SIP+D2T") {
                Some(TargetTransport::Tcp)
            } else if svc.contains("SIP+D2U") {
                Some(TargetTransport::Udp)
            } else if svc.contains("SIPS+D2W") {
                Some(TargetTransport::Wss)
            } else if svc.contains("SIP+D2W") {
                Some(TargetTransport::Ws)
            } else {
                None
            };
            if let Some(transport) = transport {
                entries.push(NaptrEntry {
                    order: *order,
                    preference: *preference,
                    transport,
                });
            }
        }
    }
    if entries.is_empty() {
        return None;
    }
    entries.sort();
    Some(entries.into_iter().map(|e| e.transport).collect())
}

/// SRV selection per RFC 2782: priority groups in order, weighted inside.
async fn srv_targets(
    service: &LookupService,
    host: &str,
    transport: TargetTransport,
    sips: bool,
) -> Vec<DnsTarget> {
    let srv_name = format!(
        "{}._{}.{}",
        transport.srv_service(sips),
        transport.srv_proto(),
        host
    );
    let Some(answer) = service.lookup(&srv_name, QueryKind::Srv).await else {
        return Vec::new();
    };

    let mut priority_groups: BTreeMap<u16, Vec<(u16, SmolStr, u16)>> = BTreeMap::new();
    for record in &answer.records {
        if let DnsRecord::Srv {
            priority,
            weight,
            port,
            target,
        } = record
        {
            priority_groups
                .entry(*priority)
                .or_default()
                .push((*weight, target.clone(), *port));
        }
    }

    let mut targets = Vec::new();
    for (priority, group) in priority_groups {
        for (target, port) in select_by_weight(group) {
            targets.push(DnsTarget::new(target, port, transport).with_priority(priority));
        }
    }
    targets
}

/// A lookup with AAAA fallback, shared with [`crate::resolve_addrs`].
pub(crate) async fn lookup_addresses(service: &LookupService, host: &str) -> Result<Vec<IpAddr>> {
    let mut ips = Vec::new();
    if let Some(answer) = service.lookup(host, QueryKind::A).await {
        ips.extend(answer.ips());
    }
    if ips.is_empty() {
        if let Some(answer) = service.lookup(host, QueryKind::Aaaa).await {
            ips.extend(answer.ips());
        }
    }
    if ips.is_empty() {
        Err(anyhow!("no A/AAAA records for {}", host))
    } else {
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DnsAnswer, StaticBackend};
    use std::sync::Arc;
    use std::time::Duration;

    fn service_with(backend: Arc<StaticBackend>) -> LookupService {
        LookupService::new(backend)
    }

    fn a_answer(ips: &[&str]) -> DnsAnswer {
        DnsAnswer {
            records: ips
                .iter()
                .map(|ip| DnsRecord::Ip(ip.parse().unwrap()))
                .collect(),
            ttl: Duration::from_secs(60),
        }
    }

    fn srv_answer(entries: &[(u16, u16, u16, &str)]) -> DnsAnswer {
        DnsAnswer {
            records: entries
                .iter()
                .map(|(priority, weight, port, target)| DnsRecord::Srv {
                    priority: *priority,
                    weight: *weight,
                    port: *port,
                    target: SmolStr::new(*target),
                })
                .collect(),
            ttl: Duration::from_secs(60),
        }
    }

    #[test]
    fn default_transport_follows_scheme_and_param() {
        let sip = SipUri::parse("sip:example.com").unwrap();
        assert_eq!(default_transport(&sip), TargetTransport::Udp);

        let sips = SipUri::parse("sips:example.com").unwrap();
        assert_eq!(default_transport(&sips), TargetTransport::Tls);

        let tcp = SipUri::parse("sip:example.com;transport=tcp").unwrap();
        assert_eq!(default_transport(&tcp), TargetTransport::Tcp);

        let ws = SipUri::parse("ws:edge.example.com").unwrap();
        assert_eq!(default_transport(&ws), TargetTransport::Ws);
    }

    #[tokio::test]
    async fn numeric_ip_resolves_directly() {
        let backend = Arc::new(StaticBackend::new());
        let service = service_with(backend.clone());
        let uri = SipUri::parse("sip:192.0.2.10:6060").unwrap();

        let targets = resolve_uri(&service, &uri).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].host.as_str(), "192.0.2.10");
        assert_eq!(targets[0].port, 6060);
        assert_eq!(backend.query_count(), 0);
    }

    #[tokio::test]
    async fn explicit_port_skips_srv() {
        let backend = Arc::new(StaticBackend::new());
        backend.insert("pbx.example.com", QueryKind::A, a_answer(&["192.0.2.20"]));
        let service = service_with(backend.clone());
        let uri = SipUri::parse("sip:pbx.example.com:5080").unwrap();

        let targets = resolve_uri(&service, &uri).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].port, 5080);
        // One A query; no SRV or NAPTR traffic.
        assert_eq!(backend.query_count(), 1);
    }

    #[tokio::test]
    async fn srv_records_drive_selection() {
        let backend = Arc::new(StaticBackend::new());
        backend.insert(
            "_sip._udp.example.com",
            QueryKind::Srv,
            srv_answer(&[(10, 60, 5066, "srv1.example.com"), (20, 10, 5067, "srv2.example.com")]),
        );
        let service = service_with(backend.clone());
        let uri = SipUri::parse("sip:example.com").unwrap();

        let targets = resolve_uri(&service, &uri).await.unwrap();
        assert_eq!(targets.len(), 2);
        // Priority 10 group comes first.
        assert_eq!(targets[0].host.as_str(), "srv1.example.com");
        assert_eq!(targets[0].port, 5066);
        assert_eq!(targets[1].priority, 20);
    }

    #[tokio::test]
    async fn falls_back_to_addresses_without_srv() {
        let backend = Arc::new(StaticBackend::new());
        backend.insert("plain.example.com", QueryKind::A, a_answer(&["192.0.2.30"]));
        let service = service_with(backend);
        let uri = SipUri::parse("sip:plain.example.com").unwrap();

        let targets = resolve_uri(&service, &uri).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].port, 5060);
        assert_eq!(targets[0].transport, TargetTransport::Udp);
    }

    #[tokio::test]
    async fn sips_fallback_uses_port_5061() {
        let backend = Arc::new(StaticBackend::new());
        backend.insert("secure.example.com", QueryKind::A, a_answer(&["192.0.2.40"]));
        let service = service_with(backend);
        let uri = SipUri::parse("sips:secure.example.com").unwrap();

        let targets = resolve_uri(&service, &uri).await.unwrap();
        assert_eq!(targets[0].port, 5061);
        assert_eq!(targets[0].transport, TargetTransport::Tls);
    }

    #[tokio::test]
    async fn naptr_orders_transport_preference() {
        let backend = Arc::new(StaticBackend::new());
        backend.insert(
            "np.example.com",
            QueryKind::Naptr,
            DnsAnswer {
                records: vec![
                    DnsRecord::Naptr {
                        order: 20,
                        preference: 10,
                        service: SmolStr::new("SIP+D2U"),
                        replacement: SmolStr::new("_sip._udp.np.example.com"),
                    },
                    DnsRecord::Naptr {
                        order: 10,
                        preference: 10,
                        service: SmolStr::new("SIP+D2T"),
                        replacement: SmolStr::new("_sip._tcp.np.example.com"),
                    },
                ],
                ttl: Duration::from_secs(60),
            },
        );
        backend.insert(
            "_sip._tcp.np.example.com",
            QueryKind::Srv,
            srv_answer(&[(10, 0, 5060, "tcp.np.example.com")]),
        );
        backend.insert(
            "_sip._udp.np.example.com",
            QueryKind::Srv,
            srv_answer(&[(10, 0, 5060, "udp.np.example.com")]),
        );
        let service = service_with(backend);
        let uri = SipUri::parse("sip:np.example.com").unwrap();

        let targets = resolve_uri(&service, &uri).await.unwrap();
        // TCP (order 10) precedes UDP (order 20).
        assert_eq!(targets[0].transport, TargetTransport::Tcp);
        assert_eq!(targets[0].host.as_str(), "tcp.np.example.com");
        assert_eq!(targets[1].transport, TargetTransport::Udp);
    }
}
