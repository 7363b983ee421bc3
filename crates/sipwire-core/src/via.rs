// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Via header (RFC 3261 §20.42).
//!
//! The topmost Via identifies the previous hop and carries the `branch`
//! parameter the transaction layer keys on. Responses travel back along the
//! Via chain using `received`/`rport` when present.

use std::fmt;

use smol_str::SmolStr;

/// Magic cookie every RFC 3261 branch parameter starts with.
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Returns true when the branch token carries the RFC 3261 magic cookie.
pub fn is_valid_branch(branch: &str) -> bool {
    branch.len() > BRANCH_MAGIC_COOKIE.len() && branch.starts_with(BRANCH_MAGIC_COOKIE)
}

/// Errors produced while parsing a Via header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViaError {
    /// Missing or malformed `SIP/2.0/<transport>` prefix.
    InvalidProtocol,
    /// Transport token is not UDP/TCP/TLS/WS/WSS.
    UnknownTransport(SmolStr),
    /// Missing or malformed sent-by host[:port].
    InvalidSentBy(&'static str),
    /// Malformed parameter segment.
    InvalidParameter,
}

impl fmt::Display for ViaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViaError::InvalidProtocol => write!(f, "invalid Via protocol prefix"),
            ViaError::UnknownTransport(t) => write!(f, "unknown Via transport: {}", t),
            ViaError::InvalidSentBy(what) => write!(f, "invalid Via sent-by: {}", what),
            ViaError::InvalidParameter => write!(f, "invalid Via parameter"),
        }
    }
}

impl std::error::Error for ViaError {}

/// Transport token carried in a Via header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViaTransport {
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl ViaTransport {
    /// Returns the uppercase Via token.
    pub fn as_str(&self) -> &'static str {
        match self {
            ViaTransport::Udp => "UDP",
            ViaTransport::Tcp => "TCP",
            ViaTransport::Tls => "TLS",
            ViaTransport::Ws => "WS",
            ViaTransport::Wss => "WSS",
        }
    }

    /// Parses a Via transport token (case-insensitive).
    pub fn parse(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("UDP") {
            Some(ViaTransport::Udp)
        } else if token.eq_ignore_ascii_case("TCP") {
            Some(ViaTransport::Tcp)
        } else if token.eq_ignore_ascii_case("TLS") {
            Some(ViaTransport::Tls)
        } else if token.eq_ignore_ascii_case("WS") {
            Some(ViaTransport::Ws)
        } else if token.eq_ignore_ascii_case("WSS") {
            Some(ViaTransport::Wss)
        } else {
            None
        }
    }

    /// Returns true for stream transports where retransmit timers collapse.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, ViaTransport::Udp)
    }
}

/// A single parsed Via header value.
///
/// Parameters keep their received order so serialization round-trips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    pub transport: ViaTransport,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: Vec<(SmolStr, Option<SmolStr>)>,
}

impl ViaHeader {
    /// Parses a Via value such as
    /// `SIP/2.0/UDP host:5060;branch=z9hG4bK77asjd;rport`.
    pub fn parse(value: &str) -> Result<Self, ViaError> {
        let value = value.trim();
        let mut segments = value.split(';');
        let sent_part = segments.next().ok_or(ViaError::InvalidProtocol)?.trim();

        let mut proto_iter = sent_part.split_whitespace();
        let proto = proto_iter.next().ok_or(ViaError::InvalidProtocol)?;
        let sent_by = proto_iter.next().ok_or(ViaError::InvalidSentBy("missing"))?;
        if proto_iter.next().is_some() {
            return Err(ViaError::InvalidSentBy("trailing tokens"));
        }

        let mut proto_parts = proto.split('/');
        let name = proto_parts.next().ok_or(ViaError::InvalidProtocol)?;
        let version = proto_parts.next().ok_or(ViaError::InvalidProtocol)?;
        let transport_token = proto_parts.next().ok_or(ViaError::InvalidProtocol)?;
        if !name.eq_ignore_ascii_case("SIP") || version != "2.0" || proto_parts.next().is_some() {
            return Err(ViaError::InvalidProtocol);
        }
        let transport = ViaTransport::parse(transport_token)
            .ok_or_else(|| ViaError::UnknownTransport(SmolStr::new(transport_token)))?;

        let (host, port) = parse_sent_by(sent_by)?;

        let mut params = Vec::new();
        for segment in segments {
            let segment = segment.trim();
            if segment.is_empty() {
                return Err(ViaError::InvalidParameter);
            }
            match segment.split_once('=') {
                Some((k, v)) => params.push((
                    SmolStr::new(k.trim().to_ascii_lowercase()),
                    Some(SmolStr::new(v.trim())),
                )),
                None => params.push((SmolStr::new(segment.to_ascii_lowercase()), None)),
            }
        }

        Ok(Self {
            transport,
            host: SmolStr::new(host),
            port,
            params,
        })
    }

    /// Returns the named parameter value, if present with a value.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    /// Returns true when the flag-style parameter is present at all.
    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Returns the transaction branch, if present.
    pub fn branch(&self) -> Option<&str> {
        self.param("branch")
    }

    /// Returns the `received` source address parameter, if stamped.
    pub fn received(&self) -> Option<&str> {
        self.param("received")
    }

    /// Returns the `rport` response port, if stamped with a value.
    pub fn rport(&self) -> Option<u16> {
        self.param("rport").and_then(|v| v.parse().ok())
    }

    /// Returns the sent-by in `host[:port]` form, re-bracketing IPv6
    /// literals so the value parses back.
    pub fn sent_by(&self) -> String {
        let host = bracket_host(&self.host);
        match self.port {
            Some(port) => format!("{}:{}", host, port),
            None => host.into_owned(),
        }
    }
}

impl fmt::Display for ViaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SIP/2.0/{} {}",
            self.transport.as_str(),
            bracket_host(&self.host)
        )?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

/// IPv6 literal hosts are stored unbracketed; serialization restores the
/// brackets so `host:port` stays unambiguous.
fn bracket_host(host: &str) -> std::borrow::Cow<'_, str> {
    if host.contains(':') {
        std::borrow::Cow::Owned(format!("[{}]", host))
    } else {
        std::borrow::Cow::Borrowed(host)
    }
}

fn parse_sent_by(sent_by: &str) -> Result<(&str, Option<u16>), ViaError> {
    if sent_by.is_empty() {
        return Err(ViaError::InvalidSentBy("empty"));
    }
    if sent_by.starts_with('[') {
        let end = sent_by
            .find(']')
            .ok_or(ViaError::InvalidSentBy("unterminated IPv6 literal"))?;
        let host = &sent_by[1..end];
        let remainder = &sent_by[end + 1..];
        if remainder.is_empty() {
            return Ok((host, None));
        }
        let port = remainder
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .ok_or(ViaError::InvalidSentBy("invalid port"))?;
        return Ok((host, Some(port)));
    }
    if sent_by.matches(':').count() > 1 {
        return Err(ViaError::InvalidSentBy("IPv6 host must use brackets"));
    }
    match sent_by.rsplit_once(':') {
        Some((host, port_str)) => {
            if host.is_empty() {
                return Err(ViaError::InvalidSentBy("empty host"));
            }
            let port = port_str
                .parse()
                .map_err(|_| ViaError::InvalidSentBy("invalid port"))?;
            Ok((host, Some(port)))
        }
        None => Ok((sent_by, None)),
    }
}
