// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::BTreeMap;
use std::fmt;

use percent_encoding::percent_decode_str;
use smol_str::SmolStr;

/// URI schemes routable by the transport layer.
///
/// `ws`/`wss` target SIP over WebSocket (RFC 7118); everything else is
/// classic RFC 3261 addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UriScheme {
    Sip,
    Sips,
    Ws,
    Wss,
}

impl UriScheme {
    /// Returns the lowercase scheme token.
    pub fn as_str(&self) -> &'static str {
        match self {
            UriScheme::Sip => "sip",
            UriScheme::Sips => "sips",
            UriScheme::Ws => "ws",
            UriScheme::Wss => "wss",
        }
    }

    /// Returns true for schemes that require a secured transport.
    pub fn is_secure(&self) -> bool {
        matches!(self, UriScheme::Sips | UriScheme::Wss)
    }

    fn parse(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("sip") {
            Some(UriScheme::Sip)
        } else if token.eq_ignore_ascii_case("sips") {
            Some(UriScheme::Sips)
        } else if token.eq_ignore_ascii_case("ws") {
            Some(UriScheme::Ws)
        } else if token.eq_ignore_ascii_case("wss") {
            Some(UriScheme::Wss)
        } else {
            None
        }
    }
}

/// Errors produced while parsing a URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriError {
    /// The scheme is not one of sip/sips/ws/wss.
    UnsupportedScheme(SmolStr),
    /// Structurally invalid URI text.
    Malformed(&'static str),
}

impl fmt::Display for UriError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UriError::UnsupportedScheme(scheme) => write!(f, "unsupported URI scheme: {}", scheme),
            UriError::Malformed(what) => write!(f, "malformed URI: {}", what),
        }
    }
}

impl std::error::Error for UriError {}

/// Parsed representation of a SIP URI (RFC 3261 §19).
///
/// `params` keeps parameter order-independent lookup (`transport`, `lr`, …);
/// `headers` carries the rarely-used `?name=value` URI headers verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub raw: SmolStr,
    pub scheme: UriScheme,
    pub user: Option<SmolStr>,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
    pub headers: BTreeMap<SmolStr, SmolStr>,
}

impl SipUri {
    /// Constructs a plain `sip:` URI with the given host.
    pub fn new(host: impl Into<SmolStr>) -> Self {
        let host = host.into();
        Self {
            raw: SmolStr::new(format!("sip:{}", host)),
            scheme: UriScheme::Sip,
            user: None,
            host,
            port: None,
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
        }
    }

    /// Attempts to parse a sip/sips/ws/wss URI from the provided string.
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let input = input.trim();
        let raw = SmolStr::new(input);
        let (scheme_token, rest) = input
            .split_once(':')
            .ok_or(UriError::Malformed("missing scheme separator"))?;
        let scheme = UriScheme::parse(scheme_token)
            .ok_or_else(|| UriError::UnsupportedScheme(SmolStr::new(scheme_token)))?;

        let (addr_part, headers_part) = match rest.split_once('?') {
            Some((addr, headers)) => (addr, Some(headers)),
            None => (rest, None),
        };

        let mut params = BTreeMap::new();
        let mut addr_iter = addr_part.split(';');
        let base = addr_iter
            .next()
            .ok_or(UriError::Malformed("empty URI body"))?
            .trim();
        for param in addr_iter {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            if let Some((k, v)) = param.split_once('=') {
                params.insert(
                    SmolStr::new(k.trim().to_ascii_lowercase()),
                    Some(SmolStr::new(v.trim())),
                );
            } else {
                params.insert(SmolStr::new(param.to_ascii_lowercase()), None);
            }
        }

        let (user, host_port) = match base.split_once('@') {
            Some((user, host)) => {
                let decoded = percent_decode_str(user.trim())
                    .decode_utf8()
                    .map_err(|_| UriError::Malformed("user is not valid UTF-8"))?;
                (Some(SmolStr::new(decoded.as_ref())), host.trim())
            }
            None => (None, base.trim()),
        };

        if host_port.is_empty() {
            return Err(UriError::Malformed("empty host"));
        }

        let (host, port) = split_host_port(host_port)?;
        let host = percent_decode_str(host)
            .decode_utf8()
            .map_err(|_| UriError::Malformed("host is not valid UTF-8"))?
            .to_ascii_lowercase();

        let mut headers = BTreeMap::new();
        if let Some(headers_part) = headers_part {
            for pair in headers_part.split('&') {
                if pair.is_empty() {
                    continue;
                }
                if let Some((k, v)) = pair.split_once('=') {
                    headers.insert(SmolStr::new(k.trim()), SmolStr::new(v.trim()));
                }
            }
        }

        Ok(Self {
            raw,
            scheme,
            user,
            host: SmolStr::new(host),
            port,
            params,
            headers,
        })
    }

    /// Returns the original textual representation of the URI.
    pub fn as_str(&self) -> &str {
        self.raw.as_str()
    }

    /// Returns the `transport` parameter value, lowercased on parse.
    pub fn transport_param(&self) -> Option<&str> {
        self.params
            .get("transport")
            .and_then(|v| v.as_deref())
    }

    /// Returns true if the URI carries the loose-routing `lr` parameter.
    pub fn is_loose_route(&self) -> bool {
        self.params.contains_key("lr")
    }

    /// Returns the explicit port or the scheme's well-known default.
    pub fn port_or_default(&self) -> u16 {
        self.port
            .unwrap_or(if self.scheme.is_secure() { 5061 } else { 5060 })
    }
}

impl fmt::Display for SipUri {
    // Display through the stored raw text keeps unknown params byte-exact.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.raw.as_str())
    }
}

/// Splits `host[:port]` or an IPv6 literal `[host]:port`.
fn split_host_port(input: &str) -> Result<(&str, Option<u16>), UriError> {
    if input.starts_with('[') {
        let end = input
            .find(']')
            .ok_or(UriError::Malformed("unterminated IPv6 literal"))?;
        let host = &input[1..end];
        if host.is_empty() {
            return Err(UriError::Malformed("empty IPv6 literal"));
        }
        let remainder = &input[end + 1..];
        if let Some(port_str) = remainder.strip_prefix(':') {
            let port = port_str
                .parse()
                .map_err(|_| UriError::Malformed("invalid port"))?;
            Ok((host, Some(port)))
        } else if remainder.is_empty() {
            Ok((host, None))
        } else {
            Err(UriError::Malformed("trailing bytes after IPv6 literal"))
        }
    } else if let Some(idx) = input.rfind(':') {
        if input.matches(':').count() > 1 {
            return Err(UriError::Malformed("IPv6 host must use brackets"));
        }
        let (host, port_str) = input.split_at(idx);
        if host.is_empty() {
            return Err(UriError::Malformed("empty host"));
        }
        let port = port_str[1..]
            .parse()
            .map_err(|_| UriError::Malformed("invalid port"))?;
        Ok((host, Some(port)))
    } else {
        Ok((input, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_sip_uri() {
        let uri = SipUri::parse("sip:alice@example.com").unwrap();
        assert_eq!(uri.scheme, UriScheme::Sip);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host.as_str(), "example.com");
        assert_eq!(uri.port, None);
        assert_eq!(uri.port_or_default(), 5060);
    }

    #[test]
    fn parses_sips_with_port() {
        let uri = SipUri::parse("sips:bob@gw.example.com:5071").unwrap();
        assert_eq!(uri.scheme, UriScheme::Sips);
        assert!(uri.scheme.is_secure());
        assert_eq!(uri.port, Some(5071));
    }

    #[test]
    fn parses_transport_and_lr_params() {
        let uri = SipUri::parse("sip:proxy.example.com;transport=TCP;lr").unwrap();
        assert_eq!(uri.transport_param(), Some("TCP"));
        assert!(uri.is_loose_route());
    }

    #[test]
    fn parses_ws_scheme() {
        let uri = SipUri::parse("ws:edge.example.com:8088").unwrap();
        assert_eq!(uri.scheme, UriScheme::Ws);
        assert_eq!(uri.port_or_default(), 8088);
    }

    #[test]
    fn rejects_unknown_scheme() {
        match SipUri::parse("http:example.com") {
            Err(UriError::UnsupportedScheme(s)) => assert_eq!(s.as_str(), "http"),
            other => panic!("expected UnsupportedScheme, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unbracketed_ipv6_host() {
        assert!(SipUri::parse("sip:2001:db8::1").is_err());
    }

    #[test]
    fn parses_bracketed_ipv6_host() {
        let uri = SipUri::parse("sip:[2001:db8::1]:5062").unwrap();
        assert_eq!(uri.host.as_str(), "2001:db8::1");
        assert_eq!(uri.port, Some(5062));
    }

    #[test]
    fn parses_uri_headers() {
        let uri = SipUri::parse("sip:carol@example.com?subject=hello&priority=urgent").unwrap();
        assert_eq!(uri.headers.get("subject").map(|v| v.as_str()), Some("hello"));
        assert_eq!(uri.headers.len(), 2);
    }

    #[test]
    fn host_is_lowercased() {
        let uri = SipUri::parse("sip:Alice@EXAMPLE.COM:6060").unwrap();
        assert_eq!(uri.host.as_str(), "example.com");
        assert_eq!(uri.user.as_deref(), Some("Alice"));
    }
}
