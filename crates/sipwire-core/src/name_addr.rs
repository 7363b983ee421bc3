// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::BTreeMap;
use std::fmt;

use smol_str::SmolStr;

use crate::uri::{SipUri, UriError};

/// A name-addr header value: optional display name, a URI, and parameters.
///
/// Used for To, From, Contact, Route, and Record-Route. The `tag` parameter
/// of To/From is exposed directly since dialogs and transactions key on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display: Option<SmolStr>,
    pub uri: SipUri,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
}

impl NameAddr {
    /// Wraps a URI with no display name or parameters.
    pub fn from_uri(uri: SipUri) -> Self {
        Self {
            display: None,
            uri,
            params: BTreeMap::new(),
        }
    }

    /// Parses values like `"Alice" <sip:alice@example.com>;tag=1928301774`
    /// or the addr-spec form `sip:alice@example.com;tag=x`.
    pub fn parse(value: &str) -> Result<Self, UriError> {
        let value = value.trim();

        let (display, rest) = if let Some(stripped) = value.strip_prefix('"') {
            let end = find_closing_quote(stripped)
                .ok_or(UriError::Malformed("unterminated display name"))?;
            let display = unescape_quoted(&stripped[..end]);
            (Some(SmolStr::new(display)), stripped[end + 1..].trim_start())
        } else if let Some(angle) = value.find('<') {
            let display = value[..angle].trim();
            let display = if display.is_empty() {
                None
            } else {
                Some(SmolStr::new(display))
            };
            (display, &value[angle..])
        } else {
            (None, value)
        };

        if let Some(rest) = rest.strip_prefix('<') {
            let end = rest
                .find('>')
                .ok_or(UriError::Malformed("unterminated angle bracket"))?;
            let uri = SipUri::parse(&rest[..end])?;
            let mut params = BTreeMap::new();
            for param in rest[end + 1..].split(';') {
                let param = param.trim();
                if param.is_empty() {
                    continue;
                }
                match param.split_once('=') {
                    Some((k, v)) => params.insert(
                        SmolStr::new(k.trim().to_ascii_lowercase()),
                        Some(SmolStr::new(v.trim())),
                    ),
                    None => params.insert(SmolStr::new(param.to_ascii_lowercase()), None),
                };
            }
            Ok(Self {
                display,
                uri,
                params,
            })
        } else {
            // addr-spec form: params after the first ';' belong to the header,
            // not the URI (RFC 3261 §20.10).
            let (uri_part, param_part) = match rest.split_once(';') {
                Some((uri, params)) => (uri, Some(params)),
                None => (rest, None),
            };
            let uri = SipUri::parse(uri_part)?;
            let mut params = BTreeMap::new();
            if let Some(param_part) = param_part {
                for param in param_part.split(';') {
                    let param = param.trim();
                    if param.is_empty() {
                        continue;
                    }
                    match param.split_once('=') {
                        Some((k, v)) => params.insert(
                            SmolStr::new(k.trim().to_ascii_lowercase()),
                            Some(SmolStr::new(v.trim())),
                        ),
                        None => params.insert(SmolStr::new(param.to_ascii_lowercase()), None),
                    };
                }
            }
            Ok(Self {
                display,
                uri,
                params,
            })
        }
    }

    /// Returns the `tag` parameter for To/From values.
    pub fn tag(&self) -> Option<&str> {
        self.params
            .get("tag")
            .and_then(|v| v.as_deref())
    }

    /// Sets or replaces the `tag` parameter.
    pub fn set_tag(&mut self, tag: impl Into<SmolStr>) {
        self.params.insert(SmolStr::new("tag"), Some(tag.into()));
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display) = &self.display {
            write!(f, "\"{}\" ", display.replace('"', "\\\""))?;
        }
        write!(f, "<{}>", self.uri)?;
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

/// Finds the closing quote of a display name, honoring backslash escapes.
fn find_closing_quote(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn unescape_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}
