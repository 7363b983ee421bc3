// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP message parser and serializer.
//!
//! Converts a contiguous byte region into a [`SipMessage`] and back. Compact
//! header names are canonicalized, comma-joined Via/Route/Record-Route/Contact
//! values are split into individual header entries, and unknown headers are
//! retained verbatim. The [`stream`] module frames messages out of a TCP/TLS
//! receive buffer using Content-Length.
//!
//! # Example
//! ```
//! use bytes::Bytes;
//! use sipwire_parse::{parse_request, serialize_request};
//! # let raw = b"OPTIONS sip:example.com SIP/2.0\r\nVia: SIP/2.0/UDP host;branch=z9hG4bKx\r\nCSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n";
//! let request = parse_request(&Bytes::from_static(raw)).unwrap();
//! let bytes = serialize_request(&request);
//! ```

use bytes::{Bytes, BytesMut};
use sipwire_core::{
    is_valid_branch, CSeqHeader, Headers, Method, Request, RequestLine, Response, SipMessage,
    StatusLine, SipUri, UriError,
};
use smol_str::SmolStr;

pub mod stream;

pub use stream::{Extraction, MessageReader};

/// Default ceiling for a single SIP message (RFC 3261 UDP maximum).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65_535;

/// Parse failures, split by how the caller should recover.
///
/// `Incomplete` means more bytes may complete the message and nothing was
/// consumed. `Malformed` is fatal for the attempt: datagrams are dropped and
/// stream connections closed. `UnsupportedScheme` rejects Request-URIs
/// outside sip/sips/ws/wss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Incomplete,
    Malformed { offset: usize },
    UnsupportedScheme,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Incomplete => write!(f, "incomplete message"),
            ParseError::Malformed { offset } => {
                write!(f, "malformed message at byte offset {}", offset)
            }
            ParseError::UnsupportedScheme => write!(f, "unsupported request URI scheme"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parses a complete byte region into a request or response.
pub fn parse_message(raw: &Bytes) -> Result<SipMessage, ParseError> {
    let head = head_slice(raw)?;
    let first = first_line(head)?;
    if first
        .get(..7)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("SIP/2.0"))
    {
        parse_response(raw).map(SipMessage::Response)
    } else {
        parse_request(raw).map(SipMessage::Request)
    }
}

/// Parses a SIP request from a complete byte region.
pub fn parse_request(raw: &Bytes) -> Result<Request, ParseError> {
    let (head, body_offset, body_bytes) = split_head_body(raw)?;

    let mut lines = HeaderLines::new(head);
    let (start_offset, first) = lines.next().ok_or(ParseError::Malformed { offset: 0 })??;
    let (method, uri) = parse_request_line(first, start_offset)?;

    let headers = parse_headers(lines)?;
    validate_top_via(&headers)?;
    validate_cseq(&headers, &method)?;

    let body = extract_body(body_bytes, body_offset, &headers)?;
    Request::new(RequestLine::new(method, uri), headers, body)
        .map_err(|_| ParseError::Malformed { offset: body_offset })
}

/// Parses a SIP response from a complete byte region.
pub fn parse_response(raw: &Bytes) -> Result<Response, ParseError> {
    let (head, body_offset, body_bytes) = split_head_body(raw)?;

    let mut lines = HeaderLines::new(head);
    let (start_offset, first) = lines.next().ok_or(ParseError::Malformed { offset: 0 })??;
    let status = parse_status_line(first, start_offset)?;

    let headers = parse_headers(lines)?;
    let body = extract_body(body_bytes, body_offset, &headers)?;
    Response::new(status, headers, body)
        .map_err(|_| ParseError::Malformed { offset: body_offset })
}

/// Serializes a request, regenerating Content-Length from the body and
/// inserting `Max-Forwards: 70` when absent.
pub fn serialize_request(req: &Request) -> Bytes {
    use std::fmt::Write;
    let mut buf = String::new();

    let _ = write!(
        buf,
        "{} {} {}\r\n",
        req.start.method.as_str(),
        req.start.uri.as_str(),
        req.start.version.as_str()
    );

    let mut has_max_forwards = false;
    for header in req.headers.iter() {
        if is_content_length_name(&header.name) {
            continue;
        }
        if header.name.eq_ignore_ascii_case("Max-Forwards") {
            has_max_forwards = true;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value.trim());
    }

    if !has_max_forwards {
        buf.push_str("Max-Forwards: 70\r\n");
    }
    let _ = write!(buf, "Content-Length: {}\r\n", req.body.len());
    buf.push_str("\r\n");

    let mut out = BytesMut::with_capacity(buf.len() + req.body.len());
    out.extend_from_slice(buf.as_bytes());
    out.extend_from_slice(req.body.as_ref());
    out.freeze()
}

/// Serializes a response, regenerating Content-Length from the body.
pub fn serialize_response(res: &Response) -> Bytes {
    use std::fmt::Write;
    let mut buf = String::new();

    let _ = write!(
        buf,
        "{} {} {}\r\n",
        res.start.version.as_str(),
        res.start.code,
        res.start.reason
    );

    for header in res.headers.iter() {
        if is_content_length_name(&header.name) {
            continue;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value.trim());
    }

    let _ = write!(buf, "Content-Length: {}\r\n", res.body.len());
    buf.push_str("\r\n");

    let mut out = BytesMut::with_capacity(buf.len() + res.body.len());
    out.extend_from_slice(buf.as_bytes());
    out.extend_from_slice(res.body.as_ref());
    out.freeze()
}

/// Serializes either message variant.
pub fn serialize_message(msg: &SipMessage) -> Bytes {
    match msg {
        SipMessage::Request(req) => serialize_request(req),
        SipMessage::Response(res) => serialize_response(res),
    }
}

/// Parses the value of a Content-Length header per the framing rules:
/// whitespace is tolerated and the value is the first contiguous run of
/// ASCII digits. Returns `None` when no digit run exists.
pub fn parse_content_length_value(value: &str) -> Option<usize> {
    let bytes = value.as_bytes();
    let start = bytes.iter().position(|b| b.is_ascii_digit())?;
    let mut acc: usize = 0;
    for &b in &bytes[start..] {
        if !b.is_ascii_digit() {
            break;
        }
        acc = acc
            .checked_mul(10)?
            .checked_add((b - b'0') as usize)?;
    }
    Some(acc)
}

fn is_content_length_name(name: &str) -> bool {
    name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l")
}

/// Canonicalizes RFC 3261 compact header names to their long form.
pub fn canonical_header_name(name: &str) -> SmolStr {
    let trimmed = name.trim();
    if trimmed.len() != 1 {
        return SmolStr::new(trimmed);
    }
    let canonical = match trimmed.to_ascii_lowercase().as_str() {
        "i" => "Call-ID",
        "f" => "From",
        "t" => "To",
        "m" => "Contact",
        "l" => "Content-Length",
        "s" => "Subject",
        "k" => "Supported",
        "o" => "Event",
        "e" => "Content-Encoding",
        "c" => "Content-Type",
        "v" => "Via",
        "r" => "Refer-To",
        "b" => "Referred-By",
        "u" => "Allow-Events",
        _ => trimmed,
    };
    SmolStr::new(canonical)
}

/// Header names whose comma-joined values expand into separate entries.
fn is_multi_value_name(name: &str) -> bool {
    name.eq_ignore_ascii_case("Via")
        || name.eq_ignore_ascii_case("Route")
        || name.eq_ignore_ascii_case("Record-Route")
        || name.eq_ignore_ascii_case("Contact")
}

fn head_slice(raw: &Bytes) -> Result<&str, ParseError> {
    let data = raw.as_ref();
    let pos = memchr::memmem::find(data, b"\r\n\r\n").ok_or(ParseError::Incomplete)?;
    std::str::from_utf8(&data[..pos]).map_err(|e| ParseError::Malformed {
        offset: e.valid_up_to(),
    })
}

fn first_line(head: &str) -> Result<&str, ParseError> {
    let line = head.split("\r\n").next().unwrap_or("").trim();
    if line.is_empty() {
        return Err(ParseError::Malformed { offset: 0 });
    }
    Ok(line)
}

fn split_head_body(raw: &Bytes) -> Result<(&str, usize, &[u8]), ParseError> {
    let data = raw.as_ref();
    let pos = memchr::memmem::find(data, b"\r\n\r\n").ok_or(ParseError::Incomplete)?;
    let head = std::str::from_utf8(&data[..pos]).map_err(|e| ParseError::Malformed {
        offset: e.valid_up_to(),
    })?;
    Ok((head, pos + 4, &data[pos + 4..]))
}

/// Iterator over header lines carrying each line's byte offset in the head.
struct HeaderLines<'a> {
    head: &'a str,
    offset: usize,
}

impl<'a> HeaderLines<'a> {
    fn new(head: &'a str) -> Self {
        Self { head, offset: 0 }
    }
}

impl<'a> Iterator for HeaderLines<'a> {
    type Item = Result<(usize, &'a str), ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.head.len() {
            return None;
        }
        let rest = &self.head[self.offset..];
        let line_offset = self.offset;
        let (line, advance) = match rest.find("\r\n") {
            Some(end) => (&rest[..end], end + 2),
            None => (rest, rest.len()),
        };
        self.offset += advance;
        Some(Ok((line_offset, line)))
    }
}

/// Parses `Method SP Request-URI SP SIP-Version`.
fn parse_request_line(line: &str, offset: usize) -> Result<(Method, SipUri), ParseError> {
    use nom::{
        bytes::complete::take_while1, character::complete::space1, combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<_>>(is_token_char),
        space1::<_, nom::error::Error<_>>,
        take_while1::<_, _, nom::error::Error<_>>(is_uri_char),
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (method_token, _, uri_token, _, version_token)) =
        parser(line.trim()).map_err(|_| ParseError::Malformed { offset })?;

    if !version_token.eq_ignore_ascii_case("SIP/2.0") {
        return Err(ParseError::Malformed { offset });
    }
    let method = Method::from_token(method_token);
    let uri = SipUri::parse(uri_token).map_err(|e| match e {
        UriError::UnsupportedScheme(_) => ParseError::UnsupportedScheme,
        UriError::Malformed(_) => ParseError::Malformed { offset },
    })?;
    Ok((method, uri))
}

/// Parses `SIP-Version SP Status-Code SP Reason-Phrase`.
fn parse_status_line(line: &str, offset: usize) -> Result<StatusLine, ParseError> {
    use nom::{
        bytes::complete::tag_no_case,
        character::complete::{space1, u16 as nom_u16},
        combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        tag_no_case::<_, _, nom::error::Error<_>>("SIP/2.0"),
        space1::<_, nom::error::Error<_>>,
        nom_u16::<_, nom::error::Error<_>>,
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (_, _, code, _, reason)) =
        parser(line.trim()).map_err(|_| ParseError::Malformed { offset })?;

    StatusLine::new(code, reason.trim()).map_err(|_| ParseError::Malformed { offset })
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#' | '$' | '%' | '&' | '\'' | '*' | '+' | '-' | '.' | '^' | '_' | '`' | '|' | '~'
        )
}

// Permissive URI character set: stop at whitespace.
fn is_uri_char(c: char) -> bool {
    !c.is_whitespace()
}

fn parse_headers<'a, I>(lines: I) -> Result<Headers, ParseError>
where
    I: Iterator<Item = Result<(usize, &'a str), ParseError>>,
{
    let mut headers = Headers::new();
    for item in lines {
        let (offset, line) = item?;
        if line.is_empty() {
            continue;
        }
        // Folded continuation lines were deprecated by RFC 3261 §7.3.1 and
        // are a smuggling vector; reject them outright.
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(ParseError::Malformed { offset });
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(ParseError::Malformed { offset })?;
        let name = canonical_header_name(name);
        if name.is_empty() {
            return Err(ParseError::Malformed { offset });
        }
        let value = value.trim();
        if is_multi_value_name(&name) {
            for part in split_commas(value) {
                headers.push(name.clone(), SmolStr::new(part.trim()));
            }
        } else {
            headers.push(name, SmolStr::new(value));
        }
    }
    Ok(headers)
}

/// Splits on commas outside quoted strings and angle brackets, so Contact
/// display names and URI headers survive intact.
fn split_commas(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth += 1,
            '>' if !in_quotes => depth = depth.saturating_sub(1),
            ',' if !in_quotes && depth == 0 => {
                parts.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts.retain(|p| !p.trim().is_empty());
    parts
}

fn validate_top_via(headers: &Headers) -> Result<(), ParseError> {
    if let Some(via) = headers.get("Via") {
        if let Some(branch) = via
            .split(';')
            .skip(1)
            .find_map(|p| p.trim().strip_prefix("branch="))
        {
            if !is_valid_branch(branch.trim()) {
                return Err(ParseError::Malformed { offset: 0 });
            }
        }
    }
    Ok(())
}

fn validate_cseq(headers: &Headers, method: &Method) -> Result<(), ParseError> {
    if let Some(cseq) = headers.get("CSeq") {
        let parsed = CSeqHeader::parse(cseq).ok_or(ParseError::Malformed { offset: 0 })?;
        if parsed.method.as_str() != method.as_str() {
            return Err(ParseError::Malformed { offset: 0 });
        }
    }
    Ok(())
}

fn extract_body(
    body_bytes: &[u8],
    body_offset: usize,
    headers: &Headers,
) -> Result<Bytes, ParseError> {
    let values: Vec<&SmolStr> = headers.get_all("Content-Length").collect();
    let declared = match values.len() {
        0 => return Ok(Bytes::copy_from_slice(body_bytes)),
        1 => parse_content_length_value(values[0]).ok_or(ParseError::Malformed {
            offset: body_offset,
        })?,
        _ => {
            let mut agreed: Option<usize> = None;
            for value in &values {
                let parsed = parse_content_length_value(value).ok_or(ParseError::Malformed {
                    offset: body_offset,
                })?;
                match agreed {
                    Some(existing) if existing != parsed => {
                        return Err(ParseError::Malformed {
                            offset: body_offset,
                        })
                    }
                    _ => agreed = Some(parsed),
                }
            }
            agreed.unwrap_or(0)
        }
    };

    if declared > body_bytes.len() {
        return Err(ParseError::Incomplete);
    }
    Ok(Bytes::copy_from_slice(&body_bytes[..declared]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_request_bytes() -> Bytes {
        Bytes::from_static(
            b"OPTIONS sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
To: <sip:bob@example.com>\r\n\
From: <sip:alice@example.com>;tag=123\r\n\
Call-ID: abc123\r\n\
CSeq: 1 OPTIONS\r\n\
Max-Forwards: 70\r\n\
Content-Length: 0\r\n\r\n",
        )
    }

    #[test]
    fn parses_basic_request() {
        let req = parse_request(&sample_request_bytes()).expect("parse");
        assert_eq!(req.start.method, Method::Options);
        assert_eq!(req.start.uri.as_str(), "sip:example.com");
        assert_eq!(
            req.headers.get("via").map(|v| v.as_str()),
            Some("SIP/2.0/UDP host;branch=z9hG4bKx")
        );
        assert_eq!(req.headers.get("call-id").map(|v| v.as_str()), Some("abc123"));
    }

    #[test]
    fn parses_basic_response() {
        let raw = Bytes::from_static(
            b"SIP/2.0 200 OK\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 5\r\n\r\nhello",
        );
        let res = parse_response(&raw).expect("parse");
        assert_eq!(res.code(), 200);
        assert_eq!(res.reason(), "OK");
        assert_eq!(res.body.as_ref(), b"hello");
    }

    #[test]
    fn message_dispatches_on_start_line() {
        assert!(parse_message(&sample_request_bytes())
            .unwrap()
            .is_request());
        let raw = Bytes::from_static(b"SIP/2.0 100 Trying\r\nContent-Length: 0\r\n\r\n");
        assert!(!parse_message(&raw).unwrap().is_request());
    }

    #[test]
    fn missing_blank_line_is_incomplete() {
        let raw = Bytes::from_static(b"OPTIONS sip:a SIP/2.0\r\nVia: SIP/2.0/UDP h;branch=z9hG4bKx\r\n");
        assert_eq!(parse_request(&raw), Err(ParseError::Incomplete));
    }

    #[test]
    fn short_body_is_incomplete() {
        let raw = Bytes::from_static(
            b"OPTIONS sip:example.com SIP/2.0\r\nContent-Length: 10\r\n\r\nbody",
        );
        assert_eq!(parse_request(&raw), Err(ParseError::Incomplete));
    }

    #[test]
    fn long_body_is_truncated_to_declared_length() {
        let raw = Bytes::from_static(
            b"OPTIONS sip:example.com SIP/2.0\r\nContent-Length: 4\r\n\r\nbodyEXTRA",
        );
        let req = parse_request(&raw).expect("parse");
        assert_eq!(req.body.as_ref(), b"body");
    }

    #[test]
    fn unsupported_scheme_is_typed() {
        let raw = Bytes::from_static(b"OPTIONS http:example.com SIP/2.0\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(parse_request(&raw), Err(ParseError::UnsupportedScheme));
    }

    #[test]
    fn folded_header_lines_rejected() {
        let raw = Bytes::from_static(
            b"OPTIONS sip:a SIP/2.0\r\nSubject: first\r\n\tsecond\r\nContent-Length: 0\r\n\r\n",
        );
        assert!(matches!(
            parse_request(&raw),
            Err(ParseError::Malformed { .. })
        ));
    }

    #[test]
    fn malformed_offset_points_at_bad_line() {
        let raw = Bytes::from_static(b"OPTIONS sip:a SIP/2.0\r\nBadHeader\r\nContent-Length: 0\r\n\r\n");
        match parse_request(&raw) {
            Err(ParseError::Malformed { offset }) => assert_eq!(offset, 23),
            other => panic!("expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn invalid_branch_cookie_rejected() {
        let raw = Bytes::from_static(
            b"OPTIONS sip:a SIP/2.0\r\nVia: SIP/2.0/UDP host;branch=badbranch\r\nContent-Length: 0\r\n\r\n",
        );
        assert!(parse_request(&raw).is_err());
    }

    #[test]
    fn cseq_method_mismatch_rejected() {
        let raw = Bytes::from_static(
            b"OPTIONS sip:a SIP/2.0\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n",
        );
        assert!(parse_request(&raw).is_err());
    }

    #[test]
    fn compact_names_canonicalized() {
        let raw = Bytes::from_static(
            b"INVITE sip:bob@example.com SIP/2.0\r\n\
v: SIP/2.0/UDP host;branch=z9hG4bKc\r\n\
f: <sip:alice@example.com>;tag=1\r\n\
t: <sip:bob@example.com>\r\n\
i: xyz@host\r\n\
m: <sip:alice@pc.example.com>\r\n\
k: 100rel, timer\r\n\
l: 0\r\n\r\n",
        );
        let req = parse_request(&raw).expect("parse");
        for name in ["Via", "From", "To", "Call-ID", "Contact", "Supported"] {
            assert!(req.headers.iter().any(|h| h.name == name), "{name} missing");
        }
        assert!(req.headers.get("Content-Length").is_some());
    }

    #[test]
    fn comma_joined_vias_split_into_entries() {
        let raw = Bytes::from_static(
            b"BYE sip:a@b.c SIP/2.0\r\n\
Via: SIP/2.0/UDP h1;branch=z9hG4bKa, SIP/2.0/TCP h2;branch=z9hG4bKb\r\n\
Route: <sip:p1;lr>, <sip:p2;lr>\r\n\
Content-Length: 0\r\n\r\n",
        );
        let req = parse_request(&raw).expect("parse");
        let vias: Vec<_> = req.headers.get_all("Via").map(|v| v.as_str()).collect();
        assert_eq!(
            vias,
            vec![
                "SIP/2.0/UDP h1;branch=z9hG4bKa",
                "SIP/2.0/TCP h2;branch=z9hG4bKb"
            ]
        );
        assert_eq!(req.headers.get_all("Route").count(), 2);
    }

    #[test]
    fn quoted_commas_do_not_split_contact() {
        let raw = Bytes::from_static(
            b"REGISTER sip:example.com SIP/2.0\r\n\
Contact: \"Smith, Alice\" <sip:alice@example.com>\r\n\
Content-Length: 0\r\n\r\n",
        );
        let req = parse_request(&raw).expect("parse");
        let contacts: Vec<_> = req.headers.get_all("Contact").collect();
        assert_eq!(contacts.len(), 1);
        assert!(contacts[0].contains("Smith, Alice"));
    }

    #[test]
    fn extension_headers_kept_verbatim() {
        let raw = Bytes::from_static(
            b"OPTIONS sip:a SIP/2.0\r\nX-Custom-Thing: opaque; stuff=1\r\nContent-Length: 0\r\n\r\n",
        );
        let req = parse_request(&raw).expect("parse");
        assert_eq!(
            req.headers.get("X-Custom-Thing").map(|v| v.as_str()),
            Some("opaque; stuff=1")
        );
    }

    #[test]
    fn content_length_digit_run_rules() {
        assert_eq!(parse_content_length_value("2393"), Some(2393));
        assert_eq!(parse_content_length_value("       2393  "), Some(2393));
        assert_eq!(parse_content_length_value("12abc"), Some(12));
        assert_eq!(parse_content_length_value("abc"), None);
        assert_eq!(parse_content_length_value(""), None);
    }

    #[test]
    fn mismatched_content_lengths_rejected() {
        let raw = Bytes::from_static(
            b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\nbody5",
        );
        assert!(matches!(
            parse_request(&raw),
            Err(ParseError::Malformed { .. })
        ));
    }

    #[test]
    fn serializer_recomputes_content_length() {
        let raw = Bytes::from_static(
            b"MESSAGE sip:a@b.c SIP/2.0\r\nCSeq: 2 MESSAGE\r\nContent-Length: 999\r\n\r\n",
        );
        let mut req = parse_request(&raw).expect("parse");
        req.set_body(Bytes::from_static(b"hello")).unwrap();
        let out = serialize_request(&req);
        let text = std::str::from_utf8(&out).unwrap();
        assert_eq!(text.matches("Content-Length").count(), 1);
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\nhello"));
    }

    #[test]
    fn serializer_inserts_max_forwards() {
        let req = parse_request(&sample_request_bytes()).expect("parse");
        // Sample already has Max-Forwards; strip it and observe reinsertion.
        let mut req = req;
        req.headers.remove_all("Max-Forwards");
        let out = serialize_request(&req);
        assert!(std::str::from_utf8(&out)
            .unwrap()
            .contains("Max-Forwards: 70\r\n"));
    }

    #[test]
    fn parse_serialize_round_trip_is_stable() {
        let req = parse_request(&sample_request_bytes()).expect("parse");
        let out = serialize_request(&req);
        let reparsed = parse_request(&out).expect("reparse");
        for name in ["Via", "To", "From", "Call-ID", "CSeq", "Max-Forwards"] {
            assert_eq!(
                req.headers.get(name).map(|v| v.as_str()),
                reparsed.headers.get(name).map(|v| v.as_str()),
                "header {name} mismatch"
            );
        }
        assert_eq!(req.start.method, reparsed.start.method);
        assert_eq!(req.body, reparsed.body);
    }

    #[test]
    fn response_serialize_round_trip() {
        let raw = Bytes::from_static(
            b"SIP/2.0 180 Ringing\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
To: <sip:bob@example.com>;tag=b1\r\n\
From: <sip:alice@example.com>;tag=a1\r\n\
CSeq: 1 INVITE\r\n\
RSeq: 4711\r\n\
Require: 100rel\r\n\
Content-Length: 0\r\n\r\n",
        );
        let res = parse_response(&raw).expect("parse");
        let reparsed = parse_response(&serialize_response(&res)).expect("reparse");
        assert_eq!(res.code(), reparsed.code());
        assert_eq!(
            res.headers.get("RSeq").map(|v| v.as_str()),
            reparsed.headers.get("RSeq").map(|v| v.as_str())
        );
    }

    proptest! {
        #[test]
        fn round_trip_random_request(
            method_idx in 0usize..5,
            host in "[a-z]{1,8}",
            body in "[a-zA-Z0-9 ]{0,32}"
        ) {
            let methods = ["OPTIONS", "INVITE", "BYE", "CANCEL", "MESSAGE"];
            let method = methods[method_idx % methods.len()];
            let raw = format!(
                "{method} sip:{host}.example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKpt\r\n\
Call-ID: prop@{host}\r\n\
CSeq: 1 {method}\r\n\
Content-Length: {}\r\n\r\n{body}",
                body.len()
            );
            let req = parse_request(&Bytes::from(raw)).expect("parse");
            let reparsed = parse_request(&serialize_request(&req)).expect("reparse");
            prop_assert_eq!(req.start.method.as_str(), method);
            prop_assert_eq!(reparsed.body.as_ref(), body.as_bytes());
        }

        #[test]
        fn header_values_survive_round_trip(
            value in "[a-zA-Z0-9 ;=/.-]{0,24}"
        ) {
            prop_assume!(value.trim() == value);
            let raw = format!(
                "OPTIONS sip:example.com SIP/2.0\r\nX-Prop: {value}\r\nContent-Length: 0\r\n\r\n"
            );
            let req = parse_request(&Bytes::from(raw)).expect("parse");
            let reparsed = parse_request(&serialize_request(&req)).expect("reparse");
            prop_assert_eq!(
                reparsed.headers.get("x-prop").map(|v| v.as_str()),
                Some(value.as_str())
            );
        }
    }
}
