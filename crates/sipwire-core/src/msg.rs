// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{headers::Headers, method::Method, uri::SipUri, version::SipVersion};

const MAX_REASON_LENGTH: usize = 256;
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    InvalidStatusCode { code: u16 },
    ReasonTooLong { max: usize, actual: usize },
    InvalidReason(String),
    BodyTooLarge { max: usize, actual: usize },
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidStatusCode { code } => {
                write!(f, "invalid SIP status code: {} (must be 100-699)", code)
            }
            Self::ReasonTooLong { max, actual } => {
                write!(f, "reason phrase too long (max {}, got {})", max, actual)
            }
            Self::InvalidReason(msg) => write!(f, "invalid reason phrase: {}", msg),
            Self::BodyTooLarge { max, actual } => {
                write!(f, "body too large (max {}, got {})", max, actual)
            }
        }
    }
}

impl std::error::Error for MessageError {}

/// First line of a SIP request: `Method SP Request-URI SP SIP-Version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SipUri,
    pub version: SipVersion,
}

impl RequestLine {
    /// Creates a request line for the given method and target URI.
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self {
            method,
            uri,
            version: SipVersion::V2,
        }
    }
}

/// First line of a SIP response: `SIP-Version SP Status-Code SP Reason`.
///
/// The constructor validates the status range (100-699) and rejects control
/// characters in the reason phrase, which blocks CRLF injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: SipVersion,
    pub code: u16,
    pub reason: SmolStr,
}

impl StatusLine {
    /// Creates a status line with the provided code and reason phrase.
    pub fn new(code: u16, reason: impl AsRef<str>) -> Result<Self, MessageError> {
        if !(100..=699).contains(&code) {
            return Err(MessageError::InvalidStatusCode { code });
        }
        let reason = reason.as_ref();
        validate_reason_phrase(reason)?;
        Ok(Self {
            version: SipVersion::V2,
            code,
            reason: SmolStr::new(reason),
        })
    }

    /// Returns true if this is an informational response (1xx).
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Returns true if this is a success response (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns true for any final response (>= 200).
    pub fn is_final(&self) -> bool {
        self.code >= 200
    }
}

/// In-memory representation of a SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub start: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    /// Builds a request from its components, bounding the body size.
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Result<Self, MessageError> {
        validate_body_size(&body)?;
        Ok(Self {
            start,
            headers,
            body,
        })
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        &self.start.method
    }

    /// Returns the request URI.
    pub fn uri(&self) -> &SipUri {
        &self.start.uri
    }

    /// Returns the Max-Forwards value, if the header is present and numeric.
    ///
    /// Absence is represented as `None`; there is no sentinel value.
    pub fn max_forwards(&self) -> Option<u32> {
        self.headers.get("Max-Forwards")?.trim().parse().ok()
    }

    /// Sets the message body, re-validating the size bound.
    pub fn set_body(&mut self, body: Bytes) -> Result<(), MessageError> {
        validate_body_size(&body)?;
        self.body = body;
        Ok(())
    }
}

/// In-memory representation of a SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub start: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    /// Builds a response from its components, bounding the body size.
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Result<Self, MessageError> {
        validate_body_size(&body)?;
        Ok(Self {
            start,
            headers,
            body,
        })
    }

    /// Returns the status code.
    pub fn code(&self) -> u16 {
        self.start.code
    }

    /// Returns the reason phrase.
    pub fn reason(&self) -> &str {
        &self.start.reason
    }

    /// Returns true if this is an informational response (1xx).
    pub fn is_provisional(&self) -> bool {
        self.start.is_provisional()
    }

    /// Returns true if this is a success response (2xx).
    pub fn is_success(&self) -> bool {
        self.start.is_success()
    }

    /// Returns true for any final response (>= 200).
    pub fn is_final(&self) -> bool {
        self.start.is_final()
    }

    /// Sets the message body, re-validating the size bound.
    pub fn set_body(&mut self, body: Bytes) -> Result<(), MessageError> {
        validate_body_size(&body)?;
        self.body = body;
        Ok(())
    }
}

/// Either a SIP request or response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    /// Returns true if this is a request.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    /// Returns a reference to the request if this is a request.
    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Self::Request(req) => Some(req),
            _ => None,
        }
    }

    /// Returns a reference to the response if this is a response.
    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Self::Response(res) => Some(res),
            _ => None,
        }
    }

    /// Returns the headers regardless of message type.
    pub fn headers(&self) -> &Headers {
        match self {
            Self::Request(req) => &req.headers,
            Self::Response(res) => &res.headers,
        }
    }

    /// Returns the body regardless of message type.
    pub fn body(&self) -> &Bytes {
        match self {
            Self::Request(req) => &req.body,
            Self::Response(res) => &res.body,
        }
    }
}

fn validate_reason_phrase(reason: &str) -> Result<(), MessageError> {
    if reason.len() > MAX_REASON_LENGTH {
        return Err(MessageError::ReasonTooLong {
            max: MAX_REASON_LENGTH,
            actual: reason.len(),
        });
    }
    if reason.chars().any(|c| c.is_ascii_control()) {
        return Err(MessageError::InvalidReason(
            "contains control characters".to_string(),
        ));
    }
    Ok(())
}

fn validate_body_size(body: &Bytes) -> Result<(), MessageError> {
    if body.len() > MAX_BODY_SIZE {
        return Err(MessageError::BodyTooLarge {
            max: MAX_BODY_SIZE,
            actual: body.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_uri() -> SipUri {
        SipUri::parse("sip:bob@example.com").expect("failed to parse URI")
    }

    #[test]
    fn create_request_line() {
        let line = RequestLine::new(Method::Invite, mock_uri());
        assert_eq!(line.method, Method::Invite);
        assert_eq!(line.version, SipVersion::V2);
    }

    #[test]
    fn status_code_bounds() {
        assert!(StatusLine::new(100, "Trying").is_ok());
        assert!(StatusLine::new(699, "Whatever").is_ok());
        assert!(StatusLine::new(99, "Low").is_err());
        assert!(StatusLine::new(700, "High").is_err());
    }

    #[test]
    fn reject_crlf_in_reason() {
        assert!(StatusLine::new(200, "OK\r\nInjected: evil").is_err());
    }

    #[test]
    fn reject_oversized_reason() {
        let long = "x".repeat(MAX_REASON_LENGTH + 1);
        assert!(StatusLine::new(200, &long).is_err());
    }

    #[test]
    fn status_line_predicates() {
        assert!(StatusLine::new(183, "Session Progress")
            .unwrap()
            .is_provisional());
        assert!(StatusLine::new(200, "OK").unwrap().is_success());
        assert!(StatusLine::new(486, "Busy Here").unwrap().is_final());
        assert!(!StatusLine::new(180, "Ringing").unwrap().is_final());
    }

    #[test]
    fn reject_oversized_body() {
        let line = RequestLine::new(Method::Invite, mock_uri());
        let huge = Bytes::from(vec![0u8; MAX_BODY_SIZE + 1]);
        assert!(Request::new(line, Headers::new(), huge).is_err());
    }

    #[test]
    fn max_forwards_is_optional() {
        let line = RequestLine::new(Method::Cancel, mock_uri());
        let mut req = Request::new(line, Headers::new(), Bytes::new()).unwrap();
        assert_eq!(req.max_forwards(), None);
        req.headers.push("Max-Forwards", "70");
        assert_eq!(req.max_forwards(), Some(70));
    }

    #[test]
    fn sip_message_accessors() {
        let req = Request::new(
            RequestLine::new(Method::Options, mock_uri()),
            Headers::new(),
            Bytes::new(),
        )
        .unwrap();
        let msg = SipMessage::Request(req);
        assert!(msg.is_request());
        assert!(msg.as_request().is_some());
        assert!(msg.as_response().is_none());
    }
}
