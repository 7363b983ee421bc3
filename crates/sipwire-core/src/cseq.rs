use std::fmt;

use crate::method::Method;

/// CSeq header: a sequence number paired with the request method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeqHeader {
    pub seq: u32,
    pub method: Method,
}

impl CSeqHeader {
    /// Creates a CSeq value.
    pub fn new(seq: u32, method: Method) -> Self {
        Self { seq, method }
    }

    /// Parses `"314159 INVITE"`.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = Method::from_token(parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        Some(Self { seq, method })
    }
}

impl fmt::Display for CSeqHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method.as_str())
    }
}
