// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RSeq and RAck headers for reliable provisional responses (RFC 3262).
//!
//! A UAS sending a reliable 1xx stamps it with an RSeq sequence number; the
//! UAC acknowledges with a PRACK whose RAck echoes that RSeq together with
//! the CSeq of the original request. RSeq values start at a random point and
//! increase by one per reliable provisional within the transaction.

use std::fmt;

use crate::method::Method;

/// Upper bound for RSeq values (2^31 - 1 per RFC 3262 §7.1).
pub const MAX_RSEQ: u32 = (1 << 31) - 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RSeqError {
    ZeroSequence,
    SequenceOutOfRange(u32),
    Malformed(String),
}

impl fmt::Display for RSeqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSequence => write!(f, "RSeq sequence cannot be zero"),
            Self::SequenceOutOfRange(v) => {
                write!(f, "RSeq sequence {} out of range 1-{}", v, MAX_RSEQ)
            }
            Self::Malformed(msg) => write!(f, "malformed value: {}", msg),
        }
    }
}

impl std::error::Error for RSeqError {}

fn validate_sequence(sequence: u32) -> Result<(), RSeqError> {
    if sequence == 0 {
        return Err(RSeqError::ZeroSequence);
    }
    if sequence > MAX_RSEQ {
        return Err(RSeqError::SequenceOutOfRange(sequence));
    }
    Ok(())
}

/// RSeq header carried on a reliable provisional response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RSeqHeader {
    sequence: u32,
}

impl RSeqHeader {
    /// Creates an RSeq header; the sequence must be in [1, 2^31 - 1].
    pub fn new(sequence: u32) -> Result<Self, RSeqError> {
        validate_sequence(sequence)?;
        Ok(Self { sequence })
    }

    /// Parses the decimal header value.
    pub fn parse(value: &str) -> Result<Self, RSeqError> {
        let sequence = value
            .trim()
            .parse()
            .map_err(|_| RSeqError::Malformed(value.trim().to_string()))?;
        Self::new(sequence)
    }

    /// Returns the sequence number.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Returns the successor RSeq for the next reliable provisional.
    pub fn next(&self) -> Result<Self, RSeqError> {
        Self::new(self.sequence + 1)
    }
}

impl fmt::Display for RSeqHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sequence)
    }
}

/// RAck header carried on a PRACK: `rseq SP cseq SP method`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RAckHeader {
    pub rseq: u32,
    pub cseq: u32,
    pub method: Method,
}

impl RAckHeader {
    /// Creates an RAck value.
    pub fn new(rseq: u32, cseq: u32, method: Method) -> Result<Self, RSeqError> {
        validate_sequence(rseq)?;
        Ok(Self { rseq, cseq, method })
    }

    /// Parses `"776656 1 INVITE"`.
    pub fn parse(value: &str) -> Result<Self, RSeqError> {
        let mut parts = value.split_whitespace();
        let rseq = parts
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| RSeqError::Malformed("missing rseq".to_string()))?;
        let cseq = parts
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| RSeqError::Malformed("missing cseq".to_string()))?;
        let method = parts
            .next()
            .map(Method::from_token)
            .ok_or_else(|| RSeqError::Malformed("missing method".to_string()))?;
        if parts.next().is_some() {
            return Err(RSeqError::Malformed("trailing tokens".to_string()));
        }
        Self::new(rseq, cseq, method)
    }

    /// Returns true when this RAck acknowledges the given provisional.
    pub fn acknowledges(&self, rseq: u32, cseq: u32, method: &Method) -> bool {
        self.rseq == rseq && self.cseq == cseq && &self.method == method
    }
}

impl fmt::Display for RAckHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.rseq, self.cseq, self.method.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rseq_bounds() {
        assert!(RSeqHeader::new(1).is_ok());
        assert!(RSeqHeader::new(MAX_RSEQ).is_ok());
        assert!(RSeqHeader::new(0).is_err());
        assert!(RSeqHeader::new(MAX_RSEQ + 1).is_err());
    }

    #[test]
    fn rseq_parse_and_next() {
        let rseq = RSeqHeader::parse(" 2000 ").unwrap();
        assert_eq!(rseq.sequence(), 2000);
        assert_eq!(rseq.next().unwrap().sequence(), 2001);
    }

    #[test]
    fn rack_parse_round_trip() {
        let rack = RAckHeader::parse("776656 1 INVITE").unwrap();
        assert_eq!(rack.rseq, 776656);
        assert_eq!(rack.cseq, 1);
        assert_eq!(rack.method, Method::Invite);
        assert_eq!(rack.to_string(), "776656 1 INVITE");
    }

    #[test]
    fn rack_acknowledges_exact_match_only() {
        let rack = RAckHeader::new(5, 1, Method::Invite).unwrap();
        assert!(rack.acknowledges(5, 1, &Method::Invite));
        assert!(!rack.acknowledges(6, 1, &Method::Invite));
        assert!(!rack.acknowledges(5, 2, &Method::Invite));
        assert!(!rack.acknowledges(5, 1, &Method::Update));
    }

    #[test]
    fn rack_rejects_garbage() {
        assert!(RAckHeader::parse("1 INVITE").is_err());
        assert!(RAckHeader::parse("1 2 INVITE extra").is_err());
    }
}
