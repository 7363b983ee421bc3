// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP types for the sipwire stack.
//!
//! This crate provides the data model shared by the parser, transport, and
//! transaction layers:
//! - **Messages**: [`Request`], [`Response`], [`SipMessage`]
//! - **Headers**: the ordered [`Headers`] container plus typed values
//!   ([`ViaHeader`], [`NameAddr`], [`CSeqHeader`], [`RSeqHeader`],
//!   [`RAckHeader`], [`TokenList`])
//! - **URIs**: [`SipUri`] covering the sip, sips, ws, and wss schemes
//! - **Methods**: the [`Method`] enum with extension-method passthrough
//!
//! Types lean on [`SmolStr`](smol_str::SmolStr) for header-sized strings and
//! [`Bytes`](bytes::Bytes) for message bodies so messages clone cheaply as
//! they move between tasks.

pub mod cseq;
pub mod headers;
pub mod method;
pub mod msg;
pub mod name_addr;
pub mod rseq;
pub mod token_list;
pub mod uri;
pub mod version;
pub mod via;

pub use cseq::CSeqHeader;
pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{MessageError, Request, RequestLine, Response, SipMessage, StatusLine};
pub use name_addr::NameAddr;
pub use rseq::{RAckHeader, RSeqError, RSeqHeader, MAX_RSEQ};
pub use token_list::{TokenList, EXTENSION_100REL};
pub use uri::{SipUri, UriError, UriScheme};
pub use via::{is_valid_branch, ViaError, ViaHeader, ViaTransport, BRANCH_MAGIC_COOKIE};
pub use version::SipVersion;
