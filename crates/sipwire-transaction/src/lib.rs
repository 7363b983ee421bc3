// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP transaction layer (RFC 3261 §17, RFC 3262).
//!
//! Four state machines — INVITE client, INVITE server, non-INVITE client,
//! non-INVITE server — expressed as pure event → action FSMs in [`fsm`],
//! driven by the [`engine::TransactionEngine`] which owns the transaction
//! tables, timers, and reliable provisional (PRACK) state.

use rand::{distributions::Alphanumeric, Rng};
use sipwire_core::{Headers, Request};
use smol_str::SmolStr;
use std::time::Duration;

pub mod engine;
pub mod fsm;
pub mod key;
pub mod timers;

pub use engine::{
    cancel_request, InboundHandler, ServerTransactionHandle, TransactionEngine,
    TransactionSnapshot, TransactionUser,
};
pub use fsm::{Action, Event, TxState};
pub use key::TransactionKey;
pub use timers::TransportAwareTimers;

/// Timers referenced by the transaction state machines (RFC 3261 §17).
///
/// `Trying` is the 200 ms delay before an INVITE server transaction emits an
/// automatic 100 Trying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionTimer {
    A,
    B,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    Trying,
}

/// Base timer values (RFC 3261 Table 4) plus the T6 lingering window after
/// which terminated transactions are swept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerDefaults {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    pub t6: Duration,
}

impl Default for TimerDefaults {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            t6: Duration::from_secs(32),
        }
    }
}

/// Extracts the `branch=` parameter from a raw Via header value.
pub fn branch_from_via(via: &str) -> Option<&str> {
    via.split(';').skip(1).find_map(|part| {
        let mut split = part.splitn(2, '=');
        let name = split.next()?.trim();
        let value = split.next()?.trim();
        if name.eq_ignore_ascii_case("branch") {
            Some(value)
        } else {
            None
        }
    })
}

/// Returns the top-most Via header value of a header block.
pub fn top_via(headers: &Headers) -> Option<&SmolStr> {
    headers.get("Via")
}

/// Returns the branch of a request's top Via, if present.
pub fn request_branch(req: &Request) -> Option<SmolStr> {
    let via = top_via(&req.headers)?;
    branch_from_via(via).map(SmolStr::new)
}

/// Generates a fresh RFC 3261 magic-cookie branch identifier.
pub fn generate_branch() -> SmolStr {
    let mut rng = rand::thread_rng();
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    SmolStr::new(format!("z9hG4bK{}", suffix))
}
