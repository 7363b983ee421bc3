// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport-aware timer values (RFC 3261 §17, Table 4).
//!
//! On reliable transports the retransmit timers (A, E, G) vanish and the
//! post-final wait timers (D, I, J, K) collapse to zero; the overall
//! timeouts (B, F, H) hold for every transport.

use std::time::Duration;

use sipwire_transport::TransportKind;

use crate::{TimerDefaults, TransactionTimer};

/// Delay before an INVITE server transaction emits an automatic 100 Trying.
pub const AUTO_TRYING_DELAY: Duration = Duration::from_millis(200);

/// Computes timer durations for one transaction's transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportAwareTimers {
    transport: TransportKind,
    defaults: TimerDefaults,
}

impl TransportAwareTimers {
    pub fn new(transport: TransportKind, defaults: TimerDefaults) -> Self {
        Self {
            transport,
            defaults,
        }
    }

    /// Base T1.
    pub fn t1(&self) -> Duration {
        self.defaults.t1
    }

    /// Base T2 (retransmit interval cap).
    pub fn t2(&self) -> Duration {
        self.defaults.t2
    }

    /// True when retransmissions are needed at all.
    pub fn should_retransmit(&self) -> bool {
        !self.transport.is_reliable()
    }

    /// Returns the duration for a timer; zero means "already elapsed".
    pub fn duration(&self, timer: TransactionTimer) -> Duration {
        let reliable = self.transport.is_reliable();
        match timer {
            // Retransmit timers: start at T1, absent on reliable transports.
            TransactionTimer::A | TransactionTimer::E | TransactionTimer::G => {
                if reliable {
                    Duration::ZERO
                } else {
                    self.defaults.t1
                }
            }
            // Overall timeouts: 64*T1 everywhere.
            TransactionTimer::B | TransactionTimer::F | TransactionTimer::H => {
                self.defaults.t1.saturating_mul(64)
            }
            // Completed-state linger for INVITE clients: >= 32s on UDP.
            TransactionTimer::D => {
                if reliable {
                    Duration::ZERO
                } else {
                    Duration::from_secs(32)
                }
            }
            // ACK / retransmission absorption waits.
            TransactionTimer::I | TransactionTimer::K => {
                if reliable {
                    Duration::ZERO
                } else {
                    self.defaults.t4
                }
            }
            TransactionTimer::J => {
                if reliable {
                    Duration::ZERO
                } else {
                    self.defaults.t1.saturating_mul(64)
                }
            }
            TransactionTimer::Trying => AUTO_TRYING_DELAY,
        }
    }
}
