// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The four RFC 3261 transaction state machines as pure event → action
//! functions. The engine owns the tables and timers and applies the actions;
//! the FSMs own only their state, stored wire bytes, and backoff intervals.

use std::time::Duration;

use bytes::Bytes;
use sipwire_core::{Request, Response};
use sipwire_parse::{serialize_request, serialize_response};
use smol_str::SmolStr;

use crate::{timers::TransportAwareTimers, TransactionTimer};

/// Transaction states across the four machine types. Transitions are one-way
/// within each machine; `Cancelled` is the practical extra state an INVITE
/// server enters when a CANCEL matches it before a final response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Cancelled,
    Terminated,
}

/// Inputs to a transaction state machine.
#[derive(Debug, Clone)]
pub enum Event {
    /// Client: transmit the initial request.
    SendRequest(Request),
    /// Client: a 1xx arrived.
    ReceiveProvisional(Response),
    /// Client: a final response arrived.
    ReceiveFinal(Response),
    /// Server: TU submits a provisional response.
    SendProvisional(Response),
    /// Server: TU submits a final response.
    SendFinal(Response),
    /// Server INVITE: ACK arrived for a non-2xx final.
    ReceiveAck,
    /// Server INVITE: a CANCEL matched this transaction.
    CancelCall,
    TimerFired(TransactionTimer),
}

/// Outputs a state machine asks the engine to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Put these bytes on the wire toward the transaction's peer.
    Transmit(Bytes),
    /// Hand a response up to the transaction user.
    Deliver(Response),
    /// Client INVITE: build, store, and send an ACK for this non-2xx final.
    SendAck(Response),
    /// Client INVITE: resend the stored ACK (duplicate final received).
    RetransmitAck,
    /// Server INVITE: no provisional went out within the grace period; the
    /// engine sends 100 Trying on the TU's behalf.
    AutoTrying,
    Schedule {
        timer: TransactionTimer,
        duration: Duration,
    },
    CancelTimer(TransactionTimer),
    /// The transaction reached Terminated.
    Terminate { timed_out: bool, reason: SmolStr },
}

fn terminate(timed_out: bool, reason: &str) -> Action {
    Action::Terminate {
        timed_out,
        reason: SmolStr::new(reason),
    }
}

/// INVITE client transaction (RFC 3261 §17.1.1).
pub struct ClientInviteFsm {
    pub state: TxState,
    timers: TransportAwareTimers,
    a_interval: Duration,
    last_request: Option<Bytes>,
}

impl ClientInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: TxState::Calling,
            timers,
            a_interval: timers.t1(),
            last_request: None,
        }
    }

    pub fn on_event(&mut self, event: Event) -> Vec<Action> {
        use TxState::*;
        match (self.state, event) {
            (Calling, Event::SendRequest(request)) => self.send_invite(request),
            (Calling | Proceeding, Event::ReceiveProvisional(response)) => {
                self.state = Proceeding;
                vec![
                    Action::CancelTimer(TransactionTimer::A),
                    Action::Deliver(response),
                ]
            }
            (Calling | Proceeding, Event::ReceiveFinal(response)) => self.receive_final(response),
            (Completed, Event::ReceiveFinal(response)) => {
                // Absorb duplicate finals by re-ACKing; nothing is delivered.
                if response.is_success() {
                    Vec::new()
                } else {
                    vec![Action::RetransmitAck]
                }
            }
            (Calling, Event::TimerFired(TransactionTimer::A)) => self.timer_a(),
            (Calling | Proceeding, Event::TimerFired(TransactionTimer::B)) => {
                self.state = Terminated;
                vec![
                    Action::CancelTimer(TransactionTimer::A),
                    terminate(true, "Timer B expired"),
                ]
            }
            (Completed, Event::TimerFired(TransactionTimer::D)) => {
                self.state = Terminated;
                vec![terminate(false, "Timer D expired")]
            }
            _ => Vec::new(),
        }
    }

    fn send_invite(&mut self, request: Request) -> Vec<Action> {
        let bytes = serialize_request(&request);
        self.last_request = Some(bytes.clone());
        let mut actions = vec![Action::Transmit(bytes)];
        if self.timers.should_retransmit() {
            actions.push(Action::Schedule {
                timer: TransactionTimer::A,
                duration: self.a_interval,
            });
        }
        actions.push(Action::Schedule {
            timer: TransactionTimer::B,
            duration: self.timers.duration(TransactionTimer::B),
        });
        actions
    }

    fn receive_final(&mut self, response: Response) -> Vec<Action> {
        let mut actions = vec![
            Action::CancelTimer(TransactionTimer::A),
            Action::CancelTimer(TransactionTimer::B),
            Action::Deliver(response.clone()),
        ];
        if response.is_success() {
            // The TU generates the ACK for 2xx; the transaction is done.
            self.state = TxState::Terminated;
            actions.push(terminate(false, "2xx received"));
        } else {
            self.state = TxState::Completed;
            actions.push(Action::SendAck(response));
            actions.push(Action::Schedule {
                timer: TransactionTimer::D,
                duration: self.timers.duration(TransactionTimer::D),
            });
        }
        actions
    }

    fn timer_a(&mut self) -> Vec<Action> {
        let Some(request) = &self.last_request else {
            return Vec::new();
        };
        // Timer A doubles without a cap; Timer B bounds the whole exchange.
        self.a_interval *= 2;
        vec![
            Action::Transmit(request.clone()),
            Action::Schedule {
                timer: TransactionTimer::A,
                duration: self.a_interval,
            },
        ]
    }
}

/// Non-INVITE client transaction (RFC 3261 §17.1.2).
pub struct ClientNonInviteFsm {
    pub state: TxState,
    timers: TransportAwareTimers,
    e_interval: Duration,
    last_request: Option<Bytes>,
}

impl ClientNonInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: TxState::Trying,
            timers,
            e_interval: timers.t1(),
            last_request: None,
        }
    }

    pub fn on_event(&mut self, event: Event) -> Vec<Action> {
        use TxState::*;
        match (self.state, event) {
            (Trying, Event::SendRequest(request)) => self.send_request(request),
            (Trying | Proceeding, Event::ReceiveProvisional(response)) => {
                self.state = Proceeding;
                vec![Action::Deliver(response)]
            }
            (Trying | Proceeding, Event::ReceiveFinal(response)) => {
                self.state = Completed;
                vec![
                    Action::Deliver(response),
                    Action::CancelTimer(TransactionTimer::E),
                    Action::CancelTimer(TransactionTimer::F),
                    Action::Schedule {
                        timer: TransactionTimer::K,
                        duration: self.timers.duration(TransactionTimer::K),
                    },
                ]
            }
            (Trying | Proceeding, Event::TimerFired(TransactionTimer::E)) => self.timer_e(),
            (Trying | Proceeding, Event::TimerFired(TransactionTimer::F)) => {
                self.state = Terminated;
                vec![
                    Action::CancelTimer(TransactionTimer::E),
                    terminate(true, "Timer F expired"),
                ]
            }
            (Completed, Event::TimerFired(TransactionTimer::K)) => {
                self.state = Terminated;
                vec![terminate(false, "Timer K expired")]
            }
            _ => Vec::new(),
        }
    }

    fn send_request(&mut self, request: Request) -> Vec<Action> {
        let bytes = serialize_request(&request);
        self.last_request = Some(bytes.clone());
        let mut actions = vec![Action::Transmit(bytes)];
        if self.timers.should_retransmit() {
            actions.push(Action::Schedule {
                timer: TransactionTimer::E,
                duration: self.e_interval,
            });
        }
        actions.push(Action::Schedule {
            timer: TransactionTimer::F,
            duration: self.timers.duration(TransactionTimer::F),
        });
        actions
    }

    fn timer_e(&mut self) -> Vec<Action> {
        let Some(request) = &self.last_request else {
            return Vec::new();
        };
        // In Proceeding the retransmit period pins to T2 (RFC 3261 §17.1.2.2).
        self.e_interval = if self.state == TxState::Proceeding {
            self.timers.t2()
        } else {
            (self.e_interval * 2).min(self.timers.t2())
        };
        vec![
            Action::Transmit(request.clone()),
            Action::Schedule {
                timer: TransactionTimer::E,
                duration: self.e_interval,
            },
        ]
    }
}

/// INVITE server transaction (RFC 3261 §17.2.1) with the `Cancelled` state
/// entered when a CANCEL matches before a final response.
pub struct ServerInviteFsm {
    pub state: TxState,
    timers: TransportAwareTimers,
    g_interval: Duration,
    last_provisional: Option<Bytes>,
    last_final: Option<Bytes>,
    pub provisional_sent: bool,
}

impl ServerInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: TxState::Proceeding,
            timers,
            g_interval: timers.t1(),
            last_provisional: None,
            last_final: None,
            provisional_sent: false,
        }
    }

    /// Actions performed when the INVITE transaction is created.
    pub fn on_create(&mut self) -> Vec<Action> {
        vec![Action::Schedule {
            timer: TransactionTimer::Trying,
            duration: self.timers.duration(TransactionTimer::Trying),
        }]
    }

    /// A retransmitted INVITE arrived; resend whatever went out last.
    pub fn on_retransmit(&self) -> Vec<Action> {
        let stored = match self.state {
            TxState::Completed => self.last_final.as_ref(),
            TxState::Proceeding => self.last_provisional.as_ref(),
            _ => None,
        };
        stored
            .map(|bytes| vec![Action::Transmit(bytes.clone())])
            .unwrap_or_default()
    }

    pub fn on_event(&mut self, event: Event) -> Vec<Action> {
        use TxState::*;
        match (self.state, event) {
            (Proceeding, Event::TimerFired(TransactionTimer::Trying)) => {
                if self.provisional_sent {
                    Vec::new()
                } else {
                    vec![Action::AutoTrying]
                }
            }
            (Proceeding, Event::SendProvisional(response)) => {
                let bytes = serialize_response(&response);
                self.last_provisional = Some(bytes.clone());
                self.provisional_sent = true;
                vec![Action::Transmit(bytes)]
            }
            (Proceeding | Cancelled, Event::SendFinal(response)) => self.send_final(response),
            (Proceeding, Event::CancelCall) => {
                self.state = Cancelled;
                // Stop pending work without emitting a response; the TU
                // produces the 487 through this transaction.
                vec![
                    Action::CancelTimer(TransactionTimer::Trying),
                    Action::Schedule {
                        timer: TransactionTimer::H,
                        duration: self.timers.duration(TransactionTimer::H),
                    },
                ]
            }
            (Completed, Event::ReceiveAck) => {
                self.state = Confirmed;
                vec![
                    Action::CancelTimer(TransactionTimer::G),
                    Action::CancelTimer(TransactionTimer::H),
                    Action::Schedule {
                        timer: TransactionTimer::I,
                        duration: self.timers.duration(TransactionTimer::I),
                    },
                ]
            }
            (Completed, Event::TimerFired(TransactionTimer::G)) => self.timer_g(),
            (Completed | Cancelled, Event::TimerFired(TransactionTimer::H)) => {
                self.state = Terminated;
                vec![
                    Action::CancelTimer(TransactionTimer::G),
                    terminate(true, "Timer H expired"),
                ]
            }
            (Confirmed, Event::TimerFired(TransactionTimer::I)) => {
                self.state = Terminated;
                vec![terminate(false, "Timer I expired")]
            }
            _ => Vec::new(),
        }
    }

    fn send_final(&mut self, response: Response) -> Vec<Action> {
        let bytes = serialize_response(&response);
        let mut actions = vec![
            Action::CancelTimer(TransactionTimer::Trying),
            Action::Transmit(bytes.clone()),
        ];
        if response.is_success() {
            // Reliable 2xx delivery is the TU's concern above this layer.
            self.state = TxState::Terminated;
            actions.push(terminate(false, "2xx sent"));
        } else {
            self.state = TxState::Completed;
            self.last_final = Some(bytes);
            self.g_interval = self.timers.t1();
            if self.timers.should_retransmit() {
                actions.push(Action::Schedule {
                    timer: TransactionTimer::G,
                    duration: self.g_interval,
                });
            }
            actions.push(Action::Schedule {
                timer: TransactionTimer::H,
                duration: self.timers.duration(TransactionTimer::H),
            });
        }
        actions
    }

    fn timer_g(&mut self) -> Vec<Action> {
        let Some(bytes) = &self.last_final else {
            return Vec::new();
        };
        let transmit = Action::Transmit(bytes.clone());
        self.g_interval = (self.g_interval * 2).min(self.timers.t2());
        vec![
            transmit,
            Action::Schedule {
                timer: TransactionTimer::G,
                duration: self.g_interval,
            },
        ]
    }
}

/// Non-INVITE server transaction (RFC 3261 §17.2.2).
pub struct ServerNonInviteFsm {
    pub state: TxState,
    timers: TransportAwareTimers,
    last_provisional: Option<Bytes>,
    last_final: Option<Bytes>,
}

impl ServerNonInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: TxState::Trying,
            timers,
            last_provisional: None,
            last_final: None,
        }
    }

    /// A retransmitted request arrived; absorb it by resending the stored
    /// response.
    pub fn on_retransmit(&self) -> Vec<Action> {
        let stored = match self.state {
            TxState::Completed => self.last_final.as_ref(),
            TxState::Proceeding => self.last_provisional.as_ref(),
            _ => None,
        };
        stored
            .map(|bytes| vec![Action::Transmit(bytes.clone())])
            .unwrap_or_default()
    }

    pub fn on_event(&mut self, event: Event) -> Vec<Action> {
        use TxState::*;
        match (self.state, event) {
            (Trying | Proceeding, Event::SendProvisional(response)) => {
                let bytes = serialize_response(&response);
                self.last_provisional = Some(bytes.clone());
                self.state = Proceeding;
                vec![Action::Transmit(bytes)]
            }
            (Trying | Proceeding, Event::SendFinal(response)) => {
                let bytes = serialize_response(&response);
                self.last_final = Some(bytes.clone());
                self.state = Completed;
                vec![
                    Action::Transmit(bytes),
                    Action::Schedule {
                        timer: TransactionTimer::J,
                        duration: self.timers.duration(TransactionTimer::J),
                    },
                ]
            }
            (Completed, Event::TimerFired(TransactionTimer::J)) => {
                self.state = Terminated;
                vec![terminate(false, "Timer J expired")]
            }
            _ => Vec::new(),
        }
    }
}
