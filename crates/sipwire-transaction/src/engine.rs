// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transaction engine: owns the client/server tables, schedules timers,
//! matches inbound messages to transactions, and layers RFC 3262 reliable
//! provisional responses on INVITE server transactions.
//!
//! Terminated transactions linger for T6 before a housekeeping sweep removes
//! them and drops their event sink, breaking any retention cycle between the
//! transaction and its user.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use sipwire_core::{
    CSeqHeader, Headers, Method, RAckHeader, Request, RequestLine, Response, SipMessage,
    StatusLine, TokenList, EXTENSION_100REL,
};
use sipwire_parse::{parse_message, serialize_request, serialize_response};
use sipwire_transport::{Endpoint, InboundMessage, RetransmitHandle, Transport};
use smol_str::SmolStr;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::fsm::{
    Action, ClientInviteFsm, ClientNonInviteFsm, Event, ServerInviteFsm, ServerNonInviteFsm,
    TxState,
};
use crate::key::TransactionKey;
use crate::timers::TransportAwareTimers;
use crate::{branch_from_via, request_branch, TimerDefaults, TransactionTimer};

/// Cadence of the sweep that reaps lingering terminated transactions.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Events a transaction reports to its user. Every method has an empty
/// default so sinks implement only what they need.
#[async_trait::async_trait]
pub trait TransactionUser: Send + Sync {
    /// A 1xx response was received (client transactions).
    async fn on_provisional(&self, _key: &TransactionKey, _response: &Response) {}
    /// A final response was received (client transactions).
    async fn on_final(&self, _key: &TransactionKey, _response: &Response) {}
    /// The transaction changed state.
    async fn on_state_changed(&self, _key: &TransactionKey, _state: TxState) {}
    /// Timer B/F/H expired without resolution.
    async fn on_timeout(&self, _key: &TransactionKey) {}
    /// A CANCEL matched this INVITE server transaction.
    async fn on_cancelled(&self, _key: &TransactionKey) {}
    /// A PRACK acknowledged this transaction's reliable provisional.
    async fn on_prack(&self, _key: &TransactionKey, _rack: &RAckHeader) {}
    /// A send attempt failed; retries continue until the governing timer.
    async fn on_transport_error(&self, _key: &TransactionKey) {}
    /// The transaction was removed; the engine drops its sink handle next.
    async fn on_removed(&self, _key: &TransactionKey) {}
}

/// Callbacks for messages that match no existing transaction.
#[async_trait::async_trait]
pub trait InboundHandler: Send + Sync {
    /// A request created a new server transaction.
    async fn on_request_received(&self, request: Request, transaction: ServerTransactionHandle);
    /// A response matched no client transaction.
    async fn on_response_received(&self, response: Response, remote: Endpoint);
}

struct NoopSink;

#[async_trait::async_trait]
impl TransactionUser for NoopSink {}

enum ClientFsm {
    Invite(ClientInviteFsm),
    NonInvite(ClientNonInviteFsm),
}

impl ClientFsm {
    fn state(&self) -> TxState {
        match self {
            ClientFsm::Invite(fsm) => fsm.state,
            ClientFsm::NonInvite(fsm) => fsm.state,
        }
    }

    fn on_event(&mut self, event: Event) -> Vec<Action> {
        match self {
            ClientFsm::Invite(fsm) => fsm.on_event(event),
            ClientFsm::NonInvite(fsm) => fsm.on_event(event),
        }
    }
}

enum ServerFsm {
    Invite(ServerInviteFsm),
    NonInvite(ServerNonInviteFsm),
}

impl ServerFsm {
    fn state(&self) -> TxState {
        match self {
            ServerFsm::Invite(fsm) => fsm.state,
            ServerFsm::NonInvite(fsm) => fsm.state,
        }
    }

    fn on_event(&mut self, event: Event) -> Vec<Action> {
        match self {
            ServerFsm::Invite(fsm) => fsm.on_event(event),
            ServerFsm::NonInvite(fsm) => fsm.on_event(event),
        }
    }

    fn on_retransmit(&self) -> Vec<Action> {
        match self {
            ServerFsm::Invite(fsm) => fsm.on_retransmit(),
            ServerFsm::NonInvite(fsm) => fsm.on_retransmit(),
        }
    }
}

/// Reliable provisional awaiting its PRACK (RFC 3262).
struct ReliableState {
    rseq: u32,
    cseq: u32,
    method: Method,
    /// Keeps the retransmit entry alive; dropping releases it.
    _handle: Option<RetransmitHandle>,
    attempts: Arc<AtomicU32>,
    failed: Arc<AtomicBool>,
}

struct ClientEntry {
    fsm: ClientFsm,
    remote: Endpoint,
    sink: Arc<dyn TransactionUser>,
    timers: HashMap<TransactionTimer, oneshot::Sender<()>>,
    created_at: Instant,
    request: Request,
    last_final: Option<Response>,
    stored_ack: Option<Bytes>,
    first_tx_at: Option<Instant>,
    last_tx_at: Option<Instant>,
    retransmits: u32,
    delivery_failed: bool,
    timed_out: bool,
    terminated_at: Option<Instant>,
}

struct ServerEntry {
    fsm: ServerFsm,
    remote: Endpoint,
    writer: Option<mpsc::Sender<Bytes>>,
    sink: Arc<dyn TransactionUser>,
    timers: HashMap<TransactionTimer, oneshot::Sender<()>>,
    created_at: Instant,
    request: Request,
    sent_by: SmolStr,
    prack_supported: bool,
    next_rseq: Option<u32>,
    reliable: Option<ReliableState>,
    last_provisional: Option<Response>,
    last_final: Option<Response>,
    first_tx_at: Option<Instant>,
    last_tx_at: Option<Instant>,
    retransmits: u32,
    delivery_failed: bool,
    timed_out: bool,
    terminated_at: Option<Instant>,
}

fn cancel_timer(timers: &mut HashMap<TransactionTimer, oneshot::Sender<()>>, timer: TransactionTimer) {
    if let Some(cancel) = timers.remove(&timer) {
        let _ = cancel.send(());
    }
}

fn cancel_all_timers(timers: &mut HashMap<TransactionTimer, oneshot::Sender<()>>) {
    for (_, cancel) in timers.drain() {
        let _ = cancel.send(());
    }
}

enum Command {
    ClientTimer {
        key: TransactionKey,
        timer: TransactionTimer,
    },
    ServerTimer {
        key: TransactionKey,
        timer: TransactionTimer,
    },
}

struct EngineInner {
    transport: Transport,
    defaults: TimerDefaults,
    client: DashMap<TransactionKey, ClientEntry>,
    server: DashMap<TransactionKey, ServerEntry>,
    handler: RwLock<Option<Arc<dyn InboundHandler>>>,
    cancel: CancellationToken,
}

/// Owns all SIP transactions and drives their state machines.
#[derive(Clone)]
pub struct TransactionEngine {
    inner: Arc<EngineInner>,
    cmd_tx: mpsc::Sender<Command>,
}

impl TransactionEngine {
    /// Creates an engine over the given transport and starts its command
    /// loop and housekeeping sweep.
    pub fn new(transport: Transport, defaults: TimerDefaults) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(128);
        let engine = Self {
            inner: Arc::new(EngineInner {
                transport,
                defaults,
                client: DashMap::new(),
                server: DashMap::new(),
                handler: RwLock::new(None),
                cancel: CancellationToken::new(),
            }),
            cmd_tx,
        };
        engine.spawn_command_loop(cmd_rx);
        engine.spawn_sweep();
        engine
    }

    /// Installs the callbacks for unmatched requests and responses.
    pub fn set_handler(&self, handler: Arc<dyn InboundHandler>) {
        *self.inner.handler.write().expect("handler lock") = Some(handler);
    }

    /// Returns the transport the engine sends through.
    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Stops the command loop, sweep, and dispatch tasks.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// Spawns the inbound dispatch loop draining the transport queue.
    pub fn start_dispatch(&self, mut rx: mpsc::Receiver<InboundMessage>) {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    message = rx.recv() => message,
                    _ = engine.inner.cancel.cancelled() => break,
                };
                let Some(message) = message else { break };
                engine.dispatch(message).await;
            }
        });
    }

    /// Parses one inbound message and routes it to a transaction, a new
    /// server transaction, or the unmatched callbacks. Malformed payloads
    /// are dropped with a warning.
    pub async fn dispatch(&self, message: InboundMessage) {
        let parsed = match parse_message(&message.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(remote = %message.remote, %e, "dropping unparsable message");
                return;
            }
        };
        match parsed {
            SipMessage::Request(request) => {
                self.inner
                    .transport
                    .trace_request_received(&message.remote, &message.payload);
                self.handle_request(request, message.remote, message.writer)
                    .await;
            }
            SipMessage::Response(response) => {
                self.inner
                    .transport
                    .trace_response_received(&message.remote, &message.payload);
                self.handle_response(response, message.remote).await;
            }
        }
    }

    // ---- client transactions ------------------------------------------------

    /// Starts an INVITE client transaction and transmits the request.
    pub async fn client_invite(
        &self,
        request: Request,
        sink: Arc<dyn TransactionUser>,
    ) -> Result<TransactionKey> {
        self.start_client(request, sink, true).await
    }

    /// Starts a non-INVITE client transaction and transmits the request.
    pub async fn client_non_invite(
        &self,
        request: Request,
        sink: Arc<dyn TransactionUser>,
    ) -> Result<TransactionKey> {
        self.start_client(request, sink, false).await
    }

    /// Builds a CANCEL for the original INVITE of a client transaction; the
    /// caller submits it through [`client_non_invite`], where the shared
    /// branch plus the CANCEL method yields a distinct key.
    ///
    /// [`client_non_invite`]: Self::client_non_invite
    pub fn create_cancel(&self, invite: &TransactionKey) -> Result<Request> {
        let entry = self
            .inner
            .client
            .get(invite)
            .ok_or_else(|| anyhow!("no client transaction {}", invite))?;
        Ok(cancel_request(&entry.request))
    }

    async fn start_client(
        &self,
        request: Request,
        sink: Arc<dyn TransactionUser>,
        invite: bool,
    ) -> Result<TransactionKey> {
        let branch = request_branch(&request)
            .ok_or_else(|| anyhow!("client request missing Via branch"))?;
        let key = TransactionKey::new(&branch, request.method());
        if self.inner.client.contains_key(&key) {
            return Err(anyhow!("client transaction {} already exists", key));
        }

        let endpoint = self.inner.transport.route_destination(request.uri()).await?;
        let timers = TransportAwareTimers::new(endpoint.transport, self.inner.defaults);
        let fsm = if invite {
            ClientFsm::Invite(ClientInviteFsm::new(timers))
        } else {
            ClientFsm::NonInvite(ClientNonInviteFsm::new(timers))
        };

        debug!(%key, method = %request.method(), %endpoint, "starting client transaction");
        let entry = ClientEntry {
            fsm,
            remote: endpoint,
            sink,
            timers: HashMap::new(),
            created_at: Instant::now(),
            request: request.clone(),
            last_final: None,
            stored_ack: None,
            first_tx_at: None,
            last_tx_at: None,
            retransmits: 0,
            delivery_failed: false,
            timed_out: false,
            terminated_at: None,
        };
        self.inner.client.insert(key.clone(), entry);
        self.process_client_event(&key, Event::SendRequest(request))
            .await;
        Ok(key)
    }

    async fn handle_response(&self, response: Response, remote: Endpoint) {
        let branch = response
            .headers
            .get("Via")
            .and_then(|via| branch_from_via(via))
            .map(SmolStr::new);
        let method = response
            .headers
            .get("CSeq")
            .and_then(|cseq| CSeqHeader::parse(cseq))
            .map(|cseq| cseq.method);

        if let (Some(branch), Some(method)) = (branch, method) {
            let key = TransactionKey::new(&branch, &method);
            if self.inner.client.contains_key(&key) {
                let event = if response.is_provisional() {
                    Event::ReceiveProvisional(response)
                } else {
                    if let Some(mut entry) = self.inner.client.get_mut(&key) {
                        entry.last_final = Some(response.clone());
                    }
                    Event::ReceiveFinal(response)
                };
                self.process_client_event(&key, event).await;
                return;
            }
        }

        debug!(%remote, code = response.code(), "response matched no transaction");
        let handler = self.handler();
        if let Some(handler) = handler {
            handler.on_response_received(response, remote).await;
        }
    }

    // ---- server transactions ------------------------------------------------

    async fn handle_request(
        &self,
        request: Request,
        remote: Endpoint,
        writer: Option<mpsc::Sender<Bytes>>,
    ) {
        let method = request.start.method.clone();
        let Some(branch) = request_branch(&request) else {
            debug!(%remote, %method, "request without Via branch absorbed");
            return;
        };

        if method == Method::Ack {
            let invite_key = TransactionKey::new(&branch, &Method::Invite);
            if self.inner.server.contains_key(&invite_key) {
                self.process_server_event(&invite_key, Event::ReceiveAck).await;
            } else {
                // ACKs for 2xx finals are dialog traffic, not transaction
                // traffic.
                debug!(%remote, "unmatched ACK absorbed");
            }
            return;
        }

        let key = TransactionKey::new(&branch, &method);
        let existing = {
            match self.inner.server.get(&key) {
                Some(entry) => {
                    let via_sent_by = top_via_sent_by(&request);
                    if via_sent_by != entry.sent_by {
                        warn!(%key, stored = %entry.sent_by, received = %via_sent_by,
                            "branch collision with different sent-by; absorbing");
                        return;
                    }
                    Some(entry.fsm.on_retransmit())
                }
                None => None,
            }
        };
        if let Some(actions) = existing {
            if let Some(mut entry) = self.inner.server.get_mut(&key) {
                entry.retransmits += 1;
            }
            self.apply_server_actions(&key, actions).await;
            return;
        }

        // New server transaction.
        let timers = TransportAwareTimers::new(remote.transport, self.inner.defaults);
        let (fsm, create_actions) = if method == Method::Invite {
            let mut fsm = ServerInviteFsm::new(timers);
            let actions = fsm.on_create();
            (ServerFsm::Invite(fsm), actions)
        } else {
            (ServerFsm::NonInvite(ServerNonInviteFsm::new(timers)), Vec::new())
        };

        let prack_supported = method == Method::Invite && supports_100rel(&request.headers);
        let entry = ServerEntry {
            fsm,
            remote,
            writer,
            sink: Arc::new(NoopSink),
            timers: HashMap::new(),
            created_at: Instant::now(),
            request: request.clone(),
            sent_by: top_via_sent_by(&request),
            prack_supported,
            next_rseq: None,
            reliable: None,
            last_provisional: None,
            last_final: None,
            first_tx_at: None,
            last_tx_at: None,
            retransmits: 0,
            delivery_failed: false,
            timed_out: false,
            terminated_at: None,
        };
        debug!(%key, %method, %remote, "new server transaction");
        self.inner.server.insert(key.clone(), entry);
        self.apply_server_actions(&key, create_actions).await;

        let handle = ServerTransactionHandle {
            engine: self.clone(),
            key: key.clone(),
        };

        match method {
            Method::Cancel => self.handle_cancel(&branch, &request, handle).await,
            Method::Prack => self.handle_prack(&request, handle).await,
            _ => {
                let handler = self.handler();
                if let Some(handler) = handler {
                    handler.on_request_received(request, handle).await;
                }
            }
        }
    }

    /// CANCEL handling: its own transaction answers, and a matching INVITE
    /// server transaction in Proceeding is driven to Cancelled.
    async fn handle_cancel(
        &self,
        branch: &str,
        request: &Request,
        handle: ServerTransactionHandle,
    ) {
        let invite_key = TransactionKey::new(branch, &Method::Invite);
        let matched = self
            .inner
            .server
            .get(&invite_key)
            .map(|entry| entry.fsm.state() == TxState::Proceeding)
            .unwrap_or(false);

        if matched {
            let sink = self
                .inner
                .server
                .get(&invite_key)
                .map(|entry| entry.sink.clone());
            self.process_server_event(&invite_key, Event::CancelCall).await;
            if let Some(sink) = sink {
                sink.on_cancelled(&invite_key).await;
            }
            if let Some(ok) = simple_response(request, 200, "OK") {
                handle.send_final(ok).await;
            }
        } else if let Some(not_found) =
            simple_response(request, 481, "Call/Transaction Does Not Exist")
        {
            handle.send_final(not_found).await;
        }
    }

    /// PRACK handling: a matching RAck clears the pending reliable
    /// provisional; anything else earns a 481.
    async fn handle_prack(&self, request: &Request, handle: ServerTransactionHandle) {
        let rack = request
            .headers
            .get("RAck")
            .and_then(|value| RAckHeader::parse(value).ok());
        let call_id = request.headers.get("Call-ID").cloned();

        let matched_key = rack.as_ref().and_then(|rack| {
            self.inner.server.iter().find_map(|entry| {
                let reliable = entry.reliable.as_ref()?;
                if entry.request.headers.get("Call-ID") != call_id.as_ref() {
                    return None;
                }
                if rack.acknowledges(reliable.rseq, reliable.cseq, &reliable.method) {
                    Some(entry.key().clone())
                } else {
                    None
                }
            })
        });

        match matched_key {
            Some(invite_key) => {
                let sink = {
                    let mut entry = match self.inner.server.get_mut(&invite_key) {
                        Some(entry) => entry,
                        None => return,
                    };
                    entry.reliable = None;
                    entry.sink.clone()
                };
                if let Some(rack) = &rack {
                    sink.on_prack(&invite_key, rack).await;
                }
                debug!(%invite_key, "reliable provisional acknowledged");
                if let Some(ok) = simple_response(request, 200, "OK") {
                    handle.send_final(ok).await;
                }
            }
            None => {
                debug!("PRACK with no matching pending provisional");
                if let Some(not_found) =
                    simple_response(request, 481, "Call/Transaction Does Not Exist")
                {
                    handle.send_final(not_found).await;
                }
            }
        }
    }

    /// Submits a provisional response on a server transaction, taking the
    /// reliable path when the INVITE negotiated `100rel`.
    pub async fn send_provisional(&self, key: &TransactionKey, response: Response) {
        let reliable = {
            match self.inner.server.get(key) {
                Some(entry) => {
                    entry.prack_supported
                        && matches!(entry.fsm, ServerFsm::Invite(_))
                        && entry.fsm.state() == TxState::Proceeding
                        && (101..200).contains(&response.code())
                }
                None => return,
            }
        };
        if reliable {
            self.send_reliable_provisional(key, response).await;
        } else {
            if let Some(mut entry) = self.inner.server.get_mut(key) {
                entry.last_provisional = Some(response.clone());
            }
            self.process_server_event(key, Event::SendProvisional(response))
                .await;
        }
    }

    /// Submits a final response on a server transaction.
    pub async fn send_final(&self, key: &TransactionKey, response: Response) {
        if let Some(mut entry) = self.inner.server.get_mut(key) {
            entry.last_final = Some(response.clone());
            // A final response supersedes any pending reliable provisional.
            entry.reliable = None;
        }
        self.process_server_event(key, Event::SendFinal(response)).await;
    }

    /// Attaches an event sink to a server transaction.
    pub fn set_server_sink(&self, key: &TransactionKey, sink: Arc<dyn TransactionUser>) {
        if let Some(mut entry) = self.inner.server.get_mut(key) {
            entry.sink = sink;
        }
    }

    async fn send_reliable_provisional(&self, key: &TransactionKey, mut response: Response) {
        let (rseq, cseq, endpoint, should_retransmit) = {
            let Some(mut entry) = self.inner.server.get_mut(key) else {
                return;
            };
            let rseq = match entry.next_rseq {
                // First value random in [1, 2^30) per RFC 3262 §7.1.
                None => rand::thread_rng().gen_range(1..(1u32 << 30)),
                Some(previous) => previous + 1,
            };
            entry.next_rseq = Some(rseq);
            if entry.reliable.is_some() {
                // The prior unacknowledged provisional is superseded; its
                // retransmissions stop and its PRACK will no longer match.
                warn!(%key, "superseding unacknowledged reliable provisional");
                entry.reliable = None;
            }
            let cseq = entry
                .request
                .headers
                .get("CSeq")
                .and_then(|v| CSeqHeader::parse(v))
                .map(|c| c.seq)
                .unwrap_or(1);
            let timers = TransportAwareTimers::new(entry.remote.transport, self.inner.defaults);
            (rseq, cseq, entry.remote, timers.should_retransmit())
        };

        response.headers.set("RSeq", rseq.to_string());
        if !require_lists_100rel(&response.headers) {
            response.headers.push("Require", EXTENSION_100REL);
        }

        let attempts = Arc::new(AtomicU32::new(0));
        let failed = Arc::new(AtomicBool::new(false));
        let handle = if should_retransmit {
            let payload = serialize_response(&response);
            let observer_attempts = attempts.clone();
            let observer_failed = failed.clone();
            Some(self.inner.transport.send_reliable(
                endpoint,
                payload,
                self.inner.defaults.t1,
                self.inner.defaults.t2,
                Some(Box::new(move |event| {
                    observer_attempts.store(event.attempts, Ordering::SeqCst);
                    if event.delivery_failed {
                        observer_failed.store(true, Ordering::SeqCst);
                    }
                })),
            ))
        } else {
            None
        };

        if let Some(mut entry) = self.inner.server.get_mut(key) {
            entry.last_provisional = Some(response.clone());
            entry.reliable = Some(ReliableState {
                rseq,
                cseq,
                method: Method::Invite,
                _handle: handle,
                attempts,
                failed,
            });
        }
        self.process_server_event(key, Event::SendProvisional(response))
            .await;
    }

    // ---- event processing ---------------------------------------------------

    async fn process_client_event(&self, key: &TransactionKey, event: Event) {
        let Some((previous, current, actions, sink)) = ({
            self.inner.client.get_mut(key).map(|mut entry| {
                let previous = entry.fsm.state();
                let actions = entry.fsm.on_event(event);
                (previous, entry.fsm.state(), actions, entry.sink.clone())
            })
        }) else {
            return;
        };
        self.apply_client_actions(key, actions).await;
        if previous != current {
            sink.on_state_changed(key, current).await;
        }
    }

    async fn process_server_event(&self, key: &TransactionKey, event: Event) {
        let Some((previous, current, actions, sink)) = ({
            self.inner.server.get_mut(key).map(|mut entry| {
                let previous = entry.fsm.state();
                let actions = entry.fsm.on_event(event);
                (previous, entry.fsm.state(), actions, entry.sink.clone())
            })
        }) else {
            return;
        };
        self.apply_server_actions(key, actions).await;
        if previous != current {
            sink.on_state_changed(key, current).await;
        }
    }

    async fn apply_client_actions(&self, key: &TransactionKey, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Transmit(payload) => {
                    let Some((remote, sink)) = ({
                        self.inner.client.get_mut(key).map(|mut entry| {
                            let now = Instant::now();
                            if entry.first_tx_at.is_none() {
                                entry.first_tx_at = Some(now);
                            } else {
                                entry.retransmits += 1;
                            }
                            entry.last_tx_at = Some(now);
                            (entry.remote, entry.sink.clone())
                        })
                    }) else {
                        continue;
                    };
                    if let Err(e) = self
                        .inner
                        .transport
                        .transmit(remote.transport, remote.addr, payload, remote.connection_id)
                        .await
                    {
                        warn!(%key, %e, "client transmit failed");
                        if let Some(mut entry) = self.inner.client.get_mut(key) {
                            entry.delivery_failed = true;
                        }
                        sink.on_transport_error(key).await;
                    }
                }
                Action::Deliver(response) => {
                    let sink = match self.inner.client.get(key) {
                        Some(entry) => entry.sink.clone(),
                        None => continue,
                    };
                    if response.is_provisional() {
                        sink.on_provisional(key, &response).await;
                    } else {
                        sink.on_final(key, &response).await;
                    }
                }
                Action::SendAck(response) => {
                    let Some((remote, ack_bytes)) = ({
                        self.inner.client.get_mut(key).map(|mut entry| {
                            let ack = ack_request(&entry.request, &response);
                            let bytes = serialize_request(&ack);
                            entry.stored_ack = Some(bytes.clone());
                            (entry.remote, bytes)
                        })
                    }) else {
                        continue;
                    };
                    if let Err(e) = self
                        .inner
                        .transport
                        .transmit(remote.transport, remote.addr, ack_bytes, remote.connection_id)
                        .await
                    {
                        warn!(%key, %e, "ACK transmit failed");
                    }
                }
                Action::RetransmitAck => {
                    let stored = self
                        .inner
                        .client
                        .get(key)
                        .and_then(|entry| entry.stored_ack.clone().map(|b| (entry.remote, b)));
                    if let Some((remote, bytes)) = stored {
                        if let Err(e) = self
                            .inner
                            .transport
                            .transmit(remote.transport, remote.addr, bytes, remote.connection_id)
                            .await
                        {
                            warn!(%key, %e, "stored ACK retransmit failed");
                        }
                    }
                }
                Action::Schedule { timer, duration } => {
                    self.schedule_client_timer(key.clone(), timer, duration);
                }
                Action::CancelTimer(timer) => {
                    if let Some(mut entry) = self.inner.client.get_mut(key) {
                        cancel_timer(&mut entry.timers, timer);
                    }
                }
                Action::Terminate { timed_out, reason } => {
                    let sink = {
                        match self.inner.client.get_mut(key) {
                            Some(mut entry) => {
                                cancel_all_timers(&mut entry.timers);
                                entry.timed_out = timed_out;
                                entry.terminated_at = Some(Instant::now());
                                entry.sink.clone()
                            }
                            None => continue,
                        }
                    };
                    debug!(%key, %reason, timed_out, "client transaction terminated");
                    if timed_out {
                        sink.on_timeout(key).await;
                    }
                }
                Action::AutoTrying => {}
            }
        }
    }


fn _debug_assert_send(e: TransactionEngine, key: TransactionKey, actions: Vec<Action>) {
    fn is_send<T: Send>(_: T) {}
    is_send(async move { e.apply_client_actions(&key, actions).await });
}

    async fn apply_server_actions(&self, key: &TransactionKey, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Transmit(payload) => {
                    let Some((remote, writer, sink)) = ({
                        self.inner.server.get_mut(key).map(|mut entry| {
                            let now = Instant::now();
                            if entry.first_tx_at.is_none() {
                                entry.first_tx_at = Some(now);
                            }
                            entry.last_tx_at = Some(now);
                            (entry.remote, entry.writer.clone(), entry.sink.clone())
                        })
                    }) else {
                        continue;
                    };
                    let result = match &writer {
                        Some(writer) => writer
                            .send(payload)
                            .await
                            .map_err(|_| anyhow!("stream connection writer closed")),
                        None => {
                            self.inner
                                .transport
                                .transmit(
                                    remote.transport,
                                    remote.addr,
                                    payload,
                                    remote.connection_id,
                                )
                                .await
                        }
                    };
                    if let Err(e) = result {
                        warn!(%key, %e, "server transmit failed");
                        if let Some(mut entry) = self.inner.server.get_mut(key) {
                            entry.delivery_failed = true;
                        }
                        sink.on_transport_error(key).await;
                    }
                }
                Action::AutoTrying => {
                    let trying = self
                        .inner
                        .server
                        .get(key)
                        .and_then(|entry| simple_response(&entry.request, 100, "Trying"));
                    if let Some(trying) = trying {
                        debug!(%key, "sending automatic 100 Trying");
                        // Spawned: re-entering the event pipeline inline
                        // would make this future type recursive.
                        let engine = self.clone();
                        let key = key.clone();
                        tokio::spawn(async move {
                            engine.send_provisional(&key, trying).await;
                        });
                    }
                }
                Action::Schedule { timer, duration } => {
                    self.schedule_server_timer(key.clone(), timer, duration);
                }
                Action::CancelTimer(timer) => {
                    if let Some(mut entry) = self.inner.server.get_mut(key) {
                        cancel_timer(&mut entry.timers, timer);
                    }
                }
                Action::Terminate { timed_out, reason } => {
                    let sink = {
                        match self.inner.server.get_mut(key) {
                            Some(mut entry) => {
                                cancel_all_timers(&mut entry.timers);
                                entry.timed_out = timed_out;
                                entry.terminated_at = Some(Instant::now());
                                entry.reliable = None;
                                entry.sink.clone()
                            }
                            None => continue,
                        }
                    };
                    debug!(%key, %reason, timed_out, "server transaction terminated");
                    if timed_out {
                        sink.on_timeout(key).await;
                    }
                }
                Action::Deliver(_) | Action::SendAck(_) | Action::RetransmitAck => {}
            }
        }
    }

    fn schedule_client_timer(&self, key: TransactionKey, timer: TransactionTimer, duration: Duration) {
        let fire = {
            match self.inner.client.get_mut(&key) {
                Some(mut entry) => {
                    cancel_timer(&mut entry.timers, timer);
                    if duration.is_zero() {
                        true
                    } else {
                        let (cancel_tx, cancel_rx) = oneshot::channel();
                        entry.timers.insert(timer, cancel_tx);
                        let cmd_tx = self.cmd_tx.clone();
                        let key = key.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = tokio::time::sleep(duration) => {
                                    let _ = cmd_tx.send(Command::ClientTimer { key, timer }).await;
                                }
                                _ = cancel_rx => {}
                            }
                        });
                        false
                    }
                }
                None => false,
            }
        };
        if fire {
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let _ = cmd_tx.send(Command::ClientTimer { key, timer }).await;
            });
        }
    }

    fn schedule_server_timer(&self, key: TransactionKey, timer: TransactionTimer, duration: Duration) {
        let fire = {
            match self.inner.server.get_mut(&key) {
                Some(mut entry) => {
                    cancel_timer(&mut entry.timers, timer);
                    if duration.is_zero() {
                        true
                    } else {
                        let (cancel_tx, cancel_rx) = oneshot::channel();
                        entry.timers.insert(timer, cancel_tx);
                        let cmd_tx = self.cmd_tx.clone();
                        let key = key.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = tokio::time::sleep(duration) => {
                                    let _ = cmd_tx.send(Command::ServerTimer { key, timer }).await;
                                }
                                _ = cancel_rx => {}
                            }
                        });
                        false
                    }
                }
                None => false,
            }
        };
        if fire {
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let _ = cmd_tx.send(Command::ServerTimer { key, timer }).await;
            });
        }
    }

    fn spawn_command_loop(&self, mut rx: mpsc::Receiver<Command>) {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let command = tokio::select! {
                    command = rx.recv() => command,
                    _ = engine.inner.cancel.cancelled() => break,
                };
                let Some(command) = command else { break };
                match command {
                    Command::ClientTimer { key, timer } => {
                        if let Some(mut entry) = engine.inner.client.get_mut(&key) {
                            entry.timers.remove(&timer);
                        }
                        engine
                            .process_client_event(&key, Event::TimerFired(timer))
                            .await;
                    }
                    Command::ServerTimer { key, timer } => {
                        if let Some(mut entry) = engine.inner.server.get_mut(&key) {
                            entry.timers.remove(&timer);
                        }
                        engine
                            .process_server_event(&key, Event::TimerFired(timer))
                            .await;
                    }
                }
            }
        });
    }

    /// Reaps transactions that have sat in Terminated for at least T6,
    /// firing the removal event and dropping the sink handle.
    fn spawn_sweep(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = engine.inner.cancel.cancelled() => break,
                }
                let linger = engine.inner.defaults.t6;
                let now = Instant::now();

                let expired_clients: Vec<TransactionKey> = engine
                    .inner
                    .client
                    .iter()
                    .filter(|entry| {
                        entry
                            .terminated_at
                            .is_some_and(|at| now.duration_since(at) >= linger)
                    })
                    .map(|entry| entry.key().clone())
                    .collect();
                for key in expired_clients {
                    if let Some((_, entry)) = engine.inner.client.remove(&key) {
                        debug!(%key, "removing terminated client transaction");
                        entry.sink.on_removed(&key).await;
                    }
                }

                let expired_servers: Vec<TransactionKey> = engine
                    .inner
                    .server
                    .iter()
                    .filter(|entry| {
                        entry
                            .terminated_at
                            .is_some_and(|at| now.duration_since(at) >= linger)
                    })
                    .map(|entry| entry.key().clone())
                    .collect();
                for key in expired_servers {
                    if let Some((_, entry)) = engine.inner.server.remove(&key) {
                        debug!(%key, "removing terminated server transaction");
                        entry.sink.on_removed(&key).await;
                    }
                }
            }
        });
    }

    fn handler(&self) -> Option<Arc<dyn InboundHandler>> {
        self.inner.handler.read().expect("handler lock").clone()
    }

    // ---- introspection ------------------------------------------------------

    /// State of a transaction, client or server.
    pub fn state_of(&self, key: &TransactionKey) -> Option<TxState> {
        if let Some(entry) = self.inner.client.get(key) {
            return Some(entry.fsm.state());
        }
        self.inner.server.get(key).map(|entry| entry.fsm.state())
    }

    /// Point-in-time view of a transaction's bookkeeping.
    pub fn snapshot(&self, key: &TransactionKey) -> Option<TransactionSnapshot> {
        if let Some(entry) = self.inner.client.get(key) {
            return Some(TransactionSnapshot {
                state: entry.fsm.state(),
                age: entry.created_at.elapsed(),
                retransmits: entry.retransmits,
                timed_out: entry.timed_out,
                delivery_failed: entry.delivery_failed,
                delivery_pending: false,
                last_provisional: None,
                last_final: entry.last_final.as_ref().map(|r| r.code()),
                since_first_transmission: entry.first_tx_at.map(|at| at.elapsed()),
                since_last_transmission: entry.last_tx_at.map(|at| at.elapsed()),
            });
        }
        self.inner.server.get(key).map(|entry| TransactionSnapshot {
            state: entry.fsm.state(),
            age: entry.created_at.elapsed(),
            retransmits: entry.retransmits,
            timed_out: entry.timed_out,
            delivery_failed: entry.delivery_failed
                || entry
                    .reliable
                    .as_ref()
                    .is_some_and(|r| r.failed.load(Ordering::SeqCst)),
            delivery_pending: entry.reliable.is_some(),
            last_provisional: entry.last_provisional.as_ref().map(|r| r.code()),
            last_final: entry.last_final.as_ref().map(|r| r.code()),
            since_first_transmission: entry.first_tx_at.map(|at| at.elapsed()),
            since_last_transmission: entry.last_tx_at.map(|at| at.elapsed()),
        })
    }

    /// True once Timer B/F/H fired for the transaction.
    pub fn is_timed_out(&self, key: &TransactionKey) -> bool {
        self.inner
            .client
            .get(key)
            .map(|e| e.timed_out)
            .or_else(|| self.inner.server.get(key).map(|e| e.timed_out))
            .unwrap_or(false)
    }

    /// True when a send attempt has failed on this transaction.
    pub fn delivery_failed(&self, key: &TransactionKey) -> bool {
        self.inner
            .client
            .get(key)
            .map(|e| e.delivery_failed)
            .or_else(|| self.inner.server.get(key).map(|e| e.delivery_failed))
            .unwrap_or(false)
    }

    /// True while a reliable provisional awaits its PRACK.
    pub fn delivery_pending(&self, key: &TransactionKey) -> bool {
        self.inner
            .server
            .get(key)
            .map(|entry| entry.reliable.is_some())
            .unwrap_or(false)
    }

    /// Current RSeq of the pending reliable provisional, if any.
    pub fn pending_rseq(&self, key: &TransactionKey) -> Option<u32> {
        self.inner
            .server
            .get(key)
            .and_then(|entry| entry.reliable.as_ref().map(|r| r.rseq))
    }

    /// Retransmissions performed for the transaction so far.
    pub fn retransmit_count(&self, key: &TransactionKey) -> u32 {
        if let Some(entry) = self.inner.client.get(key) {
            return entry.retransmits;
        }
        self.inner
            .server
            .get(key)
            .map(|entry| {
                let reliable = entry
                    .reliable
                    .as_ref()
                    .map(|r| r.attempts.load(Ordering::SeqCst))
                    .unwrap_or(0);
                entry.retransmits + reliable
            })
            .unwrap_or(0)
    }

    /// Number of live transactions (both tables).
    pub fn len(&self) -> usize {
        self.inner.client.len() + self.inner.server.len()
    }

    /// True when no transactions exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Point-in-time view of one transaction's bookkeeping: state, timestamps,
/// counters, and the delivery/timeout flags.
#[derive(Debug, Clone)]
pub struct TransactionSnapshot {
    pub state: TxState,
    pub age: Duration,
    pub retransmits: u32,
    pub timed_out: bool,
    pub delivery_failed: bool,
    pub delivery_pending: bool,
    pub last_provisional: Option<u16>,
    pub last_final: Option<u16>,
    pub since_first_transmission: Option<Duration>,
    pub since_last_transmission: Option<Duration>,
}

/// Handle for responding on a server transaction.
#[derive(Clone)]
pub struct ServerTransactionHandle {
    engine: TransactionEngine,
    key: TransactionKey,
}

impl ServerTransactionHandle {
    /// The transaction's key.
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// Attaches the event sink for this transaction.
    pub fn set_sink(&self, sink: Arc<dyn TransactionUser>) {
        self.engine.set_server_sink(&self.key, sink);
    }

    /// Sends a provisional response (reliably when 100rel was negotiated).
    pub async fn send_provisional(&self, response: Response) {
        self.engine.send_provisional(&self.key, response).await;
    }

    /// Sends a final response.
    pub async fn send_final(&self, response: Response) {
        self.engine.send_final(&self.key, response).await;
    }

    /// Current state of the transaction.
    pub fn state(&self) -> Option<TxState> {
        self.engine.state_of(&self.key)
    }
}

// ---- message construction helpers ------------------------------------------

fn top_via_sent_by(request: &Request) -> SmolStr {
    request
        .headers
        .get("Via")
        .and_then(|via| sipwire_core::ViaHeader::parse(via).ok())
        .map(|via| SmolStr::new(via.sent_by()))
        .unwrap_or_default()
}

fn supports_100rel(headers: &Headers) -> bool {
    for name in ["Require", "Supported"] {
        for value in headers.get_all(name) {
            if TokenList::parse(value).contains(EXTENSION_100REL) {
                return true;
            }
        }
    }
    false
}

fn require_lists_100rel(headers: &Headers) -> bool {
    headers
        .get_all("Require")
        .any(|value| TokenList::parse(value).contains(EXTENSION_100REL))
}

/// Builds a response template copying the headers RFC 3261 §8.2.6 requires.
fn simple_response(request: &Request, code: u16, reason: &str) -> Option<Response> {
    let status = StatusLine::new(code, reason).ok()?;
    let mut headers = Headers::new();
    for via in request.headers.get_all("Via") {
        headers.push("Via", via.clone());
    }
    for name in ["To", "From", "Call-ID", "CSeq"] {
        if let Some(value) = request.headers.get(name) {
            headers.push(name, value.clone());
        }
    }
    Response::new(status, headers, Bytes::new()).ok()
}

/// Builds the ACK for a non-2xx final response (RFC 3261 §17.1.1.3): same
/// branch and Request-URI as the INVITE, To taken from the response.
fn ack_request(invite: &Request, response: &Response) -> Request {
    let mut headers = Headers::new();
    if let Some(via) = invite.headers.get("Via") {
        headers.push("Via", via.clone());
    }
    if let Some(to) = response.headers.get("To") {
        headers.push("To", to.clone());
    } else if let Some(to) = invite.headers.get("To") {
        headers.push("To", to.clone());
    }
    for name in ["From", "Call-ID"] {
        if let Some(value) = invite.headers.get(name) {
            headers.push(name, value.clone());
        }
    }
    let cseq = invite
        .headers
        .get("CSeq")
        .and_then(|v| CSeqHeader::parse(v))
        .map(|c| c.seq)
        .unwrap_or(1);
    headers.push("CSeq", CSeqHeader::new(cseq, Method::Ack).to_string());
    if let Some(max_forwards) = invite.max_forwards() {
        headers.push("Max-Forwards", max_forwards.to_string());
    }

    Request::new(
        RequestLine::new(Method::Ack, invite.start.uri.clone()),
        headers,
        Bytes::new(),
    )
    .unwrap_or_else(|_| Request {
        start: RequestLine::new(Method::Ack, invite.start.uri.clone()),
        headers: Headers::new(),
        body: Bytes::new(),
    })
}

/// Builds a CANCEL for an INVITE (RFC 3261 §9.1): identical Request-URI,
/// top Via (same branch), To, From, and Call-ID; CSeq keeps the sequence
/// with method CANCEL. Max-Forwards is copied only when present.
pub fn cancel_request(invite: &Request) -> Request {
    let mut headers = Headers::new();
    if let Some(via) = invite.headers.get("Via") {
        headers.push("Via", via.clone());
    }
    for name in ["To", "From", "Call-ID"] {
        if let Some(value) = invite.headers.get(name) {
            headers.push(name, value.clone());
        }
    }
    let cseq = invite
        .headers
        .get("CSeq")
        .and_then(|v| CSeqHeader::parse(v))
        .map(|c| c.seq)
        .unwrap_or(1);
    headers.push("CSeq", CSeqHeader::new(cseq, Method::Cancel).to_string());
    if let Some(max_forwards) = invite.max_forwards() {
        headers.push("Max-Forwards", max_forwards.to_string());
    }

    Request::new(
        RequestLine::new(Method::Cancel, invite.start.uri.clone()),
        headers,
        Bytes::new(),
    )
    .unwrap_or_else(|_| Request {
        start: RequestLine::new(Method::Cancel, invite.start.uri.clone()),
        headers: Headers::new(),
        body: Bytes::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipwire_core::Method;

    fn invite_fixture() -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP client.example.com;branch=z9hG4bKfix");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("From", "<sip:alice@example.com>;tag=a1");
        headers.push("Call-ID", "fix@client.example.com");
        headers.push("CSeq", "7 INVITE");
        headers.push("Max-Forwards", "70");
        Request::new(
            RequestLine::new(
                Method::Invite,
                sipwire_core::SipUri::parse("sip:bob@example.com").unwrap(),
            ),
            headers,
            Bytes::new(),
        )
        .unwrap()
    }

    #[test]
    fn cancel_copies_branch_and_swaps_method() {
        let invite = invite_fixture();
        let cancel = cancel_request(&invite);
        assert_eq!(cancel.start.method, Method::Cancel);
        assert_eq!(cancel.headers.get("Via"), invite.headers.get("Via"));
        assert_eq!(
            cancel.headers.get("CSeq").map(|v| v.as_str()),
            Some("7 CANCEL")
        );
        assert_eq!(cancel.max_forwards(), Some(70));
    }

    #[test]
    fn cancel_omits_absent_max_forwards() {
        let mut invite = invite_fixture();
        invite.headers.remove_all("Max-Forwards");
        let cancel = cancel_request(&invite);
        assert_eq!(cancel.max_forwards(), None);
        assert!(cancel.headers.get("Max-Forwards").is_none());
    }

    #[test]
    fn ack_takes_to_from_response() {
        let invite = invite_fixture();
        let mut headers = Headers::new();
        headers.push("To", "<sip:bob@example.com>;tag=b2");
        let response = Response::new(
            StatusLine::new(486, "Busy Here").unwrap(),
            headers,
            Bytes::new(),
        )
        .unwrap();

        let ack = ack_request(&invite, &response);
        assert_eq!(ack.start.method, Method::Ack);
        assert_eq!(
            ack.headers.get("To").map(|v| v.as_str()),
            Some("<sip:bob@example.com>;tag=b2")
        );
        assert_eq!(ack.headers.get("Via"), invite.headers.get("Via"));
        assert_eq!(ack.headers.get("CSeq").map(|v| v.as_str()), Some("7 ACK"));
    }

    #[test]
    fn simple_response_copies_identification_headers() {
        let invite = invite_fixture();
        let trying = simple_response(&invite, 100, "Trying").unwrap();
        assert_eq!(trying.code(), 100);
        for name in ["Via", "To", "From", "Call-ID", "CSeq"] {
            assert_eq!(trying.headers.get(name), invite.headers.get(name), "{name}");
        }
    }

    #[test]
    fn supports_100rel_checks_both_lists() {
        let mut headers = Headers::new();
        headers.push("Supported", "timer, 100rel");
        assert!(supports_100rel(&headers));

        let mut headers = Headers::new();
        headers.push("Require", "100rel");
        assert!(supports_100rel(&headers));

        let mut headers = Headers::new();
        headers.push("Supported", "timer");
        assert!(!supports_100rel(&headers));
    }
}
