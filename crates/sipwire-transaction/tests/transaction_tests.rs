// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Engine-level transaction behavior driven through fabricated inbound
//! messages: state walks, retransmission schedules, CANCEL matching, and
//! reliable provisionals.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sipwire_core::{Headers, Method, Request, RequestLine, Response, SipUri, StatusLine};
use sipwire_dns::{LookupService, StaticBackend};
use sipwire_parse::{serialize_request, serialize_response};
use sipwire_transaction::{
    InboundHandler, ServerTransactionHandle, TimerDefaults, TransactionEngine, TransactionKey,
    TransactionUser, TxState,
};
use sipwire_transport::{Endpoint, InboundMessage, Transport, TransportConfig, TransportKind};
use tokio::sync::Mutex;

fn fast_defaults() -> TimerDefaults {
    TimerDefaults {
        t1: Duration::from_millis(10),
        t2: Duration::from_millis(40),
        t4: Duration::from_millis(30),
        t6: Duration::from_millis(300),
    }
}

/// Engine over a loopback UDP channel, plus a peer socket playing the remote
/// side so transmitted bytes can be observed.
async fn build_engine(defaults: TimerDefaults) -> (TransactionEngine, tokio::net::UdpSocket, Endpoint) {
    let dns = LookupService::new(Arc::new(StaticBackend::new()));
    let mut config = TransportConfig::default();
    config.t1 = defaults.t1;
    let (transport, rx) = Transport::new(config, dns);
    transport
        .add_udp("127.0.0.1:0".parse().unwrap())
        .await
        .expect("bind udp");

    let engine = TransactionEngine::new(transport, defaults);
    engine.start_dispatch(rx);

    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("peer");
    let endpoint = Endpoint::new(TransportKind::Udp, peer.local_addr().unwrap());
    (engine, peer, endpoint)
}

fn request(method: Method, branch: &str, uri: &str) -> Request {
    let mut headers = Headers::new();
    headers.push("Via", format!("SIP/2.0/UDP client.example.com;branch={branch}"));
    headers.push("To", "<sip:bob@example.com>");
    headers.push("From", "<sip:alice@example.com>;tag=a1");
    headers.push("Call-ID", format!("{branch}@client.example.com"));
    headers.push("CSeq", format!("1 {}", method.as_str()));
    headers.push("Max-Forwards", "70");
    Request::new(
        RequestLine::new(method, SipUri::parse(uri).unwrap()),
        headers,
        Bytes::new(),
    )
    .unwrap()
}

fn response_for(req: &Request, code: u16, reason: &str) -> Response {
    let mut headers = Headers::new();
    for name in ["Via", "To", "From", "Call-ID", "CSeq"] {
        if let Some(value) = req.headers.get(name) {
            headers.push(name, value.clone());
        }
    }
    Response::new(StatusLine::new(code, reason).unwrap(), headers, Bytes::new()).unwrap()
}

fn inbound(payload: Bytes, remote: Endpoint) -> InboundMessage {
    InboundMessage {
        local: Endpoint::new(TransportKind::Udp, "127.0.0.1:5060".parse().unwrap()),
        remote,
        payload,
        writer: None,
    }
}

#[derive(Default)]
struct RecordingSink {
    states: Mutex<Vec<TxState>>,
    provisionals: Mutex<Vec<u16>>,
    finals: Mutex<Vec<u16>>,
    timeouts: Mutex<u32>,
    cancelled: Mutex<u32>,
    removed: Mutex<u32>,
}

#[async_trait::async_trait]
impl TransactionUser for RecordingSink {
    async fn on_provisional(&self, _key: &TransactionKey, response: &Response) {
        self.provisionals.lock().await.push(response.code());
    }
    async fn on_final(&self, _key: &TransactionKey, response: &Response) {
        self.finals.lock().await.push(response.code());
    }
    async fn on_state_changed(&self, _key: &TransactionKey, state: TxState) {
        self.states.lock().await.push(state);
    }
    async fn on_timeout(&self, _key: &TransactionKey) {
        *self.timeouts.lock().await += 1;
    }
    async fn on_cancelled(&self, _key: &TransactionKey) {
        *self.cancelled.lock().await += 1;
    }
    async fn on_removed(&self, _key: &TransactionKey) {
        *self.removed.lock().await += 1;
    }
}

#[derive(Default)]
struct RecordingHandler {
    requests: Mutex<Vec<(Request, ServerTransactionHandle)>>,
}

#[async_trait::async_trait]
impl InboundHandler for RecordingHandler {
    async fn on_request_received(&self, request: Request, transaction: ServerTransactionHandle) {
        self.requests.lock().await.push((request, transaction));
    }
    async fn on_response_received(&self, _response: Response, _remote: Endpoint) {}
}

/// Drains any datagrams waiting on the peer socket.
async fn drain_peer(peer: &tokio::net::UdpSocket) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 2048];
    while let Ok(Ok((n, _))) =
        tokio::time::timeout(Duration::from_millis(50), peer.recv_from(&mut buf)).await
    {
        out.push(buf[..n].to_vec());
    }
    out
}

#[tokio::test]
async fn invite_client_walks_calling_proceeding_terminated() {
    // A roomy T1 keeps Timer A from firing before the 100 cancels it.
    let defaults = TimerDefaults {
        t1: Duration::from_millis(200),
        ..fast_defaults()
    };
    let (engine, peer, remote) = build_engine(defaults).await;
    let sink = Arc::new(RecordingSink::default());

    let invite = request(
        Method::Invite,
        "z9hG4bKwalk",
        &format!("sip:{}", peer.local_addr().unwrap()),
    );
    let key = engine.client_invite(invite, sink.clone()).await.unwrap();
    assert_eq!(engine.state_of(&key), Some(TxState::Calling));

    // Initial transmission reaches the peer.
    let mut buf = [0u8; 2048];
    let (n, _) = tokio::time::timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
        .await
        .expect("initial send")
        .unwrap();
    assert!(buf[..n].starts_with(b"INVITE "));

    for (code, reason) in [(100u16, "Trying"), (180u16, "Ringing")] {
        let original = request(Method::Invite, "z9hG4bKwalk", "sip:ignored@example.com");
        let resp = response_for(&original, code, reason);
        engine
            .dispatch(inbound(serialize_response(&resp), remote))
            .await;
    }
    assert_eq!(engine.state_of(&key), Some(TxState::Proceeding));

    // Timer A is cancelled in Proceeding: no retransmissions arrive even
    // after T1 has elapsed.
    let _ = drain_peer(&peer).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        drain_peer(&peer).await.is_empty(),
        "no retransmission after Proceeding"
    );
    assert_eq!(engine.retransmit_count(&key), 0);

    let original = request(Method::Invite, "z9hG4bKwalk", "sip:ignored@example.com");
    let ok = response_for(&original, 200, "OK");
    engine
        .dispatch(inbound(serialize_response(&ok), remote))
        .await;

    assert_eq!(engine.state_of(&key), Some(TxState::Terminated));
    let states = sink.states.lock().await.clone();
    assert_eq!(states, vec![TxState::Proceeding, TxState::Terminated]);
    assert_eq!(sink.provisionals.lock().await.clone(), vec![100, 180]);
    assert_eq!(sink.finals.lock().await.clone(), vec![200]);
    assert!(!engine.is_timed_out(&key));
    assert_eq!(engine.snapshot(&key).and_then(|s| s.last_final), Some(200));
    engine.shutdown();
}

#[tokio::test]
async fn invite_client_retransmits_then_times_out_on_silence() {
    let (engine, peer, _remote) = build_engine(fast_defaults()).await;
    let sink = Arc::new(RecordingSink::default());

    let invite = request(
        Method::Invite,
        "z9hG4bKsilent",
        &format!("sip:{}", peer.local_addr().unwrap()),
    );
    let key = engine.client_invite(invite, sink.clone()).await.unwrap();

    // 64 * T1 = 640ms; the doubling schedule lands sends at 0, 10, 30, 70...
    tokio::time::sleep(Duration::from_millis(900)).await;

    let sends = drain_peer(&peer).await.len();
    assert!(sends >= 4, "expected the Timer A schedule, saw {sends} sends");
    assert_eq!(engine.state_of(&key), Some(TxState::Terminated));
    assert!(engine.is_timed_out(&key));
    assert_eq!(*sink.timeouts.lock().await, 1);

    let snapshot = engine.snapshot(&key).expect("snapshot");
    assert!(snapshot.timed_out);
    assert!(snapshot.retransmits >= 3);
    assert_eq!(snapshot.last_final, None);
    assert!(snapshot.since_first_transmission.is_some());
    engine.shutdown();
}

#[tokio::test]
async fn non_invite_client_completes_and_lingers_before_removal() {
    let (engine, peer, remote) = build_engine(fast_defaults()).await;
    let sink = Arc::new(RecordingSink::default());

    let options = request(
        Method::Options,
        "z9hG4bKlinger",
        &format!("sip:{}", peer.local_addr().unwrap()),
    );
    let key = engine.client_non_invite(options, sink.clone()).await.unwrap();

    let original = request(Method::Options, "z9hG4bKlinger", "sip:ignored@example.com");
    let ok = response_for(&original, 200, "OK");
    engine
        .dispatch(inbound(serialize_response(&ok), remote))
        .await;

    assert_eq!(sink.finals.lock().await.clone(), vec![200]);

    // Timer K (T4) moves it to Terminated, then the sweep reaps after T6.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.state_of(&key), Some(TxState::Terminated));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(engine.state_of(&key), None, "swept after the linger window");
    assert_eq!(*sink.removed.lock().await, 1);
    engine.shutdown();
}

#[tokio::test]
async fn cancel_matches_invite_by_branch_and_method() {
    let (engine, peer, remote) = build_engine(fast_defaults()).await;
    let handler = Arc::new(RecordingHandler::default());
    engine.set_handler(handler.clone());

    // Inbound INVITE creates a UAS transaction.
    let invite = request(Method::Invite, "z9hG4bK-A", "sip:uas@example.com");
    engine
        .dispatch(inbound(serialize_request(&invite), remote))
        .await;

    let invite_key = TransactionKey::new("z9hG4bK-A", &Method::Invite);
    assert_eq!(engine.state_of(&invite_key), Some(TxState::Proceeding));
    {
        let requests = handler.requests.lock().await;
        assert_eq!(requests.len(), 1);
    }

    let sink = Arc::new(RecordingSink::default());
    engine.set_server_sink(&invite_key, sink.clone());

    // CANCEL with the same branch: distinct key, same matched INVITE.
    let cancel = request(Method::Cancel, "z9hG4bK-A", "sip:uas@example.com");
    engine
        .dispatch(inbound(serialize_request(&cancel), remote))
        .await;

    let cancel_key = TransactionKey::new("z9hG4bK-A", &Method::Cancel);
    assert_ne!(invite_key, cancel_key);
    assert_eq!(engine.state_of(&invite_key), Some(TxState::Cancelled));
    assert!(engine.state_of(&cancel_key).is_some());
    assert_eq!(*sink.cancelled.lock().await, 1);

    // The CANCEL transaction answered 200 on its own.
    let datagrams = drain_peer(&peer).await;
    assert!(
        datagrams
            .iter()
            .any(|d| d.starts_with(b"SIP/2.0 200") && twin_contains(d, b"CANCEL")),
        "expected a 200 for the CANCEL"
    );
    engine.shutdown();
}

#[tokio::test]
async fn cancel_without_matching_invite_gets_481() {
    let (engine, peer, remote) = build_engine(fast_defaults()).await;

    let cancel = request(Method::Cancel, "z9hG4bKorphan", "sip:uas@example.com");
    engine
        .dispatch(inbound(serialize_request(&cancel), remote))
        .await;

    let datagrams = drain_peer(&peer).await;
    assert!(
        datagrams.iter().any(|d| d.starts_with(b"SIP/2.0 481")),
        "expected 481 for an orphan CANCEL"
    );
    engine.shutdown();
}

#[tokio::test]
async fn server_non_invite_absorbs_request_retransmits() {
    let (engine, peer, remote) = build_engine(fast_defaults()).await;
    let handler = Arc::new(RecordingHandler::default());
    engine.set_handler(handler.clone());

    let options = request(Method::Options, "z9hG4bKdup", "sip:uas@example.com");
    engine
        .dispatch(inbound(serialize_request(&options), remote))
        .await;

    let handle = {
        let requests = handler.requests.lock().await;
        requests[0].1.clone()
    };
    handle.send_final(response_for(&options, 200, "OK")).await;
    let first = drain_peer(&peer).await;
    assert_eq!(first.iter().filter(|d| d.starts_with(b"SIP/2.0 200")).count(), 1);

    // The retransmitted request is absorbed by resending the stored final,
    // not by surfacing a second transaction.
    engine
        .dispatch(inbound(serialize_request(&options), remote))
        .await;
    let second = drain_peer(&peer).await;
    assert_eq!(second.iter().filter(|d| d.starts_with(b"SIP/2.0 200")).count(), 1);
    assert_eq!(handler.requests.lock().await.len(), 1);
    engine.shutdown();
}

#[tokio::test]
async fn reliable_provisional_rseq_and_prack_flow() {
    let (engine, peer, remote) = build_engine(fast_defaults()).await;
    let handler = Arc::new(RecordingHandler::default());
    engine.set_handler(handler.clone());

    let mut invite = request(Method::Invite, "z9hG4bKrel", "sip:uas@example.com");
    invite.headers.push("Supported", "100rel");
    engine
        .dispatch(inbound(serialize_request(&invite), remote))
        .await;

    let invite_key = TransactionKey::new("z9hG4bKrel", &Method::Invite);
    let handle = {
        let requests = handler.requests.lock().await;
        requests[0].1.clone()
    };

    handle
        .send_provisional(response_for(&invite, 180, "Ringing"))
        .await;
    assert!(engine.delivery_pending(&invite_key));
    let first_rseq = engine.pending_rseq(&invite_key).expect("rseq");
    assert!((1..=1 << 30).contains(&first_rseq), "rseq {first_rseq}");

    // The stamped 180 carries RSeq and Require: 100rel.
    let datagrams = drain_peer(&peer).await;
    let reliable_180 = datagrams
        .iter()
        .find(|d| d.starts_with(b"SIP/2.0 180"))
        .expect("180 on the wire");
    let text = String::from_utf8_lossy(reliable_180);
    assert!(text.contains(&format!("RSeq: {first_rseq}")));
    assert!(text.contains("100rel"));

    // A second reliable provisional increments RSeq and supersedes.
    handle
        .send_provisional(response_for(&invite, 183, "Session Progress"))
        .await;
    let second_rseq = engine.pending_rseq(&invite_key).expect("rseq");
    assert_eq!(second_rseq, first_rseq + 1);

    // Mismatched RAck: state untouched, 481 answered.
    let mut bad_prack = request(Method::Prack, "z9hG4bKprack1", "sip:uas@example.com");
    bad_prack.headers.remove_all("Call-ID");
    bad_prack
        .headers
        .push("Call-ID", "z9hG4bKrel@client.example.com");
    bad_prack
        .headers
        .push("RAck", format!("{} 1 INVITE", second_rseq + 7));
    engine
        .dispatch(inbound(serialize_request(&bad_prack), remote))
        .await;
    assert!(engine.delivery_pending(&invite_key));
    let datagrams = drain_peer(&peer).await;
    assert!(datagrams.iter().any(|d| d.starts_with(b"SIP/2.0 481")));

    // Matching RAck clears delivery-pending and earns a 200.
    let mut prack = request(Method::Prack, "z9hG4bKprack2", "sip:uas@example.com");
    prack.headers.remove_all("Call-ID");
    prack
        .headers
        .push("Call-ID", "z9hG4bKrel@client.example.com");
    prack
        .headers
        .push("RAck", format!("{second_rseq} 1 INVITE"));
    engine
        .dispatch(inbound(serialize_request(&prack), remote))
        .await;
    assert!(!engine.delivery_pending(&invite_key));
    let datagrams = drain_peer(&peer).await;
    assert!(
        datagrams
            .iter()
            .any(|d| d.starts_with(b"SIP/2.0 200") && twin_contains(d, b"PRACK")),
        "expected 200 for the PRACK"
    );
    engine.shutdown();
}

#[tokio::test]
async fn reliable_provisional_retransmits_until_acknowledged() {
    let (engine, peer, remote) = build_engine(fast_defaults()).await;
    let handler = Arc::new(RecordingHandler::default());
    engine.set_handler(handler.clone());

    let mut invite = request(Method::Invite, "z9hG4bKrtx", "sip:uas@example.com");
    invite.headers.push("Require", "100rel");
    engine
        .dispatch(inbound(serialize_request(&invite), remote))
        .await;

    let handle = {
        let requests = handler.requests.lock().await;
        requests[0].1.clone()
    };
    handle
        .send_provisional(response_for(&invite, 183, "Session Progress"))
        .await;

    tokio::time::sleep(Duration::from_millis(120)).await;
    let count_183 = drain_peer(&peer)
        .await
        .iter()
        .filter(|d| d.starts_with(b"SIP/2.0 183"))
        .count();
    assert!(count_183 >= 2, "reliable 183 must retransmit, saw {count_183}");
    engine.shutdown();
}

#[tokio::test]
async fn create_cancel_builds_from_stored_invite() {
    let (engine, peer, _remote) = build_engine(fast_defaults()).await;
    let sink = Arc::new(RecordingSink::default());

    let invite = request(
        Method::Invite,
        "z9hG4bKcc",
        &format!("sip:{}", peer.local_addr().unwrap()),
    );
    let key = engine.client_invite(invite, sink).await.unwrap();

    let cancel = engine.create_cancel(&key).unwrap();
    assert_eq!(cancel.start.method, Method::Cancel);
    assert!(cancel
        .headers
        .get("Via")
        .unwrap()
        .contains("branch=z9hG4bKcc"));
    assert_eq!(
        cancel.headers.get("CSeq").map(|v| v.as_str()),
        Some("1 CANCEL")
    );
    engine.shutdown();
}

/// Checks that `needle` appears in the datagram (for CSeq method checks).
fn twin_contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}
