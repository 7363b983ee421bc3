// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end exchanges over real sockets: a UDP OPTIONS round trip between
//! two stacks and a trickled TCP stream of requests.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sipwire_core::{Headers, Method, Request, RequestLine, Response, SipUri, StatusLine};
use sipwire_dns::{LookupService, StaticBackend};
use sipwire_transaction::{
    InboundHandler, ServerTransactionHandle, TimerDefaults, TransactionEngine, TransactionKey,
    TransactionUser,
};
use sipwire_transport::{Endpoint, Transport, TransportConfig};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

async fn build_stack(udp: Option<&str>, tcp: Option<&str>) -> (TransactionEngine, Transport) {
    let dns = LookupService::new(Arc::new(StaticBackend::new()));
    let (transport, rx) = Transport::new(TransportConfig::default(), dns);
    if let Some(addr) = udp {
        transport
            .add_udp(addr.parse().unwrap())
            .await
            .expect("bind udp");
    }
    if let Some(addr) = tcp {
        transport
            .add_tcp(addr.parse().unwrap())
            .await
            .expect("bind tcp");
    }
    let engine = TransactionEngine::new(transport.clone(), TimerDefaults::default());
    engine.start_dispatch(rx);
    (engine, transport)
}

fn ok_response(req: &Request) -> Response {
    let mut headers = Headers::new();
    for name in ["Via", "To", "From", "Call-ID", "CSeq"] {
        if let Some(value) = req.headers.get(name) {
            headers.push(name, value.clone());
        }
    }
    Response::new(StatusLine::new(200, "OK").unwrap(), headers, Bytes::new()).unwrap()
}

/// Answers every request with 200 OK and records what it saw.
#[derive(Default)]
struct AnsweringHandler {
    uris: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl InboundHandler for AnsweringHandler {
    async fn on_request_received(&self, request: Request, transaction: ServerTransactionHandle) {
        self.uris.lock().await.push(request.uri().to_string());
        transaction.send_final(ok_response(&request)).await;
    }
    async fn on_response_received(&self, _response: Response, _remote: Endpoint) {}
}

#[derive(Default)]
struct FinalWaiter {
    finals: Mutex<Vec<(TransactionKey, u16)>>,
}

#[async_trait::async_trait]
impl TransactionUser for FinalWaiter {
    async fn on_final(&self, key: &TransactionKey, response: &Response) {
        self.finals.lock().await.push((key.clone(), response.code()));
    }
}

#[tokio::test]
async fn udp_options_round_trip() {
    let (server, _st) = build_stack(Some("127.0.0.1:6060"), None).await;
    let handler = Arc::new(AnsweringHandler::default());
    server.set_handler(handler.clone());

    let (client, _ct) = build_stack(Some("127.0.0.1:6061"), None).await;
    let sink = Arc::new(FinalWaiter::default());

    let branch = "z9hG4bKudprt";
    let mut headers = Headers::new();
    headers.push("Via", format!("SIP/2.0/UDP 127.0.0.1:6061;branch={branch}"));
    headers.push("To", "<sip:127.0.0.1:6060>");
    headers.push("From", "<sip:probe@127.0.0.1:6061>;tag=rt1");
    headers.push("Call-ID", "rt@127.0.0.1");
    headers.push("CSeq", "1 OPTIONS");
    headers.push("Max-Forwards", "70");
    let options = Request::new(
        RequestLine::new(Method::Options, SipUri::parse("sip:127.0.0.1:6060").unwrap()),
        headers,
        Bytes::new(),
    )
    .unwrap();

    let key = client.client_non_invite(options, sink.clone()).await.unwrap();
    assert_eq!(key, TransactionKey::new(branch, &Method::Options));

    // The client must observe the 200 within two seconds.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        {
            let finals = sink.finals.lock().await;
            if let Some((observed_key, code)) = finals.first() {
                assert_eq!(*code, 200);
                assert_eq!(observed_key, &key);
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no 200 within two seconds"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    server.shutdown();
    client.shutdown();
}

#[tokio::test]
async fn tcp_stream_trickle_delivers_each_request_once() {
    let (server, _st) = build_stack(None, Some("127.0.0.1:9066")).await;
    let handler = Arc::new(AnsweringHandler::default());
    server.set_handler(handler.clone());

    let mut stream = tokio::net::TcpStream::connect("127.0.0.1:9066")
        .await
        .expect("connect");

    for i in 0..10 {
        let message = format!(
            "OPTIONS sip:{i}@example.com SIP/2.0\r\n\
Via: SIP/2.0/TCP 127.0.0.1;branch=z9hG4bKtr{i}\r\n\
To: <sip:{i}@example.com>\r\n\
From: <sip:prober@example.com>;tag=tr\r\n\
Call-ID: trickle-{i}@example.com\r\n\
CSeq: 1 OPTIONS\r\n\
Max-Forwards: 70\r\n\
Content-Length: 0\r\n\r\n"
        );
        stream.write_all(message.as_bytes()).await.expect("write");
        stream.flush().await.expect("flush");
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    drop(stream);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        {
            let uris = handler.uris.lock().await;
            if uris.len() >= 10 {
                let expected: Vec<String> =
                    (0..10).map(|i| format!("sip:{i}@example.com")).collect();
                assert_eq!(*uris, expected);
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "server saw only part of the trickle"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    server.shutdown();
}
