// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Datagram channel: one bound socket, per-datagram framing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::conn::next_id;
use crate::{Channel, ChannelState, Endpoint, InboundMessage, TransportKind};

pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn listening() -> Self {
        Self(AtomicU8::new(0))
    }

    pub(crate) fn get(&self) -> ChannelState {
        match self.0.load(Ordering::Relaxed) {
            0 => ChannelState::Listening,
            1 => ChannelState::Faulted,
            _ => ChannelState::Closed,
        }
    }

    pub(crate) fn set(&self, state: ChannelState) {
        let v = match state {
            ChannelState::Listening => 0,
            ChannelState::Faulted => 1,
            ChannelState::Closed => 2,
        };
        self.0.store(v, Ordering::Relaxed);
    }
}

/// UDP channel. Each received datagram is one SIP message; no stream state.
pub struct UdpChannel {
    id: u64,
    local: SocketAddr,
    socket: Arc<UdpSocket>,
    state: StateCell,
    cancel: CancellationToken,
}

impl UdpChannel {
    /// Binds the socket and starts the receive loop.
    pub async fn bind(
        addr: SocketAddr,
        inbound: mpsc::Sender<InboundMessage>,
        max_message_size: usize,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        info!(%local, "listening (udp)");

        let channel = Arc::new(Self {
            id: next_id(),
            local,
            socket: socket.clone(),
            state: StateCell::listening(),
            cancel: cancel.clone(),
        });

        let recv_channel = channel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; max_message_size];
            loop {
                let received = tokio::select! {
                    received = socket.recv_from(&mut buf) => received,
                    _ = cancel.cancelled() => break,
                };
                match received {
                    Ok((n, peer)) => {
                        if n == buf.len() {
                            warn!(%peer, max = n, "udp datagram likely truncated; consider a stream transport");
                        }
                        let message = InboundMessage {
                            local: Endpoint::new(TransportKind::Udp, local),
                            remote: Endpoint::new(TransportKind::Udp, peer),
                            payload: Bytes::copy_from_slice(&buf[..n]),
                            writer: None,
                        };
                        if inbound.send(message).await.is_err() {
                            error!("inbound queue dropped; stopping udp loop");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(%e, "udp recv error");
                        recv_channel.state.set(ChannelState::Faulted);
                        break;
                    }
                }
            }
            if recv_channel.state.get() == ChannelState::Listening {
                recv_channel.state.set(ChannelState::Closed);
            }
        });

        Ok(channel)
    }
}

#[async_trait::async_trait]
impl Channel for UdpChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn state(&self) -> ChannelState {
        self.state.get()
    }

    async fn send(
        &self,
        remote: SocketAddr,
        payload: Bytes,
        _connection_hint: Option<u64>,
    ) -> Result<()> {
        self.socket.send_to(&payload, remote).await?;
        Ok(())
    }

    fn close(&self) {
        self.state.set(ChannelState::Closed);
        self.cancel.cancel();
    }
}
