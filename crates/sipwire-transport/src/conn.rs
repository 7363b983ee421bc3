// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared stream-connection machinery for TCP and TLS channels.
//!
//! Each established connection gets a stable connection-id, a writer queue,
//! and a read task that frames SIP messages out of the byte stream. The
//! containing channel keys connections by remote endpoint and by id.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use sipwire_parse::MessageReader;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Endpoint, InboundMessage, TransportKind};

/// Global allocator for channel and connection identifiers.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Per-connection bookkeeping.
#[derive(Clone)]
pub struct ConnEntry {
    pub id: u64,
    pub writer: mpsc::Sender<Bytes>,
    pub last_activity: Arc<Mutex<Instant>>,
    pub cancel: CancellationToken,
}

impl ConnEntry {
    pub(crate) fn touch(&self) {
        *self.last_activity.lock().expect("activity lock") = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity.lock().expect("activity lock").elapsed()
    }
}

/// Connections of one stream channel, addressable by peer or by id.
#[derive(Default)]
pub struct ConnectionTable {
    by_addr: DashMap<SocketAddr, ConnEntry>,
    by_id: DashMap<u64, SocketAddr>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection, returning its entry.
    pub(crate) fn insert(
        &self,
        peer: SocketAddr,
        writer: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> ConnEntry {
        let entry = ConnEntry {
            id: next_id(),
            writer,
            last_activity: Arc::new(Mutex::new(Instant::now())),
            cancel,
        };
        self.by_id.insert(entry.id, peer);
        if let Some(stale) = self.by_addr.insert(peer, entry.clone()) {
            // A replaced connection to the same peer is shut down; its id
            // stops resolving.
            stale.cancel.cancel();
            self.by_id.remove(&stale.id);
        }
        entry
    }

    pub(crate) fn by_peer(&self, peer: SocketAddr) -> Option<ConnEntry> {
        self.by_addr.get(&peer).map(|e| e.clone())
    }

    pub(crate) fn by_id(&self, id: u64) -> Option<ConnEntry> {
        let peer = *self.by_id.get(&id)?;
        self.by_peer(peer)
    }

    pub(crate) fn remove(&self, peer: SocketAddr, id: u64) {
        self.by_id.remove(&id);
        self.by_addr.remove_if(&peer, |_, entry| entry.id == id);
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    /// True when no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    pub(crate) fn close_all(&self) {
        for entry in self.by_addr.iter() {
            entry.cancel.cancel();
        }
        self.by_addr.clear();
        self.by_id.clear();
    }
}

/// Runs reader and writer tasks for one established stream connection.
///
/// The reader frames complete SIP messages with a receive buffer bounded at
/// twice the maximum message size and closes the connection on peer close,
/// framing errors, idle timeout, or cancellation. All exits remove the
/// connection from the table.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_stream_session<S>(
    stream: S,
    kind: TransportKind,
    local: SocketAddr,
    peer: SocketAddr,
    entry: ConnEntry,
    writer_rx: mpsc::Receiver<Bytes>,
    inbound: mpsc::Sender<InboundMessage>,
    table: Arc<ConnectionTable>,
    max_message_size: usize,
    idle_timeout: Duration,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let conn_id = entry.id;
    let writer_tx = entry.writer.clone();
    let cancel = entry.cancel.clone();

    let write_entry = entry.clone();
    let write_cancel = cancel.clone();
    let writer_task = tokio::spawn(async move {
        let mut rx = writer_rx;
        loop {
            let buf = tokio::select! {
                buf = rx.recv() => buf,
                _ = write_cancel.cancelled() => None,
            };
            let Some(buf) = buf else { break };
            if let Err(e) = writer.write_all(&buf).await {
                warn!(%peer, %e, "stream write error");
                break;
            }
            if let Err(e) = writer.flush().await {
                warn!(%peer, %e, "stream flush error");
                break;
            }
            write_entry.touch();
        }
        let _ = writer.shutdown().await;
    });

    tokio::spawn(async move {
        let mut frames = MessageReader::new(max_message_size);
        let mut scratch = vec![0u8; 8192];
        loop {
            let read = tokio::select! {
                read = tokio::time::timeout(idle_timeout, reader.read(&mut scratch)) => read,
                _ = cancel.cancelled() => break,
            };
            let n = match read {
                Ok(Ok(0)) => {
                    debug!(%peer, "stream closed by peer");
                    break;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!(%peer, %e, "stream read error");
                    break;
                }
                Err(_) => {
                    // The timer measures read silence; recent outbound
                    // traffic keeps the connection alive.
                    if entry.idle_for() >= idle_timeout {
                        debug!(%peer, timeout = ?idle_timeout, "closing idle stream connection");
                        break;
                    }
                    continue;
                }
            };
            entry.touch();

            frames.extend(&scratch[..n]);
            loop {
                match frames.next_message() {
                    Ok(Some(payload)) => {
                        let message = InboundMessage {
                            local: Endpoint::new(kind, local),
                            remote: Endpoint::new(kind, peer).with_connection(conn_id),
                            payload,
                            writer: Some(writer_tx.clone()),
                        };
                        if inbound.send(message).await.is_err() {
                            warn!(%peer, "inbound queue dropped; closing connection");
                            cancel.cancel();
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(%peer, %e, "framing error; closing connection");
                        cancel.cancel();
                        break;
                    }
                }
            }
            if cancel.is_cancelled() {
                break;
            }
        }

        table.remove(peer, conn_id);
        cancel.cancel();
        let _ = writer_task.await;
    });
}
