use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::{ListenerOptions, ListenerStats};
use crate::http::{ResponseHead, StatusCode};
use crate::transfer::{reached, ConnectionId, ShutdownPhase, TransferEngine};

/// First byte of a TLS handshake record.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Bound on writing the 503 to a connection turned away at the limit.
const REJECT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Which socket a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Plain,
    Tls,
}

/// An accepted socket that has not been handed to an engine yet.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    transport: Transport,
}

impl Connection {
    pub(super) fn new(
        id: ConnectionId,
        stream: TcpStream,
        peer: SocketAddr,
        transport: Transport,
    ) -> Self {
        Self {
            id,
            stream,
            peer,
            transport,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Negotiate TLS if needed, then serve requests until the connection ends.
    pub(super) async fn serve(
        self,
        options: &ListenerOptions,
        stats: &ListenerStats,
        mut shutdown: watch::Receiver<ShutdownPhase>,
    ) {
        let Connection {
            id,
            stream,
            peer,
            transport,
        } = self;
        let _ = stream.set_nodelay(true);

        let use_tls = match (transport, &options.identity) {
            (Transport::Tls, _) => true,
            (Transport::Plain, Some(_)) => {
                let limit = options.engine.limits.header_timeout;
                match sniff_tls(&stream, limit, &mut shutdown).await {
                    Some(is_tls) => is_tls,
                    None => {
                        debug!(connection = %id, %peer, "Closed before the first byte");
                        return;
                    }
                }
            }
            (Transport::Plain, None) => false,
        };

        if !use_tls {
            let engine = TransferEngine::with_id(id, stream, peer, options.engine.clone(), shutdown);
            let summary = engine.run().await;
            debug!(connection = %id, requests = summary.requests, bytes = summary.bytes_sent, "Connection finished");
            return;
        }

        let Some(store) = options.identity.as_ref() else {
            return;
        };
        // One snapshot per handshake; a rotation mid-handshake does not affect it.
        let acceptor = TlsAcceptor::from(store.current().tls_config());
        let handshake = tokio::select! {
            result = tokio::time::timeout(options.limits.handshake_timeout, acceptor.accept(stream)) => result,
            _ = reached(&mut shutdown, ShutdownPhase::Forced) => return,
        };

        match handshake {
            Ok(Ok(tls)) => {
                stats.tls_sessions.fetch_add(1, Ordering::Relaxed);
                let engine = TransferEngine::with_id(id, tls, peer, options.engine.clone(), shutdown);
                let summary = engine.run().await;
                debug!(connection = %id, requests = summary.requests, bytes = summary.bytes_sent, "TLS connection finished");
            }
            Ok(Err(e)) => {
                stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                debug!(connection = %id, %peer, error = %e, "TLS handshake failed");
            }
            Err(_) => {
                stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                debug!(connection = %id, %peer, "TLS handshake timed out");
            }
        }
    }

    /// Turn the connection away: a 503 for plain HTTP, a bare close for TLS.
    pub(super) async fn reject_busy(mut self) {
        if self.transport == Transport::Tls {
            return;
        }
        if let Err(e) = send_busy(&mut self.stream, REJECT_WRITE_TIMEOUT).await {
            debug!(connection = %self.id, peer = %self.peer, error = %e, "Failed to send 503");
        }
    }
}

/// Write a bare 503 and close, giving up after `limit`.
async fn send_busy<S: AsyncWrite + Unpin>(stream: &mut S, limit: Duration) -> io::Result<()> {
    let (head, body) = ResponseHead::error(StatusCode::SERVICE_UNAVAILABLE);
    let mut response = head.connection(false).to_bytes();
    response.extend_from_slice(&body);

    let write = async {
        stream.write_all(&response).await?;
        stream.shutdown().await
    };
    match tokio::time::timeout(limit, write).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "client did not read the 503")),
    }
}

/// Peek at the first byte to tell a TLS ClientHello from plain HTTP.
/// `None` if the client closed, stayed silent, or the listener is stopping.
async fn sniff_tls(
    stream: &TcpStream,
    limit: Duration,
    shutdown: &mut watch::Receiver<ShutdownPhase>,
) -> Option<bool> {
    let mut first = [0u8; 1];
    tokio::select! {
        result = tokio::time::timeout(limit, stream.peek(&mut first)) => match result {
            Ok(Ok(n)) if n > 0 => Some(first[0] == TLS_HANDSHAKE_RECORD),
            _ => None,
        },
        _ = reached(shutdown, ShutdownPhase::Draining) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_send_busy_writes_503() {
        let (mut server, mut client) = tokio::io::duplex(4096);
        send_busy(&mut server, REJECT_WRITE_TIMEOUT).await.unwrap();
        drop(server);

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(response.contains("Connection: close"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_busy_gives_up_on_client_that_never_reads() {
        // A one-byte pipe nobody drains blocks the write after the first byte
        let (mut server, _client) = tokio::io::duplex(1);

        let start = Instant::now();
        let err = send_busy(&mut server, REJECT_WRITE_TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(start.elapsed() <= REJECT_WRITE_TIMEOUT + Duration::from_millis(10));
    }
}
