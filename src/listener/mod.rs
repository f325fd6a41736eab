//! Listening sockets and connection dispatch.
//!
//! [`ConnectionListener`] binds a plain port and optionally a TLS port,
//! yields accepted connections through [`ConnectionListener::accept`], and
//! runs each one on its own task. [`ListenerControl`] is the cloneable handle
//! used to stop it from elsewhere.

mod connection;

pub use connection::{Connection, Transport};

use serde::Serialize;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::ErrorClass;
use crate::identity::IdentityStore;
use crate::transfer::{reached, ConnectionId, EngineContext, ShutdownPhase};

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long cancelled connections get to notice before being aborted.
const FORCED_GRACE: Duration = Duration::from_secs(1);

/// Errors raised while binding.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("address {0} is already in use")]
    AddressInUse(SocketAddr),

    #[error("permission denied binding {0}")]
    BindPermissionDenied(SocketAddr),

    #[error("a TLS port requires a loaded identity")]
    MissingIdentity,

    #[error("failed to bind {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Result type for listener operations
pub type ListenResult<T> = Result<T, ListenError>;

/// Per-connection bounds enforced by the listener.
#[derive(Debug, Clone)]
pub struct ListenerLimits {
    pub max_connections: usize,
    pub handshake_timeout: Duration,
    /// How long `stop` lets in-flight transfers finish before cancelling.
    pub drain_timeout: Duration,
}

impl Default for ListenerLimits {
    fn default() -> Self {
        Self {
            max_connections: 256,
            handshake_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything a listener hands to the connections it accepts.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub engine: Arc<EngineContext>,
    pub identity: Option<Arc<IdentityStore>>,
    pub limits: ListenerLimits,
}

/// Connection counters shared with the accept loop and connection tasks.
#[derive(Debug, Default)]
pub struct ListenerStats {
    accepted: AtomicU64,
    active: AtomicU64,
    rejected: AtomicU64,
    tls_sessions: AtomicU64,
    handshake_failures: AtomicU64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> ListenerCounters {
        ListenerCounters {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            tls_sessions: self.tls_sessions.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ListenerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListenerCounters {
    pub accepted: u64,
    pub active: u64,
    /// Turned away because the connection limit was reached.
    pub rejected: u64,
    pub tls_sessions: u64,
    pub handshake_failures: u64,
}

/// Cloneable handle for stopping a listener and reading its state.
#[derive(Debug, Clone)]
pub struct ListenerControl {
    phase: Arc<watch::Sender<ShutdownPhase>>,
    stats: Arc<ListenerStats>,
    plain_addr: SocketAddr,
    tls_addr: Option<SocketAddr>,
}

impl ListenerControl {
    /// Close the listening sockets and let in-flight transfers drain.
    pub fn stop(&self) {
        self.advance(ShutdownPhase::Draining);
    }

    /// Cancel every connection now.
    pub fn force(&self) {
        self.advance(ShutdownPhase::Forced);
    }

    fn advance(&self, to: ShutdownPhase) {
        self.phase.send_if_modified(|phase| {
            if *phase < to {
                *phase = to;
                true
            } else {
                false
            }
        });
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    pub fn counters(&self) -> ListenerCounters {
        self.stats.snapshot()
    }

    pub fn plain_addr(&self) -> SocketAddr {
        self.plain_addr
    }

    pub fn tls_addr(&self) -> Option<SocketAddr> {
        self.tls_addr
    }
}

/// Accepts plain and TLS connections until stopped.
pub struct ConnectionListener {
    plain: Option<TcpListener>,
    tls: Option<TcpListener>,
    control: ListenerControl,
    phase: watch::Receiver<ShutdownPhase>,
    options: Arc<ListenerOptions>,
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl ConnectionListener {
    /// Bind `bind:plain_port` and, when given, `bind:tls_port`. Port 0 picks
    /// an ephemeral port; see [`ListenerControl::plain_addr`].
    pub async fn start(
        bind: IpAddr,
        plain_port: u16,
        tls_port: Option<u16>,
        options: ListenerOptions,
    ) -> ListenResult<Self> {
        if tls_port.is_some() && options.identity.is_none() {
            return Err(ListenError::MissingIdentity);
        }

        let plain = bind_socket(SocketAddr::new(bind, plain_port)).await?;
        let tls = match tls_port {
            Some(port) => Some(bind_socket(SocketAddr::new(bind, port)).await?),
            None => None,
        };

        let plain_addr = local_addr(&plain, SocketAddr::new(bind, plain_port))?;
        let tls_addr = match (&tls, tls_port) {
            (Some(listener), Some(port)) => Some(local_addr(listener, SocketAddr::new(bind, port))?),
            _ => None,
        };
        info!(plain = %plain_addr, tls = ?tls_addr, "Listening");

        let (phase_tx, phase) = watch::channel(ShutdownPhase::Running);
        let control = ListenerControl {
            phase: Arc::new(phase_tx),
            stats: Arc::new(ListenerStats::default()),
            plain_addr,
            tls_addr,
        };

        Ok(Self {
            plain: Some(plain),
            tls,
            control,
            phase,
            permits: Arc::new(Semaphore::new(options.limits.max_connections.max(1))),
            options: Arc::new(options),
            tasks: JoinSet::new(),
        })
    }

    pub fn control(&self) -> ListenerControl {
        self.control.clone()
    }

    /// Next accepted connection, or `None` once the listener is stopped.
    /// The sockets are closed as soon as a stop is observed.
    pub async fn accept(&mut self) -> Option<Connection> {
        loop {
            let plain = self.plain.as_ref()?;

            tokio::select! {
                _ = reached(&mut self.phase, ShutdownPhase::Draining) => {
                    self.plain = None;
                    self.tls = None;
                    debug!("Listening sockets closed");
                    return None;
                }
                result = plain.accept() => {
                    if let Some(conn) = self.accepted(result, Transport::Plain).await {
                        return Some(conn);
                    }
                }
                result = accept_optional(self.tls.as_ref()) => {
                    if let Some(conn) = self.accepted(result, Transport::Tls).await {
                        return Some(conn);
                    }
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Connection task panicked: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn accepted(
        &self,
        result: io::Result<(TcpStream, SocketAddr)>,
        transport: Transport,
    ) -> Option<Connection> {
        match result {
            Ok((stream, peer)) => {
                self.control.stats.accepted.fetch_add(1, Ordering::Relaxed);
                Some(Connection::new(ConnectionId::new(), stream, peer, transport))
            }
            Err(e) => {
                warn!(class = %ErrorClass::ResourceExhaustion, error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                None
            }
        }
    }

    /// Run `conn` on its own task, or turn it away if the connection limit
    /// is reached.
    pub fn dispatch(&mut self, conn: Connection) {
        let stats = Arc::clone(&self.control.stats);
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                let options = Arc::clone(&self.options);
                let shutdown = self.control.phase.subscribe();
                self.tasks.spawn(async move {
                    stats.active.fetch_add(1, Ordering::Relaxed);
                    conn.serve(&options, &stats, shutdown).await;
                    stats.active.fetch_sub(1, Ordering::Relaxed);
                    drop(permit);
                });
            }
            Err(_) => {
                stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    class = %ErrorClass::ResourceExhaustion,
                    connection = %conn.id(),
                    peer = %conn.peer(),
                    transport = ?conn.transport(),
                    "Connection limit reached; rejecting"
                );
                self.tasks.spawn(conn.reject_busy());
            }
        }
    }

    /// Accept and dispatch until stopped, then drain.
    pub async fn run(mut self) -> ListenerCounters {
        while let Some(conn) = self.accept().await {
            self.dispatch(conn);
        }
        self.drain().await;
        self.control.counters()
    }

    /// Wait for connection tasks to finish; cancel them once the drain
    /// timeout elapses.
    async fn drain(&mut self) {
        let drain_timeout = self.options.limits.drain_timeout;
        info!(connections = self.tasks.len(), "Draining connections");

        if join_all(&mut self.tasks, drain_timeout).await {
            info!("All connections drained");
            return;
        }

        warn!(
            remaining = self.tasks.len(),
            "Drain timeout elapsed; cancelling remaining transfers"
        );
        self.control.force();
        if !join_all(&mut self.tasks, FORCED_GRACE).await {
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }
}

/// Join every task within `limit`. Returns false if some are still running.
async fn join_all(tasks: &mut JoinSet<()>, limit: Duration) -> bool {
    tokio::time::timeout(limit, async {
        while tasks.join_next().await.is_some() {}
    })
    .await
    .is_ok()
}

async fn accept_optional(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn bind_socket(addr: SocketAddr) -> ListenResult<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| match e.kind() {
        io::ErrorKind::AddrInUse => ListenError::AddressInUse(addr),
        io::ErrorKind::PermissionDenied => ListenError::BindPermissionDenied(addr),
        _ => ListenError::Io { addr, source: e },
    })
}

fn local_addr(listener: &TcpListener, requested: SocketAddr) -> ListenResult<SocketAddr> {
    listener.local_addr().map_err(|source| ListenError::Io {
        addr: requested,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityStore, SelfSigned};
    use crate::share::{ShareConfig, ShareRegistry};
    use crate::transfer::TransferLimits;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn options(dir: &TempDir, identity: Option<Arc<IdentityStore>>) -> ListenerOptions {
        std::fs::write(dir.path().join("hello.txt"), b"hello").unwrap();
        let registry = ShareRegistry::from_configs(&[ShareConfig::new(
            "/files",
            dir.path().to_path_buf(),
        )])
        .unwrap();
        ListenerOptions {
            engine: Arc::new(EngineContext::new(
                Arc::new(registry),
                TransferLimits::default(),
            )),
            identity,
            limits: ListenerLimits::default(),
        }
    }

    fn identity() -> Arc<IdentityStore> {
        let identity = SelfSigned::generate(&["localhost".to_string()])
            .unwrap()
            .into_identity()
            .unwrap();
        Arc::new(IdentityStore::new(identity))
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_address_in_use() {
        let dir = TempDir::new().unwrap();
        let first = ConnectionListener::start(LOCALHOST, 0, None, options(&dir, None))
            .await
            .unwrap();
        let port = first.control().plain_addr().port();

        let err = ConnectionListener::start(LOCALHOST, port, None, options(&dir, None))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ListenError::AddressInUse(_)));
    }

    #[tokio::test]
    async fn test_tls_port_without_identity() {
        let dir = TempDir::new().unwrap();
        let err = ConnectionListener::start(LOCALHOST, 0, Some(0), options(&dir, None))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ListenError::MissingIdentity));
    }

    #[tokio::test]
    async fn test_serves_and_stops() {
        let dir = TempDir::new().unwrap();
        let listener = ConnectionListener::start(LOCALHOST, 0, None, options(&dir, None))
            .await
            .unwrap();
        let control = listener.control();
        let addr = control.plain_addr();
        let task = tokio::spawn(listener.run());

        let response = get(addr, "/files/hello.txt").await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("hello"));

        control.stop();
        let counters = task.await.unwrap();
        assert_eq!(counters.accepted, 1);
        assert_eq!(counters.active, 0);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_accept_returns_none_after_stop() {
        let dir = TempDir::new().unwrap();
        let mut listener = ConnectionListener::start(LOCALHOST, 0, None, options(&dir, None))
            .await
            .unwrap();
        listener.control().stop();
        assert!(listener.accept().await.is_none());
        assert!(listener.accept().await.is_none());
    }

    #[tokio::test]
    async fn test_connection_limit_rejects_with_503() {
        let dir = TempDir::new().unwrap();
        let mut opts = options(&dir, None);
        opts.limits.max_connections = 1;
        let listener = ConnectionListener::start(LOCALHOST, 0, None, opts)
            .await
            .unwrap();
        let control = listener.control();
        let addr = control.plain_addr();
        let task = tokio::spawn(listener.run());

        // Hold the only slot with an idle keep-alive connection
        let mut holder = TcpStream::connect(addr).await.unwrap();
        holder
            .write_all(b"GET /files/hello.txt HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 512];
        let n = holder.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));

        let mut extra = TcpStream::connect(addr).await.unwrap();
        let mut response = String::new();
        extra.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert_eq!(control.counters().rejected, 1);

        control.stop();
        let counters = task.await.unwrap();
        assert_eq!(counters.accepted, 2);
    }

    #[tokio::test]
    async fn test_handshake_failure_is_counted() {
        let dir = TempDir::new().unwrap();
        let listener =
            ConnectionListener::start(LOCALHOST, 0, Some(0), options(&dir, Some(identity())))
                .await
                .unwrap();
        let control = listener.control();
        let tls_addr = control.tls_addr().unwrap();
        let task = tokio::spawn(listener.run());

        // Plain HTTP sent to the TLS port is not a ClientHello
        let mut stream = TcpStream::connect(tls_addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;

        // The listener keeps serving afterwards
        let response = get(control.plain_addr(), "/files/hello.txt").await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

        control.stop();
        let counters = task.await.unwrap();
        assert_eq!(counters.handshake_failures, 1);
        assert_eq!(counters.tls_sessions, 0);
    }

    #[tokio::test]
    async fn test_plain_port_serves_plain_http_with_identity_loaded() {
        let dir = TempDir::new().unwrap();
        let listener =
            ConnectionListener::start(LOCALHOST, 0, None, options(&dir, Some(identity())))
                .await
                .unwrap();
        let control = listener.control();
        let task = tokio::spawn(listener.run());

        let response = get(control.plain_addr(), "/files/hello.txt").await;
        assert!(response.ends_with("hello"));

        control.stop();
        task.await.unwrap();
    }
}
