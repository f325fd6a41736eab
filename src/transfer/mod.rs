//! Per-connection transfer engine.
//!
//! Each accepted connection gets one [`TransferEngine`] running on its own
//! task. The engine walks every request through
//! `Reading -> Resolving -> Streaming -> Draining -> Closed`, with `Failed`
//! reachable from any stage, and never shares its state with other
//! connections.

mod engine;
mod listing;

pub use engine::{ConnectionSummary, TransferEngine};

use serde::Serialize;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::http::{ByteRange, RequestError};
use crate::share::ShareRegistry;

/// Default size of one disk read / socket write.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Opaque per-connection identifier, used to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stage of a single request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Reading the request line and headers.
    Reading,
    /// Looking up the share, checking permissions and range.
    Resolving,
    /// Writing the response head and body.
    Streaming,
    /// Body written; flushing before closing or reading the next request.
    Draining,
    Closed,
    Failed,
}

/// One request/response exchange on a connection.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub connection_id: ConnectionId,
    pub requested_path: String,
    pub range: Option<ByteRange>,
    pub state: TransferState,
    pub bytes_sent: u64,
}

impl Transfer {
    pub fn new(connection_id: ConnectionId, requested_path: impl Into<String>) -> Self {
        Self {
            connection_id,
            requested_path: requested_path.into(),
            range: None,
            state: TransferState::Reading,
            bytes_sent: 0,
        }
    }
}

/// Errors that end a connection.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to read local resource: {0}")]
    LocalRead(#[source] io::Error),

    #[error("bad request: {0}")]
    Request(#[from] RequestError),

    #[error("timed out waiting for request headers")]
    HeaderTimeout,

    #[error("timed out writing to client")]
    WriteTimeout,

    #[error("client closed the connection mid-request")]
    ClientClosed,

    #[error("transfer cancelled by shutdown")]
    Cancelled,
}

/// Result type for transfer operations
pub type TransferResult<T> = Result<T, TransferError>;

/// Daemon-wide shutdown progression, observed by every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    Running,
    /// Finish the response in flight, then close. Idle connections close now.
    Draining,
    /// Abandon everything; file handles are dropped immediately.
    Forced,
}

/// Bounds applied to every connection.
#[derive(Debug, Clone)]
pub struct TransferLimits {
    pub chunk_size: usize,
    /// Deadline for a complete request head, including keep-alive idle time.
    pub header_timeout: Duration,
    /// Deadline for each chunk write.
    pub write_timeout: Duration,
    /// Serve plain-text listings for directory targets.
    pub allow_listing: bool,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            header_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
            allow_listing: true,
        }
    }
}

/// Transfer counters shared by all connections.
#[derive(Debug, Default)]
pub struct TransferStats {
    completed: AtomicU64,
    failed: AtomicU64,
    bytes_sent: AtomicU64,
}

impl TransferStats {
    pub fn record(&self, transfer: &Transfer) {
        match transfer.state {
            TransferState::Closed => self.completed.fetch_add(1, Ordering::Relaxed),
            _ => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        self.bytes_sent
            .fetch_add(transfer.bytes_sent, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransferCounters {
        TransferCounters {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TransferStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferCounters {
    pub completed: u64,
    pub failed: u64,
    pub bytes_sent: u64,
}

/// Read-only state every engine needs.
#[derive(Debug)]
pub struct EngineContext {
    pub registry: Arc<ShareRegistry>,
    pub limits: TransferLimits,
    pub stats: Arc<TransferStats>,
}

impl EngineContext {
    pub fn new(registry: Arc<ShareRegistry>, limits: TransferLimits) -> Self {
        Self {
            registry,
            limits,
            stats: Arc::new(TransferStats::default()),
        }
    }
}

/// Resolve once `shutdown` reaches at least `phase`. Pends forever if the
/// sender is gone, since nobody can request shutdown anymore.
pub(crate) async fn reached(shutdown: &mut watch::Receiver<ShutdownPhase>, phase: ShutdownPhase) {
    loop {
        if *shutdown.borrow_and_update() >= phase {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run one I/O step with a deadline, aborting on forced shutdown.
pub(crate) async fn guarded<T>(
    shutdown: &mut watch::Receiver<ShutdownPhase>,
    deadline: Instant,
    on_timeout: TransferError,
    step: impl Future<Output = io::Result<T>>,
) -> TransferResult<T> {
    tokio::select! {
        result = tokio::time::timeout_at(deadline, step) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TransferError::Io(e)),
            Err(_) => Err(on_timeout),
        },
        _ = reached(shutdown, ShutdownPhase::Forced) => Err(TransferError::Cancelled),
    }
}
