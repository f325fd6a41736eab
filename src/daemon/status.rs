//! Status endpoint: a small axum router reporting daemon health.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::identity::IdentityStore;
use crate::listener::{ListenerControl, ListenerCounters};
use crate::nat::Reachability;
use crate::transfer::{ShutdownPhase, TransferCounters, TransferStats};

/// Shared state read by the status handlers.
pub struct StatusState {
    listener: ListenerControl,
    transfers: Arc<TransferStats>,
    reachability: watch::Receiver<Reachability>,
    identity: Option<Arc<IdentityStore>>,
    shares: usize,
    started: Instant,
}

impl StatusState {
    pub fn new(
        listener: ListenerControl,
        transfers: Arc<TransferStats>,
        reachability: watch::Receiver<Reachability>,
        identity: Option<Arc<IdentityStore>>,
        shares: usize,
    ) -> Self {
        Self {
            listener,
            transfers,
            reachability,
            identity,
            shares,
            started: Instant::now(),
        }
    }

    pub fn reachability(&self) -> Reachability {
        self.reachability.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Reachability> {
        self.reachability.clone()
    }

    pub fn snapshot(&self) -> DaemonStatus {
        let identity = self.identity.as_ref().map(|store| store.current());
        DaemonStatus {
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: self.started.elapsed().as_secs(),
            phase: self.listener.phase(),
            reachability: self.reachability(),
            plain_addr: self.listener.plain_addr(),
            tls_addr: self.listener.tls_addr(),
            tls_fingerprint: identity.as_ref().map(|i| i.fingerprint().to_string()),
            tls_not_after: identity.as_ref().and_then(|i| i.not_after()),
            shares: self.shares,
            connections: self.listener.counters(),
            transfers: self.transfers.snapshot(),
        }
    }
}

/// Point-in-time view of the daemon, served as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub version: &'static str,
    pub uptime_secs: u64,
    pub phase: ShutdownPhase,
    pub reachability: Reachability,
    pub plain_addr: SocketAddr,
    pub tls_addr: Option<SocketAddr>,
    pub tls_fingerprint: Option<String>,
    pub tls_not_after: Option<DateTime<Utc>>,
    pub shares: usize,
    pub connections: ListenerCounters,
    pub transfers: TransferCounters,
}

/// Build the router with all routes.
pub fn build_router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/healthz", get(health_handler))
        .with_state(state)
}

async fn status_handler(State(state): State<Arc<StatusState>>) -> Json<DaemonStatus> {
    Json(state.snapshot())
}

/// 200 while reachable or mapping is off; 503 when mapping was lost.
async fn health_handler(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    if state.reachability().is_degraded() {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (StatusCode::OK, "ok")
    }
}
