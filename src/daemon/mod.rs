//! The daemon context.
//!
//! [`Daemon`] owns everything the process shares between components: the
//! share registry, the TLS identity, the listening sockets and the port
//! mapper. It is built from fully parsed [`DaemonSettings`] and has an
//! explicit start/stop lifecycle; nothing lives in module-level globals.

pub mod status;

pub use status::{build_router, DaemonStatus, StatusState};

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::ErrorClass;
use crate::identity::{Identity, IdentityError, IdentityStore};
use crate::listener::{
    ConnectionListener, ListenError, ListenerControl, ListenerCounters, ListenerLimits,
    ListenerOptions,
};
use crate::nat::{
    GatewaySearch, MapperConfig, MapperHandle, PortMapper, Reachability, UpnpSearch,
};
use crate::share::{ShareConfig, ShareError, ShareRegistry};
use crate::transfer::{EngineContext, TransferLimits};

/// Errors that stop the daemon from starting.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("invalid share configuration: {0}")]
    Share(#[from] ShareError),

    #[error("failed to load TLS identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("a TLS port is configured but no certificate and key are")]
    TlsWithoutIdentity,

    #[error(transparent)]
    Listen(#[from] ListenError),

    #[error("failed to bind status endpoint {addr}: {source}")]
    StatusBind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl DaemonError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::StartupFatal
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            DaemonError::Listen(ListenError::MissingIdentity) => 4,
            DaemonError::Listen(_) | DaemonError::StatusBind { .. } => 2,
            DaemonError::Identity(_) => 3,
            DaemonError::Share(_) | DaemonError::TlsWithoutIdentity => 4,
        }
    }
}

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Where the TLS identity comes from.
#[derive(Debug, Clone)]
pub struct IdentitySettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Write a self-signed identity at the paths if they do not exist.
    pub generate: bool,
    /// Subject alternative names for a generated certificate.
    pub hostnames: Vec<String>,
}

/// Port mapping settings.
#[derive(Debug, Clone)]
pub struct UpnpSettings {
    pub enabled: bool,
    pub search_timeout: Duration,
    pub mapper: MapperConfig,
}

impl Default for UpnpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            search_timeout: Duration::from_secs(3),
            mapper: MapperConfig::default(),
        }
    }
}

/// Fully parsed daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub bind: IpAddr,
    pub port: u16,
    pub tls_port: Option<u16>,
    pub identity: Option<IdentitySettings>,
    pub shares: Vec<ShareConfig>,
    pub transfer: TransferLimits,
    pub listener: ListenerLimits,
    pub upnp: UpnpSettings,
    /// Loopback address for the status endpoint, if enabled.
    pub status_addr: Option<SocketAddr>,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            tls_port: None,
            identity: None,
            shares: Vec::new(),
            transfer: TransferLimits::default(),
            listener: ListenerLimits::default(),
            upnp: UpnpSettings::default(),
            status_addr: None,
        }
    }
}

/// A configured daemon, validated but not yet listening.
pub struct Daemon {
    settings: DaemonSettings,
    registry: Arc<ShareRegistry>,
    identity: Option<Arc<IdentityStore>>,
}

impl Daemon {
    /// Validate shares and load the identity. Binds nothing.
    pub fn new(settings: DaemonSettings) -> DaemonResult<Self> {
        let registry = ShareRegistry::from_configs(&settings.shares)?;

        let identity = match &settings.identity {
            Some(id) => {
                let identity = if id.generate {
                    Identity::load_or_generate(&id.cert_path, &id.key_path, &id.hostnames)?
                } else {
                    Identity::load(&id.cert_path, &id.key_path)?
                };
                Some(Arc::new(IdentityStore::new(identity)))
            }
            None => None,
        };
        if settings.tls_port.is_some() && identity.is_none() {
            return Err(DaemonError::TlsWithoutIdentity);
        }

        Ok(Self {
            settings,
            registry: Arc::new(registry),
            identity,
        })
    }

    pub fn registry(&self) -> &ShareRegistry {
        &self.registry
    }

    pub fn identity(&self) -> Option<&Arc<IdentityStore>> {
        self.identity.as_ref()
    }

    /// Start serving, mapping the port through the router's UPnP service.
    pub async fn start(self) -> DaemonResult<DaemonHandle> {
        let search = UpnpSearch::new(
            self.settings.upnp.search_timeout,
            self.settings.upnp.mapper.description.clone(),
        );
        self.start_with(search).await
    }

    /// Start serving, discovering the gateway through `search`.
    pub async fn start_with<S: GatewaySearch>(self, search: S) -> DaemonResult<DaemonHandle> {
        let settings = self.settings;
        let engine = Arc::new(EngineContext::new(
            Arc::clone(&self.registry),
            settings.transfer.clone(),
        ));

        let listener = ConnectionListener::start(
            settings.bind,
            settings.port,
            settings.tls_port,
            ListenerOptions {
                engine: Arc::clone(&engine),
                identity: self.identity.clone(),
                limits: settings.listener.clone(),
            },
        )
        .await?;
        let control = listener.control();
        let listener_task = tokio::spawn(listener.run());

        // The plain port also accepts TLS, so one mapping covers both.
        let mapper = settings.upnp.enabled.then(|| {
            PortMapper::new(search, settings.bind, settings.upnp.mapper.clone())
                .spawn(control.plain_addr().port())
        });
        let reachability = match &mapper {
            Some(mapper) => mapper.subscribe(),
            None => watch::channel(Reachability::Disabled).1,
        };

        let state = Arc::new(StatusState::new(
            control.clone(),
            Arc::clone(&engine.stats),
            reachability,
            self.identity.clone(),
            self.registry.len(),
        ));

        let status = match settings.status_addr {
            Some(addr) => match StatusServer::bind(addr, Arc::clone(&state)).await {
                Ok(server) => Some(server),
                Err(e) => {
                    control.stop();
                    let _ = listener_task.await;
                    if let Some(mapper) = mapper {
                        mapper.shutdown().await;
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        info!(
            plain = %control.plain_addr(),
            tls = ?control.tls_addr(),
            shares = self.registry.len(),
            fingerprint = ?self.identity.as_ref().map(|s| s.current().fingerprint().to_string()),
            upnp = settings.upnp.enabled,
            "Daemon started"
        );
        for entry in self.registry.entries() {
            info!(public = %format!("/{}", entry.public_path), local = %entry.local_path.display(), "Sharing");
        }

        Ok(DaemonHandle {
            control,
            listener_task,
            mapper,
            status,
            state,
            identity: self.identity,
        })
    }
}

/// The loopback status endpoint, served by axum.
struct StatusServer {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl StatusServer {
    async fn bind(addr: SocketAddr, state: Arc<StatusState>) -> DaemonResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| DaemonError::StatusBind { addr, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| DaemonError::StatusBind { addr, source })?;
        let (stop, stopped) = oneshot::channel::<()>();
        let app = build_router(state);

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = stopped.await;
                })
                .await;
            if let Err(e) = result {
                error!("Status endpoint failed: {}", e);
            }
        });
        info!(%addr, "Status endpoint listening");
        Ok(Self { addr, stop, task })
    }

    async fn shutdown(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}

/// A running daemon.
pub struct DaemonHandle {
    control: ListenerControl,
    listener_task: JoinHandle<ListenerCounters>,
    mapper: Option<MapperHandle>,
    status: Option<StatusServer>,
    state: Arc<StatusState>,
    identity: Option<Arc<IdentityStore>>,
}

impl DaemonHandle {
    pub fn plain_addr(&self) -> SocketAddr {
        self.control.plain_addr()
    }

    pub fn tls_addr(&self) -> Option<SocketAddr> {
        self.control.tls_addr()
    }

    pub fn status_addr(&self) -> Option<SocketAddr> {
        self.status.as_ref().map(|s| s.addr)
    }

    /// Identity store, for rotating the certificate while running.
    pub fn identity(&self) -> Option<&Arc<IdentityStore>> {
        self.identity.as_ref()
    }

    pub fn reachability(&self) -> Reachability {
        self.state.reachability()
    }

    /// Watch reachability changes.
    pub fn subscribe(&self) -> watch::Receiver<Reachability> {
        self.state.subscribe()
    }

    pub fn status(&self) -> DaemonStatus {
        self.state.snapshot()
    }

    /// Stop accepting, let transfers drain (cancelling them after the drain
    /// timeout), then release the port mapping and stop the status endpoint.
    pub async fn stop(self) -> DaemonStatus {
        info!("Stopping daemon");
        self.control.stop();
        match self.listener_task.await {
            Ok(counters) => info!(
                accepted = counters.accepted,
                rejected = counters.rejected,
                handshake_failures = counters.handshake_failures,
                "Listener stopped"
            ),
            Err(e) => warn!("Listener task ended abnormally: {}", e),
        }

        if let Some(mapper) = self.mapper {
            mapper.shutdown().await;
        }
        let summary = self.state.snapshot();
        if let Some(status) = self.status {
            status.shutdown().await;
        }
        info!(
            transfers = summary.transfers.completed,
            failed = summary.transfers.failed,
            bytes = summary.transfers.bytes_sent,
            "Daemon stopped"
        );
        summary
    }
}

/// Wait for Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
