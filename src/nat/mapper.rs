use std::future::Future;
use std::net::{IpAddr, SocketAddrV4};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    AddressResolver, Gateway, GatewayError, GatewaySearch, MappingError, MappingResult,
    PortMapping, Reachability,
};

/// Consecutive renewal failures after which the mapping counts as lost.
const RENEWAL_FAILURES_BEFORE_REMAP: u32 = 2;

/// Timing knobs for the mapping lifecycle.
#[derive(Debug, Clone)]
pub struct MapperConfig {
    /// Lease requested from the gateway.
    pub lease_seconds: u32,
    /// Bound on every individual gateway request.
    pub call_timeout: Duration,
    /// Bound on the release performed at shutdown.
    pub release_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Description attached to the mapping on the router.
    pub description: String,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            lease_seconds: 3600,
            call_timeout: Duration::from_secs(5),
            release_timeout: Duration::from_secs(3),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            description: concat!("mentor/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Exponential backoff: initial, 2x, 4x ... capped.
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Owns one port mapping on the gateway for the life of the daemon.
///
/// The mapping and the gateway handle are private to the mapper; once
/// [`PortMapper::spawn`] has moved it onto its own task, the rest of the
/// daemon only sees the published [`Reachability`].
pub struct PortMapper<S: GatewaySearch> {
    search: S,
    bind: IpAddr,
    config: MapperConfig,
    gateway: Option<S::Gateway>,
    local: Option<SocketAddrV4>,
    current: Option<PortMapping>,
}

impl<S: GatewaySearch> PortMapper<S> {
    pub fn new(search: S, bind: IpAddr, config: MapperConfig) -> Self {
        Self {
            search,
            bind,
            config,
            gateway: None,
            local: None,
            current: None,
        }
    }

    /// Mapping currently believed to be held.
    pub fn current(&self) -> Option<&PortMapping> {
        self.current.as_ref()
    }

    /// Discover the gateway and map an external port to `internal_port`.
    ///
    /// The same external port is requested first; if another client holds
    /// it, the gateway is asked for any free port.
    pub async fn acquire(&mut self, internal_port: u16) -> MappingResult<PortMapping> {
        let gateway = bounded(self.config.call_timeout, self.search.search()).await?;
        let local_ip = AddressResolver::local_address(self.bind, gateway.addr()).await?;
        let local = SocketAddrV4::new(local_ip, internal_port);
        let lease = self.config.lease_seconds;

        debug!(gateway = %gateway.addr(), %local, lease, "Requesting port mapping");
        let (external_port, lease) =
            match bounded(self.config.call_timeout, gateway.add_port(internal_port, local, lease))
                .await
            {
                Ok(()) => (internal_port, lease),
                Err(GatewayError::PermanentLeaseOnly) => {
                    debug!("Gateway only grants permanent leases; retrying with lease 0");
                    bounded(self.config.call_timeout, gateway.add_port(internal_port, local, 0))
                        .await?;
                    (internal_port, 0)
                }
                Err(GatewayError::PortInUse) => {
                    debug!(port = internal_port, "External port taken; asking for any port");
                    let port =
                        bounded(self.config.call_timeout, gateway.add_any_port(local, lease))
                            .await?;
                    (port, lease)
                }
                Err(e) => return Err(e.into()),
            };

        let mut mapping = PortMapping::new(external_port, internal_port, lease);
        mapping.external_ip =
            match AddressResolver::external_address(&gateway, self.config.call_timeout).await {
                Ok(ip) => Some(ip),
                Err(e) => {
                    debug!(error = %e, "Gateway did not report its external address");
                    None
                }
            };

        info!(
            external_ip = ?mapping.external_ip,
            external_port = mapping.external_port,
            internal_port,
            lease_seconds = mapping.lease_seconds,
            "Port mapping acquired"
        );
        self.gateway = Some(gateway);
        self.local = Some(local);
        self.current = Some(mapping.clone());
        Ok(mapping)
    }

    /// Extend the lease of `mapping` on the gateway it was acquired from.
    pub async fn renew(&mut self, mapping: &PortMapping) -> MappingResult<PortMapping> {
        let (Some(gateway), Some(local)) = (self.gateway.as_ref(), self.local) else {
            return Err(MappingError::LeaseExpired);
        };

        let add = gateway.add_port(mapping.external_port, local, mapping.lease_seconds);
        match bounded(self.config.call_timeout, add).await {
            Ok(()) => {}
            Err(GatewayError::Unreachable(msg)) => {
                return Err(MappingError::GatewayUnreachable(msg))
            }
            Err(e) => {
                debug!(error = %e, "Gateway rejected renewal");
                return Err(MappingError::LeaseExpired);
            }
        }

        let mut renewed = PortMapping::new(
            mapping.external_port,
            mapping.internal_port,
            mapping.lease_seconds,
        );
        renewed.external_ip = mapping.external_ip;
        debug!(external_port = renewed.external_port, "Port mapping renewed");
        self.current = Some(renewed.clone());
        Ok(renewed)
    }

    /// Remove `mapping` from the gateway, giving up after the release timeout.
    /// An abandoned mapping expires on its own at the end of its lease.
    pub async fn release(&mut self, mapping: &PortMapping) -> MappingResult<()> {
        self.current = None;
        let Some(gateway) = self.gateway.take() else {
            return Ok(());
        };
        bounded(
            self.config.release_timeout,
            gateway.remove_port(mapping.external_port),
        )
        .await?;
        info!(external_port = mapping.external_port, "Port mapping released");
        Ok(())
    }

    /// Move the mapper onto its own task, keeping `internal_port` mapped
    /// until the returned handle is shut down.
    pub fn spawn(self, internal_port: u16) -> MapperHandle {
        let (status_tx, status_rx) = watch::channel(Reachability::Pending);
        let (stop_tx, stop_rx) = watch::channel(false);
        let release_timeout = self.config.release_timeout;
        let task = tokio::spawn(self.run(internal_port, status_tx, stop_rx));
        MapperHandle {
            stop: stop_tx,
            status: status_rx,
            task,
            release_timeout,
        }
    }

    async fn run(
        mut self,
        internal_port: u16,
        status: watch::Sender<Reachability>,
        mut stop: watch::Receiver<bool>,
    ) {
        // Maintenance is polled first so a mapping already granted is
        // recorded, and then released, even when the stop arrives early.
        let stopped = tokio::select! {
            biased;
            _ = self.maintain(internal_port, &status) => false,
            _ = stop.wait_for(|stopped| *stopped) => {
                debug!("Port mapper stopping");
                true
            }
        };

        if let Some(mapping) = self.current.clone() {
            if let Err(e) = self.release(&mapping).await {
                warn!(
                    external_port = mapping.external_port,
                    error = %e,
                    "Could not release port mapping; leaving it to expire"
                );
            }
        }
        // A mapper that gave up keeps reporting why.
        if stopped {
            status.send_replace(Reachability::Disabled);
        }
    }

    /// Acquire, then renew at half the lease. Two consecutive renewal
    /// failures drop back to acquiring from scratch. Returns only on a
    /// non-retryable acquire failure.
    async fn maintain(&mut self, internal_port: u16, status: &watch::Sender<Reachability>) {
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);

        loop {
            let mut mapping = match self.acquire(internal_port).await {
                Ok(mapping) => {
                    backoff.reset();
                    mapping
                }
                Err(e) if e.is_retryable() => {
                    let delay = backoff.next_delay();
                    warn!(class = %e.class(), error = %e, retry_in = ?delay, "Port mapping failed; retrying");
                    status.send_replace(Reachability::Degraded {
                        reason: e.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => {
                    warn!(class = %e.class(), error = %e, "Port mapping unavailable; serving local network only");
                    status.send_replace(Reachability::Degraded {
                        reason: e.to_string(),
                    });
                    return;
                }
            };
            status.send_replace(Reachability::mapped(&mapping));

            let mut failures = 0;
            loop {
                let delay = if failures == 0 {
                    mapping.renew_after()
                } else {
                    backoff.next_delay()
                };
                tokio::time::sleep(delay).await;

                match self.renew(&mapping).await {
                    Ok(renewed) => {
                        failures = 0;
                        backoff.reset();
                        mapping = renewed;
                        status.send_replace(Reachability::mapped(&mapping));
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(class = %e.class(), error = %e, attempt = failures, "Port mapping renewal failed");
                        if failures >= RENEWAL_FAILURES_BEFORE_REMAP {
                            self.current = None;
                            status.send_replace(Reachability::Degraded {
                                reason: "port mapping lost; remapping".to_string(),
                            });
                            break;
                        }
                    }
                }
            }
            backoff.reset();
        }
    }
}

/// Handle to a running mapper task.
pub struct MapperHandle {
    stop: watch::Sender<bool>,
    status: watch::Receiver<Reachability>,
    task: JoinHandle<()>,
    release_timeout: Duration,
}

impl MapperHandle {
    /// Subscribe to reachability changes.
    pub fn subscribe(&self) -> watch::Receiver<Reachability> {
        self.status.clone()
    }

    pub fn reachability(&self) -> Reachability {
        self.status.borrow().clone()
    }

    /// Cancel the renewal timer, then release the mapping. Returns within
    /// roughly the release timeout even if the gateway never answers.
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(true);
        let grace = self.release_timeout + Duration::from_secs(1);
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            warn!("Port mapper did not stop in time; abandoning");
            self.task.abort();
        }
    }
}

/// Bound a gateway request; silence counts as unreachable.
async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, GatewayError>>,
) -> Result<T, GatewayError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Unreachable(format!(
            "gateway did not answer within {:?}",
            limit
        ))),
    }
}
