//! NAT traversal: keeping an external port on the home router mapped to the
//! local listening port.
//!
//! The gateway is reached through the [`GatewaySearch`] and [`Gateway`]
//! traits. [`UpnpSearch`] talks UPnP IGD to a real router; the simulated
//! gateway in [`mock`] stands in for one in tests. [`PortMapper`] drives the
//! acquire / renew / release lifecycle on top of either.

use serde::Serialize;
use std::future::Future;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

mod mapper;
pub mod mock;
mod resolver;
mod upnp;

pub use mapper::{MapperConfig, MapperHandle, PortMapper};
pub use resolver::AddressResolver;
pub use upnp::{UpnpGateway, UpnpSearch};

/// Re-check interval for mappings granted without an expiry.
const PERMANENT_LEASE_RECHECK: Duration = Duration::from_secs(30 * 60);

/// Errors surfaced by the mapping lifecycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("gateway unreachable: {0}")]
    GatewayUnreachable(String),

    #[error("no port mapping available: {0}")]
    NoMappingAvailable(String),

    #[error("port mapping not supported: {0}")]
    ProtocolUnsupported(String),

    #[error("port mapping lease expired or was taken over")]
    LeaseExpired,
}

impl MappingError {
    /// Whether trying again later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MappingError::GatewayUnreachable(_) | MappingError::LeaseExpired
        )
    }
}

/// Result type for mapping operations
pub type MappingResult<T> = Result<T, MappingError>;

/// Raw answer of a gateway to a single request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{0}")]
    Unreachable(String),

    #[error("external port already mapped to another client")]
    PortInUse,

    #[error("gateway only accepts permanent leases")]
    PermanentLeaseOnly,

    #[error("gateway has no free external ports")]
    NoPortsAvailable,

    #[error("gateway refused the request: {0}")]
    Refused(String),
}

impl From<GatewayError> for MappingError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unreachable(msg) => MappingError::GatewayUnreachable(msg),
            GatewayError::PortInUse | GatewayError::NoPortsAvailable => {
                MappingError::NoMappingAvailable(err.to_string())
            }
            GatewayError::PermanentLeaseOnly | GatewayError::Refused(_) => {
                MappingError::ProtocolUnsupported(err.to_string())
            }
        }
    }
}

/// Transport protocol of a mapping. Only TCP is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
}

/// One external -> internal port mapping held on the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub external_port: u16,
    pub internal_port: u16,
    pub protocol: Protocol,
    /// Granted lease; zero means the gateway only offered a permanent one.
    pub lease_seconds: u32,
    pub expires_at: Option<Instant>,
    pub external_ip: Option<IpAddr>,
}

impl PortMapping {
    pub fn new(external_port: u16, internal_port: u16, lease_seconds: u32) -> Self {
        let expires_at = (lease_seconds > 0)
            .then(|| Instant::now() + Duration::from_secs(u64::from(lease_seconds)));
        Self {
            external_port,
            internal_port,
            protocol: Protocol::Tcp,
            lease_seconds,
            expires_at,
            external_ip: None,
        }
    }

    /// How long to wait before renewing: half the lease.
    pub fn renew_after(&self) -> Duration {
        if self.lease_seconds == 0 {
            return PERMANENT_LEASE_RECHECK;
        }
        Duration::from_millis(u64::from(self.lease_seconds) * 500).max(Duration::from_secs(1))
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

/// Reachability from outside the local network, as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Reachability {
    /// Port mapping is turned off, or the mapper has shut down.
    Disabled,
    /// First acquire still in progress.
    Pending,
    Mapped {
        external_ip: Option<IpAddr>,
        external_port: u16,
        lease_seconds: u32,
    },
    /// Only local-network clients can reach the daemon.
    Degraded { reason: String },
}

impl Reachability {
    pub fn mapped(mapping: &PortMapping) -> Self {
        Reachability::Mapped {
            external_ip: mapping.external_ip,
            external_port: mapping.external_port,
            lease_seconds: mapping.lease_seconds,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Reachability::Degraded { .. })
    }
}

/// A discovered Internet Gateway Device.
pub trait Gateway: Send + Sync + 'static {
    /// Control address of the gateway, used to pick the local interface.
    fn addr(&self) -> SocketAddr;

    fn external_ip(&self) -> impl Future<Output = Result<IpAddr, GatewayError>> + Send;

    /// Map `external_port` to `local` for `lease_seconds` (0 = permanent).
    /// Re-adding an existing mapping for the same client refreshes it.
    fn add_port(
        &self,
        external_port: u16,
        local: SocketAddrV4,
        lease_seconds: u32,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Map any free external port to `local`, returning the port granted.
    fn add_any_port(
        &self,
        local: SocketAddrV4,
        lease_seconds: u32,
    ) -> impl Future<Output = Result<u16, GatewayError>> + Send;

    fn remove_port(&self, external_port: u16)
        -> impl Future<Output = Result<(), GatewayError>> + Send;
}

/// Discovery of the gateway on the local network.
pub trait GatewaySearch: Send + Sync + 'static {
    type Gateway: Gateway;

    fn search(&self) -> impl Future<Output = Result<Self::Gateway, GatewayError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(MappingError::GatewayUnreachable("x".into()).is_retryable());
        assert!(MappingError::LeaseExpired.is_retryable());
        assert!(!MappingError::NoMappingAvailable("x".into()).is_retryable());
        assert!(!MappingError::ProtocolUnsupported("x".into()).is_retryable());
    }

    #[test]
    fn test_gateway_error_classification() {
        assert!(matches!(
            MappingError::from(GatewayError::Unreachable("t".into())),
            MappingError::GatewayUnreachable(_)
        ));
        assert!(matches!(
            MappingError::from(GatewayError::NoPortsAvailable),
            MappingError::NoMappingAvailable(_)
        ));
        assert!(matches!(
            MappingError::from(GatewayError::Refused("401".into())),
            MappingError::ProtocolUnsupported(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_after_is_half_the_lease() {
        assert_eq!(
            PortMapping::new(8080, 8080, 3600).renew_after(),
            Duration::from_secs(1800)
        );
        assert_eq!(
            PortMapping::new(8080, 8080, 1).renew_after(),
            Duration::from_secs(1)
        );
        assert_eq!(
            PortMapping::new(8080, 8080, 0).renew_after(),
            PERMANENT_LEASE_RECHECK
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mapping_expiry() {
        let mapping = PortMapping::new(8080, 8080, 10);
        assert!(!mapping.is_expired());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(mapping.is_expired());
        assert!(!PortMapping::new(8080, 8080, 0).is_expired());
    }

    #[test]
    fn test_reachability_json() {
        let json = serde_json::to_value(Reachability::Degraded {
            reason: "gateway unreachable".into(),
        })
        .unwrap();
        assert_eq!(json["state"], "degraded");
        assert!(Reachability::Degraded { reason: String::new() }.is_degraded());
        assert!(!Reachability::Pending.is_degraded());
    }
}
