//! UPnP IGD backend built on `igd-next`.

use igd_next::aio::tokio::{search_gateway, Tokio};
use igd_next::{
    AddAnyPortError, AddPortError, GetExternalIpError, PortMappingProtocol, RemovePortError,
    SearchOptions,
};
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tracing::debug;

use super::{Gateway, GatewayError, GatewaySearch};

/// SSDP discovery of the router on the local network.
#[derive(Debug, Clone)]
pub struct UpnpSearch {
    timeout: Duration,
    description: String,
}

impl UpnpSearch {
    pub fn new(timeout: Duration, description: impl Into<String>) -> Self {
        Self {
            timeout,
            description: description.into(),
        }
    }
}

impl GatewaySearch for UpnpSearch {
    type Gateway = UpnpGateway;

    async fn search(&self) -> Result<UpnpGateway, GatewayError> {
        let options = SearchOptions {
            timeout: Some(self.timeout),
            ..Default::default()
        };
        let inner = search_gateway(options)
            .await
            .map_err(|e| GatewayError::Unreachable(format!("gateway search failed: {}", e)))?;
        debug!(gateway = %inner.addr, "Found UPnP gateway");
        Ok(UpnpGateway {
            inner,
            description: self.description.clone(),
        })
    }
}

/// A router answering UPnP IGD control requests.
pub struct UpnpGateway {
    inner: igd_next::aio::Gateway<Tokio>,
    description: String,
}

impl Gateway for UpnpGateway {
    fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    async fn external_ip(&self) -> Result<IpAddr, GatewayError> {
        self.inner.get_external_ip().await.map_err(|e| match e {
            GetExternalIpError::RequestError(e) => GatewayError::Unreachable(e.to_string()),
            other => GatewayError::Refused(other.to_string()),
        })
    }

    async fn add_port(
        &self,
        external_port: u16,
        local: SocketAddrV4,
        lease_seconds: u32,
    ) -> Result<(), GatewayError> {
        self.inner
            .add_port(
                PortMappingProtocol::TCP,
                external_port,
                SocketAddr::V4(local),
                lease_seconds,
                &self.description,
            )
            .await
            .map_err(|e| match e {
                AddPortError::PortInUse => GatewayError::PortInUse,
                AddPortError::OnlyPermanentLeasesSupported => GatewayError::PermanentLeaseOnly,
                AddPortError::RequestError(e) => GatewayError::Unreachable(e.to_string()),
                other => GatewayError::Refused(other.to_string()),
            })
    }

    async fn add_any_port(
        &self,
        local: SocketAddrV4,
        lease_seconds: u32,
    ) -> Result<u16, GatewayError> {
        self.inner
            .add_any_port(
                PortMappingProtocol::TCP,
                SocketAddr::V4(local),
                lease_seconds,
                &self.description,
            )
            .await
            .map_err(|e| match e {
                AddAnyPortError::NoPortsAvailable => GatewayError::NoPortsAvailable,
                AddAnyPortError::OnlyPermanentLeasesSupported => GatewayError::PermanentLeaseOnly,
                AddAnyPortError::RequestError(e) => GatewayError::Unreachable(e.to_string()),
                other => GatewayError::Refused(other.to_string()),
            })
    }

    async fn remove_port(&self, external_port: u16) -> Result<(), GatewayError> {
        self.inner
            .remove_port(PortMappingProtocol::TCP, external_port)
            .await
            .map_err(|e| match e {
                RemovePortError::RequestError(e) => GatewayError::Unreachable(e.to_string()),
                other => GatewayError::Refused(other.to_string()),
            })
    }
}
