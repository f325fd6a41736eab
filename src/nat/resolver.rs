use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

use super::{Gateway, MappingError, MappingResult};

/// Works out which addresses the daemon is known by.
///
/// The local address is the one the gateway must forward to; the external
/// address is whatever the router reports as its WAN side.
pub struct AddressResolver;

impl AddressResolver {
    /// IPv4 address to register with the gateway for a daemon bound to `bind`.
    ///
    /// A concrete IPv4 bind address is used as is. For a wildcard bind, the
    /// address of the interface that routes toward the gateway is used.
    pub async fn local_address(bind: IpAddr, gateway: SocketAddr) -> MappingResult<Ipv4Addr> {
        match bind {
            IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
            IpAddr::V4(_) => Self::route_toward(gateway).await,
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(v4) if !v4.is_unspecified() => Ok(v4),
                _ if ip.is_unspecified() => Self::route_toward(gateway).await,
                _ => Err(MappingError::ProtocolUnsupported(
                    "UPnP IGD only maps IPv4 addresses".to_string(),
                )),
            },
        }
    }

    /// Local IPv4 address the OS would use to reach `target`. Connecting a
    /// UDP socket only selects a route; nothing is sent.
    pub async fn route_toward(target: SocketAddr) -> MappingResult<Ipv4Addr> {
        let unreachable = |e: std::io::Error| {
            MappingError::GatewayUnreachable(format!("no route to {}: {}", target, e))
        };
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(unreachable)?;
        socket.connect(target).await.map_err(unreachable)?;
        match socket.local_addr().map_err(unreachable)?.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => {
                debug!(local = %ip, gateway = %target, "Resolved local address toward gateway");
                Ok(ip)
            }
            other => Err(MappingError::GatewayUnreachable(format!(
                "unusable local address {} toward {}",
                other, target
            ))),
        }
    }

    /// External address reported by the gateway, bounded by `timeout`.
    pub async fn external_address<G: Gateway>(
        gateway: &G,
        timeout: Duration,
    ) -> MappingResult<IpAddr> {
        match tokio::time::timeout(timeout, gateway.external_ip()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(MappingError::GatewayUnreachable(
                "gateway did not report its external address in time".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::mock::SimulatedGateway;
    use std::net::Ipv6Addr;

    #[tokio::test]
    async fn test_concrete_bind_is_used_directly() {
        let ip = AddressResolver::local_address(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            "127.0.0.1:1900".parse().unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 168, 1, 20));
    }

    #[tokio::test]
    async fn test_wildcard_bind_routes_toward_gateway() {
        let ip = AddressResolver::local_address(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            "127.0.0.1:1900".parse().unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(ip, Ipv4Addr::LOCALHOST);
    }

    #[tokio::test]
    async fn test_ipv6_bind_is_unsupported() {
        let err = AddressResolver::local_address(
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            "127.0.0.1:1900".parse().unwrap(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MappingError::ProtocolUnsupported(_)));
    }

    #[tokio::test]
    async fn test_external_address_from_gateway() {
        let gateway = SimulatedGateway::new();
        let ip = AddressResolver::external_address(&gateway, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ip, SimulatedGateway::EXTERNAL_IP);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_address_times_out() {
        let gateway = SimulatedGateway::new();
        gateway.set_silent(true);
        let err = AddressResolver::external_address(&gateway, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MappingError::GatewayUnreachable(_)));
    }
}
