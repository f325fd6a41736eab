//! Simulated gateway for testing.
//!
//! Implements both [`GatewaySearch`] and [`Gateway`] in memory, so the port
//! mapper can be driven without a router. Failures are scripted per call and
//! every request is counted.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::{Gateway, GatewayError, GatewaySearch};

/// First port handed out by `add_any_port`.
const FIRST_FREE_PORT: u16 = 40000;

#[derive(Debug, Default)]
struct State {
    /// external port -> (internal client, lease)
    mappings: HashMap<u16, (SocketAddrV4, u32)>,
    /// Ports held by some other client on the LAN.
    taken: Vec<u16>,
    /// Errors returned by the next `add_port` calls, in order.
    add_failures: Vec<GatewayError>,
    next_free: u16,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    searches: AtomicU32,
    add_calls: AtomicU32,
    remove_calls: AtomicU32,
    reachable: AtomicBool,
    /// Accept requests but never answer them.
    silent: AtomicBool,
    permanent_only: AtomicBool,
    exhausted: AtomicBool,
}

/// In-memory Internet Gateway Device.
///
/// Clones share the same state, so a test keeps one handle for scripting and
/// inspection while the mapper owns another.
///
/// ```ignore
/// let gateway = SimulatedGateway::new();
/// gateway.fail_next_adds(2);
/// let handle = PortMapper::new(gateway.clone(), bind, config).spawn(8080);
/// ```
#[derive(Debug, Clone)]
pub struct SimulatedGateway {
    inner: Arc<Inner>,
}

impl SimulatedGateway {
    pub const ADDR: SocketAddr =
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1900));
    pub const EXTERNAL_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

    pub fn new() -> Self {
        let gateway = Self {
            inner: Arc::new(Inner::default()),
        };
        gateway.inner.reachable.store(true, Ordering::SeqCst);
        gateway.state().next_free = FIRST_FREE_PORT;
        gateway
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make discovery fail, as if no router answered.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Swallow every request without answering.
    pub fn set_silent(&self, silent: bool) {
        self.inner.silent.store(silent, Ordering::SeqCst);
    }

    pub fn set_permanent_only(&self, permanent_only: bool) {
        self.inner.permanent_only.store(permanent_only, Ordering::SeqCst);
    }

    /// Make `add_any_port` report that no ports are left.
    pub fn set_exhausted(&self, exhausted: bool) {
        self.inner.exhausted.store(exhausted, Ordering::SeqCst);
    }

    /// Mark `port` as mapped by another client.
    pub fn take_port(&self, port: u16) {
        self.state().taken.push(port);
    }

    /// Fail the next `n` `add_port` calls as unreachable.
    pub fn fail_next_adds(&self, n: usize) {
        let mut state = self.state();
        for _ in 0..n {
            state
                .add_failures
                .push(GatewayError::Unreachable("simulated timeout".to_string()));
        }
    }

    /// Forget every mapping, as a router reboot would.
    pub fn reboot(&self) {
        self.state().mappings.clear();
    }

    pub fn searches(&self) -> u32 {
        self.inner.searches.load(Ordering::SeqCst)
    }

    /// Number of `add_port` and `add_any_port` requests received, including
    /// renewals.
    pub fn add_calls(&self) -> u32 {
        self.inner.add_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> u32 {
        self.inner.remove_calls.load(Ordering::SeqCst)
    }

    /// Current lease of the mapping on `external_port`, if any.
    pub fn mapping(&self, external_port: u16) -> Option<(SocketAddrV4, u32)> {
        self.state().mappings.get(&external_port).copied()
    }

    pub fn mapping_count(&self) -> usize {
        self.state().mappings.len()
    }

    async fn answer(&self) {
        if self.inner.silent.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewaySearch for SimulatedGateway {
    type Gateway = SimulatedGateway;

    async fn search(&self) -> Result<SimulatedGateway, GatewayError> {
        self.inner.searches.fetch_add(1, Ordering::SeqCst);
        self.answer().await;
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(GatewayError::Unreachable(
                "no gateway answered the search".to_string(),
            ));
        }
        Ok(self.clone())
    }
}

impl Gateway for SimulatedGateway {
    fn addr(&self) -> SocketAddr {
        Self::ADDR
    }

    async fn external_ip(&self) -> Result<IpAddr, GatewayError> {
        self.answer().await;
        Ok(Self::EXTERNAL_IP)
    }

    async fn add_port(
        &self,
        external_port: u16,
        local: SocketAddrV4,
        lease_seconds: u32,
    ) -> Result<(), GatewayError> {
        self.inner.add_calls.fetch_add(1, Ordering::SeqCst);
        self.answer().await;

        let mut state = self.state();
        if !state.add_failures.is_empty() {
            return Err(state.add_failures.remove(0));
        }
        if lease_seconds > 0 && self.inner.permanent_only.load(Ordering::SeqCst) {
            return Err(GatewayError::PermanentLeaseOnly);
        }
        if state.taken.contains(&external_port) {
            return Err(GatewayError::PortInUse);
        }
        if let Some((client, _)) = state.mappings.get(&external_port) {
            if *client != local {
                return Err(GatewayError::PortInUse);
            }
        }
        state.mappings.insert(external_port, (local, lease_seconds));
        Ok(())
    }

    async fn add_any_port(
        &self,
        local: SocketAddrV4,
        lease_seconds: u32,
    ) -> Result<u16, GatewayError> {
        self.inner.add_calls.fetch_add(1, Ordering::SeqCst);
        self.answer().await;

        if self.inner.exhausted.load(Ordering::SeqCst) {
            return Err(GatewayError::NoPortsAvailable);
        }
        let mut state = self.state();
        let mut port = state.next_free;
        while state.taken.contains(&port) || state.mappings.contains_key(&port) {
            port = port.checked_add(1).ok_or(GatewayError::NoPortsAvailable)?;
        }
        state.next_free = port.saturating_add(1);
        state.mappings.insert(port, (local, lease_seconds));
        Ok(port)
    }

    async fn remove_port(&self, external_port: u16) -> Result<(), GatewayError> {
        self.inner.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.answer().await;

        match self.state().mappings.remove(&external_port) {
            Some(_) => Ok(()),
            None => Err(GatewayError::Refused("no such port mapping".to_string())),
        }
    }
}
