//! How far an error is allowed to spread.

use serde::Serialize;
use std::fmt;

use crate::nat::MappingError;
use crate::transfer::TransferError;

/// Failure classes, from whole-process down to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bind failure, invalid identity or share configuration. Nothing is
    /// served.
    StartupFatal,
    /// Port mapping unavailable or lost. Local-network clients are still
    /// served.
    ReachabilityDegraded,
    /// Confined to one transfer; answered with an HTTP status.
    PerConnectionFailure,
    /// Connection limit or descriptor exhaustion. New connections are turned
    /// away; existing ones are untouched.
    ResourceExhaustion,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::StartupFatal => "startup_fatal",
            ErrorClass::ReachabilityDegraded => "reachability_degraded",
            ErrorClass::PerConnectionFailure => "per_connection_failure",
            ErrorClass::ResourceExhaustion => "resource_exhaustion",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MappingError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::ReachabilityDegraded
    }
}

impl TransferError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::PerConnectionFailure
    }
}
