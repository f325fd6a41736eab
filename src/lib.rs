//! mentor: a peer-hosted file-sharing daemon.
//!
//! Serves configured files and directories over HTTP and HTTPS, keeps an
//! external port mapped on the home router through UPnP, and streams every
//! connection on its own task.

pub mod config;
pub mod daemon;
pub mod error;
pub mod http;
pub mod identity;
pub mod listener;
pub mod logging;
pub mod nat;
pub mod share;
pub mod transfer;
