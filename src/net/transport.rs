//! Interfaces to the network transport and the process launcher
//!
//! The coordinator core never opens sockets or spawns processes itself. It
//! consumes these traits, which production deployments implement on top of
//! their transport, and which the [`loopback`](super::loopback) module
//! implements in-process for tests and demos.

use crate::error::Result;
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Transport family of a connection description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    #[default]
    Tcp,
    /// In-process loopback, used for tests and local demos
    Loopback,
}

/// How a node can be reached
///
/// Opaque to the node controller beyond being handed to the transport and
/// used for launch command expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionDescription {
    pub kind: ConnectionKind,
    pub hostname: String,
    pub port: u16,
}

impl Default for ConnectionDescription {
    fn default() -> Self {
        Self {
            kind: ConnectionKind::Tcp,
            hostname: "localhost".to_string(),
            port: 4242,
        }
    }
}

impl ConnectionDescription {
    /// TCP description for `hostname:port`
    pub fn tcp(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            kind: ConnectionKind::Tcp,
            hostname: hostname.into(),
            port,
        }
    }

    /// In-process description for a loopback host
    pub fn loopback(hostname: impl Into<String>) -> Self {
        Self {
            kind: ConnectionKind::Loopback,
            hostname: hostname.into(),
            port: 0,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl std::fmt::Display for ConnectionDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ConnectionKind::Tcp => write!(f, "tcp://{}", self.address()),
            ConnectionKind::Loopback => write!(f, "loopback://{}", self.hostname),
        }
    }
}

/// An established connection to one remote node
///
/// Inbound messages are delivered asynchronously through the receiver
/// returned by `inbound`; a disconnected receiver means the link was lost.
#[cfg_attr(test, mockall::automock)]
pub trait Connection: Send + Sync {
    /// Write `bytes` to the remote node as one transport write
    fn send(&self, bytes: &[u8]) -> Result<()>;

    /// Receiver of inbound byte messages
    fn inbound(&self) -> Receiver<Vec<u8>>;

    /// Whether the link is still up
    fn is_connected(&self) -> bool;

    /// Close the link; further sends fail
    fn close(&self);

    /// Human-readable peer address
    fn peer(&self) -> String;
}

/// Establishes connections to nodes
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Connect to an already running node
    fn connect(&self, description: &ConnectionDescription) -> Result<Arc<dyn Connection>>;

    /// Wait for a launched node named `node` to connect back
    fn accept(&self, node: &str, timeout: Duration) -> Result<Arc<dyn Connection>>;
}

/// Starts remote node processes from an expanded launch command
#[cfg_attr(test, mockall::automock)]
pub trait Launcher: Send + Sync {
    fn launch(&self, command: &str) -> Result<()>;
}
