//! # lockstep: cluster frame synchronization
//!
//! Keeps a set of remote render nodes in lock-step with an application
//! thread. The application starts a frame, every node receives the frame's
//! packets in one batched write, and the application blocks only once a node
//! has fallen more than `latency` frames behind.
//!
//! ## Architecture
//!
//! - **Execution**: Named threads whose start and stop are reported to listeners
//! - **Sync**: A [`Monitor`](sync::Monitor) and a reusable height-configurable [`Barrier`]
//! - **Net**: Fixed-header packets, a batching [`CommandChannel`] and the transport seams
//! - **Node**: The per-node [`NodeController`] and its background command loop
//! - **Coordinator**: Drives every node of a cluster through start, init, frames and exit
//!
//! ## Configuration
//!
//! A cluster is described by a TOML document, see [`config`]. Without one the
//! binary falls back to [`ClusterConfig::loopback_demo`].
//!
//! ## Example
//!
//! ```ignore
//! use lockstep::{ClusterConfig, ClusterCoordinator, ExecutionRuntime};
//! use lockstep::net::{ClientBehavior, LoopbackNetwork};
//! use std::sync::Arc;
//!
//! let network = LoopbackNetwork::new();
//! network.add_host("render1", ClientBehavior::default());
//! network.add_host("render2", ClientBehavior::default());
//!
//! let mut cluster = ClusterCoordinator::new(
//!     ClusterConfig::loopback_demo(),
//!     Arc::new(network.clone()),
//!     Arc::new(network),
//!     ExecutionRuntime::new(),
//! )?;
//! cluster.start_nodes()?;
//! cluster.init(1)?;
//! let frame = cluster.start_frame(1)?;
//! cluster.finish_frame(frame)?;
//! cluster.exit()?;
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod execution;
pub mod net;
pub mod node;
pub mod sync;

// Re-export commonly used types
pub use config::{ClusterConfig, NodeConfig, TaskFlags, ThreadModel};
pub use coordinator::ClusterCoordinator;
pub use error::{LockstepError, Result, ResultExt};
pub use execution::{ExecutionListener, ExecutionRuntime, ExecutionUnit};
pub use net::{CommandChannel, Connection, ConnectionDescription, Packet, PacketKind, Transport};
pub use node::{ClusterNode, FrameSync, NodeController, NodeLifecycle, NodeState};
pub use sync::Barrier;
