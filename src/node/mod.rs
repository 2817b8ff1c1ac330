//! Node controllers
//!
//! A [`NodeController`] drives one remote render node through its lifecycle
//! (connect or launch, init, per-frame updates, exit) and tracks which of its
//! frames are still in flight. The coordinator consumes it through the small
//! capability traits defined here, bundled as [`ClusterNode`].
//!
//! # Lifecycle
//!
//! ```text
//! Stopped ─connect─────────────────▶ Connected ─config_init─▶ Initializing
//!    │                                   ▲                        │
//!    └─launch─▶ Launching ─sync_launch───┘        sync_config_init│
//!                                                                 ▼
//! Stopped ◀─sync_config_exit─ Stopping ◀─config_exit────────── Running
//! ```
//!
//! A transport failure observed by the command loop moves the node straight
//! to `Stopped` from any state.

mod barrier_cache;
mod command_loop;
mod controller;
pub mod launch;
mod state;

pub use barrier_cache::{BarrierCache, BarrierHandle};
pub use controller::NodeController;
pub use state::{FrameAck, NodeState, NodeSync};

use crate::config::{CAttribute, IAttribute, SAttribute, ThreadModel};
use crate::error::Result;
use serde::Serialize;
use std::time::Instant;

/// Identifier of a node within a cluster
pub type NodeId = u32;

/// Identifier of a render pipe; nodes never dereference it
pub type PipeId = u32;

/// Connection, launch, init and exit
pub trait NodeLifecycle {
    fn name(&self) -> &str;

    fn state(&self) -> NodeState;

    /// Connect to an already running node
    fn connect(&mut self) -> Result<()>;

    /// Start the remote process; no-op when launched or connected
    fn launch(&mut self) -> Result<()>;

    /// Wait until the launched process connected back
    fn sync_launch(&mut self, deadline: Instant) -> Result<()>;

    fn config_init(&mut self, init_id: u32, frame_number: u32) -> Result<()>;

    /// Wait for the init acknowledgement
    fn sync_config_init(&mut self) -> Result<()>;

    fn config_exit(&mut self) -> Result<()>;

    /// Wait for the exit acknowledgement and release every node resource
    fn sync_config_exit(&mut self) -> Result<()>;
}

/// Activation and per-frame synchronization
pub trait FrameSync {
    fn activate(&mut self);

    fn deactivate(&mut self) -> Result<()>;

    fn is_active(&self) -> bool;

    /// Send the packets of frame `frame_number`
    fn update(&mut self, frame_id: u32, frame_number: u32) -> Result<()>;

    /// Request completion of every in-flight frame up to `frame_number`
    fn flush_frames(&mut self, frame_number: u32) -> Result<()>;

    /// Block until the node reported completion of `frame`
    fn finish_frame(&mut self, frame: u32) -> Result<()>;

    fn finished_frame(&self) -> u32;

    fn flushed_frame(&self) -> u32;

    fn change_latency(&mut self, latency: u32) -> Result<()>;

    fn get_barrier(&mut self) -> BarrierHandle;

    fn release_barrier(&mut self, barrier: BarrierHandle) -> Result<()>;
}

/// Typed node attributes
pub trait NodeAttributeAccess {
    fn sattribute(&self, attr: SAttribute) -> &str;
    fn set_sattribute(&mut self, attr: SAttribute, value: String);
    fn cattribute(&self, attr: CAttribute) -> char;
    fn set_cattribute(&mut self, attr: CAttribute, value: char);
    fn iattribute(&self, attr: IAttribute) -> i32;
    fn set_iattribute(&mut self, attr: IAttribute, value: i32);
}

/// Everything the coordinator needs from a node
pub trait ClusterNode: NodeLifecycle + FrameSync + NodeAttributeAccess + Send {
    /// Whether `start_nodes` should launch rather than connect
    fn autolaunch(&self) -> bool;

    fn snapshot(&self) -> NodeSnapshot;
}

/// Point-in-time view of a node, for logs and status output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub id: NodeId,
    pub state: NodeState,
    pub activation: u32,
    pub thread_model: ThreadModel,
    pub latency: u32,
    pub last_frame: u32,
    pub finished_frame: u32,
    pub flushed_frame: u32,
    pub frames_in_flight: usize,
    pub barriers_allocated: usize,
    pub barriers_idle: usize,
}
