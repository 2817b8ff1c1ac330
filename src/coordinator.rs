//! Minimal cluster coordinator
//!
//! Builds one [`NodeController`] per configured node and drives all of them
//! through start, init, frames and exit. Nothing is retried: the first
//! failing node aborts the step and the error names it.

use crate::config::ClusterConfig;
use crate::error::{LockstepError, Result, ResultExt};
use crate::execution::ExecutionRuntime;
use crate::net::{Launcher, Transport};
use crate::node::{BarrierHandle, ClusterNode, NodeController, NodeSnapshot, NodeState};
use std::sync::Arc;
use std::time::Instant;

/// Drives every node of a cluster in lock-step
pub struct ClusterCoordinator {
    config: ClusterConfig,
    runtime: Arc<ExecutionRuntime>,
    nodes: Vec<Box<dyn ClusterNode>>,
    frame_number: u32,
}

impl std::fmt::Debug for ClusterCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCoordinator")
            .field("name", &self.config.name)
            .field("nodes", &self.nodes.len())
            .field("frame_number", &self.frame_number)
            .finish()
    }
}

impl ClusterCoordinator {
    /// Validate `config` and create a stopped node for each entry
    pub fn new(
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        launcher: Arc<dyn Launcher>,
        runtime: Arc<ExecutionRuntime>,
    ) -> Result<Self> {
        config.validate()?;

        let nodes = config
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| {
                Box::new(NodeController::from_config(
                    node,
                    index as u32 + 1,
                    transport.clone(),
                    launcher.clone(),
                    runtime.clone(),
                    &config,
                )) as Box<dyn ClusterNode>
            })
            .collect();

        tracing::info!(
            "Cluster {} with {} nodes (latency {})",
            config.name,
            config.nodes.len(),
            config.latency
        );
        Ok(Self {
            config,
            runtime,
            nodes,
            frame_number: 0,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<ExecutionRuntime> {
        &self.runtime
    }

    /// Number of the most recently started frame
    pub fn frame_number(&self) -> u32 {
        self.frame_number
    }

    pub fn nodes(&self) -> impl Iterator<Item = &dyn ClusterNode> {
        self.nodes.iter().map(|n| &**n)
    }

    pub fn node(&self, name: &str) -> Option<&dyn ClusterNode> {
        self.nodes().find(|n| n.name() == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Box<dyn ClusterNode>> {
        self.nodes.iter_mut().find(|n| n.name() == name)
    }

    /// Connect every node, launching the `autolaunch` ones first
    pub fn start_nodes(&mut self) -> Result<()> {
        for node in self.nodes.iter_mut().filter(|n| n.autolaunch()) {
            let name = node.name().to_string();
            node.launch().with_context(|| format!("launching {}", name))?;
        }

        let deadline = Instant::now() + self.config.timeouts.launch();
        for node in &mut self.nodes {
            let name = node.name().to_string();
            if node.state() == NodeState::Launching {
                node.sync_launch(deadline)
                    .with_context(|| format!("waiting for {}", name))?;
            } else {
                node.connect()
                    .with_context(|| format!("connecting {}", name))?;
            }
        }
        Ok(())
    }

    /// Initialize every node and activate it
    ///
    /// On failure every node is exited again before the error is returned.
    pub fn init(&mut self, init_id: u32) -> Result<()> {
        let result = self.try_init(init_id);
        if let Err(e) = &result {
            tracing::error!("Cluster init failed: {}", e);
            if let Err(exit_error) = self.exit() {
                tracing::warn!("Exit after failed init: {}", exit_error);
            }
        }
        result
    }

    fn try_init(&mut self, init_id: u32) -> Result<()> {
        let frame_number = self.frame_number;
        for node in &mut self.nodes {
            let name = node.name().to_string();
            node.config_init(init_id, frame_number)
                .with_context(|| format!("initializing {}", name))?;
        }
        for node in &mut self.nodes {
            let name = node.name().to_string();
            node.sync_config_init()
                .with_context(|| format!("initializing {}", name))?;
            node.activate();
        }
        tracing::info!("Cluster {} initialized", self.config.name);
        Ok(())
    }

    /// Start the next frame on every active node and return its number
    pub fn start_frame(&mut self, frame_id: u32) -> Result<u32> {
        self.frame_number += 1;
        let frame_number = self.frame_number;

        for node in self.nodes.iter_mut().filter(|n| n.is_active()) {
            let name = node.name().to_string();
            node.update(frame_id, frame_number)
                .with_context(|| format!("frame {} on {}", frame_number, name))?;
        }
        tracing::debug!("Frame {} started (id {})", frame_number, frame_id);
        Ok(frame_number)
    }

    /// Block until every active node finished `frame_number`
    pub fn finish_frame(&mut self, frame_number: u32) -> Result<()> {
        for node in self.nodes.iter_mut().filter(|n| n.is_active()) {
            let name = node.name().to_string();
            node.finish_frame(frame_number)
                .with_context(|| format!("finishing frame {} on {}", frame_number, name))?;
        }
        Ok(())
    }

    /// Check out a barrier of the first node for `participants`
    pub fn frame_barrier(&mut self, participants: u32) -> Result<BarrierHandle> {
        let master = self
            .nodes
            .first_mut()
            .ok_or_else(|| LockstepError::Config("cluster has no nodes".to_string()))?;
        let barrier = master.get_barrier();
        if let Err(e) = barrier.set_height(participants) {
            master.release_barrier(barrier)?;
            return Err(e);
        }
        Ok(barrier)
    }

    pub fn release_frame_barrier(&mut self, barrier: BarrierHandle) -> Result<()> {
        match self.nodes.first_mut() {
            Some(master) => master.release_barrier(barrier),
            None => Err(LockstepError::Config("cluster has no nodes".to_string())),
        }
    }

    /// Change the number of frames in flight on every node
    pub fn change_latency(&mut self, latency: u32) -> Result<()> {
        for node in &mut self.nodes {
            let name = node.name().to_string();
            node.change_latency(latency)
                .with_context(|| format!("changing latency of {}", name))?;
        }
        self.config.latency = latency;
        Ok(())
    }

    /// Deactivate and exit every node
    ///
    /// All nodes are taken down even when some fail; the first error is returned.
    pub fn exit(&mut self) -> Result<()> {
        let mut first_error = None;

        for node in &mut self.nodes {
            while node.is_active() {
                node.deactivate()?;
            }
            if let Err(e) = node.config_exit() {
                tracing::warn!("Exit of {} failed: {}", node.name(), e);
                first_error.get_or_insert(e);
            }
        }
        for node in &mut self.nodes {
            if let Err(e) = node.sync_config_exit() {
                tracing::warn!("Exit of {} failed: {}", node.name(), e);
                first_error.get_or_insert(e);
            }
        }

        tracing::info!("Cluster {} exited", self.config.name);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        self.nodes.iter().map(|n| n.snapshot()).collect()
    }
}
