//! Test data builders for clusters running on the loopback network

use lockstep::config::{ClusterConfig, NodeConfig, ThreadModel};
use lockstep::execution::ExecutionRuntime;
use lockstep::net::{ClientBehavior, ConnectionDescription, LoopbackNetwork};
use lockstep::{ClusterCoordinator, NodeController};
use std::sync::Arc;

/// Builder for a cluster whose nodes answer on a [`LoopbackNetwork`]
pub struct ClusterBuilder {
    config: ClusterConfig,
    behaviors: Vec<(String, ClientBehavior)>,
}

impl ClusterBuilder {
    pub fn new(name: &str) -> Self {
        let mut config = ClusterConfig::new(name);
        config.timeouts.frame_ms = 2_000;
        Self {
            config,
            behaviors: Vec::new(),
        }
    }

    /// Add a node reachable over loopback under its own name
    pub fn node(self, name: &str) -> Self {
        self.node_with(name, ClientBehavior::default())
    }

    pub fn node_with(mut self, name: &str, behavior: ClientBehavior) -> Self {
        self.config
            .add_node(NodeConfig::new(name).with_connection(ConnectionDescription::loopback(name)));
        self.behaviors.push((name.to_string(), behavior));
        self
    }

    pub fn thread_model(mut self, thread_model: ThreadModel) -> Self {
        if let Some(node) = self.config.nodes.last_mut() {
            node.thread_model = thread_model;
        }
        self
    }

    /// Launch the last added node instead of connecting to it
    pub fn autolaunch(mut self) -> Self {
        if let Some(node) = self.config.nodes.last_mut() {
            node.autolaunch = true;
        }
        self
    }

    pub fn latency(mut self, latency: u32) -> Self {
        self.config.latency = latency;
        self
    }

    pub fn max_write_size(mut self, max_write_size: usize) -> Self {
        self.config.channel.max_write_size = max_write_size;
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The loopback network with every host registered
    pub fn network(&self) -> LoopbackNetwork {
        let network = LoopbackNetwork::new();
        for (host, behavior) in &self.behaviors {
            network.add_host(host.clone(), behavior.clone());
        }
        network
    }

    pub fn build(self) -> (ClusterCoordinator, LoopbackNetwork) {
        let network = self.network();
        let cluster = ClusterCoordinator::new(
            self.config,
            Arc::new(network.clone()),
            Arc::new(network.clone()),
            ExecutionRuntime::new(),
        )
        .unwrap();
        (cluster, network)
    }

    /// A standalone controller for the first node
    pub fn build_node(self, runtime: Arc<ExecutionRuntime>) -> (NodeController, LoopbackNetwork) {
        let network = self.network();
        let node = NodeController::from_config(
            &self.config.nodes[0],
            1,
            Arc::new(network.clone()),
            Arc::new(network.clone()),
            runtime,
            &self.config,
        );
        (node, network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_builder() {
        let builder = ClusterBuilder::new("wall")
            .node("left")
            .node("right")
            .thread_model(ThreadModel::LocalSync)
            .latency(2);

        let config = builder.config();
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.latency, 2);
        assert_eq!(config.nodes[1].thread_model, ThreadModel::LocalSync);
        assert!(config.validate().is_ok());
    }
}
