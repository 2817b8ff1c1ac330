//! Configuration module for lockstep
//!
//! A cluster is described by a [`ClusterConfig`] TOML document: the session,
//! the frame latency, timeouts for every blocking lifecycle step, command
//! channel limits, and one [`NodeConfig`] per render node.
//!
//! # Config Location
//!
//! The default document lives in the platform config directory:
//! - **Linux**: `~/.config/lockstep/cluster.toml`
//! - **macOS**: `~/Library/Application Support/lockstep/cluster.toml`
//! - **Windows**: `%APPDATA%\lockstep\cluster.toml`
//!
//! # Example
//!
//! ```toml
//! name = "wall"
//! latency = 1
//!
//! [[nodes]]
//! name = "render1"
//! thread_model = "draw_sync"
//! connections = [{ hostname = "render1", port = 4242 }]
//! ```

pub mod attributes;

pub use attributes::*;

use crate::error::{LockstepError, Result};
use crate::net::{ConnectionDescription, DEFAULT_MAX_WRITE_SIZE, HEADER_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name under the platform config directory
pub const APP_DIR: &str = "lockstep";

/// Cluster config filename
pub const CLUSTER_FILE: &str = "cluster.toml";

/// Default number of frames a node may run ahead of completion
pub const DEFAULT_LATENCY: u32 = 1;

/// Program started on remote hosts when none is configured
pub const DEFAULT_PROGRAM: &str = "lockstep";

/// Get the path of the default cluster config
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_DIR).join(CLUSTER_FILE))
}

// ==================== Timeouts ====================

/// Bounds for every blocking lifecycle step, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Wait for a launched node to connect back
    pub launch_ms: u64,
    /// Wait for the init acknowledgement
    pub init_ms: u64,
    /// Wait for the exit acknowledgement
    pub exit_ms: u64,
    /// Wait for a frame to be finished
    pub frame_ms: u64,
    /// Wait for a node's command loop to stop
    pub join_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            launch_ms: 10_000,
            init_ms: 10_000,
            exit_ms: 5_000,
            frame_ms: 10_000,
            join_ms: 2_000,
        }
    }
}

impl TimeoutConfig {
    pub fn launch(&self) -> Duration {
        Duration::from_millis(self.launch_ms)
    }

    pub fn init(&self) -> Duration {
        Duration::from_millis(self.init_ms)
    }

    pub fn exit(&self) -> Duration {
        Duration::from_millis(self.exit_ms)
    }

    pub fn frame(&self) -> Duration {
        Duration::from_millis(self.frame_ms)
    }

    pub fn join(&self) -> Duration {
        Duration::from_millis(self.join_ms)
    }
}

// ==================== Channel ====================

/// Limits of the per-node command path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Upper bound for one transport write in bytes
    pub max_write_size: usize,
    /// Capacity of the queue feeding a node's command loop
    pub loop_queue_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_write_size: DEFAULT_MAX_WRITE_SIZE,
            loop_queue_capacity: 1024,
        }
    }
}

// ==================== Nodes ====================

/// One render node of the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    /// Ways to reach the node, tried in order
    pub connections: Vec<ConnectionDescription>,
    /// Overrides the default launch command template
    pub launch_command: Option<String>,
    /// Overrides the default launch command quote
    pub launch_command_quote: Option<char>,
    pub thread_model: ThreadModel,
    /// Program started on the remote host
    pub program: String,
    /// Working directory of the remote program
    pub workdir: Option<String>,
    /// Launch the node process instead of connecting to a running one
    pub autolaunch: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            connections: Vec::new(),
            launch_command: None,
            launch_command_quote: None,
            thread_model: ThreadModel::default(),
            program: DEFAULT_PROGRAM.to_string(),
            workdir: None,
            autolaunch: false,
        }
    }
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_connection(mut self, description: ConnectionDescription) -> Self {
        self.connections.push(description);
        self
    }

    pub fn with_thread_model(mut self, thread_model: ThreadModel) -> Self {
        self.thread_model = thread_model;
        self
    }

    pub fn with_autolaunch(mut self, autolaunch: bool) -> Self {
        self.autolaunch = autolaunch;
        self
    }

    /// Attribute table derived from this config
    pub fn attributes(&self) -> NodeAttributes {
        let mut attrs = NodeAttributes::default();
        if let Some(command) = &self.launch_command {
            attrs.set_sattribute(SAttribute::LaunchCommand, command.clone());
        }
        if let Some(quote) = self.launch_command_quote {
            attrs.set_cattribute(CAttribute::LaunchCommandQuote, quote);
        }
        attrs.set_iattribute(IAttribute::ThreadModel, self.thread_model.as_i32());
        attrs
    }
}

// ==================== Cluster ====================

/// Complete cluster description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub name: String,
    /// Stamped on every packet sent in this configuration session
    pub session_id: u32,
    /// Frames a node may run ahead before the coordinator blocks
    pub latency: u32,
    pub timeouts: TimeoutConfig,
    pub channel: ChannelConfig,
    pub nodes: Vec<NodeConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "cluster".to_string(),
            session_id: 1,
            latency: DEFAULT_LATENCY,
            timeouts: TimeoutConfig::default(),
            channel: ChannelConfig::default(),
            nodes: Vec::new(),
        }
    }
}

impl ClusterConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Two loopback nodes, the second one launched instead of connected
    pub fn loopback_demo() -> Self {
        let mut config = Self::new("loopback-demo");
        config.nodes.push(
            NodeConfig::new("render1").with_connection(ConnectionDescription::loopback("render1")),
        );
        let mut launched = NodeConfig::new("render2")
            .with_connection(ConnectionDescription::loopback("render2"))
            .with_thread_model(ThreadModel::Async)
            .with_autolaunch(true);
        launched.launch_command = Some("loopback-spawn %h %c".to_string());
        launched.workdir = Some("/tmp".to_string());
        config.nodes.push(launched);
        config
    }

    pub fn add_node(&mut self, node: NodeConfig) {
        self.nodes.push(node);
    }

    pub fn find_node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ClusterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LockstepError::Config(format!("Failed to read cluster config {:?}: {}", path, e))
        })?;
        tracing::info!("Loading cluster config from {:?}", path);
        Self::from_toml_str(&content)
    }

    /// Save the config as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LockstepError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| LockstepError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            LockstepError::Config(format!("Failed to write cluster config {:?}: {}", path, e))
        })
    }

    /// Reject configs the node controllers cannot run
    pub fn validate(&self) -> Result<()> {
        if self.channel.max_write_size < HEADER_SIZE {
            return Err(LockstepError::Config(format!(
                "max_write_size {} is smaller than a packet header",
                self.channel.max_write_size
            )));
        }
        if self.channel.loop_queue_capacity == 0 {
            return Err(LockstepError::Config(
                "loop_queue_capacity must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                return Err(LockstepError::Config("node with empty name".to_string()));
            }
            if !seen.insert(node.name.as_str()) {
                return Err(LockstepError::Config(format!(
                    "duplicate node name {}",
                    node.name
                )));
            }
            if node.connections.is_empty() {
                return Err(LockstepError::Config(format!(
                    "node {} has no connection description",
                    node.name
                )));
            }
        }
        Ok(())
    }
}
