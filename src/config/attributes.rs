//! Per-node attribute table
//!
//! Nodes carry three small typed attribute sets (string, character and
//! integer attributes) that tune how they are launched and synchronized.
//! Every key has a fixed textual name used in logs and config documents.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Default command used to start a node on a remote host
pub const DEFAULT_LAUNCH_COMMAND: &str = "ssh -n %h %c";

/// Default quote character wrapped around the remote command
pub const DEFAULT_LAUNCH_COMMAND_QUOTE: char = '\'';

/// String attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SAttribute {
    /// Launch command template (`%h` host, `%c` remote command, `%n` node, `%d` workdir)
    LaunchCommand,
}

impl SAttribute {
    pub const ALL: [SAttribute; 1] = [SAttribute::LaunchCommand];

    pub fn name(self) -> &'static str {
        match self {
            SAttribute::LaunchCommand => "launch_command",
        }
    }
}

/// Character attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CAttribute {
    /// Quote wrapped around `%c` in the launch command
    LaunchCommandQuote,
}

impl CAttribute {
    pub const ALL: [CAttribute; 1] = [CAttribute::LaunchCommandQuote];

    pub fn name(self) -> &'static str {
        match self {
            CAttribute::LaunchCommandQuote => "launch_command_quote",
        }
    }
}

/// Integer attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IAttribute {
    /// [`ThreadModel`] as an integer
    ThreadModel,
}

impl IAttribute {
    pub const ALL: [IAttribute; 1] = [IAttribute::ThreadModel];

    pub fn name(self) -> &'static str {
        match self {
            IAttribute::ThreadModel => "thread_model",
        }
    }
}

/// How closely a node's rendering follows the frame loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadModel {
    /// Frames are finished with the configured latency
    Async,
    /// Draw tasks finish within one frame
    #[default]
    DrawSync,
    /// All local tasks finish before the next frame
    LocalSync,
}

impl ThreadModel {
    pub fn as_i32(self) -> i32 {
        match self {
            ThreadModel::Async => 0,
            ThreadModel::DrawSync => 1,
            ThreadModel::LocalSync => 2,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(ThreadModel::Async),
            1 => Some(ThreadModel::DrawSync),
            2 => Some(ThreadModel::LocalSync),
            _ => None,
        }
    }
}

impl std::fmt::Display for ThreadModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadModel::Async => write!(f, "async"),
            ThreadModel::DrawSync => write!(f, "draw_sync"),
            ThreadModel::LocalSync => write!(f, "local_sync"),
        }
    }
}

bitflags! {
    /// Tasks a node may execute during a frame
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct TaskFlags: u32 {
        const CLEAR    = 1 << 0;
        const DRAW     = 1 << 1;
        const READBACK = 1 << 2;
        const ASSEMBLE = 1 << 3;
    }
}

/// Attribute values of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttributes {
    launch_command: String,
    launch_command_quote: char,
    thread_model: i32,
}

impl Default for NodeAttributes {
    fn default() -> Self {
        Self {
            launch_command: DEFAULT_LAUNCH_COMMAND.to_string(),
            launch_command_quote: DEFAULT_LAUNCH_COMMAND_QUOTE,
            thread_model: ThreadModel::default().as_i32(),
        }
    }
}

impl NodeAttributes {
    pub fn sattribute(&self, attr: SAttribute) -> &str {
        match attr {
            SAttribute::LaunchCommand => &self.launch_command,
        }
    }

    pub fn set_sattribute(&mut self, attr: SAttribute, value: impl Into<String>) {
        match attr {
            SAttribute::LaunchCommand => self.launch_command = value.into(),
        }
    }

    pub fn cattribute(&self, attr: CAttribute) -> char {
        match attr {
            CAttribute::LaunchCommandQuote => self.launch_command_quote,
        }
    }

    pub fn set_cattribute(&mut self, attr: CAttribute, value: char) {
        match attr {
            CAttribute::LaunchCommandQuote => self.launch_command_quote = value,
        }
    }

    pub fn iattribute(&self, attr: IAttribute) -> i32 {
        match attr {
            IAttribute::ThreadModel => self.thread_model,
        }
    }

    pub fn set_iattribute(&mut self, attr: IAttribute, value: i32) {
        match attr {
            IAttribute::ThreadModel => {
                if ThreadModel::from_i32(value).is_none() {
                    tracing::warn!("Unknown thread model {}, using {}", value, ThreadModel::default());
                }
                self.thread_model = value;
            }
        }
    }

    /// The thread model attribute, falling back to the default for unknown values
    pub fn thread_model(&self) -> ThreadModel {
        ThreadModel::from_i32(self.thread_model).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let attrs = NodeAttributes::default();
        assert_eq!(attrs.sattribute(SAttribute::LaunchCommand), "ssh -n %h %c");
        assert_eq!(attrs.cattribute(CAttribute::LaunchCommandQuote), '\'');
        assert_eq!(attrs.thread_model(), ThreadModel::DrawSync);
    }

    #[test]
    fn test_names() {
        assert_eq!(SAttribute::LaunchCommand.name(), "launch_command");
        assert_eq!(CAttribute::LaunchCommandQuote.name(), "launch_command_quote");
        assert_eq!(IAttribute::ThreadModel.name(), "thread_model");
    }

    #[test]
    fn test_unknown_thread_model_falls_back() {
        let mut attrs = NodeAttributes::default();
        attrs.set_iattribute(IAttribute::ThreadModel, ThreadModel::LocalSync.as_i32());
        assert_eq!(attrs.thread_model(), ThreadModel::LocalSync);

        attrs.set_iattribute(IAttribute::ThreadModel, 42);
        assert_eq!(attrs.iattribute(IAttribute::ThreadModel), 42);
        assert_eq!(attrs.thread_model(), ThreadModel::DrawSync);
    }

    #[test]
    fn test_task_flags() {
        let tasks = TaskFlags::CLEAR | TaskFlags::DRAW;
        assert!(tasks.contains(TaskFlags::DRAW));
        assert!(!tasks.contains(TaskFlags::READBACK));
        assert!(TaskFlags::default().is_empty());
    }
}
