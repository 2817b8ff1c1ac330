//! Lifecycle state and frame bookkeeping of one node
//!
//! [`NodeSync`] is shared between the controller (coordinator thread) and
//! the node's command loop, which applies remote acknowledgements to it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// No connection, no remote process
    #[default]
    Stopped,
    /// Remote process started, not yet connected back
    Launching,
    /// Transport established, not initialized
    Connected,
    /// Init sent, acknowledgement pending
    Initializing,
    /// Initialized and accepting frame updates
    Running,
    /// Exit sent, acknowledgement pending
    Stopping,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeState::Stopped => "stopped",
            NodeState::Launching => "launching",
            NodeState::Connected => "connected",
            NodeState::Initializing => "initializing",
            NodeState::Running => "running",
            NodeState::Stopping => "stopping",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of applying a frame finish acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAck {
    /// `finished_frame` advanced
    Applied,
    /// Older than or equal to the finished frame; ignored
    Stale,
    /// Newer than any frame ever updated; ignored
    Unknown,
}

/// State shared by a controller and its command loop
#[derive(Debug, Clone, Default)]
pub struct NodeSync {
    pub state: NodeState,
    /// Result of the init acknowledgement, once received
    pub init_reply: Option<bool>,
    /// Result of the exit acknowledgement, once received
    pub exit_reply: Option<bool>,
    /// In-flight frames, frame number to frame id
    pub frames: BTreeMap<u32, u32>,
    pub finished_frame: u32,
    /// Highest frame a finish request was sent for
    pub flushed_frame: u32,
    /// Highest frame number passed to `update`
    pub last_frame: u32,
    /// Set by the command loop when the transport went away
    pub link_lost: bool,
}

impl NodeSync {
    /// Start a fresh configuration at `frame_number`
    pub fn reset_frames(&mut self, frame_number: u32) {
        self.frames.clear();
        self.finished_frame = frame_number;
        self.flushed_frame = frame_number;
        self.last_frame = frame_number;
    }

    pub fn record_update(&mut self, frame_id: u32, frame_number: u32) {
        self.frames.insert(frame_number, frame_id);
        self.last_frame = frame_number;
    }

    /// In-flight frames up to `frame_number` that no finish request was sent for
    ///
    /// Advances `flushed_frame` to `frame_number`, capped at the last updated frame.
    pub fn take_due_frames(&mut self, frame_number: u32) -> Vec<(u32, u32)> {
        let upto = frame_number.min(self.last_frame);
        if upto <= self.flushed_frame {
            return Vec::new();
        }
        let due = self
            .frames
            .range(self.flushed_frame + 1..=upto)
            .map(|(&number, &id)| (number, id))
            .collect();
        self.flushed_frame = upto;
        due
    }

    /// Apply a remote acknowledgement that `frame_number` completed
    pub fn frame_finished(&mut self, frame_number: u32) -> FrameAck {
        if frame_number > self.last_frame {
            return FrameAck::Unknown;
        }
        if frame_number <= self.finished_frame {
            return FrameAck::Stale;
        }
        self.finished_frame = frame_number;
        self.frames = self.frames.split_off(&frame_number.saturating_add(1));
        FrameAck::Applied
    }

    /// The transport is gone: stop and forget every in-flight frame
    pub fn mark_link_lost(&mut self) {
        self.state = NodeState::Stopped;
        self.frames.clear();
        self.link_lost = true;
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn oldest_in_flight(&self) -> Option<u32> {
        self.frames.keys().next().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_stale_ack_is_ignored() {
        let mut sync = NodeSync::default();
        sync.record_update(7, 5);
        assert_eq!(sync.frame_finished(5), FrameAck::Applied);
        assert_eq!(sync.frame_finished(4), FrameAck::Stale);
        assert_eq!(sync.finished_frame, 5);
        assert!(sync.frames.is_empty());
    }

    #[test]
    fn test_ack_beyond_last_update_is_unknown() {
        let mut sync = NodeSync::default();
        sync.record_update(1, 1);
        assert_eq!(sync.frame_finished(2), FrameAck::Unknown);
        assert_eq!(sync.finished_frame, 0);
    }

    #[test]
    fn test_due_frames_are_taken_once() {
        let mut sync = NodeSync::default();
        for n in 1..=4 {
            sync.record_update(100 + n, n);
        }
        assert_eq!(sync.take_due_frames(2), vec![(1, 101), (2, 102)]);
        assert_eq!(sync.flushed_frame, 2);
        assert!(sync.take_due_frames(2).is_empty());
        assert_eq!(sync.take_due_frames(10), vec![(3, 103), (4, 104)]);
        assert_eq!(sync.flushed_frame, 4);
    }

    #[test]
    fn test_link_lost_discards_frames() {
        let mut sync = NodeSync {
            state: NodeState::Running,
            ..Default::default()
        };
        sync.record_update(1, 1);
        sync.mark_link_lost();
        assert_eq!(sync.state, NodeState::Stopped);
        assert_eq!(sync.frames_in_flight(), 0);
    }

    proptest! {
        #[test]
        fn prop_finished_frame_is_monotonic_and_bounded(
            updates in 1u32..40,
            acks in proptest::collection::vec(0u32..60, 0..80)
        ) {
            let mut sync = NodeSync::default();
            for n in 1..=updates {
                sync.record_update(n * 3, n);
            }

            let mut previous = sync.finished_frame;
            for ack in acks {
                sync.frame_finished(ack);
                prop_assert!(sync.finished_frame >= previous);
                prop_assert!(sync.finished_frame <= sync.last_frame);
                prop_assert!(sync.frames.keys().all(|&n| n > sync.finished_frame));
                previous = sync.finished_frame;
            }
        }
    }
}
