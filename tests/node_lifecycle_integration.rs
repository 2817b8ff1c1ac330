//! Integration tests for the node lifecycle
//!
//! These tests validate the complete node workflow over the loopback network:
//! - Connect or launch, init, frames and exit
//! - Command loop start and stop as seen by execution listeners
//! - Blocking on the latency window
//! - Cancelling a unit blocked on a node

mod common;

use common::builders::ClusterBuilder;
use common::{test_timeout, wait_for, RecordingListener};
use lockstep::config::{TaskFlags, ThreadModel};
use lockstep::execution::{ExecutionRuntime, ExecutionUnit};
use lockstep::net::{ClientBehavior, PacketHeader, PacketKind};
use lockstep::node::NodeLifecycle;
use lockstep::{FrameSync, LockstepError, NodeController, NodeState};
use serial_test::serial;
use std::time::{Duration, Instant};

#[test]
fn test_full_lifecycle_reports_command_loop() {
    let runtime = ExecutionRuntime::new();
    let listener = RecordingListener::new();
    runtime.add_listener(listener.clone());

    let (mut node, _network) = ClusterBuilder::new("wall")
        .node("render1")
        .build_node(runtime);

    node.connect().unwrap();
    assert_eq!(node.state(), NodeState::Connected);
    assert_eq!(listener.count("started:node-render1"), 1);

    node.config_init(1, 0).unwrap();
    node.sync_config_init().unwrap();
    assert_eq!(node.state(), NodeState::Running);
    node.activate();

    for frame in 1..=4 {
        node.update(100 + frame, frame).unwrap();
    }
    node.finish_frame(4).unwrap();
    assert_eq!(node.finished_frame(), 4);
    assert_eq!(node.frames_in_flight(), 0);

    node.deactivate().unwrap();
    node.config_exit().unwrap();
    node.sync_config_exit().unwrap();
    assert_eq!(node.state(), NodeState::Stopped);
    assert_eq!(listener.count("stopping:node-render1"), 1);
}

#[test]
fn test_launched_node_connects_back() {
    let (mut node, network) = ClusterBuilder::new("wall")
        .node("render1")
        .autolaunch()
        .build_node(ExecutionRuntime::new());

    node.launch().unwrap();
    assert_eq!(node.state(), NodeState::Launching);
    node.sync_launch(Instant::now() + test_timeout()).unwrap();
    assert_eq!(node.state(), NodeState::Connected);

    let commands = network.launched_commands();
    assert_eq!(commands.len(), 1);
    assert!(commands[0].contains("--lockstep-node render1"));

    node.config_exit().unwrap();
    assert_eq!(node.state(), NodeState::Stopped);
}

#[test]
fn test_refusing_host_fails_launch() {
    let (mut node, _network) = ClusterBuilder::new("wall")
        .node_with(
            "render1",
            ClientBehavior {
                refuse_connections: true,
                ..Default::default()
            },
        )
        .build_node(ExecutionRuntime::new());

    assert!(matches!(
        node.connect().unwrap_err(),
        LockstepError::ConnectionFailure(_)
    ));

    node.launch().unwrap();
    let err = node
        .sync_launch(Instant::now() + Duration::from_millis(50))
        .unwrap_err();
    assert!(matches!(err, LockstepError::LaunchFailure(_)));
    assert_eq!(node.state(), NodeState::Stopped);
}

#[test]
fn test_failed_exit_reply_is_sync_failure() {
    let (mut node, _network) = ClusterBuilder::new("wall")
        .node_with(
            "render1",
            ClientBehavior {
                exit_ok: false,
                ..Default::default()
            },
        )
        .build_node(ExecutionRuntime::new());

    node.connect().unwrap();
    node.config_init(1, 0).unwrap();
    node.sync_config_init().unwrap();
    node.config_exit().unwrap();
    assert_eq!(node.state(), NodeState::Stopping);

    let err = node.sync_config_exit().unwrap_err();
    assert!(matches!(err.root(), LockstepError::SyncFailure(_)));
    assert_eq!(node.state(), NodeState::Stopped);
}

#[test]
#[serial]
fn test_update_blocks_on_latency_window() {
    let (mut node, _network) = ClusterBuilder::new("wall")
        .node_with(
            "render1",
            ClientBehavior {
                frame_delay: Duration::from_millis(50),
                ..Default::default()
            },
        )
        .latency(1)
        .build_node(ExecutionRuntime::new());

    node.connect().unwrap();
    node.config_init(1, 0).unwrap();
    node.sync_config_init().unwrap();
    node.activate();

    node.update(1, 1).unwrap();
    node.update(2, 2).unwrap();
    assert!(node.frames_in_flight() <= 2);

    // frame 1 must finish before frame 3 may start
    node.update(3, 3).unwrap();
    assert!(node.finished_frame() >= 1);
    assert!(node.frames_in_flight() <= 2);

    node.finish_frame(3).unwrap();
    node.config_exit().unwrap();
    node.sync_config_exit().unwrap();
}

#[test]
fn test_application_packets_travel_with_frame() {
    let (mut node, network) = ClusterBuilder::new("wall")
        .node("render1")
        .thread_model(ThreadModel::LocalSync)
        .build_node(ExecutionRuntime::new());
    node.add_tasks(TaskFlags::CLEAR | TaskFlags::DRAW);

    node.connect().unwrap();
    node.config_init(1, 0).unwrap();
    node.sync_config_init().unwrap();
    node.activate();
    network.clear_writes("render1");

    let viewport: [u32; 4] = [0, 0, 1920, 1080];
    node.send_slice(PacketHeader::new(PacketKind::Task), &viewport);
    node.send_str(PacketHeader::new(PacketKind::Task), "swap");
    node.update(9, 1).unwrap();
    node.finish_frame(1).unwrap();

    let writes = network.writes("render1");
    assert_eq!(writes.len(), 1);
    let tasks: Vec<_> = writes[0]
        .iter()
        .filter(|p| p.kind() == Some(PacketKind::Task))
        .collect();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].payload, bytemuck::cast_slice::<u32, u8>(&viewport));
    assert_eq!(tasks[1].payload_str(), Some("swap"));

    // local sync asks for the frame's completion in the same write
    assert_eq!(writes[0].last().and_then(|p| p.kind()), Some(PacketKind::FrameFinish));
}

#[test]
fn test_link_loss_wakes_waiter() {
    let (mut node, network) = ClusterBuilder::new("wall")
        .node_with(
            "render1",
            ClientBehavior {
                reply_frames: false,
                ..Default::default()
            },
        )
        .build_node(ExecutionRuntime::new());

    node.connect().unwrap();
    node.config_init(1, 0).unwrap();
    node.sync_config_init().unwrap();
    node.activate();
    node.update(1, 1).unwrap();

    let disconnector = {
        let network = network.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            network.disconnect("render1");
        })
    };

    let started = Instant::now();
    let err = node.finish_frame(1).unwrap_err();
    disconnector.join().unwrap();

    assert!(matches!(err, LockstepError::ConnectionFailure(_)));
    assert!(started.elapsed() < test_timeout());
    assert!(wait_for(test_timeout(), || node.state() == NodeState::Stopped));

    let err = node.update(2, 2).unwrap_err();
    assert!(matches!(err, LockstepError::ConnectionFailure(_)));
}

#[test]
fn test_cancel_interrupts_blocked_finish_frame() {
    let runtime = ExecutionRuntime::new();
    let (mut node, _network) = ClusterBuilder::new("wall")
        .node_with(
            "render1",
            ClientBehavior {
                reply_frames: false,
                ..Default::default()
            },
        )
        .build_node(runtime.clone());

    node.connect().unwrap();
    node.config_init(1, 0).unwrap();
    node.sync_config_init().unwrap();
    node.activate();
    node.update(1, 1).unwrap();

    let unit: ExecutionUnit<(lockstep::Result<()>, NodeController)> =
        ExecutionUnit::new("coord", runtime);
    unit.start(move |_| {
        let result = node.finish_frame(1);
        (result, node)
    })
    .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    let cancelled_at = Instant::now();
    unit.cancel().unwrap();
    let (result, mut node) = unit.join(Some(test_timeout())).unwrap();

    assert!(cancelled_at.elapsed() < Duration::from_secs(1));
    match result {
        Err(LockstepError::Cancelled(what)) => assert!(what.contains("frame 1")),
        other => panic!("expected cancellation, got {:?}", other),
    }

    // the node is still usable from the caller's thread
    assert_eq!(node.state(), NodeState::Running);
    node.config_exit().unwrap();
    node.sync_config_exit().unwrap();
    assert_eq!(node.state(), NodeState::Stopped);
}

#[test]
fn test_cancel_interrupts_blocked_init() {
    let runtime = ExecutionRuntime::new();
    let (mut node, _network) = ClusterBuilder::new("wall")
        .node_with(
            "render1",
            ClientBehavior {
                reply_init: false,
                ..Default::default()
            },
        )
        .build_node(runtime.clone());

    node.connect().unwrap();
    node.config_init(1, 0).unwrap();

    let unit: ExecutionUnit<(lockstep::Result<()>, NodeController)> =
        ExecutionUnit::new("coord", runtime);
    unit.start(move |_| {
        let result = node.sync_config_init();
        (result, node)
    })
    .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    let cancelled_at = Instant::now();
    unit.cancel().unwrap();
    let (result, mut node) = unit.join(Some(test_timeout())).unwrap();

    assert!(cancelled_at.elapsed() < Duration::from_secs(1));
    assert!(matches!(result, Err(LockstepError::Cancelled(_))));

    node.config_exit().unwrap();
    let _ = node.sync_config_exit();
}
