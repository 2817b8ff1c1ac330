//! Integration tests for a whole cluster running frames
//!
//! These tests validate:
//! - Start, init, frames and exit across several nodes
//! - One transport write per frame and node, split only at the write limit
//! - Frame barriers shared by one worker per node
//! - Status snapshots

mod common;

use common::builders::ClusterBuilder;
use common::test_timeout;
use lockstep::config::ThreadModel;
use lockstep::execution::{ExecutionRuntime, ExecutionUnit};
use lockstep::net::{ClientBehavior, PacketKind, HEADER_SIZE};
use lockstep::node::NodeSnapshot;
use lockstep::{ClusterConfig, LockstepError, NodeState};
use serial_test::serial;
use std::time::Duration;

#[test]
#[serial]
fn test_cluster_runs_frames_in_lockstep() {
    let (mut cluster, network) = ClusterBuilder::new("wall")
        .node("left")
        .node("right")
        .thread_model(ThreadModel::Async)
        .autolaunch()
        .latency(2)
        .build();

    cluster.start_nodes().unwrap();
    cluster.init(1).unwrap();
    assert_eq!(network.launched_commands().len(), 1);

    for frame_id in 0..20 {
        let frame = cluster.start_frame(frame_id).unwrap();
        assert!(cluster
            .nodes()
            .all(|n| n.snapshot().frames_in_flight <= 3));
        if frame % 5 == 0 {
            cluster.finish_frame(frame).unwrap();
        }
    }
    cluster.finish_frame(20).unwrap();

    for node in cluster.nodes() {
        assert_eq!(node.finished_frame(), 20);
        assert_eq!(node.state(), NodeState::Running);
    }

    cluster.exit().unwrap();
    assert!(cluster.nodes().all(|n| n.state() == NodeState::Stopped));
}

#[test]
#[serial]
fn test_one_write_per_frame() {
    let (mut cluster, network) = ClusterBuilder::new("wall").node("render1").build();
    cluster.start_nodes().unwrap();
    cluster.init(1).unwrap();
    network.clear_writes("render1");

    // default latency 1: each update carries the finish request of the previous frame
    for frame_id in 1..=5 {
        cluster.start_frame(frame_id).unwrap();
    }
    cluster.finish_frame(4).unwrap();

    let writes = network.writes("render1");
    assert_eq!(writes.len(), 5);
    for write in &writes[1..] {
        assert_eq!(
            write.iter().filter(|p| p.kind() == Some(PacketKind::FrameStart)).count(),
            1
        );
        assert_eq!(
            write.iter().filter(|p| p.kind() == Some(PacketKind::FrameFinish)).count(),
            1
        );
    }

    cluster.exit().unwrap();
}

#[test]
#[serial]
fn test_writes_split_at_limit() {
    let (mut cluster, network) = ClusterBuilder::new("wall")
        .node("render1")
        .max_write_size(2 * HEADER_SIZE)
        .build();
    cluster.start_nodes().unwrap();
    cluster.init(1).unwrap();
    network.clear_writes("render1");

    let frame = cluster.start_frame(1).unwrap();
    cluster.finish_frame(frame).unwrap();

    // draw finish, start, tasks finish, then the finish request of finish_frame
    let writes = network.writes("render1");
    assert_eq!(writes.len(), 3);
    assert!(writes.iter().all(|w| w.len() <= 2));
    assert_eq!(
        network.received_kinds("render1"),
        vec![
            PacketKind::FrameDrawFinish,
            PacketKind::FrameStart,
            PacketKind::FrameTasksFinish,
            PacketKind::FrameFinish,
        ]
    );

    cluster.exit().unwrap();
}

#[test]
#[serial]
fn test_frame_barrier_gathers_one_worker_per_node() {
    let (mut cluster, _network) = ClusterBuilder::new("wall")
        .node("left")
        .node("right")
        .node("center")
        .build();
    cluster.start_nodes().unwrap();
    cluster.init(1).unwrap();

    let runtime = ExecutionRuntime::new();
    for frame_id in 1..=3 {
        let frame = cluster.start_frame(frame_id).unwrap();
        let barrier = cluster.frame_barrier(3).unwrap();

        let workers: Vec<ExecutionUnit<lockstep::Result<()>>> = (0..3)
            .map(|i| ExecutionUnit::new(format!("draw-{}", i), runtime.clone()))
            .collect();
        for worker in &workers {
            let barrier = barrier.clone();
            worker
                .start(move |_| barrier.arrive_timeout(Duration::from_secs(2)))
                .unwrap();
        }
        for worker in &workers {
            worker.join(Some(test_timeout())).unwrap().unwrap();
        }

        assert!(barrier.is_released());
        cluster.release_frame_barrier(barrier).unwrap();
        cluster.finish_frame(frame).unwrap();
    }

    // the same barrier served every frame
    let master = cluster.nodes().next().unwrap().snapshot();
    assert_eq!(master.barriers_allocated, 1);
    assert_eq!(master.barriers_idle, 1);

    cluster.exit().unwrap();
}

#[test]
fn test_frame_barrier_rejects_zero_participants() {
    let (mut cluster, _network) = ClusterBuilder::new("wall").node("render1").build();
    let err = cluster.frame_barrier(0).unwrap_err();
    assert!(err.is_protocol_violation());

    // the failed barrier went back to the cache
    assert_eq!(cluster.nodes().next().unwrap().snapshot().barriers_idle, 1);
}

#[test]
#[serial]
fn test_unreachable_node_aborts_start() {
    let builder = ClusterBuilder::new("wall").node("render1");
    let mut config = builder.config().clone();
    config.nodes[0].connections[0].hostname = "nowhere".to_string();

    let network = builder.network();
    let mut cluster = lockstep::ClusterCoordinator::new(
        config,
        std::sync::Arc::new(network.clone()),
        std::sync::Arc::new(network),
        ExecutionRuntime::new(),
    )
    .unwrap();

    let err = cluster.start_nodes().unwrap_err();
    assert!(matches!(err.root(), LockstepError::ConnectionFailure(_)));
    assert!(err.to_string().contains("render1"));
}

#[test]
#[serial]
fn test_dropped_link_surfaces_on_frame() {
    let (mut cluster, _network) = ClusterBuilder::new("wall")
        .node_with(
            "render1",
            ClientBehavior {
                drop_after_frames: Some(2),
                ..Default::default()
            },
        )
        .build();
    cluster.start_nodes().unwrap();
    cluster.init(1).unwrap();

    let mut failure = None;
    for frame_id in 1..=10 {
        let result = cluster
            .start_frame(frame_id)
            .and_then(|frame| cluster.finish_frame(frame));
        if let Err(e) = result {
            failure = Some(e);
            break;
        }
    }

    let failure = failure.expect("link drop was not reported");
    assert!(matches!(failure.root(), LockstepError::ConnectionFailure(_)));
    assert_eq!(
        cluster.node("render1").unwrap().state(),
        NodeState::Stopped
    );
    let _ = cluster.exit();
}

#[test]
fn test_snapshots_serialize_to_json() {
    let (cluster, _network) = ClusterBuilder::new("wall").node("render1").build();
    let snapshots: Vec<NodeSnapshot> = cluster.snapshots();
    let json = serde_json::to_value(&snapshots).unwrap();

    assert_eq!(json[0]["name"], "render1");
    assert_eq!(json[0]["state"], "stopped");
    assert_eq!(json[0]["thread_model"], "draw_sync");
}

#[test]
fn test_demo_config_survives_toml_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cluster.toml");

    let config = ClusterConfig::loopback_demo();
    config.save(&path).unwrap();
    assert_eq!(ClusterConfig::load(&path).unwrap(), config);
}
