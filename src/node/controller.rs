//! The node controller
//!
//! Owned and driven by a single coordinator thread. Everything the command
//! loop also touches lives in the shared [`NodeSync`] monitor; the rest of
//! the controller is plain owned state.

use super::barrier_cache::{BarrierCache, BarrierHandle};
use super::command_loop::CommandLoop;
use super::launch::LaunchSpec;
use super::state::{NodeState, NodeSync};
use super::{
    ClusterNode, FrameSync, NodeAttributeAccess, NodeId, NodeLifecycle, NodeSnapshot, PipeId,
};
use crate::config::{
    CAttribute, ClusterConfig, IAttribute, NodeAttributes, NodeConfig, SAttribute, TaskFlags,
    ThreadModel, DEFAULT_PROGRAM,
};
use crate::error::{LockstepError, Result};
use crate::execution::ExecutionRuntime;
use crate::net::{Connection, ConnectionDescription, Launcher, Packet, PacketHeader, PacketKind, Transport};
use crate::sync::{Monitor, WaitError};
use bytemuck::Pod;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a blocking wait on the shared state ended with
enum Waited {
    Done,
    LinkLost,
    TimedOut,
    Cancelled,
}

/// Controller of one remote render node
pub struct NodeController {
    name: String,
    id: NodeId,
    transport: Arc<dyn Transport>,
    launcher: Arc<dyn Launcher>,
    runtime: Arc<ExecutionRuntime>,
    config: ClusterConfig,

    shared: Arc<Monitor<NodeSync>>,
    command_loop: Option<CommandLoop>,
    connection: Option<Arc<dyn Connection>>,

    descriptions: Vec<ConnectionDescription>,
    attributes: NodeAttributes,
    program: String,
    workdir: Option<String>,
    autolaunch: bool,

    activation: u32,
    latency: u32,
    barriers: BarrierCache,
    tasks: TaskFlags,
    last_draw_pipe: Option<PipeId>,
    /// Application packets queued by `send*` since the last update
    outbox: Vec<Packet>,
}

impl std::fmt::Debug for NodeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeController")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("state", &self.state())
            .field("activation", &self.activation)
            .finish()
    }
}

impl NodeController {
    /// Create a stopped node with default attributes and no connection descriptions
    pub fn new(
        name: impl Into<String>,
        id: NodeId,
        transport: Arc<dyn Transport>,
        launcher: Arc<dyn Launcher>,
        runtime: Arc<ExecutionRuntime>,
        config: &ClusterConfig,
    ) -> Self {
        let name = name.into();
        Self {
            barriers: BarrierCache::new(name.clone(), config.latency),
            name,
            id,
            transport,
            launcher,
            runtime,
            config: config.clone(),
            shared: Arc::new(Monitor::new(NodeSync::default())),
            command_loop: None,
            connection: None,
            descriptions: Vec::new(),
            attributes: NodeAttributes::default(),
            program: DEFAULT_PROGRAM.to_string(),
            workdir: None,
            autolaunch: false,
            activation: 0,
            latency: config.latency,
            tasks: TaskFlags::empty(),
            last_draw_pipe: None,
            outbox: Vec::new(),
        }
    }

    /// Create a node described by `node`
    pub fn from_config(
        node: &NodeConfig,
        id: NodeId,
        transport: Arc<dyn Transport>,
        launcher: Arc<dyn Launcher>,
        runtime: Arc<ExecutionRuntime>,
        config: &ClusterConfig,
    ) -> Self {
        let mut controller = Self::new(node.name.clone(), id, transport, launcher, runtime, config);
        controller.descriptions = node.connections.clone();
        controller.attributes = node.attributes();
        controller.program = node.program.clone();
        controller.workdir = node.workdir.clone();
        controller.autolaunch = node.autolaunch;
        controller
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    // ==================== Connection descriptions ====================

    pub fn add_connection_description(&mut self, description: ConnectionDescription) {
        self.descriptions.push(description);
    }

    pub fn remove_connection_description(&mut self, description: &ConnectionDescription) -> bool {
        match self.descriptions.iter().position(|d| d == description) {
            Some(index) => {
                self.descriptions.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn connection_descriptions(&self) -> &[ConnectionDescription] {
        &self.descriptions
    }

    // ==================== Tasks and pipes ====================

    /// Record tasks this node may execute
    pub fn add_tasks(&mut self, tasks: TaskFlags) {
        self.tasks |= tasks;
    }

    pub fn tasks(&self) -> TaskFlags {
        self.tasks
    }

    pub fn set_last_draw_pipe(&mut self, pipe: Option<PipeId>) {
        self.last_draw_pipe = pipe;
    }

    pub fn last_draw_pipe(&self) -> Option<PipeId> {
        self.last_draw_pipe
    }

    pub fn latency(&self) -> u32 {
        self.latency
    }

    /// Frames `update` leaves unfinished before requesting their completion
    pub fn finish_latency(&self) -> u32 {
        match self.attributes.thread_model() {
            ThreadModel::LocalSync if !self.tasks.is_empty() => 0,
            ThreadModel::DrawSync if self.tasks.contains(TaskFlags::DRAW) => self.latency.min(1),
            _ => self.latency,
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.shared.lock().frames_in_flight()
    }

    // ==================== Application sends ====================

    /// Queue an application packet for the next frame
    pub fn send(&mut self, packet: Packet) {
        let packet = self.stamp(packet);
        self.outbox.push(packet);
    }

    pub fn send_bytes(&mut self, header: PacketHeader, payload: &[u8]) {
        self.send(Packet {
            header,
            payload: payload.to_vec(),
        });
    }

    pub fn send_str(&mut self, header: PacketHeader, payload: &str) {
        self.send_bytes(header, payload.as_bytes());
    }

    pub fn send_slice<T: Pod>(&mut self, header: PacketHeader, items: &[T]) {
        self.send_bytes(header, bytemuck::cast_slice(items));
    }

    /// Transmit queued application packets now instead of with the next frame
    pub fn flush_send_buffer(&mut self) -> Result<()> {
        if self.outbox.is_empty() {
            return Ok(());
        }
        let outbox = std::mem::take(&mut self.outbox);
        let command_loop = self.command_loop()?;
        for packet in outbox {
            command_loop.enqueue(packet)?;
        }
        command_loop.flush()
    }

    // ==================== Internals ====================

    fn stamp(&self, mut packet: Packet) -> Packet {
        packet.header.session_id = self.config.session_id;
        packet.header.object_id = self.id;
        packet
    }

    fn command_loop(&self) -> Result<&CommandLoop> {
        self.command_loop.as_ref().ok_or_else(|| {
            LockstepError::ConnectionFailure(format!("{} has no command loop", self.name))
        })
    }

    fn set_state(&self, state: NodeState) {
        tracing::debug!("{} -> {}", self.name, state);
        self.shared.update(|s| s.state = state);
    }

    /// Take ownership of an established connection and start the command loop
    fn attach(&mut self, connection: Arc<dyn Connection>) -> Result<()> {
        // a lost link leaves its loop and connection behind
        self.release_link();

        // the loop may report a loss as soon as it runs
        self.shared.update(|s| {
            s.state = NodeState::Connected;
            s.link_lost = false;
            s.init_reply = None;
            s.exit_reply = None;
        });

        let command_loop = match CommandLoop::start(
            &self.name,
            self.runtime.clone(),
            connection.clone(),
            self.shared.clone(),
            &self.config,
        ) {
            Ok(command_loop) => command_loop,
            Err(e) => {
                connection.close();
                self.shared.update(|s| s.state = NodeState::Stopped);
                return Err(e);
            }
        };

        self.command_loop = Some(command_loop);
        self.connection = Some(connection);
        Ok(())
    }

    /// Release everything tied to the current connection and stop
    fn teardown(&mut self) {
        self.barriers.flush();
        self.outbox.clear();
        self.release_link();

        self.shared.update(|s| {
            s.state = NodeState::Stopped;
            s.frames.clear();
        });
        tracing::info!("{} stopped", self.name);
    }

    /// Stop the command loop and close the connection, if any
    fn release_link(&mut self) {
        if let Some(command_loop) = self.command_loop.take() {
            if let Err(e) = command_loop.stop(self.config.timeouts.join()) {
                tracing::warn!("Command loop of {} did not stop cleanly: {}", self.name, e);
            }
        }
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }

    /// Block until `done` holds or the link is lost
    fn wait_shared(&self, timeout: Duration, done: impl Fn(&NodeSync) -> bool) -> Waited {
        let guard = self.shared.lock();
        let (guard, waited) = self
            .shared
            .wait_until(guard, Some(timeout), |s| done(s) || s.link_lost);
        match waited {
            Ok(()) if done(&*guard) => Waited::Done,
            Ok(()) => Waited::LinkLost,
            Err(WaitError::TimedOut) => Waited::TimedOut,
            Err(WaitError::Cancelled) => Waited::Cancelled,
        }
    }

    fn link_lost_error(&self, during: &str) -> LockstepError {
        LockstepError::ConnectionFailure(format!("lost connection to {} during {}", self.name, during))
    }

    fn enqueue_frame_finishes(&self, frame_number: u32) -> Result<usize> {
        let due = self.shared.update(|s| s.take_due_frames(frame_number));
        if due.is_empty() {
            return Ok(0);
        }
        let command_loop = self.command_loop()?;
        for &(number, id) in &due {
            tracing::trace!("{}: finish request for frame {}", self.name, number);
            command_loop.enqueue(self.stamp(Packet::frame(PacketKind::FrameFinish, id, number)))?;
        }
        Ok(due.len())
    }
}

impl NodeLifecycle for NodeController {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> NodeState {
        self.shared.lock().state
    }

    fn connect(&mut self) -> Result<()> {
        match self.state() {
            NodeState::Stopped => {}
            NodeState::Connected => {
                tracing::debug!("{} already connected", self.name);
                return Ok(());
            }
            other => {
                return Err(LockstepError::protocol(format!(
                    "connect of {} while {}",
                    self.name, other
                )))
            }
        }

        let mut failures = Vec::new();
        for description in self.descriptions.clone() {
            match self.transport.connect(&description) {
                Ok(connection) => {
                    self.attach(connection)?;
                    tracing::info!("Connected to {} via {}", self.name, description);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Connecting {} via {} failed: {}", self.name, description, e);
                    failures.push(e.to_string());
                }
            }
        }

        if failures.is_empty() {
            failures.push("no connection description".to_string());
        }
        Err(LockstepError::ConnectionFailure(format!(
            "{}: {}",
            self.name,
            failures.join("; ")
        )))
    }

    fn launch(&mut self) -> Result<()> {
        match self.state() {
            NodeState::Stopped => {}
            NodeState::Launching | NodeState::Connected => {
                tracing::debug!("{} already launched", self.name);
                return Ok(());
            }
            other => {
                return Err(LockstepError::protocol(format!(
                    "launch of {} while {}",
                    self.name, other
                )))
            }
        }

        let spec = LaunchSpec {
            node: &self.name,
            program: &self.program,
            workdir: self.workdir.as_deref(),
            quote: self.attributes.cattribute(CAttribute::LaunchCommandQuote),
        };
        let template = self.attributes.sattribute(SAttribute::LaunchCommand);

        let mut failures = Vec::new();
        for description in &self.descriptions {
            let command = spec.expand(template, description);
            tracing::info!("Launching {}: {}", self.name, command);
            match self.launcher.launch(&command) {
                Ok(()) => {
                    self.set_state(NodeState::Launching);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Launch of {} via {} failed: {}", self.name, description, e);
                    failures.push(e.to_string());
                }
            }
        }

        if failures.is_empty() {
            failures.push("no connection description".to_string());
        }
        Err(LockstepError::LaunchFailure(format!(
            "{}: {}",
            self.name,
            failures.join("; ")
        )))
    }

    fn sync_launch(&mut self, deadline: Instant) -> Result<()> {
        match self.state() {
            NodeState::Launching => {}
            NodeState::Connected => return Ok(()),
            other => {
                return Err(LockstepError::protocol(format!(
                    "sync_launch of {} while {}",
                    self.name, other
                )))
            }
        }

        let timeout = deadline.saturating_duration_since(Instant::now());
        let accepted = self
            .transport
            .accept(&self.name, timeout)
            .and_then(|connection| self.attach(connection));

        match accepted {
            Ok(()) => {
                tracing::info!("{} connected back", self.name);
                Ok(())
            }
            Err(e) => {
                self.set_state(NodeState::Stopped);
                match e {
                    LockstepError::Cancelled(_) => Err(e),
                    other => Err(LockstepError::LaunchFailure(format!(
                        "{} never connected back: {}",
                        self.name, other
                    ))),
                }
            }
        }
    }

    fn config_init(&mut self, init_id: u32, frame_number: u32) -> Result<()> {
        let state = self.state();
        if state != NodeState::Connected {
            return Err(LockstepError::protocol(format!(
                "config_init of {} while {}",
                self.name, state
            )));
        }

        self.shared.update(|s| {
            s.reset_frames(frame_number);
            s.init_reply = None;
            s.exit_reply = None;
            s.state = NodeState::Initializing;
        });
        tracing::info!("Initializing {} (init id {})", self.name, init_id);

        let packet = self.stamp(Packet::config_init(init_id, frame_number));
        let command_loop = self.command_loop()?;
        command_loop.enqueue(packet)?;
        command_loop.flush()
    }

    fn sync_config_init(&mut self) -> Result<()> {
        let state = self.state();
        if state != NodeState::Initializing {
            return Err(LockstepError::protocol(format!(
                "sync_config_init of {} while {}",
                self.name, state
            )));
        }

        match self.wait_shared(self.config.timeouts.init(), |s| s.init_reply.is_some()) {
            Waited::Done => {}
            Waited::LinkLost => return Err(self.link_lost_error("init")),
            Waited::TimedOut => {
                return Err(LockstepError::Timeout(format!(
                    "init acknowledgement of {}",
                    self.name
                )))
            }
            Waited::Cancelled => {
                return Err(LockstepError::Cancelled(format!("init of {}", self.name)))
            }
        }

        if self.shared.lock().init_reply == Some(true) {
            self.set_state(NodeState::Running);
            tracing::info!("{} running", self.name);
            return Ok(());
        }

        tracing::warn!("{} failed to initialize, exiting", self.name);
        if let Err(e) = self.config_exit() {
            tracing::warn!("Exit of {} after failed init: {}", self.name, e);
        }
        Err(LockstepError::SyncFailure(format!(
            "{} reported init failure",
            self.name
        )))
    }

    fn config_exit(&mut self) -> Result<()> {
        match self.state() {
            NodeState::Running | NodeState::Initializing => {
                tracing::info!("Exiting {}", self.name);
                self.set_state(NodeState::Stopping);
                let packet = self.stamp(Packet::config_exit());
                let command_loop = self.command_loop()?;
                command_loop.enqueue(packet)?;
                command_loop.flush()
            }
            NodeState::Connected | NodeState::Launching => {
                self.teardown();
                Ok(())
            }
            NodeState::Stopping | NodeState::Stopped => {
                tracing::debug!("{} already exiting", self.name);
                Ok(())
            }
        }
    }

    fn sync_config_exit(&mut self) -> Result<()> {
        let outcome = match self.state() {
            NodeState::Stopping => {
                match self.wait_shared(self.config.timeouts.exit(), |s| s.exit_reply.is_some()) {
                    Waited::Done => match self.shared.lock().exit_reply {
                        Some(true) => Ok(()),
                        _ => Err(LockstepError::SyncFailure(format!(
                            "{} reported exit failure",
                            self.name
                        ))),
                    },
                    Waited::LinkLost => Err(self.link_lost_error("exit")),
                    Waited::TimedOut => Err(LockstepError::Timeout(format!(
                        "exit acknowledgement of {}",
                        self.name
                    ))),
                    Waited::Cancelled => {
                        Err(LockstepError::Cancelled(format!("exit of {}", self.name)))
                    }
                }
            }
            NodeState::Stopped | NodeState::Connected | NodeState::Launching => Ok(()),
            other => {
                return Err(LockstepError::protocol(format!(
                    "sync_config_exit of {} while {}",
                    self.name, other
                )))
            }
        };

        self.teardown();
        outcome
    }
}

impl FrameSync for NodeController {
    fn activate(&mut self) {
        self.activation += 1;
        tracing::debug!("{} activated ({})", self.name, self.activation);
    }

    fn deactivate(&mut self) -> Result<()> {
        if self.activation == 0 {
            return Err(LockstepError::protocol(format!(
                "deactivate of inactive node {}",
                self.name
            )));
        }
        self.activation -= 1;
        tracing::debug!("{} deactivated ({})", self.name, self.activation);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.activation > 0
    }

    fn update(&mut self, frame_id: u32, frame_number: u32) -> Result<()> {
        if !self.is_active() {
            return Err(LockstepError::protocol(format!(
                "update of inactive node {}",
                self.name
            )));
        }
        {
            let shared = self.shared.lock();
            if shared.link_lost {
                return Err(self.link_lost_error("update"));
            }
            if shared.state != NodeState::Running {
                return Err(LockstepError::protocol(format!(
                    "update of {} while {}",
                    self.name, shared.state
                )));
            }
            if frame_number <= shared.last_frame {
                return Err(LockstepError::protocol(format!(
                    "update of {} with frame {} after frame {}",
                    self.name, frame_number, shared.last_frame
                )));
            }
        }

        // block until the backlog fits the latency
        loop {
            let oldest = {
                let shared = self.shared.lock();
                if shared.frames_in_flight() <= self.latency as usize {
                    break;
                }
                shared.oldest_in_flight()
            };
            match oldest {
                Some(frame) => self.finish_frame(frame)?,
                None => break,
            }
        }

        self.shared.update(|s| s.record_update(frame_id, frame_number));
        tracing::debug!("{}: update frame {} (id {})", self.name, frame_number, frame_id);

        let outbox = std::mem::take(&mut self.outbox);
        let command_loop = self.command_loop()?;
        if self.last_draw_pipe.is_none() {
            command_loop.enqueue(self.stamp(Packet::frame(
                PacketKind::FrameDrawFinish,
                frame_id,
                frame_number,
            )))?;
        }
        command_loop.enqueue(self.stamp(Packet::frame(
            PacketKind::FrameStart,
            frame_id,
            frame_number,
        )))?;
        for packet in outbox {
            command_loop.enqueue(packet)?;
        }
        command_loop.enqueue(self.stamp(Packet::frame(
            PacketKind::FrameTasksFinish,
            frame_id,
            frame_number,
        )))?;

        let finish_latency = self.finish_latency();
        if frame_number > finish_latency {
            self.enqueue_frame_finishes(frame_number - finish_latency)?;
        }

        self.command_loop()?.flush()
    }

    fn flush_frames(&mut self, frame_number: u32) -> Result<()> {
        if self.enqueue_frame_finishes(frame_number)? > 0 {
            self.command_loop()?.flush()?;
        }
        Ok(())
    }

    fn finish_frame(&mut self, frame: u32) -> Result<()> {
        {
            let shared = self.shared.lock();
            if frame <= shared.finished_frame {
                tracing::debug!(
                    "{}: frame {} already finished ({})",
                    self.name,
                    frame,
                    shared.finished_frame
                );
                return Ok(());
            }
            if shared.link_lost {
                return Err(self.link_lost_error("finish_frame"));
            }
            if frame > shared.last_frame {
                return Err(LockstepError::protocol(format!(
                    "finish of frame {} on {} which only reached frame {}",
                    frame, self.name, shared.last_frame
                )));
            }
        }

        self.flush_frames(frame)?;

        match self.wait_shared(self.config.timeouts.frame(), |s| s.finished_frame >= frame) {
            Waited::Done => Ok(()),
            Waited::LinkLost => Err(self.link_lost_error("finish_frame")),
            Waited::TimedOut => Err(LockstepError::Timeout(format!(
                "frame {} on {}",
                frame, self.name
            ))),
            Waited::Cancelled => Err(LockstepError::Cancelled(format!(
                "finishing frame {} on {}",
                frame, self.name
            ))),
        }
    }

    fn finished_frame(&self) -> u32 {
        self.shared.lock().finished_frame
    }

    fn flushed_frame(&self) -> u32 {
        self.shared.lock().flushed_frame
    }

    fn change_latency(&mut self, latency: u32) -> Result<()> {
        if latency < self.latency {
            let last = self.shared.lock().last_frame;
            if last > latency {
                self.flush_frames(last - latency)?;
            }
        }
        tracing::info!("{}: latency {} -> {}", self.name, self.latency, latency);
        self.latency = latency;
        self.barriers.set_latency(latency);
        Ok(())
    }

    fn get_barrier(&mut self) -> BarrierHandle {
        self.barriers.acquire()
    }

    fn release_barrier(&mut self, barrier: BarrierHandle) -> Result<()> {
        self.barriers.release(barrier)
    }
}

impl NodeAttributeAccess for NodeController {
    fn sattribute(&self, attr: SAttribute) -> &str {
        self.attributes.sattribute(attr)
    }

    fn set_sattribute(&mut self, attr: SAttribute, value: String) {
        self.attributes.set_sattribute(attr, value);
    }

    fn cattribute(&self, attr: CAttribute) -> char {
        self.attributes.cattribute(attr)
    }

    fn set_cattribute(&mut self, attr: CAttribute, value: char) {
        self.attributes.set_cattribute(attr, value);
    }

    fn iattribute(&self, attr: IAttribute) -> i32 {
        self.attributes.iattribute(attr)
    }

    fn set_iattribute(&mut self, attr: IAttribute, value: i32) {
        self.attributes.set_iattribute(attr, value);
    }
}

impl ClusterNode for NodeController {
    fn autolaunch(&self) -> bool {
        self.autolaunch
    }

    fn snapshot(&self) -> NodeSnapshot {
        let shared = self.shared.lock();
        NodeSnapshot {
            name: self.name.clone(),
            id: self.id,
            state: shared.state,
            activation: self.activation,
            thread_model: self.attributes.thread_model(),
            latency: self.latency,
            last_frame: shared.last_frame,
            finished_frame: shared.finished_frame,
            flushed_frame: shared.flushed_frame,
            frames_in_flight: shared.frames_in_flight(),
            barriers_allocated: self.barriers.allocated(),
            barriers_idle: self.barriers.idle(),
        }
    }
}

impl Drop for NodeController {
    fn drop(&mut self) {
        if self.command_loop.is_some() || self.connection.is_some() {
            tracing::debug!("{} dropped while connected", self.name);
            self.teardown();
        }
    }
}
