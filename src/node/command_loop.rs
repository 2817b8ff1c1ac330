//! Per-node command loop
//!
//! Each connected node runs one loop on its own execution unit. The loop
//! owns the node's [`CommandChannel`]: the controller hands it packets and
//! flush requests over a bounded queue, and the loop feeds inbound
//! acknowledgements back into the shared [`NodeSync`].
//!
//! A failed write or a closed inbound stream means the link is gone; the
//! loop then stops the node, discards its in-flight frames and wakes every
//! waiter.

use super::state::{FrameAck, NodeSync};
use crate::config::ClusterConfig;
use crate::error::{LockstepError, Result};
use crate::execution::{ExecutionRuntime, ExecutionUnit, UnitContext};
use crate::net::{decode_packets, CommandChannel, Connection, Packet, PacketKind};
use crate::sync::{Monitor, CANCEL_POLL_INTERVAL};
use crossbeam_channel::{select, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

/// Work items for the loop
#[derive(Debug)]
pub(crate) enum LoopCommand {
    Enqueue(Packet),
    Flush,
    Shutdown,
}

/// Controller side handle of a running command loop
pub(crate) struct CommandLoop {
    unit: ExecutionUnit<()>,
    commands: Sender<LoopCommand>,
}

impl CommandLoop {
    /// Start the loop for `node` on a new execution unit
    pub fn start(
        node: &str,
        runtime: Arc<ExecutionRuntime>,
        connection: Arc<dyn Connection>,
        shared: Arc<Monitor<NodeSync>>,
        config: &ClusterConfig,
    ) -> Result<Self> {
        let (commands, queue) = crossbeam_channel::bounded(config.channel.loop_queue_capacity);

        let mut channel = CommandChannel::new(config.channel.max_write_size);
        channel.attach(connection.clone());

        let worker = LoopWorker {
            node: node.to_string(),
            queue,
            inbound: connection.inbound(),
            channel,
            shared,
        };

        let unit = ExecutionUnit::new(format!("node-{}", node), runtime);
        unit.start(move |ctx| worker.run(ctx))?;
        Ok(Self { unit, commands })
    }

    pub fn enqueue(&self, packet: Packet) -> Result<()> {
        self.send(LoopCommand::Enqueue(packet))
    }

    pub fn flush(&self) -> Result<()> {
        self.send(LoopCommand::Flush)
    }

    fn send(&self, command: LoopCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| {
            LockstepError::ConnectionFailure(format!("command loop {} has stopped", self.unit.name()))
        })
    }

    /// Ask the loop to stop and wait for it
    ///
    /// A loop that does not stop within `timeout` is cancelled and waited
    /// for once more.
    pub fn stop(self, timeout: Duration) -> Result<()> {
        // the loop may already be gone after a link loss
        let _ = self.commands.send(LoopCommand::Shutdown);

        match self.unit.join(Some(timeout)) {
            Err(LockstepError::Timeout(_)) => {
                tracing::warn!("Command loop {} did not stop, cancelling", self.unit.name());
                self.unit.cancel()?;
                self.unit.join(Some(timeout))
            }
            other => other,
        }
    }
}

struct LoopWorker {
    node: String,
    queue: Receiver<LoopCommand>,
    inbound: Receiver<Vec<u8>>,
    channel: CommandChannel,
    shared: Arc<Monitor<NodeSync>>,
}

impl LoopWorker {
    fn run(mut self, ctx: &UnitContext<()>) {
        tracing::debug!("Command loop for {} running", self.node);
        let tick = crossbeam_channel::tick(CANCEL_POLL_INTERVAL);

        loop {
            if ctx.is_cancelled() {
                tracing::debug!("Command loop for {} cancelled", self.node);
                break;
            }

            select! {
                recv(self.queue) -> command => match command {
                    Ok(LoopCommand::Enqueue(packet)) => self.channel.enqueue(&packet),
                    Ok(LoopCommand::Flush) => {
                        if let Err(e) = self.channel.flush() {
                            self.link_lost(&e.to_string());
                            break;
                        }
                    }
                    Ok(LoopCommand::Shutdown) | Err(_) => break,
                },
                recv(self.inbound) -> bytes => match bytes {
                    Ok(bytes) => self.dispatch(&bytes),
                    Err(_) => {
                        self.link_lost("inbound stream closed");
                        break;
                    }
                },
                recv(tick) -> _ => {}
            }
        }

        let dropped = self.channel.pending_packets();
        if dropped > 0 {
            tracing::debug!("Command loop for {} dropped {} unflushed packets", self.node, dropped);
        }
        self.channel.detach();
        tracing::debug!(
            "Command loop for {} stopped after {} writes",
            self.node,
            self.channel.stats().writes
        );
    }

    fn dispatch(&self, bytes: &[u8]) {
        let packets = match decode_packets(bytes) {
            Ok(packets) => packets,
            Err(e) => {
                tracing::error!("Malformed message from {}: {}", self.node, e);
                return;
            }
        };

        for packet in packets {
            tracing::trace!("{} <- {:?}", self.node, packet.kind());
            match packet.kind() {
                Some(PacketKind::ConfigInitReply) => {
                    let ok = packet.succeeded();
                    self.shared.update(|s| s.init_reply = Some(ok));
                }
                Some(PacketKind::ConfigExitReply) => {
                    let ok = packet.succeeded();
                    self.shared.update(|s| s.exit_reply = Some(ok));
                }
                Some(PacketKind::FrameFinishReply) => {
                    let frame = packet.header.frame_number;
                    match self.shared.update(|s| s.frame_finished(frame)) {
                        FrameAck::Applied => {
                            tracing::debug!("{} finished frame {}", self.node, frame)
                        }
                        FrameAck::Stale => {
                            tracing::warn!("{}: stale finish for frame {} ignored", self.node, frame)
                        }
                        FrameAck::Unknown => tracing::error!(
                            "{}: finish for frame {} which was never started",
                            self.node,
                            frame
                        ),
                    }
                }
                other => tracing::warn!("{}: unexpected {:?} from node", self.node, other),
            }
        }
    }

    fn link_lost(&self, reason: &str) {
        tracing::error!("Lost connection to {}: {}", self.node, reason);
        self.shared.update(NodeSync::mark_link_lost);
    }
}
