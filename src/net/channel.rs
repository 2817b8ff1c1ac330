//! Buffered outbound command channel
//!
//! A [`CommandChannel`] accumulates encoded packets destined for one remote
//! node and transmits them only on an explicit `flush`. This lets a node
//! batch a whole frame's commands into a single transport write and keeps
//! them causally grouped on the wire.

use super::packet::{encode_parts, Packet, PacketHeader};
use super::transport::Connection;
use crate::error::{LockstepError, Result};
use bytemuck::Pod;
use std::sync::Arc;

/// Default upper bound for a single transport write
pub const DEFAULT_MAX_WRITE_SIZE: usize = 64 * 1024;

/// Statistics for channel operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Packets transmitted
    pub packets_sent: u64,
    /// Bytes transmitted
    pub bytes_sent: u64,
    /// Transport writes performed
    pub writes: u64,
    /// Flushes that failed and dropped their buffer
    pub failed_flushes: u64,
    /// Largest number of packets transmitted by one flush
    pub largest_batch: usize,
}

/// Outbound packet buffer for one node connection
pub struct CommandChannel {
    connection: Option<Arc<dyn Connection>>,
    buffer: Vec<u8>,
    /// End offset of every buffered packet, so writes split on packet boundaries
    boundaries: Vec<usize>,
    max_write_size: usize,
    stats: ChannelStats,
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("attached", &self.connection.is_some())
            .field("pending_packets", &self.boundaries.len())
            .field("pending_bytes", &self.buffer.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WRITE_SIZE)
    }
}

impl CommandChannel {
    /// Create a detached channel
    pub fn new(max_write_size: usize) -> Self {
        Self {
            connection: None,
            buffer: Vec::new(),
            boundaries: Vec::new(),
            max_write_size: max_write_size.max(1),
            stats: ChannelStats::default(),
        }
    }

    /// Route future flushes to `connection`
    pub fn attach(&mut self, connection: Arc<dyn Connection>) {
        self.connection = Some(connection);
    }

    /// Drop the connection and any unsent packets
    pub fn detach(&mut self) -> Option<Arc<dyn Connection>> {
        self.clear();
        self.connection.take()
    }

    pub fn is_attached(&self) -> bool {
        self.connection.is_some()
    }

    /// Buffer a packet without transmitting it
    pub fn enqueue(&mut self, packet: &Packet) {
        packet.encode_into(&mut self.buffer);
        self.boundaries.push(self.buffer.len());
    }

    /// Buffer a header with an attached byte payload
    pub fn enqueue_bytes(&mut self, header: PacketHeader, payload: &[u8]) {
        encode_parts(header, payload, &mut self.buffer);
        self.boundaries.push(self.buffer.len());
    }

    /// Buffer a header with a string payload
    pub fn enqueue_str(&mut self, header: PacketHeader, payload: &str) {
        self.enqueue_bytes(header, payload.as_bytes());
    }

    /// Buffer a header with a typed sequence payload
    pub fn enqueue_slice<T: Pod>(&mut self, header: PacketHeader, items: &[T]) {
        self.enqueue_bytes(header, bytemuck::cast_slice(items));
    }

    pub fn pending_packets(&self) -> usize {
        self.boundaries.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boundaries.is_empty()
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Transmit every buffered packet and clear the buffer
    ///
    /// Packets are sent in enqueue order, in as few writes as the write size
    /// limit allows. A failed write drops the remaining buffer; the channel
    /// never retries.
    pub fn flush(&mut self) -> Result<()> {
        if self.boundaries.is_empty() {
            return Ok(());
        }

        let Some(connection) = self.connection.clone() else {
            self.stats.failed_flushes += 1;
            let dropped = self.boundaries.len();
            self.clear();
            return Err(LockstepError::ConnectionFailure(format!(
                "no connection attached, {} packets dropped",
                dropped
            )));
        };

        let result = self.write_batches(connection.as_ref());
        match &result {
            Ok(()) => {
                self.stats.packets_sent += self.boundaries.len() as u64;
                self.stats.largest_batch = self.stats.largest_batch.max(self.boundaries.len());
            }
            Err(e) => {
                self.stats.failed_flushes += 1;
                tracing::warn!("Flush to {} failed: {}", connection.peer(), e);
            }
        }
        self.clear();
        result
    }

    fn write_batches(&mut self, connection: &dyn Connection) -> Result<()> {
        let mut start = 0;
        let mut end = 0;
        for &boundary in &self.boundaries {
            if boundary - start > self.max_write_size && end > start {
                Self::write(connection, &self.buffer[start..end], &mut self.stats)?;
                start = end;
            }
            end = boundary;
        }
        if end > start {
            Self::write(connection, &self.buffer[start..end], &mut self.stats)?;
        }
        Ok(())
    }

    fn write(connection: &dyn Connection, bytes: &[u8], stats: &mut ChannelStats) -> Result<()> {
        tracing::trace!("Writing {} bytes to {}", bytes.len(), connection.peer());
        connection.send(bytes).map_err(|e| match e {
            LockstepError::ConnectionFailure(_) => e,
            other => LockstepError::ConnectionFailure(format!(
                "write to {} failed: {}",
                connection.peer(),
                other
            )),
        })?;
        stats.writes += 1;
        stats.bytes_sent += bytes.len() as u64;
        Ok(())
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.boundaries.clear();
    }
}
