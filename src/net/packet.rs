//! Command-dispatch envelope
//!
//! Every packet is a fixed 32-byte [`PacketHeader`] followed by an opaque
//! payload of `payload_len` bytes. Headers are plain-old-data and are
//! written in native byte order; all processes of a cluster are expected to
//! share one architecture.

use crate::error::{LockstepError, Result};
use bytemuck::{Pod, Zeroable};

/// Size of an encoded header in bytes
pub const HEADER_SIZE: usize = std::mem::size_of::<PacketHeader>();

/// Kind of command carried by a packet
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Initialize the remote node (`id` = init id)
    ConfigInit = 1,
    /// Init acknowledgement (`result` = success)
    ConfigInitReply = 2,
    /// Exit the remote node
    ConfigExit = 3,
    /// Exit acknowledgement (`result` = success)
    ConfigExitReply = 4,
    /// Start of a frame's task packets
    FrameStart = 5,
    /// End of a frame's task packets
    FrameTasksFinish = 6,
    /// Draw finished for a node without a last draw pipe
    FrameDrawFinish = 7,
    /// Request to finish a frame
    FrameFinish = 8,
    /// Frame completion notice
    FrameFinishReply = 9,
    /// Application task with opaque payload
    Task = 10,
}

impl PacketKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(PacketKind::ConfigInit),
            2 => Some(PacketKind::ConfigInitReply),
            3 => Some(PacketKind::ConfigExit),
            4 => Some(PacketKind::ConfigExitReply),
            5 => Some(PacketKind::FrameStart),
            6 => Some(PacketKind::FrameTasksFinish),
            7 => Some(PacketKind::FrameDrawFinish),
            8 => Some(PacketKind::FrameFinish),
            9 => Some(PacketKind::FrameFinishReply),
            10 => Some(PacketKind::Task),
            _ => None,
        }
    }

    /// Whether this kind travels from a node back to the coordinator
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            PacketKind::ConfigInitReply | PacketKind::ConfigExitReply | PacketKind::FrameFinishReply
        )
    }
}

/// Fixed envelope preceding every payload
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct PacketHeader {
    pub kind: u32,
    /// Configuration session the packet belongs to
    pub session_id: u32,
    /// Target object (the node) within the session
    pub object_id: u32,
    /// Frame identifier or init identifier
    pub id: u32,
    pub frame_number: u32,
    /// Non-zero for success in replies
    pub result: u32,
    pub payload_len: u32,
    pub reserved: u32,
}

impl PacketHeader {
    pub fn new(kind: PacketKind) -> Self {
        Self {
            kind: kind as u32,
            ..Self::default()
        }
    }

    pub fn packet_kind(&self) -> Option<PacketKind> {
        PacketKind::from_u32(self.kind)
    }
}

/// A header plus its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(kind: PacketKind) -> Self {
        Self {
            header: PacketHeader::new(kind),
            payload: Vec::new(),
        }
    }

    pub fn config_init(init_id: u32, frame_number: u32) -> Self {
        let mut packet = Self::new(PacketKind::ConfigInit);
        packet.header.id = init_id;
        packet.header.frame_number = frame_number;
        packet
    }

    pub fn config_init_reply(success: bool) -> Self {
        let mut packet = Self::new(PacketKind::ConfigInitReply);
        packet.header.result = success as u32;
        packet
    }

    pub fn config_exit() -> Self {
        Self::new(PacketKind::ConfigExit)
    }

    pub fn config_exit_reply(success: bool) -> Self {
        let mut packet = Self::new(PacketKind::ConfigExitReply);
        packet.header.result = success as u32;
        packet
    }

    /// A frame-scoped packet (`FrameStart`, `FrameTasksFinish`, `FrameDrawFinish`, `FrameFinish`)
    pub fn frame(kind: PacketKind, frame_id: u32, frame_number: u32) -> Self {
        let mut packet = Self::new(kind);
        packet.header.id = frame_id;
        packet.header.frame_number = frame_number;
        packet
    }

    pub fn frame_finish_reply(frame_number: u32) -> Self {
        let mut packet = Self::new(PacketKind::FrameFinishReply);
        packet.header.frame_number = frame_number;
        packet.header.result = 1;
        packet
    }

    /// An application task carrying a pre-serialized payload
    pub fn task(payload: Vec<u8>) -> Self {
        Self::new(PacketKind::Task).with_payload(payload)
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn kind(&self) -> Option<PacketKind> {
        self.header.packet_kind()
    }

    pub fn succeeded(&self) -> bool {
        self.header.result != 0
    }

    /// Payload interpreted as UTF-8, if valid
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Bytes this packet occupies on the wire
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Append the encoded packet to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        encode_parts(self.header, &self.payload, buf);
    }
}

/// Append `header` and `payload` to `buf`, fixing up `payload_len`
pub fn encode_parts(mut header: PacketHeader, payload: &[u8], buf: &mut Vec<u8>) {
    header.payload_len = payload.len() as u32;
    buf.reserve(HEADER_SIZE + payload.len());
    buf.extend_from_slice(bytemuck::bytes_of(&header));
    buf.extend_from_slice(payload);
}

/// Decode every packet contained in `bytes`
///
/// A transport write may carry several packets; a truncated trailing packet
/// or an unknown kind is an error.
pub fn decode_packets(bytes: &[u8]) -> Result<Vec<Packet>> {
    let mut packets = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let remaining = bytes.len() - offset;
        if remaining < HEADER_SIZE {
            return Err(LockstepError::Serialization(format!(
                "truncated header: {} of {} bytes",
                remaining, HEADER_SIZE
            )));
        }

        let header: PacketHeader =
            bytemuck::pod_read_unaligned(&bytes[offset..offset + HEADER_SIZE]);
        if header.packet_kind().is_none() {
            return Err(LockstepError::Serialization(format!(
                "unknown packet kind {}",
                header.kind
            )));
        }

        let start = offset + HEADER_SIZE;
        let end = start + header.payload_len as usize;
        if end > bytes.len() {
            return Err(LockstepError::Serialization(format!(
                "truncated payload: expected {} bytes, {} available",
                header.payload_len,
                bytes.len() - start
            )));
        }

        packets.push(Packet {
            header,
            payload: bytes[start..end].to_vec(),
        });
        offset = end;
    }

    Ok(packets)
}
