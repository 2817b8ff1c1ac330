//! Networking layer
//!
//! - [`packet`] - The fixed command envelope and its byte encoding
//! - [`channel`] - Buffered outbound channel with explicit flush
//! - [`transport`] - Trait seams to the transport and the process launcher
//! - [`loopback`] - In-process transport used by tests and the demo binary

pub mod channel;
pub mod loopback;
pub mod packet;
pub mod transport;

pub use channel::{ChannelStats, CommandChannel, DEFAULT_MAX_WRITE_SIZE};
pub use loopback::{ClientBehavior, LoopbackConnection, LoopbackNetwork};
pub use packet::{decode_packets, Packet, PacketHeader, PacketKind, HEADER_SIZE};
pub use transport::{Connection, ConnectionDescription, ConnectionKind, Launcher, Transport};
