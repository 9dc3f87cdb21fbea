//! Wire protocol: packet layout, checksums, and the framing state machine.

pub mod framer;
pub mod wire;

pub use framer::{Framer, FramerEvent};
pub use wire::{
    build_packet, flags, packet_checksum, sum16, CommandId, Header, CHECKSUM_SIZE,
    DEFAULT_BUFFER_SIZE, HEADER_SIZE, MAGIC,
};
