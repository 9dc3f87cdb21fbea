//! Wire format encoding and decoding.
//!
//! Implements the 8-byte packet header followed by payload and checksum:
//! ```text
//! ┌───────────┬────────┬────────┬───────────┬─────────┬───────────┐
//! │ Magic     │ Cmd ID │ Flags  │ Length    │ Payload │ Checksum  │
//! │ A5 5A     │ 1 byte │ 1 byte │ u32 LE    │ N bytes │ u16 LE    │
//! └───────────┴────────┴────────┴───────────┴─────────┴───────────┘
//! ```
//!
//! All multi-byte integers are Little Endian. The checksum is an additive
//! 16-bit wraparound sum over the 8 header bytes and all payload bytes,
//! computed identically by sender and verifier. It is non-cryptographic by
//! contract; hosts depend on exact reproduction of this sum.

/// Fixed magic sentinel pair shared by both ends.
pub const MAGIC: [u8; 2] = [0xA5, 0x5A];

/// Header size in bytes (fixed, exactly 8, magic included).
pub const HEADER_SIZE: usize = 8;

/// Trailing checksum size in bytes.
pub const CHECKSUM_SIZE: usize = 2;

/// Default protocol buffer size (1 MiB payload plus overhead).
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024 + 1024;

/// Protocol version, incremented on breaking changes.
pub const PROTOCOL_VERSION_MAJOR: u16 = 1;
/// Protocol minor version.
pub const PROTOCOL_VERSION_MINOR: u16 = 0;

/// Firmware version advertised by GetInfo, packed as `major<<16 | minor<<8 | patch`.
pub const FIRMWARE_VERSION: u32 = 0x0000_0100;

/// Bit 0 of a WriteMem/ReadMem/Exec request flag byte: bypass the
/// allocation-table bounds check. Raw-access escape hatch; the correctness
/// burden shifts entirely to the caller.
pub const MEM_FLAG_SKIP_BOUNDS: u8 = 0b0000_0001;

/// Packet flag constants.
pub mod flags {
    /// Host-to-device request.
    pub const REQUEST: u8 = 0x00;
    /// Successful response.
    pub const RESPONSE_OK: u8 = 0x01;
    /// Error response; payload is exactly 4 bytes holding a u32 error code.
    pub const RESPONSE_ERROR: u8 = 0x02;

    /// Check whether a response flags byte signals an error.
    #[inline]
    pub fn is_error(flags: u8) -> bool {
        flags == RESPONSE_ERROR
    }
}

/// Numeric error codes carried in error responses.
pub mod error_code {
    /// Success.
    pub const OK: u32 = 0x00;
    /// Checksum mismatch on a received packet.
    pub const CHECKSUM: u32 = 0x01;
    /// Unknown command id, or a malformed/too-short payload.
    pub const UNKNOWN_CMD: u32 = 0x02;
    /// Allocation failure (allocator refusal or table exhaustion).
    pub const ALLOC_FAIL: u32 = 0x03;
    /// Address rejected by the allocation tracker.
    pub const INVALID_ADDR: u32 = 0x04;
}

/// The eight protocol commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    /// Echo the payload verbatim.
    Ping = 0x01,
    /// Protocol/device capability report.
    GetInfo = 0x02,
    /// Capability-flagged aligned allocation, registered with the tracker.
    Alloc = 0x10,
    /// Release a tracked allocation.
    Free = 0x11,
    /// Copy payload bytes into device memory, then synchronize caches.
    WriteMem = 0x20,
    /// Copy device memory into the response.
    ReadMem = 0x21,
    /// Jump to an address as a no-argument routine and return its result.
    Exec = 0x30,
    /// Free/total bytes per memory class.
    HeapInfo = 0x40,
}

impl CommandId {
    /// Decode a wire command id.
    pub fn from_u8(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(Self::Ping),
            0x02 => Some(Self::GetInfo),
            0x10 => Some(Self::Alloc),
            0x11 => Some(Self::Free),
            0x20 => Some(Self::WriteMem),
            0x21 => Some(Self::ReadMem),
            0x30 => Some(Self::Exec),
            0x40 => Some(Self::HeapInfo),
            _ => None,
        }
    }

    /// Wire value of this command.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Command identifier.
    pub cmd_id: u8,
    /// Flags byte (see [`flags`]).
    pub flags: u8,
    /// Payload length in bytes.
    pub payload_len: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(cmd_id: u8, flags: u8, payload_len: u32) -> Self {
        Self {
            cmd_id,
            flags,
            payload_len,
        }
    }

    /// Encode the full on-wire header, magic included (Little Endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = MAGIC[0];
        buf[1] = MAGIC[1];
        buf[2] = self.cmd_id;
        buf[3] = self.flags;
        buf[4..8].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    /// Decode the 6 header bytes that follow the magic sentinel.
    ///
    /// Returns `None` if the buffer is too short.
    pub fn decode_body(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE - MAGIC.len() {
            return None;
        }
        Some(Self {
            cmd_id: buf[0],
            flags: buf[1],
            payload_len: u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
        })
    }

    /// Check if this header signals an error response.
    #[inline]
    pub fn is_error(&self) -> bool {
        flags::is_error(self.flags)
    }
}

/// Additive 16-bit wraparound sum over a byte slice.
#[inline]
pub fn sum16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |sum, &b| sum.wrapping_add(b as u16))
}

/// Checksum over a full packet: header bytes (magic included) plus payload.
pub fn packet_checksum(header: &Header, payload: &[u8]) -> u16 {
    sum16(&header.encode()).wrapping_add(sum16(payload))
}

/// Build a complete wire packet: header, payload, trailing checksum.
pub fn build_packet(cmd_id: u8, flags: u8, payload: &[u8]) -> Vec<u8> {
    let header = Header::new(cmd_id, flags, payload.len() as u32);
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CHECKSUM_SIZE);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&packet_checksum(&header, payload).to_le_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_layout() {
        let header = Header::new(0x20, flags::REQUEST, 0x01020304);
        let bytes = header.encode();

        assert_eq!(bytes[0], 0xA5);
        assert_eq!(bytes[1], 0x5A);
        assert_eq!(bytes[2], 0x20);
        assert_eq!(bytes[3], 0x00);

        // Length: 0x01020304 in LE
        assert_eq!(bytes[4], 0x04);
        assert_eq!(bytes[5], 0x03);
        assert_eq!(bytes[6], 0x02);
        assert_eq!(bytes[7], 0x01);
    }

    #[test]
    fn test_header_decode_body_roundtrip() {
        let original = Header::new(0x30, flags::RESPONSE_OK, 42);
        let encoded = original.encode();
        let decoded = Header::decode_body(&encoded[2..]).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_decode_too_short() {
        assert!(Header::decode_body(&[0u8; 5]).is_none());
    }

    #[test]
    fn test_sum16_wraps() {
        let data = vec![0xFFu8; 300]; // 300 * 255 = 76500, wraps past u16::MAX
        assert_eq!(sum16(&data), (300u32 * 255 % 65536) as u16);
    }

    #[test]
    fn test_packet_checksum_covers_header_and_payload() {
        let header = Header::new(0x01, flags::REQUEST, 2);
        let sum = packet_checksum(&header, &[0x10, 0x20]);

        let mut expected = 0u16;
        for b in header.encode() {
            expected = expected.wrapping_add(b as u16);
        }
        expected = expected.wrapping_add(0x10).wrapping_add(0x20);
        assert_eq!(sum, expected);
    }

    #[test]
    fn test_build_packet_shape() {
        let packet = build_packet(0x01, flags::REQUEST, b"hi");

        assert_eq!(packet.len(), HEADER_SIZE + 2 + CHECKSUM_SIZE);
        assert_eq!(&packet[..2], &MAGIC);
        assert_eq!(&packet[8..10], b"hi");

        let header = Header::decode_body(&packet[2..8]).unwrap();
        assert_eq!(header.payload_len, 2);
        let checksum = u16::from_le_bytes([packet[10], packet[11]]);
        assert_eq!(checksum, packet_checksum(&header, b"hi"));
    }

    #[test]
    fn test_command_id_roundtrip() {
        for id in [0x01, 0x02, 0x10, 0x11, 0x20, 0x21, 0x30, 0x40] {
            let cmd = CommandId::from_u8(id).unwrap();
            assert_eq!(cmd.as_u8(), id);
        }
        assert!(CommandId::from_u8(0x00).is_none());
        assert!(CommandId::from_u8(0xFF).is_none());
    }

    #[test]
    fn test_flags_is_error() {
        assert!(flags::is_error(flags::RESPONSE_ERROR));
        assert!(!flags::is_error(flags::RESPONSE_OK));
        assert!(!flags::is_error(flags::REQUEST));
    }
}
