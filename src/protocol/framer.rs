//! Packet framing state machine.
//!
//! Drives the receive side of the protocol over a blocking [`Transport`]:
//!
//! ```text
//! Sync1 → Sync2 → ReadHeader → ReadPayload → ReadChecksum → Verify
//! ```
//!
//! Corruption never kills the link: a bad magic byte silently restarts the
//! scan, an oversized declared length drains exactly `len + 2` bytes in
//! bounded chunks to preserve alignment (no response is emitted), and a
//! checksum mismatch is answered with an error response before scanning
//! resumes. Retransmission is the host's responsibility.

use tracing::{debug, error, warn};

use super::wire::{self, error_code, flags, Header, CHECKSUM_SIZE};
use crate::error::Result;
use crate::transport::Transport;

/// Chunk size used to drain oversized packets without large stack buffers.
const DRAIN_CHUNK: usize = 256;

/// Outcome of one pass of the receive state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerEvent {
    /// A verified request. The payload occupies `rx[..len]`.
    Request { cmd_id: u8, flags: u8, len: usize },
    /// Checksum failed; an error response was already sent.
    ChecksumMismatch { cmd_id: u8 },
    /// Declared length exceeded the negotiated max; the packet was drained
    /// silently and no response was sent.
    Oversized { declared: u32 },
}

/// Blocking packet framer owning the transport.
pub struct Framer<T: Transport> {
    transport: T,
    max_payload: usize,
}

impl<T: Transport> Framer<T> {
    /// Create a framer bounded to the negotiated max payload.
    pub fn new(transport: T, max_payload: usize) -> Self {
        Self {
            transport,
            max_payload,
        }
    }

    /// Negotiated max payload this framer accepts.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Access the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.transport.read_exact(&mut b)?;
        Ok(b[0])
    }

    /// Scan the stream for the two-byte magic sentinel.
    ///
    /// Explicit bounded state machine: a mismatch in `Sync2` re-tests the
    /// offending byte as a fresh `Sync1` candidate, so `A5 A5 5A` still
    /// locks on.
    fn sync(&mut self) -> Result<()> {
        enum Sync {
            One,
            Two,
        }
        let mut state = Sync::One;
        loop {
            let byte = self.read_u8()?;
            state = match state {
                Sync::One if byte == wire::MAGIC[0] => Sync::Two,
                Sync::One => Sync::One,
                Sync::Two if byte == wire::MAGIC[1] => return Ok(()),
                Sync::Two if byte == wire::MAGIC[0] => Sync::Two,
                Sync::Two => Sync::One,
            };
        }
    }

    /// Consume exactly `count` bytes in bounded chunks.
    fn drain(&mut self, mut count: usize) -> Result<()> {
        let mut chunk = [0u8; DRAIN_CHUNK];
        while count > 0 {
            let n = count.min(DRAIN_CHUNK);
            self.transport.read_exact(&mut chunk[..n])?;
            count -= n;
        }
        Ok(())
    }

    /// Block until the next packet boundary and classify what arrived.
    ///
    /// The payload of a `Request` event is left in `rx[..len]`; `rx` must be
    /// at least `max_payload` bytes.
    pub fn read_event(&mut self, rx: &mut [u8]) -> Result<FramerEvent> {
        debug_assert!(rx.len() >= self.max_payload);

        self.sync()?;

        let mut body = [0u8; 6];
        self.transport.read_exact(&mut body)?;
        let header = Header::decode_body(&body).expect("body buffer is 6 bytes");

        if header.payload_len as usize > self.max_payload {
            error!(
                declared = header.payload_len,
                max = self.max_payload,
                "payload too large, draining to resync"
            );
            // Payload plus the trailing checksum, to preserve alignment.
            self.drain(header.payload_len as usize + CHECKSUM_SIZE)?;
            warn!(
                drained = header.payload_len as usize + CHECKSUM_SIZE,
                "drained oversized packet"
            );
            return Ok(FramerEvent::Oversized {
                declared: header.payload_len,
            });
        }

        let len = header.payload_len as usize;
        if len > 0 {
            self.transport.read_exact(&mut rx[..len])?;
        }

        let mut checksum_bytes = [0u8; CHECKSUM_SIZE];
        self.transport.read_exact(&mut checksum_bytes)?;
        let received = u16::from_le_bytes(checksum_bytes);
        let calculated = wire::packet_checksum(&header, &rx[..len]);

        if calculated != received {
            error!(
                calculated = format_args!("{calculated:04X}"),
                received = format_args!("{received:04X}"),
                "checksum mismatch"
            );
            self.send_error(header.cmd_id, error_code::CHECKSUM)?;
            return Ok(FramerEvent::ChecksumMismatch {
                cmd_id: header.cmd_id,
            });
        }

        debug!(cmd_id = format_args!("{:#04x}", header.cmd_id), len, "request framed");
        Ok(FramerEvent::Request {
            cmd_id: header.cmd_id,
            flags: header.flags,
            len,
        })
    }

    /// Encode and send a response packet, recomputing the checksum over the
    /// full outgoing header and payload.
    pub fn send_response(&mut self, cmd_id: u8, flags: u8, payload: &[u8]) -> Result<()> {
        let header = Header::new(cmd_id, flags, payload.len() as u32);
        self.transport.write_all(&header.encode())?;
        if !payload.is_empty() {
            self.transport.write_all(payload)?;
        }
        let checksum = wire::packet_checksum(&header, payload);
        self.transport.write_all(&checksum.to_le_bytes())
    }

    /// Send an error response: 4-byte numeric code, error flag set.
    pub fn send_error(&mut self, cmd_id: u8, code: u32) -> Result<()> {
        self.send_response(cmd_id, flags::RESPONSE_ERROR, &code.to_le_bytes())
    }
}
