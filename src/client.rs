//! Host-side commander.
//!
//! Blocking, one-request-one-response client for driving a remote engine.
//! Response parsing is strict: magic, checksum, and command id must all
//! match, and an error envelope surfaces as [`Error::Device`].

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::{DeviceAddr, HeapStats};
use crate::protocol::wire::{self, error_code, flags, CommandId, Header, MEM_FLAG_SKIP_BOUNDS};
use crate::transport::Transport;

/// Device identity and limits, as reported by GetInfo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub protocol_major: u16,
    pub protocol_minor: u16,
    pub max_payload: u32,
    pub cache_line: u32,
    pub table_capacity: u32,
    pub firmware_version: u32,
}

/// Outcome of a WriteMem command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    /// Bytes copied into device memory.
    pub bytes_written: u32,
    /// False if the device reported a cache-sync failure. The copy itself
    /// still happened; executing it is unsafe until re-synced.
    pub cache_synced: bool,
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Blocking protocol client.
pub struct Client<T: Transport> {
    transport: T,
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Consume the client and recover the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Issue one command and return the verified response payload.
    pub fn request(&mut self, cmd: CommandId, payload: &[u8]) -> Result<Bytes> {
        debug!(cmd = ?cmd, len = payload.len(), "request");
        let packet = wire::build_packet(cmd.as_u8(), flags::REQUEST, payload);
        self.transport.write_all(&packet)?;

        let mut header_bytes = [0u8; wire::HEADER_SIZE];
        self.transport.read_exact(&mut header_bytes)?;
        if header_bytes[..2] != wire::MAGIC {
            return Err(Error::Protocol(format!(
                "bad magic {:02x} {:02x}",
                header_bytes[0], header_bytes[1]
            )));
        }
        let header = Header::decode_body(&header_bytes[2..])
            .ok_or_else(|| Error::Protocol("undecodable header".into()))?;

        let mut body = vec![0u8; header.payload_len as usize];
        self.transport.read_exact(&mut body)?;
        let mut checksum = [0u8; wire::CHECKSUM_SIZE];
        self.transport.read_exact(&mut checksum)?;
        let expected = wire::packet_checksum(&header, &body);
        if u16::from_le_bytes(checksum) != expected {
            return Err(Error::Protocol("response checksum mismatch".into()));
        }

        if header.is_error() {
            if body.len() != 4 {
                return Err(Error::Protocol(format!(
                    "error envelope with {}-byte payload",
                    body.len()
                )));
            }
            return Err(Error::Device {
                cmd_id: header.cmd_id,
                code: get_u32(&body, 0),
            });
        }
        if header.cmd_id != cmd.as_u8() {
            return Err(Error::Protocol(format!(
                "response for command {:#04x}, expected {:#04x}",
                header.cmd_id,
                cmd.as_u8()
            )));
        }
        Ok(Bytes::from(body))
    }

    /// Echo probe.
    pub fn ping(&mut self, data: &[u8]) -> Result<Bytes> {
        self.request(CommandId::Ping, data)
    }

    /// Query versions and limits.
    pub fn get_info(&mut self) -> Result<DeviceInfo> {
        let body = self.request(CommandId::GetInfo, &[])?;
        if body.len() != 20 {
            return Err(Error::Protocol(format!("GetInfo returned {} bytes", body.len())));
        }
        Ok(DeviceInfo {
            protocol_major: u16::from_le_bytes([body[0], body[1]]),
            protocol_minor: u16::from_le_bytes([body[2], body[3]]),
            max_payload: get_u32(&body, 4),
            cache_line: get_u32(&body, 8),
            table_capacity: get_u32(&body, 12),
            firmware_version: get_u32(&body, 16),
        })
    }

    /// Allocate `size` bytes on the device.
    ///
    /// The device reports allocation failure inside an OK envelope; it is
    /// surfaced here as [`Error::Device`] all the same.
    pub fn alloc(&mut self, size: u32, caps: u32, alignment: u32) -> Result<DeviceAddr> {
        let mut payload = BytesMut::with_capacity(12);
        payload.put_u32_le(size);
        payload.put_u32_le(caps);
        payload.put_u32_le(alignment);

        let body = self.request(CommandId::Alloc, &payload)?;
        if body.len() != 8 {
            return Err(Error::Protocol(format!("Alloc returned {} bytes", body.len())));
        }
        let addr = get_u32(&body, 0);
        let code = get_u32(&body, 4);
        if code != error_code::OK {
            return Err(Error::Device {
                cmd_id: CommandId::Alloc.as_u8(),
                code,
            });
        }
        Ok(DeviceAddr::new(addr))
    }

    /// Release a device allocation.
    pub fn free(&mut self, addr: DeviceAddr) -> Result<()> {
        self.request(CommandId::Free, &addr.value().to_le_bytes())?;
        Ok(())
    }

    /// Copy `data` into device memory at `addr`.
    pub fn write_mem(&mut self, addr: DeviceAddr, data: &[u8], skip_bounds: bool) -> Result<WriteReport> {
        let mut payload = BytesMut::with_capacity(8 + data.len());
        payload.put_u32_le(addr.value());
        payload.put_u8(if skip_bounds { MEM_FLAG_SKIP_BOUNDS } else { 0 });
        payload.put_bytes(0, 3);
        payload.put_slice(data);

        let body = self.request(CommandId::WriteMem, &payload)?;
        if body.len() != 8 {
            return Err(Error::Protocol(format!("WriteMem returned {} bytes", body.len())));
        }
        Ok(WriteReport {
            bytes_written: get_u32(&body, 0),
            cache_synced: get_u32(&body, 4) == 0,
        })
    }

    /// Copy `size` bytes out of device memory at `addr`.
    pub fn read_mem(&mut self, addr: DeviceAddr, size: u32, skip_bounds: bool) -> Result<Bytes> {
        let mut payload = BytesMut::with_capacity(12);
        payload.put_u32_le(addr.value());
        payload.put_u32_le(size);
        payload.put_u8(if skip_bounds { MEM_FLAG_SKIP_BOUNDS } else { 0 });
        payload.put_bytes(0, 3);

        let body = self.request(CommandId::ReadMem, &payload)?;
        if body.len() != size as usize {
            return Err(Error::Protocol(format!(
                "ReadMem returned {} bytes, asked for {size}",
                body.len()
            )));
        }
        Ok(body)
    }

    /// Call into device memory at `addr` and return the routine's result.
    pub fn exec(&mut self, addr: DeviceAddr, skip_bounds: bool) -> Result<u32> {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32_le(addr.value());
        payload.put_u8(if skip_bounds { MEM_FLAG_SKIP_BOUNDS } else { 0 });
        payload.put_bytes(0, 3);

        let body = self.request(CommandId::Exec, &payload)?;
        if body.len() != 4 {
            return Err(Error::Protocol(format!("Exec returned {} bytes", body.len())));
        }
        Ok(get_u32(&body, 0))
    }

    /// Query device heap counters.
    pub fn heap_info(&mut self) -> Result<HeapStats> {
        let body = self.request(CommandId::HeapInfo, &[])?;
        if body.len() != 16 {
            return Err(Error::Protocol(format!("HeapInfo returned {} bytes", body.len())));
        }
        Ok(HeapStats {
            free_external: get_u32(&body, 0),
            total_external: get_u32(&body, 4),
            free_internal: get_u32(&body, 8),
            total_internal: get_u32(&body, 12),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Scripted transport: bytes to serve in, bytes written out.
    struct MockLink {
        incoming: VecDeque<u8>,
        outgoing: Vec<u8>,
    }

    impl MockLink {
        fn serving(packets: &[Vec<u8>]) -> Self {
            Self {
                incoming: packets.iter().flatten().copied().collect(),
                outgoing: Vec::new(),
            }
        }
    }

    impl Transport for MockLink {
        fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
            for b in buf.iter_mut() {
                *b = self.incoming.pop_front().ok_or(Error::ConnectionClosed)?;
            }
            Ok(())
        }

        fn write_all(&mut self, buf: &[u8]) -> Result<()> {
            self.outgoing.extend_from_slice(buf);
            Ok(())
        }
    }

    #[test]
    fn test_request_sends_framed_packet_and_parses_ok_response() {
        let response = wire::build_packet(CommandId::Ping.as_u8(), flags::RESPONSE_OK, b"pong");
        let mut client = Client::new(MockLink::serving(&[response]));

        let body = client.ping(b"pong").unwrap();
        assert_eq!(&body[..], b"pong");

        let sent = &client.transport.outgoing;
        assert_eq!(
            sent,
            &wire::build_packet(CommandId::Ping.as_u8(), flags::REQUEST, b"pong")
        );
    }

    #[test]
    fn test_error_envelope_becomes_device_error() {
        let response = wire::build_packet(
            CommandId::Free.as_u8(),
            flags::RESPONSE_ERROR,
            &error_code::INVALID_ADDR.to_le_bytes(),
        );
        let mut client = Client::new(MockLink::serving(&[response]));

        let err = client.free(DeviceAddr::new(0x1000)).unwrap_err();
        match err {
            Error::Device { cmd_id, code } => {
                assert_eq!(cmd_id, CommandId::Free.as_u8());
                assert_eq!(code, error_code::INVALID_ADDR);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_corrupted_response_checksum_rejected() {
        let mut response = wire::build_packet(CommandId::Ping.as_u8(), flags::RESPONSE_OK, b"x");
        let last = response.len() - 1;
        response[last] ^= 0xFF;
        let mut client = Client::new(MockLink::serving(&[response]));

        let err = client.ping(b"x").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_in_body_alloc_failure_surfaces() {
        let mut body = Vec::new();
        body.extend(0u32.to_le_bytes());
        body.extend(error_code::ALLOC_FAIL.to_le_bytes());
        let response = wire::build_packet(CommandId::Alloc.as_u8(), flags::RESPONSE_OK, &body);
        let mut client = Client::new(MockLink::serving(&[response]));

        let err = client.alloc(1 << 30, 0, 4).unwrap_err();
        assert!(matches!(
            err,
            Error::Device { code: error_code::ALLOC_FAIL, .. }
        ));
    }

    #[test]
    fn test_mismatched_command_id_rejected() {
        let response = wire::build_packet(CommandId::GetInfo.as_u8(), flags::RESPONSE_OK, b"pong");
        let mut client = Client::new(MockLink::serving(&[response]));

        let err = client.ping(b"pong").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_closed_link_surfaces() {
        let mut client = Client::new(MockLink::serving(&[]));
        let err = client.ping(b"hello").unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }
}
