//! Command dispatch.
//!
//! Synchronous, single-call-per-command execution: given a command id, the
//! request payload, and a pre-sized output buffer, produce the response
//! payload and an error code. All request/response fields are Little Endian
//! u32 unless noted.
//!
//! | Command  | Request                              | Response                  |
//! |----------|--------------------------------------|---------------------------|
//! | Ping     | arbitrary bytes                      | echo                      |
//! | GetInfo  | empty                                | versions + limits (20 B)  |
//! | Alloc    | size, caps, alignment (12 B)         | address + error (8 B)     |
//! | Free     | address (4 B)                        | status (4 B)              |
//! | WriteMem | address, flags u8, pad[3], data      | bytes written + status    |
//! | ReadMem  | address, size, flags u8, pad[3]      | raw bytes                 |
//! | Exec     | address, flags u8, pad[3]            | return value (4 B)        |
//! | HeapInfo | empty                                | four u32 counters         |
//!
//! Bit 0 of the WriteMem/ReadMem/Exec flag byte skips the allocation-table
//! bounds check, the raw-access escape hatch.

use tracing::{debug, error, warn};

use crate::cache::{CacheOps, CacheSynchronizer};
use crate::memory::{DeviceAddr, DeviceMemory};
use crate::protocol::wire::{
    error_code, CommandId, FIRMWARE_VERSION, MEM_FLAG_SKIP_BOUNDS, PROTOCOL_VERSION_MAJOR,
    PROTOCOL_VERSION_MINOR,
};
use crate::tracker::AllocationTracker;

/// Fixed request sizes (bytes).
const ALLOC_REQ_LEN: usize = 12;
const FREE_REQ_LEN: usize = 4;
const WRITE_REQ_HEADER_LEN: usize = 8;
const READ_REQ_LEN: usize = 12;
const EXEC_REQ_LEN: usize = 8;

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

#[inline]
fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Executes protocol commands against the platform memory services.
pub struct Dispatcher<M: DeviceMemory, C: CacheOps> {
    memory: M,
    tracker: AllocationTracker,
    cache: CacheSynchronizer<C>,
    max_payload: usize,
}

impl<M: DeviceMemory, C: CacheOps> Dispatcher<M, C> {
    /// Create a dispatcher with the default allocation-table capacity.
    pub fn new(memory: M, cache_ops: C, max_payload: usize) -> Self {
        Self {
            memory,
            tracker: AllocationTracker::new(),
            cache: CacheSynchronizer::new(cache_ops),
            max_payload,
        }
    }

    /// Access the platform memory backend.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Access the allocation table.
    pub fn tracker(&self) -> &AllocationTracker {
        &self.tracker
    }

    /// Access the cache synchronizer.
    pub fn cache(&self) -> &CacheSynchronizer<C> {
        &self.cache
    }

    /// Execute one command.
    ///
    /// Returns `(response_len, error_code)`. On a nonzero error code the
    /// caller sends the error envelope and `out` contents are meaningless.
    /// `out` must hold at least the negotiated max payload.
    pub fn execute(&mut self, cmd_id: u8, payload: &[u8], out: &mut [u8]) -> (usize, u32) {
        let Some(cmd) = CommandId::from_u8(cmd_id) else {
            warn!(cmd_id = format_args!("{cmd_id:#04x}"), "unknown command");
            return (0, error_code::UNKNOWN_CMD);
        };

        match cmd {
            CommandId::Ping => {
                out[..payload.len()].copy_from_slice(payload);
                (payload.len(), error_code::OK)
            }
            CommandId::GetInfo => self.get_info(out),
            CommandId::Alloc => self.alloc(payload, out),
            CommandId::Free => self.free(payload, out),
            CommandId::WriteMem => self.write_mem(payload, out),
            CommandId::ReadMem => self.read_mem(payload, out),
            CommandId::Exec => self.exec(payload, out),
            CommandId::HeapInfo => self.heap_info(out),
        }
    }

    fn get_info(&self, out: &mut [u8]) -> (usize, u32) {
        out[0..2].copy_from_slice(&PROTOCOL_VERSION_MAJOR.to_le_bytes());
        out[2..4].copy_from_slice(&PROTOCOL_VERSION_MINOR.to_le_bytes());
        put_u32(out, 4, self.max_payload as u32);
        put_u32(out, 8, self.cache.line_size());
        put_u32(out, 12, self.tracker.capacity() as u32);
        put_u32(out, 16, FIRMWARE_VERSION);
        (20, error_code::OK)
    }

    fn alloc(&mut self, payload: &[u8], out: &mut [u8]) -> (usize, u32) {
        if payload.len() < ALLOC_REQ_LEN {
            error!(len = payload.len(), "alloc: payload too short");
            return (0, error_code::UNKNOWN_CMD);
        }
        let size = read_u32(payload, 0);
        let caps = read_u32(payload, 4);
        let alignment = read_u32(payload, 8);

        debug!(size, caps = format_args!("{caps:#010x}"), alignment, "alloc");

        // Alignment must be a nonzero power of two.
        if alignment == 0 || !alignment.is_power_of_two() {
            error!(alignment, "alloc: invalid alignment");
            put_u32(out, 0, 0);
            put_u32(out, 4, error_code::ALLOC_FAIL);
            return (8, error_code::OK);
        }

        let (addr, code) = match self.memory.alloc(size, caps, alignment) {
            Some(addr) => match self.tracker.add(addr, size) {
                Ok(()) => {
                    debug!(%addr, "alloc: success");
                    (addr, error_code::OK)
                }
                Err(_) => {
                    // Fail closed: no untracked memory may leak.
                    error!(%addr, "alloc: table full, releasing");
                    self.memory.free(addr);
                    (DeviceAddr::NULL, error_code::ALLOC_FAIL)
                }
            },
            None => {
                error!(size, "alloc: allocator refused");
                (DeviceAddr::NULL, error_code::ALLOC_FAIL)
            }
        };

        put_u32(out, 0, addr.value());
        put_u32(out, 4, code);
        (8, error_code::OK)
    }

    fn free(&mut self, payload: &[u8], out: &mut [u8]) -> (usize, u32) {
        if payload.len() < FREE_REQ_LEN {
            return (0, error_code::UNKNOWN_CMD);
        }
        let addr = DeviceAddr::new(read_u32(payload, 0));

        if !self.tracker.remove(addr) {
            warn!(%addr, "free: address not tracked");
            return (0, error_code::INVALID_ADDR);
        }
        self.memory.free(addr);
        debug!(%addr, "free");

        put_u32(out, 0, 0);
        (4, error_code::OK)
    }

    fn write_mem(&mut self, payload: &[u8], out: &mut [u8]) -> (usize, u32) {
        if payload.len() < WRITE_REQ_HEADER_LEN {
            return (0, error_code::UNKNOWN_CMD);
        }
        let addr = DeviceAddr::new(read_u32(payload, 0));
        let mem_flags = payload[4];
        let data = &payload[WRITE_REQ_HEADER_LEN..];
        let skip_bounds = mem_flags & MEM_FLAG_SKIP_BOUNDS != 0;

        if !skip_bounds && !self.tracker.validate(addr, data.len() as u32) {
            warn!(%addr, len = data.len(), "write: out of tracked bounds");
            return (0, error_code::INVALID_ADDR);
        }

        if self.memory.write(addr, data).is_err() {
            error!(%addr, len = data.len(), "write: memory fault");
            return (0, error_code::INVALID_ADDR);
        }

        // The written bytes may be code: make them safe to execute. A sync
        // failure marks the status, but the copy is not rolled back.
        let status = match self.cache.sync_after_write(addr.value(), data.len() as u32) {
            Ok(()) => 0,
            Err(e) => {
                error!(%addr, error = %e, "cache sync failed");
                1
            }
        };

        put_u32(out, 0, data.len() as u32);
        put_u32(out, 4, status);
        (8, error_code::OK)
    }

    fn read_mem(&mut self, payload: &[u8], out: &mut [u8]) -> (usize, u32) {
        if payload.len() < READ_REQ_LEN {
            return (0, error_code::UNKNOWN_CMD);
        }
        let addr = DeviceAddr::new(read_u32(payload, 0));
        let size = read_u32(payload, 4) as usize;
        let mem_flags = payload[8];
        let skip_bounds = mem_flags & MEM_FLAG_SKIP_BOUNDS != 0;

        // The response must fit the TX buffer.
        if size > self.max_payload {
            error!(size, max = self.max_payload, "read: size exceeds max payload");
            return (0, error_code::UNKNOWN_CMD);
        }

        if !skip_bounds && !self.tracker.validate(addr, size as u32) {
            warn!(%addr, size, "read: out of tracked bounds");
            return (0, error_code::INVALID_ADDR);
        }

        if self.memory.read(addr, &mut out[..size]).is_err() {
            error!(%addr, size, "read: memory fault");
            return (0, error_code::INVALID_ADDR);
        }

        (size, error_code::OK)
    }

    fn exec(&mut self, payload: &[u8], out: &mut [u8]) -> (usize, u32) {
        if payload.len() < EXEC_REQ_LEN {
            return (0, error_code::UNKNOWN_CMD);
        }
        let addr = DeviceAddr::new(read_u32(payload, 0));
        let mem_flags = payload[4];
        let skip_bounds = mem_flags & MEM_FLAG_SKIP_BOUNDS != 0;

        // At least one byte of the entry point must lie in a tracked
        // allocation.
        if !skip_bounds && !self.tracker.validate(addr, 1) {
            warn!(%addr, "exec: address not in a tracked allocation");
            return (0, error_code::INVALID_ADDR);
        }

        debug!(%addr, "exec: entering injected code");
        // Blocks for the full duration of the injected code; no timeout or
        // cancellation exists by contract.
        let ret = self.memory.exec(addr);
        debug!(%addr, ret, "exec: returned");

        put_u32(out, 0, ret);
        (4, error_code::OK)
    }

    fn heap_info(&self, out: &mut [u8]) -> (usize, u32) {
        let stats = self.memory.heap_stats();
        put_u32(out, 0, stats.free_external);
        put_u32(out, 4, stats.total_external);
        put_u32(out, 8, stats.free_internal);
        put_u32(out, 12, stats.total_internal);
        (16, error_code::OK)
    }
}
