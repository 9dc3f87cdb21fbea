//! Device memory abstraction.
//!
//! The protocol engine never touches raw pointers directly. Device addresses
//! travel as the opaque [`DeviceAddr`] newtype, a 32-bit value meaningful
//! only on the target. The single place an address becomes a callable is
//! the platform's [`DeviceMemory::exec`] implementation, which is the
//! protocol's deliberate, unchecked escape into arbitrary machine code.
//!
//! [`EmulatedMemory`] is a host-side arena implementation used by the tests
//! and the loopback demo.

use std::collections::HashMap;

use thiserror::Error;

/// Free/total byte counters per memory class of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// Free bytes in the external (larger/slower) pool.
    pub free_external: u32,
    /// Total bytes in the external pool.
    pub total_external: u32,
    /// Free bytes in the internal (smaller/faster) pool.
    pub free_internal: u32,
    /// Total bytes in the internal pool.
    pub total_internal: u32,
}

/// Memory pool preference for protocol buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPool {
    /// Larger, slower pool (e.g. SPIRAM). Preferred for protocol buffers.
    External,
    /// Smaller, faster on-chip pool. Fallback.
    Internal,
}

/// An address in device memory.
///
/// Deliberately distinct from host pointers: it is a tracking key for the
/// allocation table and, on the Exec path only, an entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddr(u32);

impl DeviceAddr {
    /// The null device address, returned by failed allocations.
    pub const NULL: DeviceAddr = DeviceAddr(0);

    /// Wrap a raw 32-bit device address.
    #[inline]
    pub fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Raw 32-bit value.
    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }

    /// True for the null address.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A raw memory access fell outside addressable device memory.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("memory fault at {addr} ({len} bytes)")]
pub struct MemoryFault {
    /// Faulting address.
    pub addr: DeviceAddr,
    /// Access length.
    pub len: usize,
}

/// Platform memory services consumed by the dispatcher and engine.
pub trait DeviceMemory {
    /// Capability-flagged aligned allocation. `caps` is a platform-defined
    /// bitmask passed through from the host; `align` has already been
    /// validated as a nonzero power of two.
    fn alloc(&mut self, size: u32, caps: u32, align: u32) -> Option<DeviceAddr>;

    /// Release an allocation by its start address.
    fn free(&mut self, addr: DeviceAddr);

    /// Raw copy into device memory. No bounds policy applies here; the
    /// dispatcher has already consulted the tracker (or was told not to).
    fn write(&mut self, addr: DeviceAddr, data: &[u8]) -> Result<(), MemoryFault>;

    /// Raw copy out of device memory.
    fn read(&self, addr: DeviceAddr, out: &mut [u8]) -> Result<(), MemoryFault>;

    /// Jump to `addr` as a no-argument routine and return its result.
    ///
    /// Unchecked by contract: the implementation casts the address to a
    /// callable. Blocks for the full duration of the injected code, with no
    /// timeout, watchdog, or cancellation: a hang here halts the entire
    /// protocol until external reset.
    fn exec(&mut self, addr: DeviceAddr) -> u32;

    /// Free/total bytes per memory class.
    fn heap_stats(&self) -> HeapStats;

    /// Allocate a protocol scratch buffer from the given pool.
    fn alloc_protocol_buffer(&mut self, size: usize, pool: BufferPool) -> Option<Box<[u8]>>;
}

/// Arena-backed host implementation for tests, demos, and protocol bring-up.
///
/// Allocation is a bump allocator over a fixed arena starting at
/// [`EmulatedMemory::BASE`]. `exec` follows an emulation convention: the
/// routine's "return value" is the little-endian u32 stored at the entry
/// address. That is enough to exercise the full write-sync-execute path
/// without generating target machine code.
pub struct EmulatedMemory {
    arena: Vec<u8>,
    brk: usize,
    live: HashMap<u32, u32>,
    fail_buffer_alloc: bool,
}

impl EmulatedMemory {
    /// Base device address of the emulated arena.
    pub const BASE: u32 = 0x4000_0000;

    /// Create an arena of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: vec![0u8; capacity],
            brk: 0,
            live: HashMap::new(),
            fail_buffer_alloc: false,
        }
    }

    /// Make [`DeviceMemory::alloc_protocol_buffer`] fail, to exercise
    /// engine startup failure paths.
    pub fn fail_buffer_alloc(mut self) -> Self {
        self.fail_buffer_alloc = true;
        self
    }

    /// Number of live allocations (leak checking in tests).
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    fn offset_of(&self, addr: DeviceAddr, len: usize) -> Option<usize> {
        let off = addr.value().checked_sub(Self::BASE)? as usize;
        if off.checked_add(len)? <= self.arena.len() {
            Some(off)
        } else {
            None
        }
    }
}

impl DeviceMemory for EmulatedMemory {
    fn alloc(&mut self, size: u32, _caps: u32, align: u32) -> Option<DeviceAddr> {
        if size == 0 {
            return None;
        }
        let align = align as usize;
        let next = Self::BASE as usize + self.brk;
        let aligned = next.checked_add(align - 1)? & !(align - 1);
        let start = aligned - Self::BASE as usize;
        let end = start.checked_add(size as usize)?;
        if end > self.arena.len() {
            return None;
        }
        self.brk = end;
        let addr = Self::BASE + start as u32;
        self.live.insert(addr, size);
        Some(DeviceAddr::new(addr))
    }

    fn free(&mut self, addr: DeviceAddr) {
        // Bump allocator: freeing only drops the bookkeeping entry.
        self.live.remove(&addr.value());
    }

    fn write(&mut self, addr: DeviceAddr, data: &[u8]) -> Result<(), MemoryFault> {
        let off = self.offset_of(addr, data.len()).ok_or(MemoryFault {
            addr,
            len: data.len(),
        })?;
        self.arena[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, addr: DeviceAddr, out: &mut [u8]) -> Result<(), MemoryFault> {
        let off = self.offset_of(addr, out.len()).ok_or(MemoryFault {
            addr,
            len: out.len(),
        })?;
        out.copy_from_slice(&self.arena[off..off + out.len()]);
        Ok(())
    }

    fn exec(&mut self, addr: DeviceAddr) -> u32 {
        // Emulation convention: the u32 at the entry address is the result.
        let mut word = [0u8; 4];
        match self.read(addr, &mut word) {
            Ok(()) => u32::from_le_bytes(word),
            Err(_) => u32::MAX,
        }
    }

    fn heap_stats(&self) -> HeapStats {
        HeapStats {
            free_external: (self.arena.len() - self.brk) as u32,
            total_external: self.arena.len() as u32,
            free_internal: 0,
            total_internal: 0,
        }
    }

    fn alloc_protocol_buffer(&mut self, size: usize, _pool: BufferPool) -> Option<Box<[u8]>> {
        if self.fail_buffer_alloc {
            return None;
        }
        Some(vec![0u8; size].into_boxed_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_addr_display_and_null() {
        assert_eq!(DeviceAddr::new(0x4000_1000).to_string(), "0x40001000");
        assert!(DeviceAddr::NULL.is_null());
        assert!(!DeviceAddr::new(1).is_null());
    }

    #[test]
    fn test_emulated_alloc_respects_alignment() {
        let mut mem = EmulatedMemory::new(4096);

        let a = mem.alloc(10, 0, 4).unwrap();
        let b = mem.alloc(32, 0, 64).unwrap();

        assert_eq!(a.value() % 4, 0);
        assert_eq!(b.value() % 64, 0);
        assert!(b.value() >= a.value() + 10);
    }

    #[test]
    fn test_emulated_alloc_exhaustion() {
        let mut mem = EmulatedMemory::new(128);
        assert!(mem.alloc(100, 0, 4).is_some());
        assert!(mem.alloc(100, 0, 4).is_none());
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut mem = EmulatedMemory::new(1024);
        let addr = mem.alloc(16, 0, 4).unwrap();

        mem.write(addr, b"0123456789abcdef").unwrap();
        let mut out = [0u8; 16];
        mem.read(addr, &mut out).unwrap();
        assert_eq!(&out, b"0123456789abcdef");
    }

    #[test]
    fn test_out_of_arena_access_faults() {
        let mut mem = EmulatedMemory::new(64);
        let bogus = DeviceAddr::new(0x1000);

        assert!(mem.write(bogus, &[0]).is_err());
        let mut out = [0u8; 1];
        assert!(mem.read(bogus, &mut out).is_err());

        // In-arena start but spilling past the end also faults.
        let tail = DeviceAddr::new(EmulatedMemory::BASE + 60);
        assert!(mem.write(tail, &[0u8; 8]).is_err());
    }

    #[test]
    fn test_exec_returns_word_at_entry() {
        let mut mem = EmulatedMemory::new(256);
        let addr = mem.alloc(64, 0, 16).unwrap();
        mem.write(addr, &42u32.to_le_bytes()).unwrap();

        assert_eq!(mem.exec(addr), 42);
    }

    #[test]
    fn test_free_drops_live_entry() {
        let mut mem = EmulatedMemory::new(1024);
        let a = mem.alloc(8, 0, 4).unwrap();
        let b = mem.alloc(8, 0, 4).unwrap();
        assert_eq!(mem.live_allocations(), 2);

        mem.free(a);
        assert_eq!(mem.live_allocations(), 1);
        mem.free(b);
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn test_heap_stats_track_bump() {
        let mut mem = EmulatedMemory::new(1000);
        assert_eq!(mem.heap_stats().free_external, 1000);

        mem.alloc(100, 0, 1).unwrap();
        let stats = mem.heap_stats();
        assert_eq!(stats.total_external, 1000);
        assert_eq!(stats.free_external, 900);
    }
}
