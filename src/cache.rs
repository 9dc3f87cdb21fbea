//! Cache coherency for write-then-execute.
//!
//! WriteMem can inject code that Exec later runs. On targets with split
//! instruction/data caches the two are not automatically coherent, so every
//! write must flush the written bytes out of the data cache and invalidate
//! any stale instruction-cache lines over the same range, unconditionally,
//! since the dispatcher cannot know whether written bytes are code or data.
//!
//! The affected range is the write rounded outward to cache-line granularity:
//! `[floor(A/S)*S, ceil((A+L)/S)*S)` for a write at `A` of `L` bytes with
//! line size `S`.

use thiserror::Error;
use tracing::debug;

/// Fallback cache-line size when the platform query fails.
pub const DEFAULT_CACHE_LINE: u32 = 128;

/// The coherency operation itself failed.
///
/// Only cache consistency is in question; the byte copy that preceded the
/// sync is not rolled back.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("cache writeback/invalidate failed over {addr:#010x}+{len:#x}")]
pub struct CacheSyncError {
    /// Aligned start of the failed range.
    pub addr: u32,
    /// Aligned length of the failed range.
    pub len: u32,
}

/// Platform coherency hooks.
pub trait CacheOps {
    /// Cache-line size in bytes, or `None` if the platform query fails.
    fn line_size(&self) -> Option<u32>;

    /// Combined flush-to-memory plus instruction-cache invalidate over an
    /// already line-aligned range.
    fn writeback_invalidate(&mut self, addr: u32, len: u32) -> Result<(), CacheSyncError>;
}

/// No-op implementation for coherent or emulated targets.
pub struct NoopCache;

impl CacheOps for NoopCache {
    fn line_size(&self) -> Option<u32> {
        None
    }

    fn writeback_invalidate(&mut self, _addr: u32, _len: u32) -> Result<(), CacheSyncError> {
        Ok(())
    }
}

/// Round a byte range outward to cache-line granularity.
///
/// Returns `(aligned_start, aligned_len)`. `line` must be a power of two.
/// Computed in 64-bit then clamped so a range ending at the top of the
/// address space cannot wrap.
pub fn aligned_span(addr: u32, len: u32, line: u32) -> (u32, u32) {
    debug_assert!(line.is_power_of_two());
    let mask = u64::from(line) - 1;
    let start = u64::from(addr) & !mask;
    let end = (u64::from(addr) + u64::from(len) + mask) & !mask;
    let end = end.min(u64::from(u32::MAX) + 1);
    (start as u32, (end - start) as u32)
}

/// Issues coherency operations at cache-line granularity.
pub struct CacheSynchronizer<C: CacheOps> {
    ops: C,
    line: u32,
}

impl<C: CacheOps> CacheSynchronizer<C> {
    /// Query the platform line size once, falling back to
    /// [`DEFAULT_CACHE_LINE`] on failure or a non-power-of-two answer.
    pub fn new(ops: C) -> Self {
        let line = ops
            .line_size()
            .filter(|s| s.is_power_of_two())
            .unwrap_or(DEFAULT_CACHE_LINE);
        Self { ops, line }
    }

    /// Effective cache-line size.
    #[inline]
    pub fn line_size(&self) -> u32 {
        self.line
    }

    /// Access the platform hooks.
    pub fn ops(&self) -> &C {
        &self.ops
    }

    /// Make `len` bytes written at `addr` safe to execute.
    pub fn sync_after_write(&mut self, addr: u32, len: u32) -> Result<(), CacheSyncError> {
        if len == 0 {
            return Ok(());
        }
        let (start, span) = aligned_span(addr, len, self.line);
        debug!(
            addr = format_args!("{addr:#010x}"),
            len = format_args!("{len:#x}"),
            aligned_addr = format_args!("{start:#010x}"),
            aligned_len = format_args!("{span:#x}"),
            "cache sync"
        );
        self.ops.writeback_invalidate(start, span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_span_rounds_outward() {
        // Write at 0x1010 of 0x20 bytes with 128-byte lines covers one line.
        assert_eq!(aligned_span(0x1010, 0x20, 128), (0x1000, 0x80));
        // Crossing a line boundary covers both lines.
        assert_eq!(aligned_span(0x1070, 0x20, 128), (0x1000, 0x100));
        // Already aligned stays put.
        assert_eq!(aligned_span(0x1000, 0x100, 128), (0x1000, 0x100));
    }

    #[test]
    fn test_aligned_span_formula() {
        // [floor(A/S)*S, ceil((A+L)/S)*S)
        for (a, l, s) in [(0x2003u32, 61u32, 64u32), (0x377, 1, 32), (0, 1, 128)] {
            let (start, span) = aligned_span(a, l, s);
            assert_eq!(start, (a / s) * s);
            assert_eq!(start + span, ((a + l).div_ceil(s)) * s);
        }
    }

    #[test]
    fn test_aligned_span_top_of_address_space() {
        let (start, span) = aligned_span(0xFFFF_FFC0, 0x40, 128);
        assert_eq!(start, 0xFFFF_FF80);
        // Clamped: the end cannot wrap past the 32-bit address space.
        assert_eq!(span, 0x80);
    }

    struct Recording {
        line: Option<u32>,
        calls: std::cell::RefCell<Vec<(u32, u32)>>,
        fail: bool,
    }

    impl CacheOps for Recording {
        fn line_size(&self) -> Option<u32> {
            self.line
        }
        fn writeback_invalidate(&mut self, addr: u32, len: u32) -> Result<(), CacheSyncError> {
            self.calls.borrow_mut().push((addr, len));
            if self.fail {
                Err(CacheSyncError { addr, len })
            } else {
                Ok(())
            }
        }
    }

    fn recording(line: Option<u32>, fail: bool) -> Recording {
        Recording {
            line,
            calls: std::cell::RefCell::new(Vec::new()),
            fail,
        }
    }

    #[test]
    fn test_sync_uses_platform_line_size() {
        let mut sync = CacheSynchronizer::new(recording(Some(64), false));
        assert_eq!(sync.line_size(), 64);

        sync.sync_after_write(0x1010, 8).unwrap();
        assert_eq!(sync.ops().calls.borrow()[..], [(0x1000, 0x40)]);
    }

    #[test]
    fn test_line_size_query_failure_falls_back() {
        let sync = CacheSynchronizer::new(recording(None, false));
        assert_eq!(sync.line_size(), DEFAULT_CACHE_LINE);
    }

    #[test]
    fn test_bogus_line_size_falls_back() {
        let sync = CacheSynchronizer::new(recording(Some(96), false));
        assert_eq!(sync.line_size(), DEFAULT_CACHE_LINE);
    }

    #[test]
    fn test_zero_length_write_issues_no_op() {
        let mut sync = CacheSynchronizer::new(recording(Some(128), false));
        sync.sync_after_write(0x1000, 0).unwrap();
        assert!(sync.ops().calls.borrow().is_empty());
    }

    #[test]
    fn test_sync_failure_propagates() {
        let mut sync = CacheSynchronizer::new(recording(Some(128), true));
        let err = sync.sync_after_write(0x1000, 4).unwrap_err();
        assert_eq!(err, CacheSyncError { addr: 0x1000, len: 0x80 });
    }
}
