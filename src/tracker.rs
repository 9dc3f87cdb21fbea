//! Allocation tracking for bounds validation.
//!
//! A fixed-capacity table mapping device addresses to sizes. Every successful
//! Alloc registers here; WriteMem/ReadMem/Exec are validated against the
//! table unless the request sets the skip-bounds flag. Table exhaustion is a
//! hard failure: the caller must release the just-obtained memory so no
//! untracked allocation leaks.
//!
//! Entries are assumed disjoint: the tracker records what it is told and does
//! not detect overlapping ranges handed out by the underlying allocator.

use thiserror::Error;

use crate::memory::DeviceAddr;

/// Default table capacity.
pub const MAX_ALLOCATIONS: usize = 64;

/// The allocation table has no free slot.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("allocation table full")]
pub struct TrackerFull;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    addr: u32,
    size: u32,
    in_use: bool,
}

/// Fixed-capacity allocation table.
#[derive(Debug)]
pub struct AllocationTracker {
    slots: Vec<Slot>,
}

impl AllocationTracker {
    /// Create a tracker with the default capacity of [`MAX_ALLOCATIONS`].
    pub fn new() -> Self {
        Self::with_capacity(MAX_ALLOCATIONS)
    }

    /// Create a tracker with a custom slot count.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![Slot::default(); capacity],
        }
    }

    /// Number of slots in the table.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    /// True if no entries are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register an allocation. Linear scan for a free slot.
    ///
    /// On `TrackerFull` the caller must release the memory it just obtained.
    pub fn add(&mut self, addr: DeviceAddr, size: u32) -> Result<(), TrackerFull> {
        for slot in &mut self.slots {
            if !slot.in_use {
                *slot = Slot {
                    addr: addr.value(),
                    size,
                    in_use: true,
                };
                return Ok(());
            }
        }
        Err(TrackerFull)
    }

    /// Remove the entry whose start address matches exactly.
    ///
    /// Returns `false` if no such entry exists.
    pub fn remove(&mut self, addr: DeviceAddr) -> bool {
        for slot in &mut self.slots {
            if slot.in_use && slot.addr == addr.value() {
                slot.in_use = false;
                return true;
            }
        }
        false
    }

    /// Exact start-address match. Gates Free and Exec's starting address.
    pub fn contains(&self, addr: DeviceAddr) -> bool {
        self.slots
            .iter()
            .any(|s| s.in_use && s.addr == addr.value())
    }

    /// True iff `[addr, addr + size)` lies fully within one entry's range.
    ///
    /// Rejects queries whose own range overflows the address space, and
    /// skips any stored entry whose range would overflow rather than
    /// mis-evaluating it.
    pub fn validate(&self, addr: DeviceAddr, size: u32) -> bool {
        let start = addr.value();
        let Some(end) = start.checked_add(size) else {
            return false;
        };

        self.slots.iter().any(|slot| {
            if !slot.in_use {
                return false;
            }
            let Some(slot_end) = slot.addr.checked_add(slot.size) else {
                return false;
            };
            start >= slot.addr && start < slot_end && end <= slot_end
        })
    }
}

impl Default for AllocationTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(a: u32) -> DeviceAddr {
        DeviceAddr::new(a)
    }

    #[test]
    fn test_add_contains_remove() {
        let mut tracker = AllocationTracker::new();

        tracker.add(addr(0x1000), 256).unwrap();
        assert!(tracker.contains(addr(0x1000)));
        assert_eq!(tracker.len(), 1);

        assert!(tracker.remove(addr(0x1000)));
        assert!(!tracker.contains(addr(0x1000)));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_remove_requires_exact_start_address() {
        let mut tracker = AllocationTracker::new();
        tracker.add(addr(0x1000), 256).unwrap();

        // Inside the range but not the start: not removable.
        assert!(!tracker.remove(addr(0x1010)));
        assert!(tracker.contains(addr(0x1000)));
    }

    #[test]
    fn test_double_remove_fails() {
        let mut tracker = AllocationTracker::new();
        tracker.add(addr(0x2000), 64).unwrap();

        assert!(tracker.remove(addr(0x2000)));
        assert!(!tracker.remove(addr(0x2000)));
    }

    #[test]
    fn test_table_full_after_capacity_adds() {
        let mut tracker = AllocationTracker::with_capacity(4);

        for i in 0..4 {
            tracker.add(addr(0x1000 + i * 0x100), 16).unwrap();
        }
        assert_eq!(tracker.add(addr(0x9000), 16), Err(TrackerFull));

        // Freeing one slot makes room again.
        assert!(tracker.remove(addr(0x1000)));
        tracker.add(addr(0x9000), 16).unwrap();
    }

    #[test]
    fn test_validate_full_containment() {
        let mut tracker = AllocationTracker::new();
        tracker.add(addr(0x1000), 256).unwrap();

        assert!(tracker.validate(addr(0x1000), 256));
        assert!(tracker.validate(addr(0x1080), 128));
        assert!(tracker.validate(addr(0x10FF), 1));

        // One byte past the end in either direction.
        assert!(!tracker.validate(addr(0x1000), 257));
        assert!(!tracker.validate(addr(0x0FFF), 2));
        assert!(!tracker.validate(addr(0x1100), 1));
        // Untracked region entirely.
        assert!(!tracker.validate(addr(0x5000), 4));
    }

    #[test]
    fn test_validate_does_not_span_entries() {
        let mut tracker = AllocationTracker::new();
        // Adjacent entries; a range crossing the seam is not inside ONE entry.
        tracker.add(addr(0x1000), 0x100).unwrap();
        tracker.add(addr(0x1100), 0x100).unwrap();

        assert!(!tracker.validate(addr(0x10F0), 0x20));
    }

    #[test]
    fn test_validate_rejects_query_overflow() {
        let mut tracker = AllocationTracker::new();
        tracker.add(addr(0xFFFF_F000), 0x800).unwrap();

        assert!(!tracker.validate(addr(0xFFFF_FF00), 0x200));
    }

    #[test]
    fn test_validate_skips_overflowing_entry() {
        let mut tracker = AllocationTracker::new();
        // An entry whose own range overflows must never validate anything.
        tracker.add(addr(0xFFFF_FFF0), 0x100).unwrap();

        assert!(!tracker.validate(addr(0xFFFF_FFF0), 1));
    }

    #[test]
    fn test_slot_reuse_after_remove() {
        let mut tracker = AllocationTracker::with_capacity(2);
        tracker.add(addr(0xA000), 8).unwrap();
        tracker.add(addr(0xB000), 8).unwrap();

        assert!(tracker.remove(addr(0xA000)));
        tracker.add(addr(0xC000), 8).unwrap();

        assert!(tracker.contains(addr(0xB000)));
        assert!(tracker.contains(addr(0xC000)));
        assert_eq!(tracker.len(), 2);
    }
}
