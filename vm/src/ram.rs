//! The RAM boundary oracle and primitive stealer: reports the boundaries of
//! physical memory and hands out frames before the core map exists.
//!
//! Real wiring to the board's memory controller is an external collaborator.
//! This module only defines the trait the bootstrap sequencer and `alloc_kpages`
//! pre-init path depend on, plus a mock used by tests.

use shared::memory::{Frame, Length, PhysAddress};

use crate::config::PAGE_SIZE;

/// Reports physical memory boundaries and lends out frames before the core
/// map is bootstrapped.
pub trait RamOracle {
    /// Returns `(first_free, ram_end)`: the first address not already
    /// claimed by the bootloader/kernel image, and the address just past the
    /// end of physical memory.
    fn get_size(&self) -> (PhysAddress, PhysAddress);

    /// Hands out `npages` contiguous frames from the low end of memory not
    /// yet claimed by anyone, advancing the allocation point. Used only
    /// before the core map exists; never returns the same frame twice.
    fn steal_mem(&mut self, npages: u32) -> PhysAddress;
}

/// An in-memory `RamOracle` for tests: pretends physical memory spans
/// `[0, size)`, with `first_free` fixed at construction.
#[cfg(test)]
pub struct MockRam {
    first_free: PhysAddress,
    ram_end: PhysAddress,
    steal_cursor: PhysAddress,
}

#[cfg(test)]
impl MockRam {
    /// Creates a mock RAM oracle spanning `[0, ram_end)`, with primitive
    /// bootstrap allocations already having claimed `[0, first_free)`.
    pub fn new(first_free: PhysAddress, ram_end: PhysAddress) -> Self {
        assert!(first_free.is_aligned_to(PAGE_SIZE.as_raw()));
        assert!(ram_end.is_aligned_to(PAGE_SIZE.as_raw()));
        assert!(first_free <= ram_end);
        MockRam {
            first_free,
            ram_end,
            steal_cursor: first_free,
        }
    }
}

#[cfg(test)]
impl RamOracle for MockRam {
    fn get_size(&self) -> (PhysAddress, PhysAddress) {
        (self.first_free, self.ram_end)
    }

    fn steal_mem(&mut self, npages: u32) -> PhysAddress {
        let addr = self.steal_cursor;
        let len = Length::from_raw(npages.checked_mul(PAGE_SIZE.as_raw()).unwrap());
        let new_cursor = addr.offset_by_checked(len).expect("ram exhausted");
        assert!(new_cursor <= self.ram_end, "ram exhausted");
        self.steal_cursor = new_cursor;
        addr
    }
}

/// Frame equivalent of [`RamOracle::steal_mem`], for callers that already
/// think in frames rather than raw addresses.
pub fn steal_frame(ram: &mut dyn RamOracle) -> Frame {
    Frame::new(ram.steal_mem(1))
}
