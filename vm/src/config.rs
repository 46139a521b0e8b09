//! Numeric constants fixed by the platform this VM core targets: a 32-bit
//! MIPS-like processor with a 1024x1024 two-level page table and a
//! software-managed TLB.

use shared::memory::{Length, VirtAddress};
use static_assertions::const_assert_eq;

pub const PAGE_SIZE: Length = shared::memory::PAGE_SIZE;

/// First virtual address of the kernel-direct-mapped region. Addresses at or
/// above this map one-to-one to physical memory, bypassing page tables, and
/// are off-limits to user code.
pub const USERSPACETOP: VirtAddress = VirtAddress::from_raw(0x8000_0000);

/// Number of pages the user stack is allowed to grow to.
pub const VM_STACKPAGES: u32 = 256;

/// Lowest user-virtual address the stack may grow down to.
pub const USER_STACK_LIMIT: VirtAddress =
    VirtAddress::from_raw(USERSPACETOP.as_raw() - VM_STACKPAGES * PAGE_SIZE.as_raw());

/// Entries per page directory and per page table.
pub const PAGE_TABLE_ENTRIES: usize = 1024;

/// A page table is exactly one frame: 1024 4-byte entries.
const_assert_eq!((PAGE_TABLE_ENTRIES * 4) as u32, PAGE_SIZE.as_raw());

/// Number of hardware TLB slots. The real r3000-style coprocessor this
/// targets has 64; tests may drive the manager with a smaller mock to
/// exercise replacement without needing 64 entries of setup.
pub const TLB_SLOT_COUNT: usize = 64;
