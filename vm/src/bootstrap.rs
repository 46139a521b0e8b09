//! The one-shot transition from "steal-only" to "core-map backed"
//! allocation.

use log::info;
use shared::memory::{Length, PhysAddress};

use crate::config::PAGE_SIZE;
use crate::coremap::{CoreMap, CoreMapEntry};
use crate::ram::RamOracle;

/// Size in bytes of one core-map entry, as actually laid out in memory.
/// Used to compute how much of RAM the core map itself consumes.
pub fn core_map_entry_size() -> u32 {
    core::mem::size_of::<CoreMapEntry>() as u32
}

/// Everything the bootstrap sequencer computed, handed back to the caller
/// so it can build the core map lock and the frame allocator around it.
/// `entries` borrows the kernel-direct-mapped region the core map itself
/// lives in; callers on real hardware construct this slice from a raw
/// pointer derived from `first_free`, which is why `vm_bootstrap` takes the
/// backing storage as a parameter instead of allocating it itself - there
/// is nothing to allocate *from* yet.
pub struct BootstrapResult<'a> {
    pub core_map: CoreMap<'a>,
    pub page_count: u32,
    pub reserved_end: PhysAddress,
}

/// Performs the one-time bootstrap sequence described for this VM core:
/// computes how many frames RAM holds, reserves the frames the core map
/// itself occupies (plus everything below `first_free`), and marks the
/// remainder `FREE`.
///
/// `entries` must be exactly `page_count` entries long, where `page_count =
/// ram_end / PAGE_SIZE`; the caller is responsible for having placed it at
/// the kernel-direct-mapped image of `first_free` and for never calling
/// this function more than once.
///
/// # Panics
///
/// Panics (a fatal bootstrap inconsistency) if `reserved_end > ram_end`, or
/// if `entries.len()` does not match the computed `page_count`.
pub fn vm_bootstrap(ram: &dyn RamOracle, entries: &mut [CoreMapEntry]) -> BootstrapResult<'_> {
    let (first_free, ram_end) = ram.get_size();
    let page_count = ram_end.as_raw() / PAGE_SIZE.as_raw();
    info!("vm_bootstrap: first_free={first_free:?} ram_end={ram_end:?} page_count={page_count}");

    assert_eq!(
        entries.len() as u32,
        page_count,
        "core map backing storage does not match computed page_count"
    );

    let core_map_bytes = page_count
        .checked_mul(core_map_entry_size())
        .expect("page_count * entry size overflowed");
    let reserved_end = first_free
        .offset_by_checked(Length::from_raw(core_map_bytes))
        .expect("reserved_end overflowed physical address space")
        .align_up(PAGE_SIZE.as_raw());

    assert!(
        reserved_end <= ram_end,
        "core map does not fit in available RAM"
    );

    let mut core_map = unsafe { CoreMap::new(entries) };
    let fixed_frame_count = reserved_end.as_raw() / PAGE_SIZE.as_raw();
    core_map.reserve_boot_frames(fixed_frame_count);
    info!(
        "vm_bootstrap: reserved {fixed_frame_count} frames up to {reserved_end:?}, {} free",
        core_map.free_count()
    );

    BootstrapResult {
        core_map,
        page_count,
        reserved_end,
    }
}
