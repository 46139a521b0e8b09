//! Frame allocation: the operations that actually hand out and reclaim
//! physical frames, wrapping the core map and physical-memory access behind
//! a single handle.
//!
//! A `FrameAllocator` is meant to live behind one `spin::Mutex` per kernel
//! (see `bootstrap`). Every operation here takes `&mut self`, so holding a
//! `&mut FrameAllocator` *is* the proof the lock is held; none of these
//! methods ever lock anything themselves, so passing a `&mut FrameAllocator`
//! down into address-space code (which needs to allocate page-table frames
//! mid-walk) can never double-lock.

use log::error;
use shared::memory::{Frame, Length, VirtAddress};

use crate::addrspace::{AddressSpace, AsId, Permissions, Pte};
use crate::config::{PAGE_SIZE, USERSPACETOP};
use crate::coremap::CoreMap;
use crate::physmem::PhysMemory;

pub struct FrameAllocator<'cm, 'pm> {
    core_map: CoreMap<'cm>,
    phys_mem: &'pm mut dyn PhysMemory,
}

impl<'cm, 'pm> FrameAllocator<'cm, 'pm> {
    pub fn new(core_map: CoreMap<'cm>, phys_mem: &'pm mut dyn PhysMemory) -> Self {
        FrameAllocator { core_map, phys_mem }
    }

    pub fn core_map(&self) -> &CoreMap<'cm> {
        &self.core_map
    }

    pub fn phys_mem(&self) -> &dyn PhysMemory {
        self.phys_mem
    }

    pub fn phys_mem_mut(&mut self) -> &mut dyn PhysMemory {
        self.phys_mem
    }

    fn kva_of(frame: Frame) -> VirtAddress {
        VirtAddress::from_raw(frame.start().as_raw() | USERSPACETOP.as_raw())
    }

    fn frame_of_kva(kva: VirtAddress) -> Frame {
        assert!(kva >= USERSPACETOP, "not a kernel-direct-mapped address");
        Frame::new(shared::memory::PhysAddress::from_raw(
            kva.as_raw() & !USERSPACETOP.as_raw(),
        ))
    }

    /// Allocates a single zeroed frame for kernel use, marking it `Fixed`.
    pub fn allocate_kernel_single_frame(&mut self) -> Frame {
        let frame = self.core_map.find_free().unwrap_or_else(|| {
            error!("out of memory: no free frames, {} total", self.core_map.page_count());
            panic!("out of memory: no free frames");
        });
        self.core_map.mark_fixed(frame, 1);
        self.phys_mem.zero_frame(frame);
        frame
    }

    /// `alloc_kpages(1)`: returns the kernel-direct-mapped address of a
    /// single freshly zeroed frame.
    pub fn allocate_kernel_single(&mut self) -> VirtAddress {
        Self::kva_of(self.allocate_kernel_single_frame())
    }

    /// `alloc_kpages(n)`: returns the kernel-direct-mapped address of the
    /// first frame in a zeroed, physically contiguous run of `n` frames.
    pub fn allocate_kernel_run(&mut self, n: u32) -> VirtAddress {
        assert!(n >= 1);
        let first = self.core_map.find_free_run(n).unwrap_or_else(|| {
            error!("out of memory: no contiguous run of {n} frames, {} free", self.core_map.free_count());
            panic!("out of memory: no contiguous run");
        });
        for i in 0..n {
            let frame = first.next(i).unwrap();
            self.core_map
                .mark_fixed(frame, if i == 0 { n } else { 0 });
            self.phys_mem.zero_frame(frame);
        }
        Self::kva_of(first)
    }

    /// `free_kpages`: releases the run a previous `allocate_kernel_*` call
    /// returned. `kva` must be exactly the address that call returned.
    pub fn free_kernel(&mut self, kva: VirtAddress) {
        let frame = Self::frame_of_kva(kva);
        self.core_map.free_run(frame);
    }

    /// Claims a free frame as `Dirty`, owned by `owner` at user virtual
    /// address `va`, without touching its contents. Used by the fault
    /// handler (which zeroes it) and by `AddressSpace::copy` (which
    /// overwrites it wholesale via `copy_frame`).
    pub fn allocate_user_frame(&mut self, owner: AsId, va: u32) -> Frame {
        let frame = self.core_map.find_free().unwrap_or_else(|| {
            error!("out of memory: no free frames for user va={va:#x}");
            panic!("out of memory: no free frames");
        });
        self.core_map.mark_dirty(frame, owner, va);
        frame
    }

    /// Allocates a zeroed frame backing `va` in `target`, installing the
    /// mapping in its page table (creating the second-level table if
    /// needed). Used by the fault handler when faulting in a new page.
    pub fn allocate_user(
        &mut self,
        target: &mut AddressSpace,
        va: VirtAddress,
        perms: Permissions,
    ) -> Frame {
        let frame = self.allocate_user_frame(target.id(), va.as_raw());
        self.phys_mem.zero_frame(frame);

        let (_, table_index, _) = crate::addrspace::split_va(va);
        let table = target.walk_table(va, true, self).unwrap();
        self.phys_mem
            .write_u32(table, table_index, Pte::new(frame, perms).raw());

        frame
    }

    /// Returns a single user frame to `Free`. Used when tearing down an
    /// address space.
    pub fn free_user_frame(&mut self, frame: Frame) {
        self.core_map.mark_free(frame);
    }

    /// Returns a page-table frame (always a singleton `Fixed` run) to
    /// `Free`.
    pub fn free_page_table(&mut self, frame: Frame) {
        self.core_map.free_run(frame);
    }

    /// Number of frames not currently allocated to anyone.
    pub fn free_count(&self) -> u32 {
        self.core_map.free_count()
    }

    pub fn page_count(&self) -> u32 {
        self.core_map.page_count()
    }
}
