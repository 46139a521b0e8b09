//! Virtual memory core: core map, frame allocator, address spaces and
//! page tables, fault handler, and TLB manager for a 32-bit MIPS-like
//! processor with a software-managed TLB.
//!
//! This crate owns everything below the kernel heap and above the RAM
//! driver. It is deliberately ignorant of the trap entry code, the ELF
//! loader, the scheduler, and lock primitives themselves - those are
//! external collaborators the surrounding kernel provides.

#![cfg_attr(not(test), no_std)]

pub mod addrspace;
pub mod bootstrap;
pub mod config;
pub mod coremap;
pub mod error;
pub mod fault;
pub mod frame_alloc;
pub mod physmem;
pub mod ram;
pub mod tlb;

use log::info;
use once_cell::unsync::OnceCell;
use spin::Mutex;

use addrspace::{AddressSpace, Permissions};
use config::USERSPACETOP;
use coremap::CoreMapEntry;
use error::{FaultType, VmFaultResult};
use frame_alloc::FrameAllocator;
use physmem::PhysMemory;
use ram::RamOracle;
use shared::memory::{Length, VirtAddress};
use tlb::{InterruptGuard, MockTlb};

struct VmState {
    frames: FrameAllocator<'static, 'static>,
    tlb: MockTlb,
}

/// Process-wide VM state: the core map, frame allocator, and TLB-cursor
/// bookkeeping. Set exactly once by [`vm_bootstrap_global`]; every other
/// entry point panics if called before that ("vm_initialized" in the
/// design notes' terms is simply "this cell is set").
static VM_STATE: Mutex<OnceCell<VmState>> = Mutex::new(OnceCell::new());

fn with_state<R>(f: impl FnOnce(&mut VmState) -> R) -> R {
    let mut guard = VM_STATE.lock();
    let state = guard.get_mut().expect("VM core used before vm_bootstrap");
    f(state)
}

/// Performs the one-time bootstrap sequence, then makes the resulting
/// frame allocator available to every other function in this module.
///
/// `entries` and `phys_mem` must be backed by storage that lives for the
/// remainder of the kernel's execution - on real hardware, the
/// kernel-direct-mapped region above `first_free`. Panics if called more
/// than once.
pub fn vm_bootstrap_global(
    ram: &dyn RamOracle,
    entries: &'static mut [CoreMapEntry],
    phys_mem: &'static mut dyn PhysMemory,
) {
    let result = bootstrap::vm_bootstrap(ram, entries);
    let frames = FrameAllocator::new(result.core_map, phys_mem);
    let state = VmState {
        frames,
        tlb: MockTlb::new(),
    };

    let guard = VM_STATE.lock();
    if guard.set(state).is_err() {
        panic!("vm_bootstrap_global called more than once");
    }
    info!("vm_bootstrap_global: done, vm_initialized");
}

/// `alloc_kpages`: before bootstrap, forwards to the primitive stealer;
/// afterwards, uses the frame allocator. `n < 1` is fatal.
pub fn alloc_kpages(ram: &mut dyn RamOracle, n: u32) -> VirtAddress {
    assert!(n >= 1, "alloc_kpages(0) is fatal");

    let mut guard = VM_STATE.lock();
    match guard.get_mut() {
        Some(state) => {
            if n == 1 {
                state.frames.allocate_kernel_single()
            } else {
                state.frames.allocate_kernel_run(n)
            }
        }
        None => {
            let pa = ram.steal_mem(n);
            VirtAddress::from_raw(pa.as_raw() | USERSPACETOP.as_raw())
        }
    }
}

/// `free_kpages`: only valid once `vm_bootstrap_global` has run, since
/// frames handed out by the primitive stealer are never reclaimed.
pub fn free_kpages(kva: VirtAddress) {
    with_state(|state| state.frames.free_kernel(kva));
}

/// `vm_fault`: resolves a TLB-refill or protection fault for `as_`.
pub fn vm_fault<G: InterruptGuard>(
    fault_type: FaultType,
    fault_va: VirtAddress,
    as_: &mut AddressSpace,
) -> VmFaultResult {
    with_state(|state| fault::vm_fault::<G>(fault_type, fault_va, as_, &mut state.frames, &mut state.tlb))
}

/// `as_create`: a fresh, empty address space.
pub fn as_create() -> AddressSpace {
    AddressSpace::create()
}

/// `as_destroy`: releases every frame and page table `as_` owns.
pub fn as_destroy(as_: AddressSpace) {
    with_state(|state| as_.destroy(&mut state.frames));
}

/// `as_copy`: the fork path. Duplicates every mapped page of `src`.
pub fn as_copy(src: &AddressSpace) -> AddressSpace {
    with_state(|state| src.copy(&mut state.frames))
}

/// `as_activate`: flushes the TLB on context switch. This platform has no
/// address-space tags, so every entry is invalidated unconditionally.
pub fn as_activate(_as_: &AddressSpace) {
    with_state(|state| state.tlb.invalidate_all());
}

/// `as_define_region`: records a segment's bounds and permissions.
pub fn as_define_region(as_: &mut AddressSpace, start: VirtAddress, len: Length, perms: Permissions) {
    as_.define_region(start, len, perms);
}

/// `as_prepare_load`: disables permission checking while the ELF loader
/// populates segments.
pub fn as_prepare_load(as_: &mut AddressSpace) {
    as_.prepare_load();
}

/// `as_complete_load`: re-enables permission checking and marks the load
/// as finished.
pub fn as_complete_load(as_: &mut AddressSpace) {
    as_.complete_load();
}

/// `as_define_stack`: sets the initial user stack pointer to
/// `USERSPACETOP` and resets the stack to its maximum extent.
pub fn as_define_stack(as_: &mut AddressSpace, initial_sp: &mut VirtAddress) {
    as_.define_stack(initial_sp);
}
