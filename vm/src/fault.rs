//! The fault handler: resolves TLB-refill and protection faults for user
//! processes, growing the stack and heap on demand.

use log::trace;
use shared::memory::{Page, VirtAddress};

use crate::addrspace::{AddressSpace, Permissions, Pte};
use crate::config::{PAGE_SIZE, USERSPACETOP, USER_STACK_LIMIT};
use crate::error::{FaultType, InvalidAccess, VmFaultResult};
use crate::frame_alloc::FrameAllocator;
use crate::tlb::{tlb_insert, InterruptGuard, MockTlb};

/// Services one fault, following the policy in order. On success, a TLB
/// entry has been installed and the page table mutation (if any) is
/// durable; on failure, nothing about the core map or page tables has
/// changed.
pub fn vm_fault<G: InterruptGuard>(
    fault_type: FaultType,
    fault_va: VirtAddress,
    as_: &mut AddressSpace,
    frames: &mut FrameAllocator<'_, '_>,
    tlb: &mut MockTlb,
) -> VmFaultResult {
    if fault_type == FaultType::ReadonlyViolation && as_.use_permissions() {
        trace!("vm_fault: {fault_type:?} at {fault_va:?} rejected, permissions enforced");
        return Err(InvalidAccess);
    }

    if fault_va.is_zero() {
        trace!("vm_fault: null pointer dereference");
        return Err(InvalidAccess);
    }

    let fault_va = fault_va.align_down(PAGE_SIZE.as_raw());

    if fault_va >= USERSPACETOP {
        trace!("vm_fault: {fault_va:?} is in the kernel-direct-mapped range");
        return Err(InvalidAccess);
    }

    if as_.loadelf_done() && fault_va < USER_STACK_LIMIT && fault_va > as_.heap_end() {
        trace!("vm_fault: {fault_va:?} is in the dead zone between heap and stack");
        return Err(InvalidAccess);
    }

    let pte = as_.lookup_pte(fault_va, frames);
    if !pte.is_present() {
        if USER_STACK_LIMIT < fault_va && fault_va < as_.stack_bottom() {
            as_.grow_stack_one_page();
            let stack_va = as_.stack_bottom();
            trace!("vm_fault: growing stack to {stack_va:?}");
            frames.allocate_user(as_, stack_va, Permissions::R | Permissions::W);
        } else if as_.heap_start() <= fault_va && fault_va < as_.heap_end() {
            trace!("vm_fault: faulting in heap page {fault_va:?}");
            frames.allocate_user(as_, fault_va, Permissions::R | Permissions::W);
        } else {
            trace!("vm_fault: {fault_va:?} is outside every mapped region");
            return Err(InvalidAccess);
        }
    }

    let pte = as_.lookup_pte(fault_va, frames);
    debug_assert!(pte.is_present(), "page-in left no present mapping");

    // While the ELF loader is still populating segments (`use_permissions ==
    // false`), every page is writable regardless of its stored permission
    // bits - the loader writes read-only segments (.text, .rodata) before
    // `as_complete_load` locks permissions back down.
    let writable = pte.perms().contains(Permissions::W) || !as_.use_permissions();
    let tlb_pte = if writable {
        Pte::new(pte.frame().unwrap(), pte.perms() | Permissions::W)
    } else {
        pte
    };

    let page = Page::containing(fault_va);
    tlb_insert::<G>(tlb, page, tlb_pte);
    trace!(
        "vm_fault: {fault_type:?} at {fault_va:?} resolved, writable={writable}"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coremap::{CoreMap, CoreMapEntry};
    use crate::physmem::MockPhysMemory;
    use crate::tlb::{lookup, NoopGuard};
    use shared::memory::Length;
    use test_log::test;

    fn setup(page_count: usize) -> (std::vec::Vec<CoreMapEntry>, MockPhysMemory) {
        (
            std::vec![CoreMapEntry::for_index(0); page_count],
            MockPhysMemory::new(PAGE_SIZE.as_raw() * page_count as u32),
        )
    }

    #[test]
    fn heap_fault_allocates_and_installs_tlb_entry() {
        let (mut storage, mut mem) = setup(16);
        let core_map = unsafe { CoreMap::new(&mut storage) };
        let mut frames = FrameAllocator::new(core_map, &mut mem);

        let mut as_ = AddressSpace::create();
        as_.define_region(
            VirtAddress::from_raw(0x0040_0000),
            Length::from_raw(0x1000),
            Permissions::R | Permissions::W,
        );
        // heap_start == heap_end after define_region; grow it by one page so
        // the fault address below falls inside it.
        as_.grow_heap(Length::from_raw(0x1000));

        let mut tlb = MockTlb::new();
        let fault_va = VirtAddress::from_raw(0x0040_1800);

        let result = vm_fault::<NoopGuard>(
            FaultType::ReadMiss,
            fault_va,
            &mut as_,
            &mut frames,
            &mut tlb,
        );

        assert_eq!(result, Ok(()));
        let installed = lookup(&tlb, fault_va).unwrap();
        assert!(installed.is_present());
        assert_eq!(installed.perms(), Permissions::R | Permissions::W);
    }

    #[test]
    fn readonly_segment_is_writable_while_load_is_in_progress() {
        let (mut storage, mut mem) = setup(16);
        let core_map = unsafe { CoreMap::new(&mut storage) };
        let mut frames = FrameAllocator::new(core_map, &mut mem);

        let mut as_ = AddressSpace::create();
        as_.prepare_load();
        let va = VirtAddress::from_raw(0x0040_0000);
        // The loader maps a read-only segment page directly, bypassing the
        // fault handler, the way the ELF loader populates .text/.rodata.
        frames.allocate_user(&mut as_, va, Permissions::R);

        let mut tlb = MockTlb::new();
        let result = vm_fault::<NoopGuard>(
            FaultType::WriteMiss,
            va,
            &mut as_,
            &mut frames,
            &mut tlb,
        );

        assert_eq!(result, Ok(()));
        let installed = lookup(&tlb, va).unwrap();
        assert!(
            installed.perms().contains(Permissions::W),
            "pages must be writable while use_permissions is false, even if mapped read-only"
        );
    }

    #[test]
    fn stack_fault_grows_stack_downward() {
        let (mut storage, mut mem) = setup(16);
        let core_map = unsafe { CoreMap::new(&mut storage) };
        let mut frames = FrameAllocator::new(core_map, &mut mem);

        let mut as_ = AddressSpace::create();
        let mut sp = VirtAddress::zero();
        as_.define_stack(&mut sp);
        let fault_va = as_.stack_bottom() - PAGE_SIZE;

        let mut tlb = MockTlb::new();
        let result = vm_fault::<NoopGuard>(
            FaultType::WriteMiss,
            fault_va,
            &mut as_,
            &mut frames,
            &mut tlb,
        );

        assert_eq!(result, Ok(()));
        assert_eq!(as_.stack_bottom(), fault_va);
    }

    #[test]
    fn null_deref_fails_without_touching_state() {
        let (mut storage, mut mem) = setup(16);
        let core_map = unsafe { CoreMap::new(&mut storage) };
        let mut frames = FrameAllocator::new(core_map, &mut mem);
        let free_before = frames.free_count();

        let mut as_ = AddressSpace::create();
        as_.complete_load();
        let mut tlb = MockTlb::new();

        let result = vm_fault::<NoopGuard>(
            FaultType::ReadMiss,
            VirtAddress::zero(),
            &mut as_,
            &mut frames,
            &mut tlb,
        );

        assert_eq!(result, Err(InvalidAccess));
        assert_eq!(frames.free_count(), free_before);
    }

    #[test]
    fn kernel_range_access_fails() {
        let (mut storage, mut mem) = setup(16);
        let core_map = unsafe { CoreMap::new(&mut storage) };
        let mut frames = FrameAllocator::new(core_map, &mut mem);

        let mut as_ = AddressSpace::create();
        let mut tlb = MockTlb::new();

        let result = vm_fault::<NoopGuard>(
            FaultType::ReadMiss,
            USERSPACETOP,
            &mut as_,
            &mut frames,
            &mut tlb,
        );

        assert_eq!(result, Err(InvalidAccess));
    }

    #[test]
    fn dead_zone_fails_once_load_is_complete() {
        let (mut storage, mut mem) = setup(16);
        let core_map = unsafe { CoreMap::new(&mut storage) };
        let mut frames = FrameAllocator::new(core_map, &mut mem);

        let mut as_ = AddressSpace::create();
        as_.define_region(
            VirtAddress::from_raw(0x0040_0000),
            Length::from_raw(0x1000),
            Permissions::R | Permissions::W,
        );
        as_.complete_load();
        let mut tlb = MockTlb::new();

        // Between heap_end and USER_STACK_LIMIT: the dead zone.
        let result = vm_fault::<NoopGuard>(
            FaultType::ReadMiss,
            VirtAddress::from_raw(0x1000_0000),
            &mut as_,
            &mut frames,
            &mut tlb,
        );

        assert_eq!(result, Err(InvalidAccess));
    }

    #[test]
    fn readonly_violation_fails_once_permissions_enforced() {
        let (mut storage, mut mem) = setup(16);
        let core_map = unsafe { CoreMap::new(&mut storage) };
        let mut frames = FrameAllocator::new(core_map, &mut mem);

        let mut as_ = AddressSpace::create();
        as_.complete_load();
        let mut tlb = MockTlb::new();

        let result = vm_fault::<NoopGuard>(
            FaultType::ReadonlyViolation,
            VirtAddress::from_raw(0x0040_0000),
            &mut as_,
            &mut frames,
            &mut tlb,
        );

        assert_eq!(result, Err(InvalidAccess));
    }
}
