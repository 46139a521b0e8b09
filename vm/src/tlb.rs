//! The software-managed TLB: the fixed-size cache of recently used
//! translations the fault handler installs entries into, and the
//! replacement policy used when it's full.

use shared::memory::{Page, VirtAddress};

use crate::addrspace::{Permissions, Pte};
use crate::config::TLB_SLOT_COUNT;

/// One hardware TLB entry: a virtual page mapped to a physical frame with
/// its permissions, or nothing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TlbEntry {
    pub page: Page,
    pub pte: Pte,
}

/// The hardware TLB, abstracted so the replacement policy can be tested
/// without a real coprocessor. Real hardware backs this with coprocessor-0
/// `tlbwi`/`tlbwr`/`tlbp` instructions; `MockTlb` backs it with a plain
/// array for tests.
pub trait Tlb {
    fn slot_count(&self) -> usize;
    fn get(&self, slot: usize) -> Option<TlbEntry>;
    fn write(&mut self, slot: usize, entry: TlbEntry);
    fn invalidate(&mut self, slot: usize);
    fn invalidate_all(&mut self) {
        for slot in 0..self.slot_count() {
            self.invalidate(slot);
        }
    }
}

/// An in-memory `Tlb` for tests, with the same round-robin write cursor a
/// real coprocessor's `tlbwr` instruction advances internally.
pub struct MockTlb {
    slots: [Option<TlbEntry>; TLB_SLOT_COUNT],
    next_victim: usize,
}

impl MockTlb {
    pub fn new() -> Self {
        MockTlb {
            slots: [None; TLB_SLOT_COUNT],
            next_victim: 0,
        }
    }

    /// Finds the slot the next write should land in: the first invalid slot
    /// if one exists, otherwise the next slot in round-robin order. Matches
    /// this processor's `tlbwr` behavior of writing to a "random" slot that
    /// excludes any the kernel has wired down, simplified here to plain
    /// round-robin since this VM core wires nothing down.
    fn victim_slot(&mut self) -> usize {
        if let Some(slot) = self.slots.iter().position(|s| s.is_none()) {
            return slot;
        }
        let slot = self.next_victim;
        self.next_victim = (self.next_victim + 1) % self.slots.len();
        slot
    }
}

impl Default for MockTlb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tlb for MockTlb {
    fn slot_count(&self) -> usize {
        TLB_SLOT_COUNT
    }

    fn get(&self, slot: usize) -> Option<TlbEntry> {
        self.slots[slot]
    }

    fn write(&mut self, slot: usize, entry: TlbEntry) {
        self.slots[slot] = Some(entry);
    }

    fn invalidate(&mut self, slot: usize) {
        self.slots[slot] = None;
    }
}

/// Disables interrupts for the duration of a TLB update, matching the
/// hardware requirement that the TLB never be modified while an interrupt
/// could read it mid-update. Real code backs this with `splhigh`/`splx`;
/// tests use a no-op guard.
pub trait InterruptGuard {
    fn enter() -> Self;
}

pub struct NoopGuard;

impl InterruptGuard for NoopGuard {
    fn enter() -> Self {
        NoopGuard
    }
}

/// Installs a translation for `page` into `tlb`, evicting an entry if
/// necessary. Disables interrupts around the write via `G: InterruptGuard`.
pub fn tlb_insert<G: InterruptGuard>(tlb: &mut MockTlb, page: Page, pte: Pte) {
    let _guard = G::enter();
    let slot = tlb.victim_slot();
    tlb.write(slot, TlbEntry { page, pte });
}

/// Invalidates every entry belonging to `page`'s address space. This
/// platform has no address-space-tagged TLB, so in practice this means
/// "every entry the kernel knows can't still be valid" - `vm_tlbshootdown`
/// in the fault handler just invalidates everything, matching the teaching
/// kernel's lack of true multiprocessor shootdown.
pub fn invalidate_page(tlb: &mut dyn Tlb, page: Page) {
    for slot in 0..tlb.slot_count() {
        if let Some(entry) = tlb.get(slot) {
            if entry.page == page {
                tlb.invalidate(slot);
            }
        }
    }
}

pub fn lookup(tlb: &dyn Tlb, va: VirtAddress) -> Option<Pte> {
    let page = Page::containing(va);
    (0..tlb.slot_count())
        .filter_map(|slot| tlb.get(slot))
        .find(|entry| entry.page == page)
        .map(|entry| entry.pte)
}
