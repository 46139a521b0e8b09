//! The core map: one record per physical frame, tracking who owns it and
//! what state it's in.

use shared::memory::{Frame, PhysAddress};
use static_assertions::const_assert;

use crate::addrspace::AsId;
use crate::config::PAGE_SIZE;

/// The state a frame can be in. `Clean` is reserved for a future eviction
/// path; nothing in the live allocation path ever assigns it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FrameState {
    Free,
    Fixed,
    Dirty,
    #[allow(dead_code)]
    Clean,
}

/// One core-map record. `owner` is a weak reference: it must never be
/// dereferenced without independent knowledge that the address space it
/// names is still alive. See the frame-liveness note in `addrspace`.
#[derive(Clone, Copy, Debug)]
pub struct CoreMapEntry {
    pa: PhysAddress,
    state: FrameState,
    owner: Option<AsId>,
    va: u32,
    run_length: u32,
}

/// Pins the entry's layout: `vm_bootstrap` multiplies this size by
/// `page_count` to decide how many frames the core map itself reserves,
/// so an accidental size change here would silently shift that
/// reservation.
const_assert!(core::mem::size_of::<CoreMapEntry>() <= 32);

impl CoreMapEntry {
    pub(crate) fn for_index(index: u32) -> CoreMapEntry {
        CoreMapEntry {
            pa: PhysAddress::from_raw(index * PAGE_SIZE.as_raw()),
            state: FrameState::Free,
            owner: None,
            va: 0,
            run_length: 0,
        }
    }

    pub fn pa(&self) -> PhysAddress {
        self.pa
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn owner(&self) -> Option<AsId> {
        self.owner
    }

    pub fn va(&self) -> u32 {
        self.va
    }

    pub fn run_length(&self) -> u32 {
        self.run_length
    }
}

/// A contiguous array indexed by physical frame number. Owns no memory of
/// its own: the backing slice is supplied by the bootstrap sequencer, which
/// places it directly above `first_free` (see `bootstrap::vm_bootstrap`),
/// bypassing the not-yet-existent kernel heap.
pub struct CoreMap<'a> {
    entries: &'a mut [CoreMapEntry],
    free_count: u32,
}

impl<'a> CoreMap<'a> {
    /// Builds a core map over `entries`, one record per frame starting at
    /// physical address 0. Every entry starts out `Free`; callers must mark
    /// reserved frames `Fixed` before anyone else can observe the map (see
    /// `bootstrap::vm_bootstrap`).
    ///
    /// # Safety
    ///
    /// `entries` must not alias any other live `CoreMap`, and its length
    /// must equal `page_count` for the RAM this kernel is running on.
    pub unsafe fn new(entries: &'a mut [CoreMapEntry]) -> CoreMap<'a> {
        for (i, entry) in entries.iter_mut().enumerate() {
            *entry = CoreMapEntry::for_index(i as u32);
        }
        let free_count = entries.len() as u32;
        CoreMap {
            entries,
            free_count,
        }
    }

    pub fn page_count(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn free_count(&self) -> u32 {
        self.free_count
    }

    pub fn entry(&self, frame: Frame) -> &CoreMapEntry {
        &self.entries[frame.index() as usize]
    }

    /// Marks `[0, fixed_frame_count)` `Fixed` with no owner and everything
    /// else `Free`. Used once, by bootstrap.
    pub fn reserve_boot_frames(&mut self, fixed_frame_count: u32) {
        assert!(fixed_frame_count <= self.entries.len() as u32);
        for (i, entry) in self.entries.iter_mut().enumerate() {
            entry.state = if (i as u32) < fixed_frame_count {
                FrameState::Fixed
            } else {
                FrameState::Free
            };
        }
        self.free_count = self.entries.len() as u32 - fixed_frame_count;
    }

    /// Finds the first `Free` frame starting the scan at index 0, without
    /// mutating anything. Returns `None` if the core map is full.
    pub fn find_free(&self) -> Option<Frame> {
        self.entries
            .iter()
            .position(|e| e.state == FrameState::Free)
            .map(|i| Frame::new(PhysAddress::from_raw(i as u32 * PAGE_SIZE.as_raw())))
    }

    /// Finds the first run of `n` contiguous `Free` frames. First-fit,
    /// lowest index wins; no search rotation.
    pub fn find_free_run(&self, n: u32) -> Option<Frame> {
        if n == 0 {
            return None;
        }
        let n = n as usize;
        let mut run_start = None;
        let mut run_len = 0usize;

        for (i, entry) in self.entries.iter().enumerate() {
            if entry.state == FrameState::Free {
                if run_len == 0 {
                    run_start = Some(i);
                }
                run_len += 1;
                if run_len == n {
                    let start = run_start.unwrap();
                    return Some(Frame::new(PhysAddress::from_raw(
                        start as u32 * PAGE_SIZE.as_raw(),
                    )));
                }
            } else {
                run_len = 0;
                run_start = None;
            }
        }

        None
    }

    /// Marks `frame` `Fixed` with `run_length` set; the frame must currently
    /// be `Free`.
    pub fn mark_fixed(&mut self, frame: Frame, run_length: u32) {
        let entry = &mut self.entries[frame.index() as usize];
        assert_eq!(entry.state, FrameState::Free);
        entry.state = FrameState::Fixed;
        entry.run_length = run_length;
        self.free_count -= 1;
    }

    /// Marks `frame` `Dirty`, owned by `owner` at user virtual address `va`;
    /// the frame must currently be `Free`.
    pub fn mark_dirty(&mut self, frame: Frame, owner: AsId, va: u32) {
        let entry = &mut self.entries[frame.index() as usize];
        assert_eq!(entry.state, FrameState::Free);
        entry.state = FrameState::Dirty;
        entry.owner = Some(owner);
        entry.va = va;
        entry.run_length = 0;
        self.free_count -= 1;
    }

    /// Returns `frame` to `Free`, clearing owner/va/run_length. The frame
    /// must not already be `Free`.
    pub fn mark_free(&mut self, frame: Frame) {
        let entry = &mut self.entries[frame.index() as usize];
        assert_ne!(entry.state, FrameState::Free);
        entry.state = FrameState::Free;
        entry.owner = None;
        entry.va = 0;
        entry.run_length = 0;
        self.free_count += 1;
    }

    /// Releases every frame in the `run_length`-frame run beginning at
    /// `frame`, which must be `Fixed` with `run_length >= 1`.
    pub fn free_run(&mut self, frame: Frame) {
        let run_length = self.entry(frame).run_length();
        assert!(run_length >= 1, "freeing a frame with no recorded run");
        for i in 0..run_length {
            let f = frame.next(i).expect("run extends past addressable memory");
            self.mark_free(f);
        }
    }

    /// Checks that every entry's redundant `pa` field equals
    /// `index * PAGE_SIZE`. Intended for tests and debug assertions, not
    /// the hot path.
    #[cfg(test)]
    pub fn check_pa_invariant(&self) -> bool {
        self.entries
            .iter()
            .enumerate()
            .all(|(i, e)| e.pa().as_raw() == i as u32 * PAGE_SIZE.as_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::memory::PhysAddress;
    use std::vec;

    fn backing(n: usize) -> vec::Vec<CoreMapEntry> {
        vec![CoreMapEntry::for_index(0); n]
    }

    #[test]
    fn new_marks_everything_free() {
        let mut storage = backing(4);
        let map = unsafe { CoreMap::new(&mut storage) };
        assert_eq!(map.free_count(), 4);
        assert!(map.check_pa_invariant());
    }

    #[test]
    fn reserve_boot_frames_splits_fixed_and_free() {
        let mut storage = backing(8);
        let mut map = unsafe { CoreMap::new(&mut storage) };
        map.reserve_boot_frames(3);

        assert_eq!(map.free_count(), 5);
        for i in 0..3 {
            let f = Frame::new(PhysAddress::from_raw(i * PAGE_SIZE.as_raw()));
            assert_eq!(map.entry(f).state(), FrameState::Fixed);
        }
        for i in 3..8 {
            let f = Frame::new(PhysAddress::from_raw(i * PAGE_SIZE.as_raw()));
            assert_eq!(map.entry(f).state(), FrameState::Free);
        }
    }

    #[test]
    fn find_free_run_requires_contiguity() {
        let mut storage = backing(6);
        let mut map = unsafe { CoreMap::new(&mut storage) };

        let f2 = Frame::new(PhysAddress::from_raw(2 * PAGE_SIZE.as_raw()));
        map.mark_fixed(f2, 1);

        // No 3-run exists before index 2; the only 3-run is frames 3..6.
        let found = map.find_free_run(3).unwrap();
        assert_eq!(found, Frame::new(PhysAddress::from_raw(3 * PAGE_SIZE.as_raw())));
    }

    #[test]
    fn mark_and_free_round_trip() {
        let mut storage = backing(4);
        let mut map = unsafe { CoreMap::new(&mut storage) };

        let f = map.find_free().unwrap();
        map.mark_fixed(f, 1);
        assert_eq!(map.free_count(), 3);

        map.free_run(f);
        assert_eq!(map.free_count(), 4);
        assert_eq!(map.entry(f).state(), FrameState::Free);
    }
}
