//! Per-process address spaces: page directories, page-table walking, and
//! heap/stack region bookkeeping.

use core::sync::atomic::{AtomicU32, Ordering};

use arrayvec::ArrayVec;
use bitflags::bitflags;
use shared::memory::{Frame, PhysAddress, VirtAddress};
use static_assertions::const_assert_eq;

use crate::config::{PAGE_TABLE_ENTRIES, USERSPACETOP, USER_STACK_LIMIT};
use crate::frame_alloc::FrameAllocator;

bitflags! {
    /// Permission bits carried in the low 3 bits of a page-table entry.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Permissions: u32 {
        const R = 0b001;
        const W = 0b010;
        const X = 0b100;
    }
}

/// A page-table entry: bits 31..12 are the frame's physical address, bits
/// 2..0 are permission flags. Zero means "not present".
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Pte(u32);

const FRAME_MASK: u32 = !0xFFF;

/// The frame-number bits and the permission bits must never overlap: a PTE
/// packs both into the same 32-bit word.
const_assert_eq!(FRAME_MASK & Permissions::all().bits(), 0);

impl Pte {
    pub const EMPTY: Pte = Pte(0);

    pub fn new(frame: Frame, perms: Permissions) -> Pte {
        Pte((frame.start().as_raw() & FRAME_MASK) | perms.bits())
    }

    pub fn from_raw(raw: u32) -> Pte {
        Pte(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_present(self) -> bool {
        self.0 != 0
    }

    pub fn frame(self) -> Option<Frame> {
        self.is_present()
            .then(|| Frame::new(PhysAddress::from_raw(self.0 & FRAME_MASK)))
    }

    pub fn perms(self) -> Permissions {
        Permissions::from_bits_truncate(self.0 & Permissions::all().bits())
    }
}

/// Splits a user virtual address into `(directory_index, table_index,
/// page_offset)`.
pub fn split_va(va: VirtAddress) -> (usize, usize, u32) {
    let raw = va.as_raw();
    let dir_index = (raw >> 22) & 0x3FF;
    let table_index = (raw >> 12) & 0x3FF;
    let offset = raw & 0xFFF;
    (dir_index as usize, table_index as usize, offset)
}

/// Opaque, weak-reference-style handle a core-map entry's `owner` field
/// points at. Never dereferenced directly: the core map only uses it for
/// equality checks (e.g. "does frame X still belong to address space Y").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AsId(u32);

static NEXT_AS_ID: AtomicU32 = AtomicU32::new(1);

fn next_as_id() -> AsId {
    AsId(NEXT_AS_ID.fetch_add(1, Ordering::Relaxed))
}

/// A mapped region of user-virtual address space, recording the permissions
/// it should be faulted in with. Populated by `define_region` as the ELF
/// loader declares each segment; `heap_start`/`heap_end` derive from it, but
/// the fault handler itself only ever consults the derived heap/stack bounds,
/// never this list directly.
#[derive(Clone, Copy, Debug)]
pub struct Segment {
    pub start: VirtAddress,
    pub len: shared::memory::Length,
    pub perms: Permissions,
}

const MAX_SEGMENTS: usize = 8;

/// Capacity of the present-PTE buffer `copy`/`destroy` collect into before
/// mutating the frame allocator, since the crate has no heap to reach for a
/// `Vec`. Matches the largest address space this teaching kernel is expected
/// to exercise in tests; production address spaces with more live pages
/// would need a larger bound or a streaming rewrite of `copy`/`destroy`.
/// `ArrayVec::collect` panics past this, the same as the old hand-rolled
/// buffer's over-capacity assert.
const MAX_LIVE_PAGES: usize = 512;

/// A process's virtual address space: its page directory, heap/stack
/// bounds, and ELF-load bookkeeping.
pub struct AddressSpace {
    id: AsId,
    page_dir: [Option<Frame>; PAGE_TABLE_ENTRIES],
    segments: [Option<Segment>; MAX_SEGMENTS],
    heap_start: VirtAddress,
    heap_end: VirtAddress,
    stack_bottom: VirtAddress,
    use_permissions: bool,
    loadelf_done: bool,
}

impl AddressSpace {
    /// Creates an empty address space with no mapped pages. Matches
    /// `as_create`.
    pub fn create() -> AddressSpace {
        AddressSpace {
            id: next_as_id(),
            page_dir: [None; PAGE_TABLE_ENTRIES],
            segments: [None; MAX_SEGMENTS],
            heap_start: VirtAddress::zero(),
            heap_end: VirtAddress::zero(),
            stack_bottom: USERSPACETOP,
            use_permissions: true,
            loadelf_done: false,
        }
    }

    pub fn id(&self) -> AsId {
        self.id
    }

    pub fn heap_start(&self) -> VirtAddress {
        self.heap_start
    }

    pub fn heap_end(&self) -> VirtAddress {
        self.heap_end
    }

    pub fn stack_bottom(&self) -> VirtAddress {
        self.stack_bottom
    }

    pub fn use_permissions(&self) -> bool {
        self.use_permissions
    }

    pub fn loadelf_done(&self) -> bool {
        self.loadelf_done
    }

    /// `as_prepare_load`: disables permission checking while segments are
    /// being populated by the ELF loader.
    pub fn prepare_load(&mut self) {
        self.use_permissions = false;
    }

    /// `as_complete_load`: re-enables permission checking and marks load as
    /// finished, so the dead zone between heap and stack becomes fatal.
    pub fn complete_load(&mut self) {
        self.use_permissions = true;
        self.loadelf_done = true;
    }

    /// `as_define_stack`: sets the initial user stack pointer and resets the
    /// stack to its maximum extent.
    pub fn define_stack(&mut self, initial_sp: &mut VirtAddress) {
        self.stack_bottom = USERSPACETOP;
        *initial_sp = USERSPACETOP;
    }

    /// `as_define_region`: records a segment's bounds and permissions, and
    /// widens the heap to start just past it. Does not allocate frames.
    pub fn define_region(
        &mut self,
        start: VirtAddress,
        len: shared::memory::Length,
        perms: Permissions,
    ) {
        let slot = self
            .segments
            .iter_mut()
            .find(|s| s.is_none())
            .expect("too many segments");
        *slot = Some(Segment { start, len, perms });

        let end = start + len;
        if end > self.heap_start {
            self.heap_start = end.align_up(crate::config::PAGE_SIZE.as_raw());
            self.heap_end = self.heap_start;
        }
    }

    /// Grows the heap end by `len` bytes (the `sbrk`-equivalent primitive),
    /// without allocating any frames. Returns the old `heap_end`.
    pub fn grow_heap(&mut self, len: shared::memory::Length) -> VirtAddress {
        let old_end = self.heap_end;
        self.heap_end = self.heap_end + len;
        old_end
    }

    /// Extends the stack one page further down. Caller is responsible for
    /// actually allocating the backing frame.
    pub fn grow_stack_one_page(&mut self) {
        self.stack_bottom = self.stack_bottom - crate::config::PAGE_SIZE;
        assert!(self.stack_bottom >= USER_STACK_LIMIT);
    }

    /// Looks up the page-table frame for `va`'s directory index, creating it
    /// (via `frames`) if absent and `create` is true.
    pub fn walk_table(
        &mut self,
        va: VirtAddress,
        create: bool,
        frames: &mut FrameAllocator<'_, '_>,
    ) -> Option<Frame> {
        let (dir_index, _, _) = split_va(va);
        if let Some(table) = self.page_dir[dir_index] {
            return Some(table);
        }
        if !create {
            return None;
        }
        let table = frames.allocate_kernel_single_frame();
        self.page_dir[dir_index] = Some(table);
        Some(table)
    }

    /// Looks up the PTE currently mapping `va`, without creating anything.
    pub fn lookup_pte(&self, va: VirtAddress, frames: &FrameAllocator<'_, '_>) -> Pte {
        let (dir_index, table_index, _) = split_va(va);
        match self.page_dir[dir_index] {
            None => Pte::EMPTY,
            Some(table) => Pte::from_raw(frames.phys_mem().read_u32(table, table_index)),
        }
    }

    /// All `(directory_index, table_index, pte)` triples with a present
    /// mapping, for `copy` and `destroy`.
    fn present_ptes<'b, 'cm, 'pm>(
        &'b self,
        frames: &'b FrameAllocator<'cm, 'pm>,
    ) -> impl Iterator<Item = (usize, usize, Pte)> + 'b {
        self.page_dir
            .iter()
            .enumerate()
            .filter_map(|(d, t)| t.map(|table| (d, table)))
            .flat_map(move |(d, table)| {
                (0..PAGE_TABLE_ENTRIES).filter_map(move |t| {
                    let pte = Pte::from_raw(frames.phys_mem().read_u32(table, t));
                    pte.is_present().then_some((d, t, pte))
                })
            })
    }

    /// `as_copy`: duplicates every mapped page into a fresh address space.
    /// Copies frame *contents*, not core-map metadata.
    pub fn copy(&self, frames: &mut FrameAllocator<'_, '_>) -> AddressSpace {
        let mut dst = AddressSpace::create();
        dst.segments = self.segments;
        dst.heap_start = self.heap_start;
        dst.heap_end = self.heap_end;
        dst.stack_bottom = self.stack_bottom;
        dst.use_permissions = self.use_permissions;
        dst.loadelf_done = self.loadelf_done;

        let present: ArrayVec<(usize, usize, Pte), MAX_LIVE_PAGES> = self.present_ptes(frames).collect();

        for (d, t, pte) in present {
            let src_frame = pte.frame().unwrap();
            let va = VirtAddress::from_raw(((d as u32) << 22) | ((t as u32) << 12));

            let dst_frame = frames.allocate_user_frame(dst.id(), va.as_raw());
            frames.phys_mem_mut().copy_frame(src_frame, dst_frame);

            let table = dst.walk_table(va, true, frames).unwrap();
            frames
                .phys_mem_mut()
                .write_u32(table, t, Pte::new(dst_frame, pte.perms()).raw());
        }

        dst
    }

    /// `as_destroy`: releases every backing frame and every second-level
    /// page table, then the address space itself is dropped by the caller.
    pub fn destroy(mut self, frames: &mut FrameAllocator<'_, '_>) {
        let present: ArrayVec<(usize, usize, Pte), MAX_LIVE_PAGES> = self.present_ptes(frames).collect();
        for (_, _, pte) in present {
            frames.free_user_frame(pte.frame().unwrap());
        }
        for table in self.page_dir.iter_mut().filter_map(|t| t.take()) {
            frames.free_page_table(table);
        }
    }
}
