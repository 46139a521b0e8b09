//! Data structures representing pages and frames.

use static_assertions::const_assert_eq;

use super::addr::{Length, PhysAddress, PhysExtent, VirtAddress, VirtExtent};

pub const PAGE_SIZE: Length = Length::from_raw(4096);

/// A 4 KiB physical memory frame.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct Frame {
    start: PhysAddress,
}

// `Frame` and `Page` are newtypes over an address with no extra bookkeeping;
// pin that they stay zero-cost so callers can pass them by value freely.
const_assert_eq!(core::mem::size_of::<Frame>(), core::mem::size_of::<PhysAddress>());
const_assert_eq!(core::mem::size_of::<Page>(), core::mem::size_of::<VirtAddress>());

impl Frame {
    /// Creates a `Frame` representing the frame beginning at `start`.
    ///
    /// # Panics
    ///
    /// Panics if `start` is not aligned to `PAGE_SIZE`.
    pub fn new(start: PhysAddress) -> Frame {
        assert!(start.is_aligned_to(PAGE_SIZE.as_raw()));
        Frame { start }
    }

    /// Gets the `Frame` that contains `addr`.
    pub fn containing(addr: PhysAddress) -> Frame {
        Self::new(addr.align_down(PAGE_SIZE.as_raw()))
    }

    /// Start address of the frame.
    pub fn start(self) -> PhysAddress {
        self.start
    }

    /// Extent of memory contained in the frame.
    pub fn extent(self) -> PhysExtent {
        PhysExtent::new(self.start, PAGE_SIZE)
    }

    /// The frame number: `start / PAGE_SIZE`. Used to index a core map.
    pub fn index(self) -> u32 {
        self.start.as_raw() / PAGE_SIZE.as_raw()
    }

    /// The nth frame after `self`, or `None` if it's not addressable.
    pub fn next(self, n: u32) -> Option<Frame> {
        let next_start = self
            .start
            .offset_by_checked(Length::from_raw(PAGE_SIZE.as_raw().checked_mul(n)?))?;
        Some(Self::new(next_start))
    }

    /// The number of frames between `self` and `other`, which must not be
    /// after `self`.
    pub fn distance_from(self, other: Frame) -> u32 {
        (self.start - other.start).as_raw() / PAGE_SIZE.as_raw()
    }
}

/// A 4 KiB virtual memory page.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct Page {
    start: VirtAddress,
}

impl Page {
    /// Creates a `Page` representing the page beginning at `start`.
    ///
    /// # Panics
    ///
    /// Panics if `start` is not aligned to `PAGE_SIZE`.
    pub fn new(start: VirtAddress) -> Page {
        assert!(start.is_aligned_to(PAGE_SIZE.as_raw()));
        Page { start }
    }

    /// Gets the `Page` that contains `addr`.
    pub fn containing(addr: VirtAddress) -> Page {
        Self::new(addr.align_down(PAGE_SIZE.as_raw()))
    }

    /// Start address of the page.
    pub fn start(&self) -> VirtAddress {
        self.start
    }

    /// Extent of virtual address space contained in the page.
    pub fn extent(&self) -> VirtExtent {
        VirtExtent::new(self.start, PAGE_SIZE)
    }

    /// The nth page after `self`, or `None` if it's not addressable.
    pub fn next(self, n: u32) -> Option<Page> {
        let next_start = self
            .start
            .offset_by_checked(Length::from_raw(PAGE_SIZE.as_raw().checked_mul(n)?))?;
        Some(Self::new(next_start))
    }

    pub fn distance_from(self, other: Page) -> u32 {
        (self.start - other.start).as_raw() / PAGE_SIZE.as_raw()
    }
}

/// A contiguous range of physical memory frames. Always non-empty.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameRange {
    first: Frame,
    count: u32,
}

impl FrameRange {
    pub fn new(first: Frame, count: u32) -> Option<FrameRange> {
        if count == 0 {
            return None;
        }

        // Check that `count` frames after and including `first` are
        // addressable. `first.next(count)` may not be addressable if the
        // range includes the last frame.
        if first.next(count - 1).is_none() {
            return None;
        }

        Some(FrameRange { first, count })
    }

    pub fn one(first: Frame) -> FrameRange {
        FrameRange { first, count: 1 }
    }

    /// All frames between and including `first` to `last`.
    pub fn between_inclusive(first: Frame, last: Frame) -> FrameRange {
        let count = last.distance_from(first) + 1;
        FrameRange { first, count }
    }

    /// All frames from `first` to `last`, including `first` but not `last`.
    pub fn between_exclusive(first: Frame, last: Frame) -> FrameRange {
        let count = last.distance_from(first);
        FrameRange { first, count }
    }

    pub fn first(&self) -> Frame {
        self.first
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// The last `Frame` within the range.
    pub fn last(&self) -> Frame {
        self.first.next(self.count - 1).unwrap()
    }

    /// The first `Frame` after the range, or `None` if it ends at the last
    /// addressable frame.
    pub fn end(&self) -> Option<Frame> {
        self.first.next(self.count)
    }

    pub fn contains(&self, frame: Frame) -> bool {
        frame >= self.first && frame.distance_from(self.first) < self.count
    }

    pub fn iter(&self) -> FrameRangeIter {
        FrameRangeIter {
            next: self.first,
            remaining: self.count,
        }
    }
}

impl IntoIterator for FrameRange {
    type Item = Frame;
    type IntoIter = FrameRangeIter;

    fn into_iter(self) -> FrameRangeIter {
        self.iter()
    }
}

#[derive(Clone, Debug)]
pub struct FrameRangeIter {
    next: Frame,
    remaining: u32,
}

impl Iterator for FrameRangeIter {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.remaining == 0 {
            return None;
        }

        let frame = self.next;
        self.remaining -= 1;
        if self.remaining > 0 {
            self.next = frame.next(1).unwrap();
        }
        Some(frame)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining as usize, Some(self.remaining as usize))
    }
}

impl ExactSizeIterator for FrameRangeIter {}

/// A contiguous range of virtual memory pages. Always non-empty.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageRange {
    first: Page,
    count: u32,
}

impl PageRange {
    pub fn new(first: Page, count: u32) -> Option<PageRange> {
        if count == 0 {
            return None;
        }

        if first.next(count - 1).is_none() {
            return None;
        }

        Some(PageRange { first, count })
    }

    pub fn one(first: Page) -> PageRange {
        PageRange { first, count: 1 }
    }

    /// All pages between and including `first` to `last`.
    pub fn between_inclusive(first: Page, last: Page) -> PageRange {
        let count = last.distance_from(first) + 1;
        PageRange { first, count }
    }

    /// All pages from `first` to `last`, including `first` but not `last`.
    pub fn between_exclusive(first: Page, last: Page) -> PageRange {
        let count = last.distance_from(first);
        PageRange { first, count }
    }

    pub fn first(&self) -> Page {
        self.first
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// The last `Page` within the range.
    pub fn last(&self) -> Page {
        self.first.next(self.count - 1).unwrap()
    }

    /// The first `Page` after the range, or `None` if it ends at the last
    /// addressable page.
    pub fn end(&self) -> Option<Page> {
        self.first.next(self.count)
    }

    pub fn contains(&self, page: Page) -> bool {
        page >= self.first && page.distance_from(self.first) < self.count
    }

    pub fn iter(&self) -> PageRangeIter {
        PageRangeIter {
            next: self.first,
            remaining: self.count,
        }
    }
}

impl IntoIterator for PageRange {
    type Item = Page;
    type IntoIter = PageRangeIter;

    fn into_iter(self) -> PageRangeIter {
        self.iter()
    }
}

#[derive(Clone, Debug)]
pub struct PageRangeIter {
    next: Page,
    remaining: u32,
}

impl Iterator for PageRangeIter {
    type Item = Page;

    fn next(&mut self) -> Option<Page> {
        if self.remaining == 0 {
            return None;
        }

        let page = self.next;
        self.remaining -= 1;
        if self.remaining > 0 {
            self.next = page.next(1).unwrap();
        }
        Some(page)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining as usize, Some(self.remaining as usize))
    }
}

impl ExactSizeIterator for PageRangeIter {}
