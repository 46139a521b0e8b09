//! Address, length, page, and frame primitives.
//!
//! Everything here is architecture-agnostic: it knows about 32-bit addresses
//! and 4 KiB pages, but nothing about page table formats, TLBs, or how RAM is
//! actually discovered. Those live in the `vm` crate.

pub mod addr;
pub mod page;

pub use addr::*;
pub use page::*;
