//! Workspace root crate.
//!
//! The VM core (frame allocator, core map, address spaces, fault handler,
//! TLB manager) lives entirely in the `vm` crate and is usable on its own.
//! This crate is the integration point the rest of the kernel - trap entry,
//! the ELF loader, the scheduler, process lifecycle - would depend on; all
//! of those are external collaborators outside this workspace's scope, so
//! there is nothing else to wire up here beyond re-exporting `vm`'s public
//! surface under the workspace's own name.

#![cfg_attr(not(test), no_std)]

pub use vm::*;
