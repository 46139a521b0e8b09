//! Address, length, and page/frame primitives shared between the VM core
//! and anything that needs to talk about physical or virtual memory ranges.
//!
//! This crate has no dependency on any particular board or bootstrap
//! protocol; it only knows about 32-bit addresses and 4 KiB pages.

#![no_std]

pub mod log;
pub mod memory;
