//! OnyxOS kernel library
//!
//! A small cooperative x86_64 kernel: Multiboot2 boot-info parsing,
//! bitmap physical memory management, 4-level paging, a first-fit early
//! heap, cooperative threads, a block device layer with MBR partitions,
//! and a VFS hosting devfs and a minimal exFAT.
//!
//! The crate builds for bare metal and for the host; on the host the
//! hardware-facing pieces compile out and the rest is exercised by the
//! standard test harness.

#![no_std]

// Host builds (tests, tooling) link std and use the system allocator so
// collection types work under the normal harness.
#[cfg(not(target_os = "none"))]
extern crate std;

extern crate alloc;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;
#[macro_use]
pub mod serial;

pub mod block;
pub mod bootinfo;
pub mod error;
pub mod fs;
pub mod input;
pub mod logger;
pub mod mm;
pub mod sched;
pub mod shell;
pub mod vga;

#[cfg(test)]
mod integration_tests;

pub use error::{KernelError, KernelResult};
