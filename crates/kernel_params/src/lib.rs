//! Compile-time parameters shared by the kernel core.
//!
//! These mirror the handful of `#define`s a small teaching kernel carries
//! in `param.h`: sizes chosen once, at build time, and never revisited at
//! runtime.
#![no_std]

/// Number of buffers held by the block I/O cache.
pub const NBUF: usize = 30;

/// Number of hash buckets in the block I/O cache.
///
/// Must be prime and co-prime with [`NBUF`] so that block numbers spread
/// evenly across buckets instead of clustering.
pub const NBUCKET: usize = 13;

const _: () = assert!(gcd(NBUF, NBUCKET) == 1, "NBUCKET must be co-prime with NBUF");

const fn gcd(a: usize, b: usize) -> usize {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Maximum number of harts (logical CPUs) the kernel schedules across.
pub const NCPU: usize = 8;

/// Size in bytes of one disk block.
pub const BSIZE: usize = 1024;

/// Size in bytes of one physical page frame.
pub const PGSIZE: usize = 4096;

/// Byte pattern written into a page frame immediately after [`allocate`](../page_alloc/index.html).
///
/// Catches use-before-init: code that reads an allocated page without
/// writing it first will see this value rather than stale or zeroed data.
pub const ALLOC_FILL: u8 = 0x05;

/// Byte pattern written into a page frame immediately after `free`.
///
/// Catches use-after-free: a dangling reference into a freed page will
/// observe this value instead of its old contents.
pub const FREE_FILL: u8 = 0x01;
