//! Physical page allocation.
//!
//! Wires [`page_alloc::PageFrameAllocator`] to this kernel's hart model and
//! memory layout: one process-wide allocator, reached through [`OnceInit`],
//! with one freelist per hart.

use core::ptr::NonNull;

use kernel_params::{NCPU, PGSIZE};
use once_init::OnceInit;
use page_alloc::{
    FreeList, HeapAllocator, PageFrameAllocator, RetrieveHeapAllocator, RetrievePageFrameAllocator,
};

use crate::{
    hart, memlayout,
    sync::{SpinLock, SpinLockGuard},
};

type Allocator = PageFrameAllocator<SpinLock<FreeList>, PGSIZE, NCPU>;

static ALLOCATOR: OnceInit<Allocator> = OnceInit::new();

static HEAP_ALLOCATOR: SpinLock<HeapAllocator<PGSIZE>> = SpinLock::new(HeapAllocator::new());

/// Hook letting [`page_alloc::GlobalHeapAllocator`] reach this kernel's
/// sub-page heap allocator.
pub struct HeapRetriever;

impl RetrieveHeapAllocator<PGSIZE> for HeapRetriever {
    type AllocatorRef = SpinLockGuard<'static, HeapAllocator<PGSIZE>>;

    fn retrieve_allocator() -> Self::AllocatorRef {
        HEAP_ALLOCATOR.lock()
    }
}

/// Initializes the page allocator over `[kernel_end, phys_top)` and frees
/// the whole range onto the calling hart's freelist. Call once, at boot,
/// before any hart calls [`allocate`] or [`free`].
pub fn init() {
    let start = memlayout::kernel_end().wrapping_add(PGSIZE - 1);
    let start = start.wrapping_sub(start.addr() % PGSIZE);
    let end = memlayout::phys_top();
    let end = end.wrapping_sub(end.addr() % PGSIZE);

    let allocator = unsafe { Allocator::new(start..end) };
    ALLOCATOR.init(allocator);
    ALLOCATOR.get().init(hart::id());
}

pub fn allocate() -> Option<NonNull<u8>> {
    ALLOCATOR.get().allocate(hart::id())
}

/// # Safety
///
/// `page` must have been returned by [`allocate`] and not freed since.
pub unsafe fn free(page: NonNull<u8>) {
    ALLOCATOR.get().free(hart::id(), page);
}

/// Hook letting generic allocator-backed types (e.g. [`page_alloc::PageBox`])
/// reach this kernel's page allocator without naming a hart themselves.
pub struct Retriever;

impl RetrievePageFrameAllocator<PGSIZE> for Retriever {
    fn allocate() -> Option<NonNull<u8>> {
        self::allocate()
    }

    unsafe fn free(page: NonNull<u8>) {
        unsafe { self::free(page) };
    }
}
