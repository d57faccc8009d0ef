use core::ptr::NonNull;
use core::ops::Range;

use kernel_params::{ALLOC_FILL, FREE_FILL};
use mutex_api::Mutex;

struct Run {
    next: Option<NonNull<Run>>,
}

/// A singly-linked chain of free page frames, threaded through the frames
/// themselves.
pub struct FreeList(Option<NonNull<Run>>);

unsafe impl Send for FreeList {}

impl FreeList {
    const fn new() -> Self {
        Self(None)
    }

    fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    fn push(&mut self, page: NonNull<u8>) {
        let mut run = page.cast::<Run>();
        unsafe {
            run.as_mut().next = self.0;
        }
        self.0 = Some(run);
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        let mut run = self.0.take()?;
        self.0 = unsafe { run.as_mut().next };
        Some(run.cast())
    }
}

/// A page allocator with one freelist per hart, falling back to stealing a
/// single frame from another hart's freelist on local exhaustion.
///
/// `FreeListMutex` is the per-hart spinlock; `NCPU` is the number of harts
/// served.
pub struct PageFrameAllocator<FreeListMutex, const PAGE_SIZE: usize, const NCPU: usize> {
    heap: Range<*mut u8>,
    freelists: [FreeListMutex; NCPU],
}

unsafe impl<FreeListMutex: Send, const PAGE_SIZE: usize, const NCPU: usize> Send
    for PageFrameAllocator<FreeListMutex, PAGE_SIZE, NCPU>
{
}
unsafe impl<FreeListMutex: Sync, const PAGE_SIZE: usize, const NCPU: usize> Sync
    for PageFrameAllocator<FreeListMutex, PAGE_SIZE, NCPU>
{
}

impl<FreeListMutex, const PAGE_SIZE: usize, const NCPU: usize>
    PageFrameAllocator<FreeListMutex, PAGE_SIZE, NCPU>
where
    FreeListMutex: Mutex<Data = FreeList>,
{
    /// Creates an allocator over the given page-aligned range of physical
    /// memory. Every per-hart freelist starts out empty; call
    /// [`init`](Self::init) to partition the range onto one hart.
    ///
    /// # Safety
    ///
    /// The given range of physical memory must be valid and must not
    /// overlap with any other memory region.
    pub unsafe fn new(heap: Range<*mut u8>) -> Self {
        assert!(size_of::<Run>() <= PAGE_SIZE);
        assert!(heap.start.addr() > 0);
        assert_eq!(heap.start.addr() % PAGE_SIZE, 0);
        assert_eq!(heap.end.addr() % PAGE_SIZE, 0);

        Self {
            heap,
            freelists: core::array::from_fn(|_| FreeListMutex::new(FreeList::new())),
        }
    }

    /// Splits the managed range into page-aligned frames and frees every one
    /// of them onto `hart`'s freelist. Call once, at boot, from a single
    /// hart before any other hart calls [`allocate`](Self::allocate).
    pub fn init(&self, hart: usize) {
        let mut list = self.freelists[hart].lock();
        let mut p = self.heap.start;
        while p < self.heap.end {
            let page = NonNull::new(p).expect("heap range must not include the null page");
            list.push(page);
            // SAFETY: the loop guard keeps `p` within `heap`, and `new`
            // already checked that `heap`'s bounds are PAGE_SIZE-aligned.
            p = unsafe { p.byte_add(PAGE_SIZE) };
        }
    }

    /// Returns one page frame filled with [`ALLOC_FILL`], or `None` if every
    /// hart's freelist is empty.
    pub fn allocate(&self, hart: usize) -> Option<NonNull<u8>> {
        let local = {
            let mut freelist = self.freelists[hart].lock();
            freelist.pop()
        };
        let frame = local.or_else(|| self.steal(hart))?;
        unsafe {
            frame.as_ptr().write_bytes(ALLOC_FILL, PAGE_SIZE);
        }
        Some(frame)
    }

    /// Looks for a frame on some other hart's freelist, starting just past
    /// `hart` and wrapping around. Holds at most one freelist lock at a
    /// time, except for a brief hand-off where the foreign hart's lock and
    /// `hart`'s own lock are held together; the frame found is returned
    /// directly to the caller and is never placed on `hart`'s own freelist.
    fn steal(&self, hart: usize) -> Option<NonNull<u8>> {
        for other in (0..NCPU).filter(|&h| h != hart) {
            let mut foreign = self.freelists[other].lock();
            if foreign.is_empty() {
                continue;
            }
            // A concurrent free onto `hart`'s own freelist between the local
            // pop in allocate() and here is possible and not treated as a
            // bug: once a steal has committed to a foreign frame it does not
            // re-check the local list.
            let _current = self.freelists[hart].lock();
            let frame = foreign.pop();
            drop(foreign);
            return frame;
        }
        None
    }

    /// Overwrites `page` with [`FREE_FILL`] and links it onto `hart`'s
    /// freelist.
    ///
    /// # Panics
    ///
    /// Panics if `page` is not page-aligned or does not lie within the
    /// managed range.
    pub fn free(&self, hart: usize, page: NonNull<u8>) {
        assert!(
            self.heap.contains(&page.as_ptr()),
            "free of a frame outside the managed range"
        );
        assert_eq!(
            page.addr().get() % PAGE_SIZE,
            0,
            "free of a misaligned frame"
        );

        unsafe {
            page.as_ptr().write_bytes(FREE_FILL, PAGE_SIZE);
        }

        let mut list = self.freelists[hart].lock();
        list.push(page);
    }
}

/// A type that can retrieve the process-wide [`PageFrameAllocator`] and the
/// identity of the calling hart, exposed as plain `allocate`/`free` so that
/// generic consumers (e.g. [`crate::boxed::PageBox`]) never need to name a
/// hart themselves.
pub trait RetrievePageFrameAllocator<const PAGE_SIZE: usize> {
    fn allocate() -> Option<NonNull<u8>>;

    fn allocate_zeroed() -> Option<NonNull<u8>> {
        let page = Self::allocate()?;
        unsafe {
            page.as_ptr().write_bytes(0, PAGE_SIZE);
        }
        Some(page)
    }

    /// # Safety
    ///
    /// `page` must have been previously returned by [`allocate`](Self::allocate)
    /// or [`allocate_zeroed`](Self::allocate_zeroed) on this same type, and
    /// must not be accessed or freed again afterwards.
    unsafe fn free(page: NonNull<u8>);
}

#[cfg(test)]
mod tests {
    use std::cell::UnsafeCell;
    use std::collections::HashSet;
    use std::ops::{Deref, DerefMut};

    use super::*;

    const PAGE_SIZE: usize = 64;
    const NCPU: usize = 2;

    struct StdMutex<T>(std::sync::Mutex<T>);
    struct StdMutexGuard<'a, T>(std::sync::MutexGuard<'a, T>);

    impl<T> Mutex for StdMutex<T> {
        type Data = T;
        type Guard<'a>
            = StdMutexGuard<'a, T>
        where
            Self: 'a;

        fn new(data: Self::Data) -> Self {
            Self(std::sync::Mutex::new(data))
        }

        fn lock(&self) -> Self::Guard<'_> {
            StdMutexGuard(self.0.lock().unwrap())
        }
    }

    impl<T> Deref for StdMutexGuard<'_, T> {
        type Target = T;
        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }

    impl<T> DerefMut for StdMutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.0
        }
    }

    type Allocator = PageFrameAllocator<StdMutex<FreeList>, PAGE_SIZE, NCPU>;

    #[repr(align(64))]
    struct Heap(UnsafeCell<[u8; PAGE_SIZE * 100]>);
    unsafe impl Sync for Heap {}

    fn new_allocator() -> (Box<Heap>, Allocator) {
        let heap = Box::new(Heap(UnsafeCell::new([0; PAGE_SIZE * 100])));
        let range = unsafe { (*heap.0.get()).as_mut_ptr_range() };
        let allocator = unsafe { Allocator::new(range) };
        (heap, allocator)
    }

    #[test]
    fn alloc_is_filled_and_page_aligned() {
        let (_heap, allocator) = new_allocator();
        allocator.init(0);

        let page = allocator.allocate(0).unwrap();
        assert_eq!(page.addr().get() % PAGE_SIZE, 0);
        let bytes = unsafe { core::slice::from_raw_parts(page.as_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == ALLOC_FILL));
    }

    #[test]
    fn free_then_alloc_returns_same_frame() {
        let (_heap, allocator) = new_allocator();
        allocator.init(0);

        let page = allocator.allocate(0).unwrap();
        allocator.free(0, page);
        let page2 = allocator.allocate(0).unwrap();
        assert_eq!(page, page2);
    }

    #[test]
    fn free_fills_with_distinct_pattern() {
        let (_heap, allocator) = new_allocator();
        allocator.init(0);

        let page = allocator.allocate(0).unwrap();
        allocator.free(0, page);
        let bytes = unsafe { core::slice::from_raw_parts(page.as_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == FREE_FILL));
    }

    #[test]
    #[should_panic(expected = "misaligned")]
    fn free_of_misaligned_frame_panics() {
        let (_heap, allocator) = new_allocator();
        allocator.init(0);
        let page = allocator.allocate(0).unwrap();
        let off_by_one = unsafe { NonNull::new_unchecked(page.as_ptr().add(1)) };
        allocator.free(0, off_by_one);
    }

    #[test]
    fn s5_steal_moves_exactly_one_frame_to_the_caller() {
        let (_heap, allocator) = new_allocator();
        allocator.init(0);

        // hart 1 has nothing; it must steal from hart 0.
        let before = count_free_and_restock(&allocator, 0);
        let stolen = allocator.allocate(1);
        assert!(stolen.is_some());
        let after = count_free_and_restock(&allocator, 0);
        assert_eq!(after, before - 1);
        allocator.free(1, stolen.unwrap());
    }

    #[test]
    fn s6_exhaustion_then_free_alloc_round_trips() {
        let (_heap, allocator) = new_allocator();
        allocator.init(0);

        let mut pages = vec![];
        while let Some(p) = allocator.allocate(0) {
            pages.push(p);
        }
        assert!(allocator.allocate(0).is_none());
        assert!(allocator.allocate(1).is_none());

        let f = pages.pop().unwrap();
        allocator.free(0, f);
        let reused = allocator.allocate(0).unwrap();
        assert_eq!(reused, f);
        pages.push(reused);

        for p in pages {
            allocator.free(0, p);
        }
    }

    #[test]
    fn all_frames_are_accounted_for_and_distinct() {
        let (_heap, allocator) = new_allocator();
        allocator.init(0);

        let mut pages = vec![];
        let mut addrs = HashSet::new();
        while let Some(p) = allocator.allocate(0) {
            assert!(addrs.insert(p.addr()), "frame handed out twice");
            pages.push(p);
        }
        assert_eq!(pages.len(), 100);
        for p in pages {
            allocator.free(0, p);
        }
    }

    /// Drains `hart`'s freelist to count it, then frees every frame straight
    /// back so the allocator is left as it was found.
    fn count_free_and_restock(allocator: &Allocator, hart: usize) -> usize {
        let mut taken = vec![];
        while let Some(p) = allocator.allocate(hart) {
            taken.push(p);
        }
        let n = taken.len();
        for p in taken {
            allocator.free(hart, p);
        }
        n
    }
}
