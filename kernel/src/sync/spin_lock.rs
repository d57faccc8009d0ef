use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use mutex_api::Mutex;

use crate::{hart, interrupt};

/// A spinlock, disabling interrupts on the current hart for as long as it
/// is held.
///
/// Backs the buffer cache's per-bucket and eviction locks, and the page
/// allocator's per-hart freelists: short critical sections with no need to
/// ever sleep.
pub struct SpinLock<T> {
    locked: AtomicBool,
    holder: UnsafeCell<usize>,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            holder: UnsafeCell::new(hart::INVALID_HART),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let int_guard = interrupt::push_disabled();

        assert!(!self.holding());

        while self.locked.swap(true, Ordering::Acquire) {}

        unsafe {
            *self.holder.get() = hart::id();
        }

        // the guard's drop re-enables interrupts; push_disabled's own
        // guard must not also do so.
        int_guard.forget();

        SpinLockGuard { lock: self }
    }

    fn holding(&self) -> bool {
        assert!(!interrupt::is_enabled());
        self.locked.load(Ordering::Relaxed) && unsafe { *self.holder.get() } == hart::id()
    }
}

impl<T> Mutex for SpinLock<T> {
    type Data = T;
    type Guard<'a>
        = SpinLockGuard<'a, T>
    where
        T: 'a;

    fn new(data: Self::Data) -> Self {
        Self::new(data)
    }

    fn lock(&self) -> Self::Guard<'_> {
        self.lock()
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

unsafe impl<T> Send for SpinLockGuard<'_, T> where T: Send {}
unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        assert!(self.lock.holding());
        unsafe {
            *self.lock.holder.get() = hart::INVALID_HART;
        }
        self.lock.locked.store(false, Ordering::Release);
        unsafe {
            interrupt::pop_disabled();
        }
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}
