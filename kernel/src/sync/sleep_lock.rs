use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use mutex_api::Mutex;
use once_init::OnceInit;

/// A scheduler hook a sleep-capable lock calls into when it must block,
/// instead of burning cycles spinning.
///
/// `chan` is a "sleep channel": any stable address uniquely identifying
/// what's being waited for. A lock uses its own address. `sleep` must not
/// return until some other hart has called `wakeup` with the same `chan`
/// at least once after `sleep` was entered.
pub trait SleepWake: Sync {
    fn sleep(&self, chan: usize);
    fn wakeup(&self, chan: usize);
}

static SCHEDULER: OnceInit<&'static dyn SleepWake> = OnceInit::new();

/// Registers the scheduler's sleep/wakeup hook. Call once, during boot.
pub fn install_scheduler(scheduler: &'static dyn SleepWake) {
    SCHEDULER.init(scheduler);
}

fn sleep(chan: usize) {
    match SCHEDULER.try_get() {
        Ok(scheduler) => scheduler.sleep(chan),
        // no scheduler registered yet (e.g. running under test, or before
        // install_scheduler() runs at boot): fall back to spinning so
        // correctness doesn't depend on boot order.
        Err(_) => core::hint::spin_loop(),
    }
}

fn wakeup(chan: usize) {
    if let Ok(scheduler) = SCHEDULER.try_get() {
        scheduler.wakeup(chan);
    }
}

/// A lock that, on contention, parks the calling hart via [`SleepWake`]
/// instead of spinning.
///
/// Backs the buffer cache's per-buffer content lock: held across a disk
/// read or write, which can take far longer than any spinlock critical
/// section should.
pub struct SleepLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SleepLock<T> where T: Send {}

impl<T> SleepLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let chan = core::ptr::from_ref(self).addr();
        while self.locked.swap(true, Ordering::Acquire) {
            sleep(chan);
        }
        SleepLockGuard { lock: self }
    }
}

impl<T> Mutex for SleepLock<T> {
    type Data = T;
    type Guard<'a>
        = SleepLockGuard<'a, T>
    where
        T: 'a;

    fn new(data: Self::Data) -> Self {
        Self::new(data)
    }

    fn lock(&self) -> Self::Guard<'_> {
        self.lock()
    }
}

pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

unsafe impl<T> Send for SleepLockGuard<'_, T> where T: Send {}
unsafe impl<T> Sync for SleepLockGuard<'_, T> where T: Sync {}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        wakeup(core::ptr::from_ref(self.lock).addr());
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}
