mod sleep_lock;
mod spin_lock;

pub use self::{
    sleep_lock::{SleepLock, SleepLockGuard, SleepWake, install_scheduler},
    spin_lock::{SpinLock, SpinLockGuard},
};
