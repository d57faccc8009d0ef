//! Interrupt enable/disable bookkeeping.
//!
//! Spinlocks disable interrupts for as long as they are held, to avoid a
//! hart deadlocking with itself (acquiring a lock, then taking a timer
//! interrupt whose handler tries to acquire the same lock). Disabling and
//! re-enabling nest: [`push_disabled`] records the enabled/disabled state
//! only on the outermost call, and the matching [`Guard`] drop restores it
//! only once the nesting unwinds back to zero.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use kernel_params::NCPU;
use riscv::register::sstatus;

use crate::hart;

/// Enables interrupts on the current hart.
pub fn enable() {
    unsafe {
        sstatus::set_sie();
    }
}

/// Disables interrupts on the current hart.
pub fn disable() {
    unsafe {
        sstatus::clear_sie();
    }
}

/// Returns whether interrupts are currently enabled on this hart.
pub fn is_enabled() -> bool {
    sstatus::read().sie()
}

/// Disables interrupts, remembering whether they were enabled beforehand.
///
/// Returns a guard that restores the saved state when dropped. Nested
/// calls only restore interrupts once the outermost guard drops.
pub fn push_disabled() -> Guard {
    let was_enabled = is_enabled();
    disable();

    let hartid = raw_hart_id();
    CPU_STATE[hartid].push(was_enabled);
    Guard { hartid }
}

/// Restores interrupt state saved by a prior [`push_disabled`] whose guard
/// was [`forgotten`](Guard::forget).
///
/// # Safety
///
/// Must be paired 1:1 with a forgotten [`Guard`] on the same hart.
pub unsafe fn pop_disabled() {
    drop(Guard {
        hartid: raw_hart_id(),
    });
}

pub fn with_push_disabled<T>(f: impl FnOnce() -> T) -> T {
    let _guard = push_disabled();
    f()
}

/// Reads `tp` directly rather than through [`hart::id`], which asserts
/// interrupts are already disabled -- exactly the invariant this module is
/// establishing.
fn raw_hart_id() -> usize {
    disable();
    hart::id()
}

pub struct Guard {
    hartid: usize,
}

impl Guard {
    /// Leaks the guard without restoring interrupt state. Paired with an
    /// explicit [`pop_disabled`] later so the disabled region can span
    /// more than one lexical scope (e.g. a lock acquired in one function
    /// and released in another).
    pub fn forget(self) {
        core::mem::forget(self);
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        assert_eq!(self.hartid, raw_hart_id());
        assert!(!is_enabled());
        if let Some(was_enabled) = CPU_STATE[self.hartid].pop() {
            if was_enabled {
                enable();
            }
        }
    }
}

static CPU_STATE: [NestingState; NCPU] = [const { NestingState::new() }; NCPU];

struct NestingState {
    depth: AtomicUsize,
    was_enabled_outermost: AtomicBool,
}

impl NestingState {
    const fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            was_enabled_outermost: AtomicBool::new(false),
        }
    }

    fn push(&self, was_enabled: bool) {
        let depth = self.depth.fetch_add(1, Ordering::Acquire);
        if depth == 0 {
            self.was_enabled_outermost.store(was_enabled, Ordering::Relaxed);
        }
    }

    fn pop(&self) -> Option<bool> {
        assert!(self.depth.load(Ordering::Relaxed) > 0);
        let was_enabled = self.was_enabled_outermost.load(Ordering::Relaxed);
        if self.depth.fetch_sub(1, Ordering::Release) == 1 {
            return Some(was_enabled);
        }
        None
    }
}
