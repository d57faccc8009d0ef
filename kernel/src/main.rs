#![no_std]
#![no_main]

use core::{
    hint,
    sync::atomic::{AtomicBool, Ordering},
};

extern crate alloc;

mod bio;
mod console;
mod error;
mod hart;
mod interrupt;
mod kalloc;
mod memlayout;
mod ramdisk;
mod start;
mod sync;

#[global_allocator]
static HEAP: page_alloc::GlobalHeapAllocator<kalloc::Retriever, kalloc::HeapRetriever, { kernel_params::PGSIZE }> =
    page_alloc::GlobalHeapAllocator::new();

static STARTED: AtomicBool = AtomicBool::new(false);

// start() jumps here in supervisor mode on all harts.
extern "C" fn main() -> ! {
    interrupt::disable();

    if hart::id() == 0 {
        console::init();
        kprintln!();
        kprintln!("kernel is booting");
        kprintln!();

        kalloc::init(); // physical page allocator
        bio::init(); // buffer cache and backing store

        STARTED.store(true, Ordering::Release);
    } else {
        while !STARTED.load(Ordering::Acquire) {
            hint::spin_loop();
        }
        kprintln!("hart {} starting", hart::id());
    }

    loop {
        hint::spin_loop();
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    console::PANICKED.store(true, Ordering::SeqCst);
    kprintln!("panic: {info}");
    loop {
        hint::spin_loop();
    }
}
