//! Physical memory layout.
//!
//! qemu -machine virt is set up like this, based on qemu's
//! `hw/riscv/virt.c`:
//!
//! ```text
//! 0x1000_0000 -- UART0
//! 0x8000_0000 -- boot ROM jumps here in machine mode; -kernel loads here
//! unused RAM after 0x8000_0000
//! ```
//!
//! The kernel itself occupies `[KERNEL_BASE, KERNEL_END)`; everything from
//! `KERNEL_END` up to `PHYS_TOP` is handed to the page allocator.

use core::arch::global_asm;

/// qemu puts UART registers here in physical memory.
pub const UART0: usize = 0x1000_0000;

/// Total physical memory qemu -machine virt gives us, starting at
/// `KERNEL_BASE`.
const PHYS_MEMORY_SIZE: usize = 128 * 1024 * 1024;

global_asm!(
    "
        .global _kernel_base_addr
        _kernel_base_addr: .dword _kernel_base
        .global _kernel_end_addr
        _kernel_end_addr: .dword _kernel_end
    "
);

unsafe extern "C" {
    #[link_name = "_kernel_base_addr"]
    static KERNEL_BASE: usize;

    /// Address of the end of the kernel's loaded image; the page allocator
    /// manages everything from here onward.
    #[link_name = "_kernel_end_addr"]
    static KERNEL_END: usize;
}

/// Start of the page allocator's managed range: the first page-aligned
/// address at or after the end of the kernel image.
pub fn kernel_end() -> *mut u8 {
    unsafe { core::ptr::with_exposed_provenance_mut(KERNEL_END) }
}

/// End of the page allocator's managed range (exclusive).
pub fn phys_top() -> *mut u8 {
    unsafe { core::ptr::with_exposed_provenance_mut(KERNEL_BASE + PHYS_MEMORY_SIZE) }
}
