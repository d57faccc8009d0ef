//! Ambient kernel-wide error type.
//!
//! The buffer cache and page allocator signal their own failure semantics
//! (exhaustion, misuse) by panicking, per their own fault model. This type
//! is for the surrounding kernel glue: device setup and the block-device
//! boundary, where a bad request is a recoverable condition rather than a
//! programmer fault.

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("device {device} is not registered")]
    NoSuchDevice { device: usize },
    #[error("block {blockno} is out of range for this device")]
    InvalidBlock { blockno: u32 },
}
