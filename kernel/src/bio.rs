//! Buffer cache wiring.
//!
//! Instantiates [`block_io::BlockIoCache`] with this kernel's lock types:
//! spinlocks for bucket membership and the eviction pool, a sleep lock for
//! each buffer's content (held across a disk read or write).

use block_io::{BlockData, BlockIoCache, Bucket, FreePool};
use kernel_params::{BSIZE, NBUCKET, NBUF};
use once_init::OnceInit;

use crate::{
    error::KernelError,
    ramdisk::RamDisk,
    sync::{SleepLock, SpinLock},
};

type ContentLock = SleepLock<BlockData<BSIZE>>;
type Cache = BlockIoCache<RamDisk, SpinLock<FreePool<ContentLock>>, SpinLock<Bucket<ContentLock>>, ContentLock, NBUCKET>;

pub use block_io::{BlockGuard, BlockHandle};

/// A handle into the buffer cache this kernel instantiates.
pub type Handle<'a> = BlockHandle<'a, RamDisk, SpinLock<FreePool<ContentLock>>, SpinLock<Bucket<ContentLock>>, ContentLock, NBUCKET>;

static CACHE: OnceInit<Cache> = OnceInit::new();

/// The only device id the backing ramdisk answers to.
const ROOT_DEVICE: usize = 0;

/// How many blocks the demonstration ramdisk backing store holds.
const RAMDISK_BLOCKS: usize = NBUF * 4;

/// Builds the backing ramdisk and populates the cache's free pool. Call
/// once, at boot, before any hart calls [`get`].
pub fn init() {
    let cache = Cache::new(RamDisk::new(RAMDISK_BLOCKS));
    cache.init::<BSIZE>(NBUF);
    CACHE.init(cache);
}

/// Acquires the cache slot for `(device, blockno)`, assigning a buffer to
/// it (reading nothing yet) if it is not already resident.
///
/// # Errors
///
/// Returns [`KernelError::NoSuchDevice`] if `device` is not the ramdisk's
/// own device id.
pub fn get(device: usize, blockno: u32) -> Result<Handle<'static>, KernelError> {
    if device != ROOT_DEVICE {
        return Err(KernelError::NoSuchDevice { device });
    }
    Ok(CACHE.get().get(device, blockno))
}

/// Reads `(device, blockno)` through the cache into `out`, pulling it from
/// the backing device on a miss.
pub fn read_block(device: usize, blockno: u32, out: &mut [u8; BSIZE]) -> Result<(), KernelError> {
    let mut handle = get(device, blockno)?;
    let guard = handle.lock::<BSIZE>().read().map_err(|(_, err)| err)?;
    *out = *guard.bytes();
    Ok(())
}

/// Writes `data` to `(device, blockno)` through the cache, immediately
/// pushing it to the backing device.
pub fn write_block(device: usize, blockno: u32, data: &[u8; BSIZE]) -> Result<(), KernelError> {
    let mut handle = get(device, blockno)?;
    let mut guard = handle.lock::<BSIZE>().set_data(data);
    guard.write()
}
