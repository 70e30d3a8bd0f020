/// Memory subsystem: physical pages, DMA buffers, kernel heap, object
/// caches, and the memory-pressure cleaner registry.
pub mod dma;
pub mod heap;
pub mod objcache;
pub mod phys;

pub use dma::DmaBuf;
pub use objcache::ObjectCache;
pub use phys::{hhdm_offset, set_hhdm_offset, AllocError, PhysAddr, PAGE_SIZE};

use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

/// Round `n` up to the next page boundary.
pub const fn page_align(n: usize) -> usize {
    (n + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// A memory-pressure cleaner: asked to free up to `clean_bytes`, returns
/// the number of bytes actually released.
pub type MemCleaner = Box<dyn Fn(u64) -> u64 + Send + Sync>;

static MEM_CLEANERS: Mutex<Vec<MemCleaner>> = Mutex::new(Vec::new());

/// Register a cleaner invoked when the kernel needs memory back (cache
/// drains, pool trims).
pub fn register_mem_cleaner(cleaner: MemCleaner) {
    MEM_CLEANERS.lock().push(cleaner);
}

/// Walk the cleaner registry asking for `bytes` in total. Returns the
/// number of bytes reported freed.
pub fn clean(bytes: u64) -> u64 {
    let cleaners = MEM_CLEANERS.lock();
    let mut freed = 0;
    for c in cleaners.iter() {
        if freed >= bytes {
            break;
        }
        freed += c(bytes - freed);
    }
    freed
}
