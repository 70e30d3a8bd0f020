/// Bitmap physical page allocator.
///
/// Tracks 4 KiB pages. Supports contiguous runs with power-of-two page
/// alignment, as required by DMA buffers and the legacy virtqueue layout
/// (whole queue in one page-aligned allocation).
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// Higher-Half Direct Map offset, set once at boot from the Limine HHDM
/// response. virt = phys + HHDM_OFFSET for all physical memory.
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Set the HHDM offset. Must happen before any `PhysAddr::as_ptr` call.
pub fn set_hhdm_offset(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Relaxed);
}

pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Relaxed)
}

/// A physical address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Virtual pointer through the HHDM.
    pub fn as_ptr<T>(self) -> *mut T {
        (self.0 + HHDM_OFFSET.load(Ordering::Relaxed)) as *mut T
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

/// Physical address of an HHDM virtual pointer.
pub fn physical_from_virtual<T>(ptr: *const T) -> PhysAddr {
    PhysAddr::new(ptr as u64 - HHDM_OFFSET.load(Ordering::Relaxed))
}

#[derive(Debug)]
pub enum AllocError {
    OutOfMemory,
    InvalidAlignment,
    InvalidSize,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "out of physical memory"),
            AllocError::InvalidAlignment => write!(f, "invalid alignment"),
            AllocError::InvalidSize => write!(f, "invalid size"),
        }
    }
}

pub const PAGE_SIZE: usize = 4096;

/// Up to 4 GiB of tracked memory: 1M pages, 128 KiB bitmap, stored inline.
const MAX_PAGES: usize = 1024 * 1024;
const BITMAP_WORDS: usize = MAX_PAGES / 64;

pub struct PhysPageAllocator {
    inner: Mutex<Bitmap>,
}

struct Bitmap {
    words: [u64; BITMAP_WORDS],
    total_pages: usize,
    free_pages: usize,
}

impl Bitmap {
    #[inline]
    fn is_used(&self, page: usize) -> bool {
        self.words[page / 64] & (1 << (page % 64)) != 0
    }

    #[inline]
    fn set_used(&mut self, page: usize) {
        self.words[page / 64] |= 1 << (page % 64);
    }

    #[inline]
    fn set_free(&mut self, page: usize) {
        self.words[page / 64] &= !(1 << (page % 64));
    }
}

impl PhysPageAllocator {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Bitmap {
                words: [!0u64; BITMAP_WORDS], // everything used until init
                total_pages: 0,
                free_pages: 0,
            }),
        }
    }

    /// Initialize from a list of (base, length) usable RAM regions.
    pub fn init(&self, regions: &[(u64, u64)]) {
        let mut inner = self.inner.lock();
        for &(base, length) in regions {
            let start = (base as usize + PAGE_SIZE - 1) / PAGE_SIZE;
            let end = ((base + length) as usize / PAGE_SIZE).min(MAX_PAGES);
            for page in start..end {
                if inner.is_used(page) {
                    inner.set_free(page);
                    inner.free_pages += 1;
                }
            }
        }
        let max_addr = regions.iter().map(|&(b, l)| b + l).max().unwrap_or(0);
        inner.total_pages = (max_addr as usize / PAGE_SIZE).min(MAX_PAGES);
    }

    /// Allocate `count` physically contiguous pages aligned to `align`
    /// pages (power of two).
    ///
    /// The scan grows a run of free pages and restarts it (rounded up
    /// to the alignment) whenever a used page breaks it. Fully occupied
    /// bitmap words are skipped whole, so densely used memory is walked
    /// 64 pages at a time.
    pub fn alloc_pages(&self, count: usize, align: usize) -> Result<PhysAddr, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment);
        }
        if count == 0 {
            return Err(AllocError::InvalidSize);
        }
        let amask = align - 1;

        let mut inner = self.inner.lock();
        let total = inner.total_pages;
        let mut run_start = 0usize; // aligned start of the current run
        let mut page = 0usize;      // next page to examine

        while run_start + count <= total {
            // Word-at-a-time skip over fully used stretches.
            if page & 63 == 0 {
                let before = page;
                while page < total && inner.words[page / 64] == !0u64 {
                    page += 64;
                }
                if page != before {
                    run_start = (page + amask) & !amask;
                    page = run_start;
                    continue;
                }
            }
            if inner.is_used(page) {
                run_start = (page + 1 + amask) & !amask;
                page = run_start;
                continue;
            }
            page += 1;
            if page - run_start == count {
                for p in run_start..page {
                    inner.set_used(p);
                }
                inner.free_pages -= count;
                return Ok(PhysAddr::new((run_start * PAGE_SIZE) as u64));
            }
        }
        Err(AllocError::OutOfMemory)
    }

    pub fn alloc_page(&self) -> Result<PhysAddr, AllocError> {
        self.alloc_pages(1, 1)
    }

    /// Free `count` pages at `base`. Double frees are ignored rather than
    /// corrupting the free count.
    pub fn free_pages(&self, base: PhysAddr, count: usize) {
        let mut inner = self.inner.lock();
        let start = base.as_u64() as usize / PAGE_SIZE;
        for page in start..(start + count).min(MAX_PAGES) {
            if inner.is_used(page) {
                inner.set_free(page);
                inner.free_pages += 1;
            }
        }
    }

    /// Mark a range as used (kernel image, MMIO windows).
    pub fn mark_used(&self, base: PhysAddr, count: usize) {
        let mut inner = self.inner.lock();
        let start = base.as_u64() as usize / PAGE_SIZE;
        for page in start..(start + count).min(MAX_PAGES) {
            if !inner.is_used(page) {
                inner.set_used(page);
                inner.free_pages -= 1;
            }
        }
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free_pages
    }
}

/// Global physical page allocator.
pub static PHYS_ALLOCATOR: PhysPageAllocator = PhysPageAllocator::new();
