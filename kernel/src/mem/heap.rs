/// Kernel heap — power-of-two size classes over the physical page
/// allocator.
///
/// Classes run 8..=2048 bytes (shifts 3..=11); larger requests take
/// whole pages, so every class fits at least one tagged chunk per
/// page. Every allocation is preceded by a one-word tag: the class
/// index for chunk allocations, or the page count with the high bit
/// set for page-backed ones, so deallocation needs no layout. Tags are
/// written when a chunk is handed out, not when a page is carved, so
/// free chunks carry no bookkeeping.
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use spin::Mutex;

use super::phys::{PhysAddr, PAGE_SIZE, PHYS_ALLOCATOR};

const MIN_CLASS_SHIFT: u32 = 3;
const MAX_CLASS_SHIFT: u32 = 11;
const CLASS_COUNT: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;

/// Tag word ahead of each allocation, padded so payloads stay
/// 16-aligned.
const TAG_SIZE: usize = 16;
/// Marks a page-backed allocation; the low bits hold the page count.
const TAG_LARGE: usize = 1 << (usize::BITS - 1);

struct FreeNode {
    next: *mut FreeNode,
}

struct Classes {
    heads: [*mut FreeNode; CLASS_COUNT],
}

unsafe impl Send for Classes {}

pub struct KernelHeap {
    classes: Mutex<Classes>,
}

impl KernelHeap {
    pub const fn new() -> Self {
        Self {
            classes: Mutex::new(Classes { heads: [ptr::null_mut(); CLASS_COUNT] }),
        }
    }

    /// Class index serving `size` bytes, or None for the page-backed
    /// path.
    fn class_of(size: usize) -> Option<usize> {
        if size > 1 << MAX_CLASS_SHIFT {
            return None;
        }
        let shift = size.next_power_of_two().trailing_zeros().max(MIN_CLASS_SHIFT);
        Some((shift - MIN_CLASS_SHIFT) as usize)
    }

    fn chunk_size(class: usize) -> usize {
        1usize << (class as u32 + MIN_CLASS_SHIFT)
    }

    /// Carve one fresh page into chunks for `class`, chaining them back
    /// to front, and splice the chain onto the class list.
    fn grow(classes: &mut Classes, class: usize) -> bool {
        let stride = TAG_SIZE + Self::chunk_size(class);
        let page = match PHYS_ALLOCATOR.alloc_page() {
            Ok(p) => p,
            Err(_) => return false,
        };
        let base = page.as_ptr::<u8>();
        let mut chain = classes.heads[class];
        let mut offset = (PAGE_SIZE / stride) * stride;
        while offset >= stride {
            offset -= stride;
            let node = unsafe { base.add(offset + TAG_SIZE) } as *mut FreeNode;
            unsafe { (*node).next = chain };
            chain = node;
        }
        classes.heads[class] = chain;
        true
    }

    /// Page-backed path for requests beyond the largest class.
    unsafe fn alloc_untracked_pages(need: usize) -> *mut u8 {
        let pages = super::page_align(need + TAG_SIZE) / PAGE_SIZE;
        let phys = match PHYS_ALLOCATOR.alloc_pages(pages, 1) {
            Ok(p) => p,
            Err(_) => return ptr::null_mut(),
        };
        let base = phys.as_ptr::<u8>();
        (base as *mut usize).write(TAG_LARGE | pages);
        base.add(TAG_SIZE)
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let need = layout.size().max(layout.align());
        let class = match Self::class_of(need) {
            Some(c) => c,
            None => return Self::alloc_untracked_pages(need),
        };

        let mut classes = self.classes.lock();
        if classes.heads[class].is_null() && !Self::grow(&mut classes, class) {
            return ptr::null_mut();
        }
        let node = classes.heads[class];
        classes.heads[class] = (*node).next;
        drop(classes);

        let p = node as *mut u8;
        (p.sub(TAG_SIZE) as *mut usize).write(class);
        p
    }

    unsafe fn dealloc(&self, p: *mut u8, _layout: Layout) {
        if p.is_null() {
            return;
        }
        let tag = (p.sub(TAG_SIZE) as *const usize).read();
        if tag & TAG_LARGE != 0 {
            // Page allocator frees take the physical address; the tag
            // sits at an HHDM pointer.
            let phys = PhysAddr::new(p.sub(TAG_SIZE) as u64 - super::hhdm_offset());
            PHYS_ALLOCATOR.free_pages(phys, tag & !TAG_LARGE);
        } else {
            let node = p as *mut FreeNode;
            let mut classes = self.classes.lock();
            (*node).next = classes.heads[tag];
            classes.heads[tag] = node;
        }
    }
}

unsafe impl Sync for KernelHeap {}

/// Global kernel heap allocator.
#[global_allocator]
pub static HEAP: KernelHeap = KernelHeap::new();
