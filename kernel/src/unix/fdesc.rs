/// File descriptor contract consumed by the AIO core.
///
/// I/O is completion-based: `read`/`write` take a completion invoked
/// exactly once with the signed result, possibly before the call
/// returns (RAM-backed files) or from another context later (device
/// files). `supports_*` says whether the operation exists at all
/// (EINVAL otherwise); `is_readable`/`is_writable` reflect the open
/// mode (EBADF otherwise).
use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

use super::{Sysreturn, EINVAL};

pub type IoCompletion = Box<dyn FnOnce(Sysreturn) + Send>;

pub trait Fdesc: Send + Sync {
    fn supports_read(&self) -> bool {
        false
    }

    fn supports_write(&self) -> bool {
        false
    }

    fn is_readable(&self) -> bool {
        false
    }

    fn is_writable(&self) -> bool {
        false
    }

    /// Read up to `len` bytes at `offset` into `buf`.
    fn read(&self, _buf: *mut u8, _len: usize, _offset: u64, completion: IoCompletion) {
        completion(-EINVAL);
    }

    /// Write `len` bytes from `buf` at `offset`.
    fn write(&self, _buf: *const u8, _len: usize, _offset: u64, completion: IoCompletion) {
        completion(-EINVAL);
    }
}

/// RAM-backed file. Reads and writes complete inline; writes past the
/// end grow the backing store.
pub struct RamFile {
    data: Mutex<Vec<u8>>,
}

impl RamFile {
    pub fn new() -> Self {
        Self { data: Mutex::new(Vec::new()) }
    }

    pub fn with_contents(contents: &[u8]) -> Self {
        Self { data: Mutex::new(contents.to_vec()) }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }
}

impl Fdesc for RamFile {
    fn supports_read(&self) -> bool {
        true
    }

    fn supports_write(&self) -> bool {
        true
    }

    fn is_readable(&self) -> bool {
        true
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn read(&self, buf: *mut u8, len: usize, offset: u64, completion: IoCompletion) {
        let data = self.data.lock();
        let offset = offset as usize;
        let n = if offset >= data.len() { 0 } else { len.min(data.len() - offset) };
        if n > 0 {
            unsafe {
                core::ptr::copy_nonoverlapping(data.as_ptr().add(offset), buf, n);
            }
        }
        drop(data);
        completion(n as Sysreturn);
    }

    fn write(&self, buf: *const u8, len: usize, offset: u64, completion: IoCompletion) {
        let mut data = self.data.lock();
        let offset = offset as usize;
        if data.len() < offset + len {
            data.resize(offset + len, 0);
        }
        unsafe {
            core::ptr::copy_nonoverlapping(buf, data.as_mut_ptr().add(offset), len);
        }
        drop(data);
        completion(len as Sysreturn);
    }
}
