/// Eventfd-style counter descriptor, the RESFD completion side channel:
/// each AIO completion adds 1 to the counter.
use spin::Mutex;

use super::fdesc::{Fdesc, IoCompletion};
use super::{Sysreturn, EAGAIN, EINVAL};

pub struct EventFd {
    count: Mutex<u64>,
}

impl EventFd {
    pub fn new() -> Self {
        Self { count: Mutex::new(0) }
    }

    /// Current counter value (diagnostics and tests).
    pub fn value(&self) -> u64 {
        *self.count.lock()
    }
}

impl Fdesc for EventFd {
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

    /// Non-blocking read: returns and clears the counter, EAGAIN when
    /// zero.
    fn read(&self, buf: *mut u8, len: usize, _offset: u64, completion: IoCompletion) {
        if len < 8 {
            completion(-EINVAL);
            return;
        }
        let mut count = self.count.lock();
        if *count == 0 {
            drop(count);
            completion(-EAGAIN);
            return;
        }
        let val = core::mem::take(&mut *count);
        drop(count);
        unsafe {
            core::ptr::copy_nonoverlapping(val.to_ne_bytes().as_ptr(), buf, 8);
        }
        completion(8 as Sysreturn);
    }

    /// Add the 8-byte value to the counter.
    fn write(&self, buf: *const u8, len: usize, _offset: u64, completion: IoCompletion) {
        if len != 8 {
            completion(-EINVAL);
            return;
        }
        let mut bytes = [0u8; 8];
        unsafe {
            core::ptr::copy_nonoverlapping(buf, bytes.as_mut_ptr(), 8);
        }
        *self.count.lock() += u64::from_ne_bytes(bytes);
        completion(8 as Sysreturn);
    }
}
