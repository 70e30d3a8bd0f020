/// Virtio split virtqueue (legacy layout) with descriptor chains and
/// per-chain completion callbacks.
///
/// Descriptors + available ring + padding + used ring live in a single
/// page-aligned physical allocation; the device derives all three
/// addresses from the Page Frame Number written to the Queue Address
/// register.
///
/// Layout:
///   [descriptors: 16 * queue_size]
///   [available ring: 4 + 2 * queue_size + 2 (used_event)]
///   [padding to 4096 boundary]
///   [used ring: 4 + 8 * queue_size + 2 (avail_event)]
///
/// A message (`VqMsg`) collects scatter-gather entries; committing it
/// claims a descriptor chain, publishes it in the available ring, and
/// stores a completion invoked with the device-written length when the
/// chain comes back through the used ring.
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};
use static_assertions::const_assert_eq;

use crate::mem::{AllocError, DmaBuf, PhysAddr};

const VIRTQ_DESC_F_NEXT: u16 = 1;
const VIRTQ_DESC_F_WRITE: u16 = 2;
const VIRTQ_USED_F_NO_NOTIFY: u16 = 1;
const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1;

/// A single descriptor in the descriptor table.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

const_assert_eq!(core::mem::size_of::<VirtqDesc>(), 16);

/// Used ring element: head descriptor index plus bytes written.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct VirtqUsedElem {
    id: u32,
    len: u32,
}

/// Completion callback, invoked with the total bytes the device wrote
/// into the chain's writable buffers.
pub type VqCompletion = Box<dyn FnOnce(u32) + Send>;

/// Doorbell callback installed by the transport.
pub type VqNotify = Box<dyn Fn() + Send>;

#[derive(Debug)]
pub enum VqError {
    QueueFull,
    EmptyMessage,
}

impl core::fmt::Display for VqError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VqError::QueueFull => write!(f, "virtqueue descriptor table full"),
            VqError::EmptyMessage => write!(f, "empty virtqueue message"),
        }
    }
}

struct SgEntry {
    addr: u64,
    len: u32,
    write: bool,
}

/// Scatter-gather list under construction, not yet visible to the
/// device.
pub struct VqMsg {
    sgs: Vec<SgEntry>,
}

impl VqMsg {
    /// Append one buffer. `device_writable` marks buffers the device
    /// fills (RX payloads, command acks).
    pub fn push(&mut self, addr: PhysAddr, len: u32, device_writable: bool) {
        self.sgs.push(SgEntry { addr: addr.as_u64(), len, write: device_writable });
    }
}

pub struct Virtqueue {
    name: &'static str,
    buf: DmaBuf,
    size: u16,
    avail_offset: usize,
    used_offset: usize,
    free_head: u16,
    num_free: u16,
    last_used_idx: u16,
    /// RING_EVENT_IDX negotiated: use avail_event/used_event instead of
    /// the flag words.
    event_idx: bool,
    /// Serviced from the submit path rather than by interrupt.
    polling: bool,
    /// CPU bitmap this queue's interrupt should target.
    affinity: u64,
    notify: VqNotify,
    /// Completion slot per head descriptor index.
    completions: Vec<Option<VqCompletion>>,
}

// The raw ring pointers all derive from the owned DmaBuf.
unsafe impl Send for Virtqueue {}

impl Virtqueue {
    /// Total bytes and ring offsets for the legacy layout.
    fn legacy_layout(queue_size: u16) -> (usize, usize, usize) {
        let qs = queue_size as usize;
        let desc_size = 16 * qs;
        let avail_size = 6 + 2 * qs; // flags + idx + ring + used_event
        let avail_offset = desc_size;
        let used_offset = align_up(desc_size + avail_size, 4096);
        let used_size = 6 + 8 * qs; // flags + idx + ring + avail_event
        (used_offset + used_size, avail_offset, used_offset)
    }

    /// Allocate and initialize a virtqueue. `queue_size` must be the
    /// value read from the device's Queue Size register.
    pub fn new(
        name: &'static str,
        queue_size: u16,
        event_idx: bool,
        notify: VqNotify,
    ) -> Result<Self, AllocError> {
        let (total, avail_offset, used_offset) = Self::legacy_layout(queue_size);
        // Page-aligned: the device derives ring addresses from the PFN.
        let buf = DmaBuf::alloc_aligned(total, 1)?;

        // Descriptor free list threaded through `next`.
        let descs = buf.as_mut_ptr() as *mut VirtqDesc;
        for i in 0..queue_size {
            unsafe {
                (*descs.add(i as usize)).next = if i + 1 < queue_size { i + 1 } else { 0 };
            }
        }

        let mut completions = Vec::with_capacity(queue_size as usize);
        completions.resize_with(queue_size as usize, || None);

        Ok(Self {
            name,
            buf,
            size: queue_size,
            avail_offset,
            used_offset,
            free_head: 0,
            num_free: queue_size,
            last_used_idx: 0,
            event_idx,
            polling: false,
            affinity: 0,
            notify,
            completions,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Page Frame Number for the legacy Queue Address register.
    pub fn pfn(&self) -> u32 {
        (self.buf.phys_addr().as_u64() / 4096) as u32
    }

    /// Number of descriptor entries.
    pub fn entries(&self) -> u16 {
        self.size
    }

    pub fn free_entries(&self) -> u16 {
        self.num_free
    }

    /// Mark the queue as serviced from the submit path. Suppresses the
    /// device-side interrupt via the avail ring flag.
    pub fn set_polling(&mut self, polling: bool) {
        self.polling = polling;
        let flags = if polling && !self.event_idx { VIRTQ_AVAIL_F_NO_INTERRUPT } else { 0 };
        unsafe { core::ptr::write_volatile(self.avail_flags_ptr(), flags) };
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn set_affinity(&mut self, cpu_bitmap: u64) {
        self.affinity = cpu_bitmap;
    }

    pub fn affinity(&self) -> u64 {
        self.affinity
    }

    /// Start building a message.
    pub fn msg(&self) -> VqMsg {
        VqMsg { sgs: Vec::new() }
    }

    // ---- Ring pointer helpers ----

    fn desc_ptr(&self, idx: u16) -> *mut VirtqDesc {
        unsafe { (self.buf.as_mut_ptr() as *mut VirtqDesc).add(idx as usize) }
    }

    fn avail_flags_ptr(&self) -> *mut u16 {
        unsafe { self.buf.as_mut_ptr().add(self.avail_offset) as *mut u16 }
    }

    fn avail_idx_ptr(&self) -> *mut u16 {
        unsafe { self.buf.as_mut_ptr().add(self.avail_offset + 2) as *mut u16 }
    }

    fn avail_ring_ptr(&self) -> *mut u16 {
        unsafe { self.buf.as_mut_ptr().add(self.avail_offset + 4) as *mut u16 }
    }

    /// used_event: written by the driver when RING_EVENT_IDX is active
    /// to say "interrupt me once used_idx passes this".
    fn used_event_ptr(&self) -> *mut u16 {
        unsafe {
            self.buf
                .as_mut_ptr()
                .add(self.avail_offset + 4 + 2 * self.size as usize) as *mut u16
        }
    }

    fn used_flags_ptr(&self) -> *const u16 {
        unsafe { self.buf.as_ptr().add(self.used_offset) as *const u16 }
    }

    fn used_idx_ptr(&self) -> *const u16 {
        unsafe { self.buf.as_ptr().add(self.used_offset + 2) as *const u16 }
    }

    fn used_ring_ptr(&self) -> *const VirtqUsedElem {
        unsafe { self.buf.as_ptr().add(self.used_offset + 4) as *const VirtqUsedElem }
    }

    /// avail_event: written by the device when RING_EVENT_IDX is active
    /// to say "notify me once avail_idx passes this".
    fn avail_event_ptr(&self) -> *const u16 {
        unsafe {
            self.buf
                .as_ptr()
                .add(self.used_offset + 4 + 8 * self.size as usize) as *const u16
        }
    }

    // ---- Submission ----

    /// Publish a message as one descriptor chain. The completion runs
    /// when the device returns the chain through the used ring.
    pub fn commit(&mut self, msg: VqMsg, completion: VqCompletion) -> Result<(), VqError> {
        let count = msg.sgs.len();
        if count == 0 {
            return Err(VqError::EmptyMessage);
        }
        if (self.num_free as usize) < count {
            return Err(VqError::QueueFull);
        }

        // Claim a chain from the free list.
        let head = self.free_head;
        let mut idx = head;
        for (i, sg) in msg.sgs.iter().enumerate() {
            let desc = self.desc_ptr(idx);
            unsafe {
                let next = (*desc).next;
                (*desc).addr = sg.addr;
                (*desc).len = sg.len;
                (*desc).flags = if sg.write { VIRTQ_DESC_F_WRITE } else { 0 }
                    | if i + 1 < count { VIRTQ_DESC_F_NEXT } else { 0 };
                if i + 1 < count {
                    idx = next;
                } else {
                    self.free_head = next;
                }
            }
        }
        self.num_free -= count as u16;
        debug_assert!(self.completions[head as usize].is_none());
        self.completions[head as usize] = Some(completion);

        // Publish the head in the available ring; the index update must
        // come after the descriptor and ring-entry stores.
        unsafe {
            let avail_idx = core::ptr::read_volatile(self.avail_idx_ptr());
            core::ptr::write_volatile(
                self.avail_ring_ptr().add((avail_idx % self.size) as usize),
                head,
            );
            fence(Ordering::Release);
            core::ptr::write_volatile(self.avail_idx_ptr(), avail_idx.wrapping_add(1));
            fence(Ordering::SeqCst);
            if self.should_notify(avail_idx) {
                (self.notify)();
            }
        }
        Ok(())
    }

    /// Device notification suppression. `old_avail` is the avail index
    /// before this submission.
    fn should_notify(&self, old_avail: u16) -> bool {
        if self.event_idx {
            let event = unsafe { core::ptr::read_volatile(self.avail_event_ptr()) };
            event == old_avail
        } else {
            let flags = unsafe { core::ptr::read_volatile(self.used_flags_ptr()) };
            flags & VIRTQ_USED_F_NO_NOTIFY == 0
        }
    }

    // ---- Completion ----

    /// Drain the used ring, returning each chain's completion and the
    /// length the device wrote. Callers invoke the completions after
    /// releasing the queue lock; completions may re-enter the queue to
    /// post new buffers.
    pub fn drain_used(&mut self) -> Vec<(VqCompletion, u32)> {
        let mut done = Vec::new();
        loop {
            let used_idx = unsafe { core::ptr::read_volatile(self.used_idx_ptr()) };
            if self.last_used_idx == used_idx {
                break;
            }
            fence(Ordering::Acquire);
            let slot = (self.last_used_idx % self.size) as usize;
            let elem = unsafe { core::ptr::read_volatile(self.used_ring_ptr().add(slot)) };
            self.last_used_idx = self.last_used_idx.wrapping_add(1);
            self.free_chain(elem.id as u16);
            match self.completions[elem.id as usize].take() {
                Some(completion) => done.push((completion, elem.len)),
                None => log::warn!("{}: used element {} without completion", self.name, elem.id),
            }
        }
        if self.event_idx && !self.polling {
            // Ask for an interrupt at the next used entry.
            unsafe { core::ptr::write_volatile(self.used_event_ptr(), self.last_used_idx) };
            fence(Ordering::SeqCst);
        }
        done
    }

    /// Return a chain to the free list, following NEXT links.
    fn free_chain(&mut self, head: u16) {
        let mut idx = head;
        loop {
            let desc = self.desc_ptr(idx);
            let (flags, next) = unsafe { ((*desc).flags, (*desc).next) };
            self.num_free += 1;
            if flags & VIRTQ_DESC_F_NEXT == 0 {
                unsafe { (*desc).next = self.free_head };
                self.free_head = head;
                break;
            }
            idx = next;
        }
    }
}

/// Drain a locked queue and run the completions outside the lock.
pub fn service(queue: &spin::Mutex<Virtqueue>) -> usize {
    let done = queue.lock().drain_used();
    let n = done.len();
    for (completion, len) in done {
        completion(len);
    }
    n
}

fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicUsize;

    fn test_queue(size: u16, event_idx: bool) -> (Virtqueue, Arc<AtomicUsize>) {
        let notifies = Arc::new(AtomicUsize::new(0));
        let n = notifies.clone();
        let vq = Virtqueue::new(
            "test",
            size,
            event_idx,
            Box::new(move || {
                n.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        (vq, notifies)
    }

    /// Pretend to be the device: mark `head` used with `len` bytes
    /// written.
    fn device_complete(vq: &Virtqueue, head: u16, len: u32) {
        unsafe {
            let used_idx_ptr = vq.buf.as_mut_ptr().add(vq.used_offset + 2) as *mut u16;
            let used_idx = core::ptr::read_volatile(used_idx_ptr);
            let ring = vq.buf.as_mut_ptr().add(vq.used_offset + 4) as *mut VirtqUsedElem;
            core::ptr::write_volatile(
                ring.add((used_idx % vq.size) as usize),
                VirtqUsedElem { id: head as u32, len },
            );
            core::ptr::write_volatile(used_idx_ptr, used_idx.wrapping_add(1));
        }
    }

    fn avail_idx(vq: &Virtqueue) -> u16 {
        unsafe { core::ptr::read_volatile(vq.avail_idx_ptr()) }
    }

    #[test]
    fn commit_publishes_chain() {
        let (mut vq, notifies) = test_queue(8, false);
        let mut msg = vq.msg();
        msg.push(PhysAddr::new(0x1000), 10, false);
        msg.push(PhysAddr::new(0x2000), 1500, true);
        vq.commit(msg, Box::new(|_| {})).unwrap();

        assert_eq!(avail_idx(&vq), 1);
        assert_eq!(vq.free_entries(), 6);
        assert_eq!(notifies.load(Ordering::SeqCst), 1);

        // Head descriptor chains to the payload descriptor.
        unsafe {
            let d0 = &*vq.desc_ptr(0);
            assert_eq!(d0.addr, 0x1000);
            assert_eq!(d0.len, 10);
            assert_eq!(d0.flags, VIRTQ_DESC_F_NEXT);
            let d1 = &*vq.desc_ptr(d0.next);
            assert_eq!(d1.addr, 0x2000);
            assert_eq!(d1.flags, VIRTQ_DESC_F_WRITE);
        }
    }

    #[test]
    fn completion_runs_with_written_len() {
        let (mut vq, _) = test_queue(8, false);
        let got = Arc::new(AtomicUsize::new(0));
        let g = got.clone();
        let mut msg = vq.msg();
        msg.push(PhysAddr::new(0x3000), 64, true);
        vq.commit(msg, Box::new(move |len| {
            g.store(len as usize, Ordering::SeqCst);
        }))
        .unwrap();

        device_complete(&vq, 0, 42);
        let done = vq.drain_used();
        assert_eq!(done.len(), 1);
        for (c, len) in done {
            c(len);
        }
        assert_eq!(got.load(Ordering::SeqCst), 42);
        // Chain returned to the free list.
        assert_eq!(vq.free_entries(), 8);
    }

    #[test]
    fn queue_full_rejected() {
        let (mut vq, _) = test_queue(2, false);
        for _ in 0..2 {
            let mut msg = vq.msg();
            msg.push(PhysAddr::new(0x1000), 16, false);
            vq.commit(msg, Box::new(|_| {})).unwrap();
        }
        let mut msg = vq.msg();
        msg.push(PhysAddr::new(0x1000), 16, false);
        assert!(matches!(vq.commit(msg, Box::new(|_| {})), Err(VqError::QueueFull)));
    }

    #[test]
    fn descriptors_recycled_in_order() {
        let (mut vq, _) = test_queue(4, false);
        // Fill and drain twice; the queue must not leak descriptors.
        for round in 0..2 {
            for _ in 0..4 {
                let mut msg = vq.msg();
                msg.push(PhysAddr::new(0x1000), 16, true);
                vq.commit(msg, Box::new(|_| {})).unwrap();
            }
            assert_eq!(vq.free_entries(), 0, "round {}", round);
            for head in 0..4u16 {
                device_complete(&vq, head, 1);
            }
            let done = vq.drain_used();
            assert_eq!(done.len(), 4);
            assert_eq!(vq.free_entries(), 4);
        }
    }

    #[test]
    fn event_idx_suppresses_notify() {
        let (mut vq, notifies) = test_queue(8, true);
        // avail_event = 0: first submission (old avail 0) must notify.
        let mut msg = vq.msg();
        msg.push(PhysAddr::new(0x1000), 16, false);
        vq.commit(msg, Box::new(|_| {})).unwrap();
        assert_eq!(notifies.load(Ordering::SeqCst), 1);

        // Device has not advanced avail_event: second submission (old
        // avail 1 != event 0) is suppressed.
        let mut msg = vq.msg();
        msg.push(PhysAddr::new(0x1000), 16, false);
        vq.commit(msg, Box::new(|_| {})).unwrap();
        assert_eq!(notifies.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_requests_next_interrupt() {
        let (mut vq, _) = test_queue(4, true);
        let mut msg = vq.msg();
        msg.push(PhysAddr::new(0x1000), 16, true);
        vq.commit(msg, Box::new(|_| {})).unwrap();
        device_complete(&vq, 0, 5);
        let _ = vq.drain_used();
        let used_event = unsafe { core::ptr::read_volatile(vq.used_event_ptr()) };
        assert_eq!(used_event, 1);
    }
}
