/// Linux-compatible AIO: io_setup / io_submit / io_getevents /
/// io_destroy over a shared-memory completion ring.
///
/// The ring lives in memory mapped into the owning process, so the
/// kernel side treats the header as untrusted: out-of-range `head` and
/// `tail` values read back from it are clamped rather than trusted.
///
/// In-flight accounting: `nr` includes one reserved slot, and admission
/// refuses a submission unless `ongoing_ops < available_slots - 1`, so
/// every dispatched operation has a ring slot waiting for it.
///
/// Events are delivered in completion order, not submission order; the
/// completion path decrements the in-flight count and then fills the
/// slot under the same lock, so only the total number of events is
/// bounded, not their order.
use alloc::boxed::Box;
use alloc::sync::Arc;
use spin::Mutex;
use static_assertions::const_assert_eq;

use super::blockq::{BqAction, BqFlags};
use super::fdesc::{Fdesc, IoCompletion};
use super::process::{Process, Task};
use super::{
    validate_user_memory, Sysreturn, EAGAIN, EBADF, EFAULT, EINTR, EINVAL, ENOMEM, ERESTARTSYS,
};
use crate::mem::{page_align, DmaBuf};

pub const AIO_RING_MAGIC: u32 = 0xA10A10A1;

pub const IOCB_CMD_PREAD: u16 = 0;
pub const IOCB_CMD_PWRITE: u16 = 1;

pub const IOCB_FLAG_RESFD: u32 = 1;

/// ABI-fixed ring header, immediately followed by `nr` io_events.
#[repr(C)]
pub struct AioRingHdr {
    pub id: u32,
    pub nr: u32,
    pub head: u32,
    pub tail: u32,
    pub magic: u32,
    pub compat_features: u32,
    pub incompat_features: u32,
    pub header_length: u32,
}

const_assert_eq!(core::mem::size_of::<AioRingHdr>(), 32);

#[repr(C)]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct IoEvent {
    pub data: u64,
    pub obj: u64,
    pub res: i64,
    pub res2: i64,
}

const_assert_eq!(core::mem::size_of::<IoEvent>(), 32);

/// ABI-fixed submission descriptor (layout matches struct iocb).
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct Iocb {
    pub aio_data: u64,
    pub aio_key: u32,
    pub aio_reserved1: u32,
    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,
    pub aio_reserved2: u64,
    pub aio_flags: u32,
    pub aio_resfd: u32,
}

const_assert_eq!(core::mem::size_of::<Iocb>(), 64);

/// The ring allocation. All header accesses are volatile: the owning
/// process reads and may scribble on this memory concurrently.
struct RingMem {
    buf: DmaBuf,
}

// All ring accesses are volatile single-word operations; coherence of
// head/tail against the event slots comes from the context lock.
unsafe impl Send for RingMem {}
unsafe impl Sync for RingMem {}

impl RingMem {
    fn hdr(&self) -> *mut AioRingHdr {
        self.buf.as_mut_ptr() as *mut AioRingHdr
    }

    fn events(&self) -> *mut IoEvent {
        unsafe { self.buf.as_mut_ptr().add(core::mem::size_of::<AioRingHdr>()) as *mut IoEvent }
    }

    /// User-visible address of the ring; doubles as the context handle.
    fn user_addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    fn init(&self, id: u32, nr: u32) {
        unsafe {
            let hdr = self.hdr();
            (*hdr).id = id;
            (*hdr).nr = nr;
            (*hdr).head = 0;
            (*hdr).tail = 0;
            (*hdr).magic = AIO_RING_MAGIC;
            (*hdr).compat_features = 1;
            (*hdr).incompat_features = 0;
            (*hdr).header_length = core::mem::size_of::<AioRingHdr>() as u32;
        }
    }

    fn head(&self) -> u32 {
        unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*self.hdr()).head)) }
    }

    fn tail(&self) -> u32 {
        unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*self.hdr()).tail)) }
    }

    fn set_head(&self, head: u32) {
        unsafe { core::ptr::write_volatile(core::ptr::addr_of_mut!((*self.hdr()).head), head) }
    }

    fn set_tail(&self, tail: u32) {
        unsafe { core::ptr::write_volatile(core::ptr::addr_of_mut!((*self.hdr()).tail), tail) }
    }

    fn write_event(&self, slot: u32, event: IoEvent) {
        unsafe { core::ptr::write_volatile(self.events().add(slot as usize), event) }
    }

    fn read_event(&self, slot: u32) -> IoEvent {
        unsafe { core::ptr::read_volatile(self.events().add(slot as usize)) }
    }
}

struct AioState {
    ongoing_ops: u32,
    copied_evts: u32,
    /// The blockq of whichever thread is currently harvesting; captured
    /// by the completion path under the lock.
    bq: Option<Arc<super::blockq::Blockq>>,
}

/// Kernel-side AIO context. Dropping the last reference releases the
/// ring allocation.
pub struct Aio {
    ring: RingMem,
    nr: u32,
    state: Mutex<AioState>,
}

impl Aio {
    pub fn nr(&self) -> u32 {
        self.nr
    }

    pub fn ongoing_ops(&self) -> u32 {
        self.state.lock().ongoing_ops
    }

    pub fn ring_addr(&self) -> u64 {
        self.ring.user_addr()
    }

    /// Free slots as seen from the untrusted ring indices: head - tail
    /// mod nr, or nr when they coincide.
    fn avail_events(&self) -> i64 {
        let mut avail = self.ring.head() as i64 - self.ring.tail() as i64;
        if avail <= 0 {
            avail += self.nr as i64;
        }
        avail
    }
}

/// Resolve a context handle: the handle is the ring address, whose
/// header holds the process-local context id.
fn aio_from_ring(p: &Arc<Process>, ctx_id: u64) -> Option<Arc<Aio>> {
    if !validate_user_memory(ctx_id, core::mem::size_of::<AioRingHdr>(), false) {
        return None;
    }
    let id = unsafe { core::ptr::read_volatile(ctx_id as *const u32) };
    let aio = p.aio_get(id)?;
    // Reject a stale handle whose id now names someone else's ring.
    if aio.ring.user_addr() != ctx_id {
        return None;
    }
    Some(aio)
}

// ---- io_setup ----

/// Create a context able to carry `nr_events` concurrent operations and
/// publish the ring address through `ctx_out`.
pub fn io_setup(p: &Arc<Process>, nr_events: u32, ctx_out: u64) -> Sysreturn {
    if !validate_user_memory(ctx_out, 8, true) {
        return -EFAULT;
    }
    if nr_events == 0 {
        return -EINVAL;
    }
    // One reserved slot for head/tail management.
    let nr = nr_events + 1;
    let alloc_size = page_align(
        core::mem::size_of::<AioRingHdr>() + nr as usize * core::mem::size_of::<IoEvent>(),
    );
    let buf = match DmaBuf::alloc(alloc_size) {
        Ok(b) => b,
        Err(_) => return -ENOMEM,
    };

    let aio = Arc::new(Aio {
        ring: RingMem { buf },
        nr,
        state: Mutex::new(AioState { ongoing_ops: 0, copied_evts: 0, bq: None }),
    });
    let id = p.aio_register(aio.clone());
    aio.ring.init(id, nr);

    unsafe { core::ptr::write_volatile(ctx_out as *mut u64, aio.ring.user_addr()) };
    0
}

// ---- Completion ----

/// The completion closure handed to the target fd. Owns a context
/// reference, the fd reference, and the submitter's identity for the
/// optional eventfd notification.
fn aio_completion(
    aio: Arc<Aio>,
    f: Arc<dyn Fdesc>,
    data: u64,
    obj: u64,
    res_fd: Option<u32>,
    p: Arc<Process>,
) -> IoCompletion {
    Box::new(move |rv: Sysreturn| {
        let bq = {
            let mut st = aio.state.lock();
            st.ongoing_ops -= 1;
            // Untrusted tail: clamp before use.
            let mut tail = aio.ring.tail();
            if tail >= aio.nr {
                tail = 0;
            }
            aio.ring.write_event(tail, IoEvent { data, obj, res: rv as i64, res2: 0 });
            tail += 1;
            if tail == aio.nr {
                tail = 0;
            }
            aio.ring.set_tail(tail);
            st.bq.clone()
        };
        drop(f);

        if let Some(res_fd) = res_fd {
            if let Some(res) = p.fd_get(res_fd) {
                if res.supports_write() && res.is_writable() {
                    let val = Box::new(1u64);
                    let ptr = &*val as *const u64 as *const u8;
                    res.write(ptr, 8, 0, Box::new(move |_| drop(val)));
                }
            }
        }

        if let Some(bq) = bq {
            bq.wake_one();
        }
    })
}

// ---- io_submit ----

/// Enqueue one IOCB. Returns 0 on success.
fn iocb_enqueue(p: &Arc<Process>, aio: &Arc<Aio>, iocb_ptr: u64) -> Sysreturn {
    if !validate_user_memory(iocb_ptr, core::mem::size_of::<Iocb>(), false) {
        return -EFAULT;
    }
    let iocb = unsafe { core::ptr::read_unaligned(iocb_ptr as *const Iocb) };

    if iocb.aio_reserved1 != 0
        || iocb.aio_reserved2 != 0
        || iocb.aio_buf == 0
        || iocb.aio_flags & !IOCB_FLAG_RESFD != 0
    {
        return -EINVAL;
    }

    let f = match p.fd_get(iocb.aio_fildes) {
        Some(f) => f,
        None => return -EBADF,
    };
    let res_fd = if iocb.aio_flags & IOCB_FLAG_RESFD != 0 { Some(iocb.aio_resfd) } else { None };

    {
        let mut st = aio.state.lock();
        if st.ongoing_ops as i64 >= aio.avail_events() - 1 {
            return -EAGAIN;
        }
        st.ongoing_ops += 1;
    }

    let completion = aio_completion(
        aio.clone(),
        f.clone(),
        iocb.aio_data,
        iocb_ptr,
        res_fd,
        p.clone(),
    );

    let rv = match iocb.aio_lio_opcode {
        IOCB_CMD_PREAD => {
            if !f.supports_read() {
                -EINVAL
            } else if !f.is_readable() {
                -EBADF
            } else {
                f.read(
                    iocb.aio_buf as *mut u8,
                    iocb.aio_nbytes as usize,
                    iocb.aio_offset as u64,
                    completion,
                );
                return 0;
            }
        }
        IOCB_CMD_PWRITE => {
            if !f.supports_write() {
                -EINVAL
            } else if !f.is_writable() {
                -EBADF
            } else {
                f.write(
                    iocb.aio_buf as *const u8,
                    iocb.aio_nbytes as usize,
                    iocb.aio_offset as u64,
                    completion,
                );
                return 0;
            }
        }
        _ => -EINVAL,
    };

    // Dispatch refused: give the in-flight slot back. The unused
    // completion drops its context reference here.
    aio.state.lock().ongoing_ops -= 1;
    rv
}

/// Submit up to `nr` IOCBs from the pointer array at `iocbpp`. Returns
/// the number submitted, or the first error when nothing was.
pub fn io_submit(p: &Arc<Process>, ctx_id: u64, nr: i64, iocbpp: u64) -> Sysreturn {
    if nr < 0 {
        return -EINVAL;
    }
    if !validate_user_memory(iocbpp, nr as usize * 8, false) {
        return -EFAULT;
    }
    let aio = match aio_from_ring(p, ctx_id) {
        Some(a) => a,
        None => return -EINVAL,
    };
    let mut submitted: i64 = 0;
    for i in 0..nr {
        let iocb_ptr = unsafe { core::ptr::read_unaligned((iocbpp as *const u64).add(i as usize)) };
        let rv = iocb_enqueue(p, &aio, iocb_ptr);
        if rv != 0 {
            if submitted == 0 {
                return rv;
            }
            break;
        }
        submitted += 1;
    }
    submitted as Sysreturn
}

// ---- io_getevents ----

/// The harvest action, shared with the destroy drain. Re-entered by the
/// blockq until it resolves; applies `completion` exactly once.
/// `events_ptr == 0` discards events (drain mode).
fn getevents_action(
    aio: Arc<Aio>,
    min_nr: i64,
    nr: i64,
    events_ptr: u64,
    timeout_ns: Option<u64>,
    completion: IoCompletion,
) -> BqAction {
    let mut completion = Some(completion);
    Box::new(move |flags: BqFlags| {
        let mut st = aio.state.lock();
        let rv;
        if flags.contains(BqFlags::NULLIFY) {
            rv = if timeout_ns.is_none() { -ERESTARTSYS } else { -EINTR };
        } else {
            // Untrusted indices: clamp both before walking.
            let mut head = aio.ring.head();
            let tail = {
                let t = aio.ring.tail();
                if t >= aio.nr { 0 } else { t }
            };
            if head >= aio.nr {
                head = 0;
            }
            while head != tail {
                if events_ptr != 0 {
                    let event = aio.ring.read_event(head);
                    unsafe {
                        core::ptr::write_unaligned(
                            (events_ptr as *mut IoEvent).add(st.copied_evts as usize),
                            event,
                        );
                    }
                }
                head += 1;
                if head == aio.nr {
                    head = 0;
                }
                st.copied_evts += 1;
                if st.copied_evts as i64 == nr {
                    break;
                }
            }
            aio.ring.set_head(head);
            aio.ring.set_tail(tail);

            if (st.copied_evts as i64) < min_nr
                && timeout_ns != Some(0)
                && !flags.contains(BqFlags::TIMEDOUT)
            {
                return None; // keep blocking
            }
            rv = st.copied_evts as Sysreturn;
        }
        st.bq = None;
        drop(st);
        if let Some(c) = completion.take() {
            c(rv);
        }
        Some(rv)
    })
}

/// Harvest between `min_nr` and `nr` events, blocking up to
/// `timeout_ns` (None = forever, Some(0) = poll). Returns the
/// synchronous result or None when blocked; `completion` always
/// observes the final result.
pub fn io_getevents(
    p: &Arc<Process>,
    task: &Arc<Task>,
    ctx_id: u64,
    min_nr: i64,
    nr: i64,
    events_ptr: u64,
    timeout_ns: Option<u64>,
    completion: IoCompletion,
) -> Option<Sysreturn> {
    if nr > 0 && !validate_user_memory(events_ptr, nr as usize * core::mem::size_of::<IoEvent>(), true)
    {
        completion(-EFAULT);
        return Some(-EFAULT);
    }
    let aio = aio_from_ring(p, ctx_id);
    if nr <= 0 || nr < min_nr || aio.is_none() {
        completion(-EINVAL);
        return Some(-EINVAL);
    }
    let aio = aio.unwrap();

    {
        let mut st = aio.state.lock();
        st.copied_evts = 0;
        st.bq = Some(task.bq.clone());
    }
    let action = getevents_action(aio, min_nr, nr, events_ptr, timeout_ns, completion);
    task.bq.check_timeout(action, timeout_ns.filter(|&ns| ns > 0))
}

// ---- io_destroy ----

fn io_destroy_drain(aio: Arc<Aio>, task: Arc<Task>, completion: IoCompletion) -> Option<Sysreturn> {
    let ongoing = {
        let mut st = aio.state.lock();
        if st.ongoing_ops > 0 {
            st.copied_evts = 0;
            st.bq = Some(task.bq.clone());
        }
        st.ongoing_ops
    };
    if ongoing == 0 {
        completion(0);
        return Some(0);
    }

    // The drain can resolve early if a signal nullifies the wait while
    // operations are still in flight; re-enter until they are all gone.
    let drain_aio = aio.clone();
    let drain_task = task.clone();
    let drain_completion: IoCompletion = Box::new(move |_rv| {
        if drain_aio.ongoing_ops() > 0 {
            io_destroy_drain(drain_aio.clone(), drain_task, completion);
        } else {
            completion(0);
        }
    });

    let action = getevents_action(
        aio,
        ongoing as i64,
        ongoing as i64,
        0,
        None,
        drain_completion,
    );
    task.bq.check_timeout(action, None).map(|_| 0)
}

/// Tear down a context: unlink its id, then wait for every in-flight
/// operation before the final reference releases the ring. Returns the
/// synchronous result or None when blocked on the drain.
pub fn io_destroy(
    p: &Arc<Process>,
    task: &Arc<Task>,
    ctx_id: u64,
    completion: IoCompletion,
) -> Option<Sysreturn> {
    if !validate_user_memory(ctx_id, core::mem::size_of::<AioRingHdr>(), false) {
        completion(-EFAULT);
        return Some(-EFAULT);
    }
    let id = unsafe { core::ptr::read_volatile(ctx_id as *const u32) };
    let aio = match p.aio_get(id) {
        Some(a) if a.ring.user_addr() == ctx_id => {
            p.aio_remove(id);
            a
        }
        _ => {
            completion(-EINVAL);
            return Some(-EINVAL);
        }
    };
    io_destroy_drain(aio, task.clone(), completion)
}
