/// Unit tests for the AIO core and its supporting contracts — ring
/// lifecycle, in-flight accounting, blocking harvest, teardown drain,
/// the eventfd side channel, and the blockq primitive.
///
/// These run on the host target: cargo test --target
/// x86_64-unknown-linux-gnu --lib. The ring lives in the stub DmaBuf,
/// fds are RAM-backed or manually-completed, and the clock is advanced
/// explicitly.
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::aio::{
    io_destroy, io_getevents, io_setup, io_submit, AioRingHdr, IoEvent, Iocb, AIO_RING_MAGIC,
    IOCB_CMD_PREAD, IOCB_CMD_PWRITE, IOCB_FLAG_RESFD,
};
use super::blockq::{Blockq, BqFlags};
use super::eventfd::EventFd;
use super::fdesc::{Fdesc, IoCompletion, RamFile};
use super::process::{Process, Task};
use super::{Sysreturn, EAGAIN, EBADF, EFAULT, EINTR, EINVAL, ERESTARTSYS};
use crate::time;

// ---- Harness pieces ----

/// An fd whose completions are captured and fired by the test, standing
/// in for a device that finishes I/O later.
struct DeferredFile {
    pending: Mutex<Vec<IoCompletion>>,
}

impl DeferredFile {
    fn new() -> Arc<Self> {
        Arc::new(Self { pending: Mutex::new(Vec::new()) })
    }

    fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Complete the oldest outstanding operation with `rv`.
    fn fire(&self, rv: Sysreturn) {
        let completion = self.pending.lock().remove(0);
        completion(rv);
    }
}

impl Fdesc for DeferredFile {
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

    fn read(&self, _buf: *mut u8, _len: usize, _offset: u64, completion: IoCompletion) {
        self.pending.lock().push(completion);
    }

    fn write(&self, _buf: *const u8, _len: usize, _offset: u64, completion: IoCompletion) {
        self.pending.lock().push(completion);
    }
}

/// A completion that records its result.
fn capture() -> (IoCompletion, Arc<Mutex<Option<Sysreturn>>>) {
    let slot = Arc::new(Mutex::new(None));
    let s = slot.clone();
    (Box::new(move |rv| *s.lock() = Some(rv)), slot)
}

fn setup_ctx(p: &Arc<Process>, nr_events: u32) -> u64 {
    let mut ctx: u64 = 0;
    let rv = io_setup(p, nr_events, &mut ctx as *mut u64 as u64);
    assert_eq!(rv, 0);
    assert_ne!(ctx, 0);
    ctx
}

fn ring_hdr(ctx: u64) -> AioRingHdr {
    unsafe { core::ptr::read_volatile(ctx as *const AioRingHdr) }
}

/// A header-shaped buffer standing in for a context handle that names
/// no registered ring.
fn fake_ring_hdr(id: u32) -> AioRingHdr {
    AioRingHdr {
        id,
        nr: 2,
        head: 0,
        tail: 0,
        magic: AIO_RING_MAGIC,
        compat_features: 1,
        incompat_features: 0,
        header_length: 0x20,
    }
}

fn iocb(fd: u32, opcode: u16, buf: u64, nbytes: u64, offset: i64, data: u64) -> Iocb {
    Iocb {
        aio_data: data,
        aio_lio_opcode: opcode,
        aio_fildes: fd,
        aio_buf: buf,
        aio_nbytes: nbytes,
        aio_offset: offset,
        ..Default::default()
    }
}

fn submit(p: &Arc<Process>, ctx: u64, iocbs: &[&Iocb]) -> Sysreturn {
    let ptrs: Vec<u64> = iocbs.iter().map(|i| *i as *const Iocb as u64).collect();
    io_submit(p, ctx, ptrs.len() as i64, ptrs.as_ptr() as u64)
}

fn getevents(
    p: &Arc<Process>,
    task: &Arc<Task>,
    ctx: u64,
    min_nr: i64,
    nr: i64,
    events: &mut [IoEvent],
    timeout_ns: Option<u64>,
) -> (Option<Sysreturn>, Arc<Mutex<Option<Sysreturn>>>) {
    let (completion, slot) = capture();
    let rv = io_getevents(
        p,
        task,
        ctx,
        min_nr,
        nr,
        events.as_mut_ptr() as u64,
        timeout_ns,
        completion,
    );
    (rv, slot)
}

// ---- io_setup ----

#[test]
fn setup_initializes_ring() {
    let p = Process::new();
    let ctx = setup_ctx(&p, 4);
    let hdr = ring_hdr(ctx);
    assert_eq!(hdr.nr, 5); // requested + 1 reserved slot
    assert_eq!(hdr.head, 0);
    assert_eq!(hdr.tail, 0);
    assert_eq!(hdr.magic, AIO_RING_MAGIC);
    assert_eq!(hdr.compat_features, 1);
    assert_eq!(hdr.incompat_features, 0);
    assert_eq!(hdr.header_length, 0x20);
}

#[test]
fn setup_rejects_bad_args() {
    let p = Process::new();
    assert_eq!(io_setup(&p, 4, 0), -EFAULT);
    let mut ctx: u64 = 0;
    assert_eq!(io_setup(&p, 0, &mut ctx as *mut u64 as u64), -EINVAL);
}

#[test]
fn setup_allocates_distinct_ids() {
    let p = Process::new();
    let c1 = setup_ctx(&p, 2);
    let c2 = setup_ctx(&p, 2);
    assert_ne!(ring_hdr(c1).id, ring_hdr(c2).id);
}

// ---- Submission and harvest ----

#[test]
fn read_submit_then_harvest() {
    let p = Process::new();
    let task = Task::new();
    let contents: Vec<u8> = (0u8..16).collect();
    let fd = p.install_fd(Arc::new(RamFile::with_contents(&contents)));
    let ctx = setup_ctx(&p, 1);

    let mut buf = [0u8; 16];
    let cb = iocb(fd, IOCB_CMD_PREAD, buf.as_mut_ptr() as u64, 16, 0, 0x1122);
    assert_eq!(submit(&p, ctx, &[&cb]), 1);

    let mut evs = [IoEvent::default(); 1];
    let (rv, slot) = getevents(&p, &task, ctx, 1, 1, &mut evs, None);
    assert_eq!(rv, Some(1));
    assert_eq!(*slot.lock(), Some(1));
    assert_eq!(evs[0].res, 16);
    assert_eq!(evs[0].data, 0x1122);
    assert_eq!(evs[0].obj, &cb as *const Iocb as u64);
    assert_eq!(&buf[..], &contents[..]);
}

#[test]
fn write_submit_reaches_file() {
    let p = Process::new();
    let task = Task::new();
    let file = Arc::new(RamFile::new());
    let fd = p.install_fd(file.clone());
    let ctx = setup_ctx(&p, 1);

    let data = b"ring ring";
    let cb = iocb(fd, IOCB_CMD_PWRITE, data.as_ptr() as u64, data.len() as u64, 0, 7);
    assert_eq!(submit(&p, ctx, &[&cb]), 1);

    let mut evs = [IoEvent::default(); 1];
    let (rv, _) = getevents(&p, &task, ctx, 1, 1, &mut evs, None);
    assert_eq!(rv, Some(1));
    assert_eq!(evs[0].res, data.len() as i64);
    assert_eq!(file.len(), data.len());
}

#[test]
fn second_submit_gets_eagain_when_ring_full() {
    let p = Process::new();
    let dev = DeferredFile::new();
    let fd = p.install_fd(dev.clone());
    // nr = 2 slots, one reserved: a single in-flight op is the maximum.
    let ctx = setup_ctx(&p, 1);

    let cb1 = iocb(fd, IOCB_CMD_PREAD, 0x1000, 8, 0, 1);
    let cb2 = iocb(fd, IOCB_CMD_PREAD, 0x2000, 8, 0, 2);
    assert_eq!(submit(&p, ctx, &[&cb1]), 1);
    assert_eq!(submit(&p, ctx, &[&cb2]), -EAGAIN);
    assert_eq!(dev.pending(), 1);

    // After the first completes and is harvested the slot opens again.
    dev.fire(8);
    let task = Task::new();
    let mut evs = [IoEvent::default(); 1];
    let (rv, _) = getevents(&p, &task, ctx, 1, 1, &mut evs, None);
    assert_eq!(rv, Some(1));
    assert_eq!(submit(&p, ctx, &[&cb2]), 1);
}

#[test]
fn submit_validates_iocb_fields() {
    let p = Process::new();
    let fd = p.install_fd(Arc::new(RamFile::new()));
    let ctx = setup_ctx(&p, 4);

    // Reserved field set.
    let mut bad = iocb(fd, IOCB_CMD_PREAD, 0x1000, 8, 0, 0);
    bad.aio_reserved2 = 1;
    assert_eq!(submit(&p, ctx, &[&bad]), -EINVAL);

    // Null buffer.
    let bad = iocb(fd, IOCB_CMD_PREAD, 0, 8, 0, 0);
    assert_eq!(submit(&p, ctx, &[&bad]), -EINVAL);

    // Unknown flags.
    let mut bad = iocb(fd, IOCB_CMD_PREAD, 0x1000, 8, 0, 0);
    bad.aio_flags = 0x8000;
    assert_eq!(submit(&p, ctx, &[&bad]), -EINVAL);

    // Unknown opcode.
    let bad = iocb(fd, 99, 0x1000, 8, 0, 0);
    assert_eq!(submit(&p, ctx, &[&bad]), -EINVAL);

    // Bad fd.
    let bad = iocb(1234, IOCB_CMD_PREAD, 0x1000, 8, 0, 0);
    assert_eq!(submit(&p, ctx, &[&bad]), -EBADF);

    // Unknown context: a header whose id names nothing.
    let fake = fake_ring_hdr(999);
    let good = iocb(fd, IOCB_CMD_PREAD, 0x1000, 8, 0, 0);
    assert_eq!(submit(&p, &fake as *const AioRingHdr as u64, &[&good]), -EINVAL);

    // Nothing slipped through.
    assert_eq!(ring_hdr(ctx).tail, 0);
}

#[test]
fn submit_stops_at_first_failure_after_success() {
    let p = Process::new();
    let mut contents = [0u8; 8];
    let fd = p.install_fd(Arc::new(RamFile::with_contents(&contents)));
    let ctx = setup_ctx(&p, 4);

    let mut buf = [0u8; 8];
    let good = iocb(fd, IOCB_CMD_PREAD, buf.as_mut_ptr() as u64, 8, 0, 1);
    let bad = iocb(fd, IOCB_CMD_PREAD, 0, 8, 0, 2); // null buffer
    let also_good = iocb(fd, IOCB_CMD_PREAD, contents.as_mut_ptr() as u64, 8, 0, 3);

    // Linux semantics: count submitted so far, not the error.
    assert_eq!(submit(&p, ctx, &[&good, &bad, &also_good]), 1);
}

#[test]
fn events_delivered_in_completion_order() {
    let p = Process::new();
    let task = Task::new();
    let dev = DeferredFile::new();
    let fd = p.install_fd(dev.clone());
    let ctx = setup_ctx(&p, 7); // nr = 8

    let cbs: Vec<Iocb> = (0..5)
        .map(|i| iocb(fd, IOCB_CMD_PREAD, 0x1000 + i, 8, 0, 100 + i))
        .collect();
    let refs: Vec<&Iocb> = cbs.iter().collect();
    assert_eq!(submit(&p, ctx, &refs), 5);
    assert_eq!(dev.pending(), 5);

    // Complete out of submission order: results follow completion order.
    for rv in [30, 10, 50, 20, 40] {
        dev.fire(rv);
    }

    let mut evs = [IoEvent::default(); 5];
    let (rv, _) = getevents(&p, &task, ctx, 5, 5, &mut evs, None);
    assert_eq!(rv, Some(5));
    let results: Vec<i64> = evs.iter().map(|e| e.res).collect();
    assert_eq!(results, alloc::vec![30, 10, 50, 20, 40]);
    // Exactly the completions that happened, no duplication or loss.
    let mut datas: Vec<u64> = evs.iter().map(|e| e.data).collect();
    datas.sort_unstable();
    assert_eq!(datas, alloc::vec![100, 101, 102, 103, 104]);
}

#[test]
fn getevents_validates_args() {
    let p = Process::new();
    let task = Task::new();
    let ctx = setup_ctx(&p, 2);
    let mut evs = [IoEvent::default(); 2];

    let (rv, slot) = getevents(&p, &task, ctx, 1, 0, &mut evs, None);
    assert_eq!(rv, Some(-EINVAL));
    assert_eq!(*slot.lock(), Some(-EINVAL));

    let (rv, _) = getevents(&p, &task, ctx, 3, 2, &mut evs, None);
    assert_eq!(rv, Some(-EINVAL));

    let fake = fake_ring_hdr(999);
    let (rv, _) = getevents(&p, &task, &fake as *const AioRingHdr as u64, 1, 1, &mut evs, None);
    assert_eq!(rv, Some(-EINVAL));

    let (completion, slot) = capture();
    assert_eq!(io_getevents(&p, &task, ctx, 1, 1, 0, None, completion), Some(-EFAULT));
    assert_eq!(*slot.lock(), Some(-EFAULT));
}

// ---- Blocking harvest ----

#[test]
fn getevents_zero_timeout_polls() {
    let p = Process::new();
    let task = Task::new();
    let ctx = setup_ctx(&p, 2);
    let mut evs = [IoEvent::default(); 1];
    let (rv, slot) = getevents(&p, &task, ctx, 1, 1, &mut evs, Some(0));
    assert_eq!(rv, Some(0));
    assert_eq!(*slot.lock(), Some(0));
}

#[test]
fn getevents_times_out() {
    let p = Process::new();
    let task = Task::new();
    let ctx = setup_ctx(&p, 2);
    let mut evs = [IoEvent::default(); 1];

    // 10ms timeout with no completions: blocks, then resolves to 0.
    let (rv, slot) = getevents(&p, &task, ctx, 1, 1, &mut evs, Some(10 * time::NANOS_PER_MS));
    assert_eq!(rv, None);

    time::test_advance_ns(10 * time::NANOS_PER_MS);
    time::service_timers();
    assert_eq!(*slot.lock(), Some(0));
    assert_eq!(task.bq.waiting(), 0);
}

#[test]
fn getevents_wakes_on_completion() {
    let p = Process::new();
    let task = Task::new();
    let dev = DeferredFile::new();
    let fd = p.install_fd(dev.clone());
    let ctx = setup_ctx(&p, 4);

    let cb1 = iocb(fd, IOCB_CMD_PREAD, 0x1000, 8, 0, 1);
    let cb2 = iocb(fd, IOCB_CMD_PREAD, 0x2000, 8, 0, 2);
    assert_eq!(submit(&p, ctx, &[&cb1, &cb2]), 2);

    // min_nr = 2: the first completion wakes the waiter, which re-blocks
    // until the second arrives.
    let mut evs = [IoEvent::default(); 2];
    let (rv, slot) = getevents(&p, &task, ctx, 2, 2, &mut evs, None);
    assert_eq!(rv, None);

    dev.fire(8);
    assert_eq!(*slot.lock(), None);
    assert_eq!(task.bq.waiting(), 1);

    dev.fire(4);
    assert_eq!(*slot.lock(), Some(2));
    assert_eq!(evs[0].res, 8);
    assert_eq!(evs[1].res, 4);
}

#[test]
fn interrupted_wait_maps_to_eintr_or_restart() {
    let p = Process::new();
    let ctx = setup_ctx(&p, 2);
    let mut evs = [IoEvent::default(); 1];

    // Finite timeout: EINTR.
    let task = Task::new();
    let (rv, slot) = getevents(&p, &task, ctx, 1, 1, &mut evs, Some(60_000 * time::NANOS_PER_MS));
    assert_eq!(rv, None);
    task.bq.nullify_all();
    assert_eq!(*slot.lock(), Some(-EINTR));

    // Infinite wait: ERESTARTSYS so the syscall restarts after the
    // signal.
    let task = Task::new();
    let (rv, slot) = getevents(&p, &task, ctx, 1, 1, &mut evs, None);
    assert_eq!(rv, None);
    task.bq.nullify_all();
    assert_eq!(*slot.lock(), Some(-ERESTARTSYS));
}

// ---- RESFD side channel ----

#[test]
fn resfd_eventfd_notified_on_completion() {
    let p = Process::new();
    let task = Task::new();
    let efd_obj = Arc::new(EventFd::new());
    let efd = p.install_fd(efd_obj.clone());
    let contents = [9u8; 4];
    let fd = p.install_fd(Arc::new(RamFile::with_contents(&contents)));
    let ctx = setup_ctx(&p, 2);

    let mut buf = [0u8; 4];
    let mut cb = iocb(fd, IOCB_CMD_PREAD, buf.as_mut_ptr() as u64, 4, 0, 5);
    cb.aio_flags = IOCB_FLAG_RESFD;
    cb.aio_resfd = efd;
    assert_eq!(submit(&p, ctx, &[&cb]), 1);

    // RamFile completes inline; the eventfd already counted it.
    assert_eq!(efd_obj.value(), 1);

    let mut evs = [IoEvent::default(); 1];
    let (rv, _) = getevents(&p, &task, ctx, 1, 1, &mut evs, None);
    assert_eq!(rv, Some(1));
}

// ---- Teardown ----

#[test]
fn destroy_without_inflight_is_immediate() {
    let p = Process::new();
    let task = Task::new();
    let ctx = setup_ctx(&p, 2);
    let id = ring_hdr(ctx).id;

    let (completion, slot) = capture();
    assert_eq!(io_destroy(&p, &task, ctx, completion), Some(0));
    assert_eq!(*slot.lock(), Some(0));
    assert!(p.aio_get(id).is_none());
}

#[test]
fn destroy_waits_for_inflight_ops() {
    let p = Process::new();
    let task = Task::new();
    let dev = DeferredFile::new();
    let fd = p.install_fd(dev.clone());
    let ctx = setup_ctx(&p, 2);
    let id = ring_hdr(ctx).id;

    let cb = iocb(fd, IOCB_CMD_PREAD, 0x1000, 8, 0, 1);
    assert_eq!(submit(&p, ctx, &[&cb]), 1);

    let (completion, slot) = capture();
    let rv = io_destroy(&p, &task, ctx, completion);
    assert_eq!(rv, None); // draining
    assert_eq!(*slot.lock(), None);

    // The id is already unlinked: new submissions see EINVAL.
    assert_eq!(submit(&p, ctx, &[&cb]), -EINVAL);

    // Late completion finishes the drain.
    dev.fire(8);
    assert_eq!(*slot.lock(), Some(0));
    assert!(p.aio_get(id).is_none());
}

#[test]
fn destroy_unknown_context_reports_einval() {
    let p = Process::new();
    let task = Task::new();

    let fake = fake_ring_hdr(999);
    let (completion, slot) = capture();
    let rv = io_destroy(&p, &task, &fake as *const AioRingHdr as u64, completion);
    assert_eq!(rv, Some(-EINVAL));
    assert_eq!(*slot.lock(), Some(-EINVAL));
}

// ---- Ring hardening ----

#[test]
fn corrupted_tail_is_clamped() {
    let p = Process::new();
    let task = Task::new();
    let contents = [3u8; 8];
    let fd = p.install_fd(Arc::new(RamFile::with_contents(&contents)));
    let ctx = setup_ctx(&p, 3); // nr = 4

    // User space scribbles an out-of-range tail into the shared header.
    unsafe {
        let hdr = ctx as *mut AioRingHdr;
        core::ptr::write_volatile(core::ptr::addr_of_mut!((*hdr).tail), 999);
    }

    let mut buf = [0u8; 8];
    let cb = iocb(fd, IOCB_CMD_PREAD, buf.as_mut_ptr() as u64, 8, 0, 42);
    assert_eq!(submit(&p, ctx, &[&cb]), 1);

    // The completion clamped tail to 0 and produced the event at slot 0.
    let hdr = ring_hdr(ctx);
    assert_eq!(hdr.tail, 1);

    let mut evs = [IoEvent::default(); 1];
    let (rv, _) = getevents(&p, &task, ctx, 1, 1, &mut evs, None);
    assert_eq!(rv, Some(1));
    assert_eq!(evs[0].data, 42);
}

// ---- Blockq primitive ----

#[test]
fn blockq_inline_resolution_skips_parking() {
    let bq = Blockq::new();
    let rv = bq.check_timeout(Box::new(|_flags| Some(17)), None);
    assert_eq!(rv, Some(17));
    assert_eq!(bq.waiting(), 0);
}

#[test]
fn blockq_wake_reruns_action() {
    let bq = Blockq::new();
    let fired = Arc::new(Mutex::new(0u32));
    let f = fired.clone();
    let rv = bq.check_timeout(
        Box::new(move |flags| {
            let mut fired = f.lock();
            *fired += 1;
            // Resolve only once woken.
            if flags.contains(BqFlags::BLOCKED) {
                Some(*fired as Sysreturn)
            } else {
                None
            }
        }),
        None,
    );
    assert_eq!(rv, None);
    assert_eq!(bq.waiting(), 1);
    bq.wake_one();
    assert_eq!(bq.waiting(), 0);
    assert_eq!(*fired.lock(), 2);
}

#[test]
fn blockq_wake_on_empty_queue_is_noop() {
    let bq = Blockq::new();
    bq.wake_one(); // must not panic
    assert_eq!(bq.waiting(), 0);
}

#[test]
fn blockq_nullify_delivers_flag() {
    let bq = Blockq::new();
    let seen = Arc::new(Mutex::new(BqFlags::empty()));
    let s = seen.clone();
    let rv = bq.check_timeout(
        Box::new(move |flags| {
            if flags.is_empty() {
                None
            } else {
                *s.lock() = flags;
                Some(0)
            }
        }),
        None,
    );
    assert_eq!(rv, None);
    bq.nullify_all();
    assert!(seen.lock().contains(BqFlags::NULLIFY));
    assert_eq!(bq.waiting(), 0);
}
