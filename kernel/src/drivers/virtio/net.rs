/// Virtio-net driver: multi-queue RX/TX with per-CPU transmit steering,
/// a pooled receive path, and the control-queue command protocol.
///
/// Queue layout per the virtio spec: rx = 2n, tx = 2n+1 for pair n, and
/// the control queue (when MQ is active) after the last pair.
use static_assertions::const_assert_eq;

/// Per-packet header, legacy form (10 bytes).
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
}

/// Header with the mergeable-buffers count (12 bytes), used when
/// MRG_RXBUF or a modern transport is negotiated.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct VirtioNetHdrMrgRxbuf {
    pub hdr: VirtioNetHdr,
    pub num_buffers: u16,
}

const_assert_eq!(core::mem::size_of::<VirtioNetHdr>(), 10);
const_assert_eq!(core::mem::size_of::<VirtioNetHdrMrgRxbuf>(), 12);

pub const VIRTIO_NET_HDR_F_NEEDS_CSUM: u8 = 1;

/// Device config window offsets.
pub const CFG_MAC: u64 = 0;
pub const CFG_MAX_VQ_PAIRS: u64 = 8;

/// Control queue protocol.
pub const VIRTIO_NET_CTRL_MQ: u8 = 4;
pub const VIRTIO_NET_CTRL_MQ_VQ_PAIRS_SET: u8 = 0;
pub const VIRTIO_NET_OK: u8 = 0;
pub const VIRTIO_NET_ERR: u8 = 1;

/// Ethernet header + VLAN tag + payload MTU, which is what a
/// full-length receive descriptor must hold beyond the net header.
const ETH_HDR_LEN: usize = 14;
const ETH_VLAN_LEN: usize = 4;
const ETH_MTU: usize = 1500;

/// Receive buffer length for a given net header size, padded to 8 bytes
/// so pooled buffers stay aligned.
pub const fn rx_buf_len(net_header_len: usize) -> usize {
    (net_header_len + ETH_HDR_LEN + ETH_VLAN_LEN + ETH_MTU + 7) & !7
}

/// Spread `ncpu` CPUs over `pairs` queue pairs: every pair gets
/// `ncpu / pairs`, the first `ncpu % pairs` pairs take one extra.
/// Returns (first_cpu, num_cpus) per pair.
pub fn vq_pair_plan(ncpu: usize, pairs: usize) -> alloc::vec::Vec<(usize, usize)> {
    let base = ncpu / pairs;
    let excess = ncpu - base * pairs;
    let mut plan = alloc::vec::Vec::with_capacity(pairs);
    let mut first = 0;
    for i in 0..pairs {
        let n = if i < excess { base + 1 } else { base };
        plan.push((first, n));
        first += n;
    }
    plan
}

/// One's-complement sum with 64-bit accumulation: add carries at each
/// width while folding 64 -> 32 -> 16, then invert.
pub fn net_checksum(buf: &[u8]) -> u16 {
    let mut sum: u64 = 0;
    let mut chunks = buf.chunks_exact(8);
    for c in chunks.by_ref() {
        let s = u64::from_ne_bytes(c.try_into().unwrap());
        sum = sum.wrapping_add(s);
        if sum < s {
            sum += 1;
        }
    }
    let mut rest = chunks.remainder();
    if rest.len() >= 4 {
        let s = u32::from_ne_bytes(rest[..4].try_into().unwrap()) as u64;
        sum = sum.wrapping_add(s);
        if sum < s {
            sum += 1;
        }
        rest = &rest[4..];
    }
    if rest.len() >= 2 {
        let s = u16::from_ne_bytes(rest[..2].try_into().unwrap()) as u64;
        sum = sum.wrapping_add(s);
        if sum < s {
            sum += 1;
        }
        rest = &rest[2..];
    }
    if let Some(&b) = rest.first() {
        let s = b as u64;
        sum = sum.wrapping_add(s);
        if sum < s {
            sum += 1;
        }
    }

    let mut s1 = sum as u32;
    let s2 = (sum >> 32) as u32;
    s1 = s1.wrapping_add(s2);
    if s1 < s2 {
        s1 += 1;
    }
    let mut s3 = s1 as u16;
    let s4 = (s1 >> 16) as u16;
    s3 = s3.wrapping_add(s4);
    if s3 < s4 {
        s3 += 1;
    }
    !s3
}

/// Finish a partial checksum the device left for us: sum the payload
/// from `csum_start` and store the result at `csum_start + csum_offset`.
/// Returns false (caller drops the packet) when the indicated region
/// does not fit the payload.
pub fn rx_csum_fixup(payload: &mut [u8], csum_start: usize, csum_offset: usize) -> bool {
    let len = payload.len();
    if csum_start + csum_offset + 2 > len {
        return false;
    }
    let csum = net_checksum(&payload[csum_start..]);
    payload[csum_start + csum_offset..csum_start + csum_offset + 2]
        .copy_from_slice(&csum.to_ne_bytes());
    true
}

#[cfg(not(test))]
pub use driver::*;

#[cfg(not(test))]
mod driver {
    use super::*;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicU64, Ordering};
    use spin::Mutex;

    use crate::arch::x86_64 as arch;
    use crate::drivers::pci::{register_pci_driver, PciDev};
    use crate::drivers::virtio::virtqueue::{self, VqCompletion, VqError, Virtqueue};
    use crate::drivers::virtio::{Features, VtDev, VIRTIO_ID_NETWORK};
    use crate::mem::objcache::CacheObj;
    use crate::mem::{self, DmaBuf, ObjectCache, PhysAddr};
    use crate::net::device as netdev;

    /// Buffers kept through a memory-pressure drain.
    const RX_BUFFERS_RETAIN: u64 = 64;

    /// Interface transmit/receive counters (MIB-style).
    #[derive(Default)]
    pub struct NetCounters {
        pub out_octets: AtomicU64,
        pub out_ucast_pkts: AtomicU64,
        pub out_nucast_pkts: AtomicU64,
        pub in_octets: AtomicU64,
        pub in_pkts: AtomicU64,
        pub in_drops: AtomicU64,
    }

    /// A pooled receive buffer. Dropping it returns the storage to the
    /// pool, which is how rejected and consumed frames alike find their
    /// way back.
    pub struct RxBuf {
        pool: Arc<ObjectCache>,
        obj: CacheObj,
        len: usize,
    }

    unsafe impl Send for RxBuf {}

    impl RxBuf {
        fn alloc(pool: &Arc<ObjectCache>) -> Option<Self> {
            let obj = pool.alloc()?;
            let len = pool.obj_size();
            Some(Self { pool: pool.clone(), obj, len })
        }

        pub fn phys(&self) -> PhysAddr {
            self.obj.phys
        }

        pub fn as_slice(&self) -> &[u8] {
            unsafe { core::slice::from_raw_parts(self.obj.ptr, self.len) }
        }

        pub fn as_mut_slice(&mut self) -> &mut [u8] {
            unsafe { core::slice::from_raw_parts_mut(self.obj.ptr, self.len) }
        }
    }

    impl Drop for RxBuf {
        fn drop(&mut self) {
            self.pool.release(self.obj.ptr);
        }
    }

    #[derive(Debug)]
    pub enum CtrlError {
        /// Device wrote other than the one ack byte.
        BadAckLength(u32),
        /// Device reported failure.
        CommandStatus(u8),
        OutOfMemory,
    }

    impl core::fmt::Display for CtrlError {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            match self {
                CtrlError::BadAckLength(l) => write!(f, "invalid ack length {}", l),
                CtrlError::CommandStatus(s) => write!(f, "command status {}", s),
                CtrlError::OutOfMemory => write!(f, "out of memory"),
            }
        }
    }

    pub struct VirtioNet {
        dev: Arc<VtDev>,
        mac: [u8; 6],
        net_header_len: usize,
        rxbuflen: usize,
        rx_pool: Arc<ObjectCache>,
        vq_pairs: usize,
        /// rx, tx interleaved per pair.
        queues: Vec<Arc<Mutex<Virtqueue>>>,
        /// Read-only after attach; indexed by CPU, no hot-path locking.
        txq_map: Vec<Arc<Mutex<Virtqueue>>>,
        ctl: Option<Arc<Mutex<Virtqueue>>>,
        /// Shared zeroed net header prepended to every transmit chain.
        empty: DmaBuf,
        pub counters: NetCounters,
    }

    /// Global driver instance, installed by the PCI probe.
    pub static VIRTIO_NET: Mutex<Option<Arc<VirtioNet>>> = Mutex::new(None);

    impl VirtioNet {
        pub fn mac(&self) -> [u8; 6] {
            self.mac
        }

        pub fn vq_pairs(&self) -> usize {
            self.vq_pairs
        }

        // ---- Receive path ----

        /// Post one receive buffer on `rxq`. Under ANY_LAYOUT the whole
        /// buffer is a single writable descriptor; otherwise the header
        /// and payload are split as two.
        fn post_receive(self: &Arc<Self>, rxq: &Arc<Mutex<Virtqueue>>) {
            let buf = match RxBuf::alloc(&self.rx_pool) {
                Some(b) => b,
                None => {
                    log::error!("virtio-net: rx buffer pool exhausted");
                    return;
                }
            };
            let phys = buf.phys();
            let vn = self.clone();
            let q = rxq.clone();
            let completion: VqCompletion = Box::new(move |len| {
                vn.rx_input(buf, len);
                vn.post_receive(&q);
            });

            let mut queue = rxq.lock();
            let mut msg = queue.msg();
            if self.dev.is_modern() || self.dev.features.contains(Features::ANY_LAYOUT) {
                msg.push(phys, self.rxbuflen as u32, true);
            } else {
                msg.push(phys, self.net_header_len as u32, true);
                msg.push(
                    PhysAddr::new(phys.as_u64() + self.net_header_len as u64),
                    (self.rxbuflen - self.net_header_len) as u32,
                    true,
                );
            }
            match queue.commit(msg, completion) {
                Ok(()) => {}
                // Expected once the ring is full during seeding (split
                // header+payload posts take two descriptors each).
                Err(VqError::QueueFull) => {}
                Err(e) => log::error!("virtio-net: rx post failed: {}", e),
            }
        }

        /// One received frame: strip the net header, finish a partial
        /// checksum if the device asked for one, and hand the payload to
        /// the network stack. Rejected frames return to the pool via the
        /// buffer's drop.
        fn rx_input(self: &Arc<Self>, mut buf: RxBuf, written: u32) {
            let written = written as usize;
            if written < self.net_header_len || written > self.rxbuflen {
                self.counters.in_drops.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let len = written - self.net_header_len;
            let hdr_len = self.net_header_len;

            let (flags, csum_start, csum_offset) = {
                let bytes = buf.as_slice();
                let hdr = unsafe { &*(bytes.as_ptr() as *const VirtioNetHdr) };
                (hdr.flags, hdr.csum_start as usize, hdr.csum_offset as usize)
            };
            if flags & VIRTIO_NET_HDR_F_NEEDS_CSUM != 0 {
                let payload = &mut buf.as_mut_slice()[hdr_len..hdr_len + len];
                if !rx_csum_fixup(payload, csum_start, csum_offset) {
                    self.counters.in_drops.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }

            self.counters.in_pkts.fetch_add(1, Ordering::Relaxed);
            self.counters.in_octets.fetch_add(len as u64, Ordering::Relaxed);
            if !netdev::enqueue_rx(netdev::RxFrame { buf, offset: hdr_len, len }) {
                self.counters.in_drops.fetch_add(1, Ordering::Relaxed);
            }
        }

        // ---- Transmit path ----

        /// Send one Ethernet frame on the current CPU's transmit queue.
        /// The chain is [shared zeroed header][payload]; the completion
        /// frees the packet buffer.
        pub fn low_level_output(&self, frame: &[u8]) -> bool {
            let txq = &self.txq_map[arch::current_cpu() % self.txq_map.len()];
            // TX queues poll: reclaim finished chains before submitting.
            virtqueue::service(txq);

            let mut pkt = match DmaBuf::alloc(frame.len()) {
                Ok(b) => b,
                Err(_) => return false,
            };
            pkt.copy_from_slice(0, frame);

            let mut queue = txq.lock();
            let mut msg = queue.msg();
            msg.push(self.empty.phys_addr(), self.net_header_len as u32, false);
            msg.push(pkt.phys_addr(), frame.len() as u32, false);
            let completion: VqCompletion = Box::new(move |_| {
                drop(pkt);
            });
            if let Err(e) = queue.commit(msg, completion) {
                log::warn!("virtio-net: tx commit failed: {}", e);
                return false;
            }
            drop(queue);

            self.counters.out_octets.fetch_add(frame.len() as u64, Ordering::Relaxed);
            if frame.first().map_or(false, |b| b & 1 != 0) {
                self.counters.out_nucast_pkts.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.out_ucast_pkts.fetch_add(1, Ordering::Relaxed);
            }
            true
        }

        /// Reclaim completed transmit chains on every queue; called from
        /// the kernel poll loop so idle queues still free their buffers.
        pub fn service_tx(&self) {
            for q in self.txq_map.iter() {
                virtqueue::service(q);
            }
        }

        // ---- Control queue ----

        /// Issue a control-queue command: read-only header and payload,
        /// one writable ack byte. `completion` observes the validated
        /// outcome.
        pub fn ctrl_cmd(
            &self,
            class: u8,
            cmd: u8,
            data: &[u8],
            completion: Box<dyn FnOnce(Result<(), CtrlError>) + Send>,
        ) {
            let ctl = match &self.ctl {
                Some(q) => q,
                None => {
                    completion(Err(CtrlError::OutOfMemory));
                    return;
                }
            };
            let ack_off = 2 + data.len();
            let mut cmdbuf = match DmaBuf::alloc(ack_off + 1) {
                Ok(b) => b,
                Err(_) => {
                    completion(Err(CtrlError::OutOfMemory));
                    return;
                }
            };
            cmdbuf.copy_from_slice(0, &[class, cmd]);
            cmdbuf.copy_from_slice(2, data);
            cmdbuf.copy_from_slice(ack_off, &[VIRTIO_NET_ERR]);

            let phys = cmdbuf.phys_addr();
            let mut queue = ctl.lock();
            let mut msg = queue.msg();
            msg.push(phys, 2, false);
            msg.push(PhysAddr::new(phys.as_u64() + 2), data.len() as u32, false);
            msg.push(PhysAddr::new(phys.as_u64() + ack_off as u64), 1, true);
            let vq_completion: VqCompletion = Box::new(move |written| {
                let ack = cmdbuf.as_slice()[ack_off];
                let result = if written != 1 {
                    Err(CtrlError::BadAckLength(written))
                } else if ack != VIRTIO_NET_OK {
                    Err(CtrlError::CommandStatus(ack))
                } else {
                    Ok(())
                };
                completion(result);
            });
            if queue.commit(msg, vq_completion).is_err() {
                log::warn!("virtio-net: control queue full");
            }
        }
    }

    /// Negotiated feature set for the PCI transport.
    fn driver_features() -> Features {
        Features::NET_MAC
            | Features::ANY_LAYOUT
            | Features::RING_EVENT_IDX
            | Features::NET_CTRL_VQ
            | Features::NET_MQ
    }

    /// Bring up a probed device: size the receive pool, plan queue
    /// pairs across CPUs, seed the receive rings, and (with MQ) tell
    /// the device how many pairs to use before going live.
    fn virtio_net_attach(dev: Arc<VtDev>) {
        let net_header_len = if dev.is_modern() || dev.features.contains(Features::NET_MRG_RXBUF) {
            core::mem::size_of::<VirtioNetHdrMrgRxbuf>()
        } else {
            core::mem::size_of::<VirtioNetHdr>()
        };
        let rxbuflen = rx_buf_len(net_header_len);
        log::info!("virtio-net: header {} bytes, rx buffers {} bytes", net_header_len, rxbuflen);

        let ncpu = arch::cpu_count();
        let max_pairs = if dev.features.contains(Features::NET_MQ) {
            dev.cfg_read_2(CFG_MAX_VQ_PAIRS) as usize
        } else {
            1
        };
        let vq_pairs = max_pairs.min(ncpu).max(1);
        let plan = vq_pair_plan(ncpu, vq_pairs);

        let mut mac = [0u8; 6];
        dev.cfg_read_mem(&mut mac);

        let rx_pool = Arc::new(ObjectCache::new(rxbuflen));
        {
            let pool = rx_pool.clone();
            let floor = RX_BUFFERS_RETAIN * rxbuflen as u64;
            mem::register_mem_cleaner(Box::new(move |clean_bytes| {
                pool.drain(clean_bytes, floor)
            }));
        }

        let mut queues = Vec::with_capacity(vq_pairs * 2);
        let mut txq_map: Vec<Arc<Mutex<Virtqueue>>> = Vec::with_capacity(ncpu);
        for (i, &(first_cpu, num_cpus)) in plan.iter().enumerate() {
            let cpu_bits = if num_cpus >= 64 {
                !0u64
            } else {
                ((1u64 << num_cpus) - 1) << first_cpu
            };
            let rxq = match dev.alloc_virtqueue("virtio net rx", 2 * i as u16) {
                Ok(q) => q,
                Err(e) => {
                    log::error!("virtio-net: rx queue {}: {}", i, e);
                    return;
                }
            };
            dev.set_vq_affinity(&rxq, cpu_bits);
            queues.push(rxq);
            let txq = match dev.alloc_virtqueue("virtio net tx", 2 * i as u16 + 1) {
                Ok(q) => q,
                Err(e) => {
                    log::error!("virtio-net: tx queue {}: {}", i, e);
                    return;
                }
            };
            dev.set_vq_affinity(&txq, cpu_bits);
            txq.lock().set_polling(true);
            for _ in 0..num_cpus {
                txq_map.push(txq.clone());
            }
            queues.push(txq);
        }

        let ctl = if vq_pairs > 1 && dev.features.contains(Features::NET_CTRL_VQ) {
            match dev.alloc_virtqueue("virtio net ctrl", 2 * max_pairs as u16) {
                Ok(q) => Some(q),
                Err(e) => {
                    log::warn!("virtio-net: control queue: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let empty = match DmaBuf::alloc(net_header_len) {
            Ok(b) => b, // DmaBuf::alloc zeroes
            Err(e) => {
                log::error!("virtio-net: header allocation: {}", e);
                return;
            }
        };

        let vn = Arc::new(VirtioNet {
            dev: dev.clone(),
            mac,
            net_header_len,
            rxbuflen,
            rx_pool,
            vq_pairs,
            queues,
            txq_map,
            ctl,
            empty,
            counters: NetCounters::default(),
        });

        dev.setup_interrupt("virtio-net");

        // Keep every receive ring full from the start.
        for i in 0..vn.vq_pairs {
            let rxq = vn.queues[2 * i].clone();
            let entries = rxq.lock().entries();
            for _ in 0..entries {
                vn.post_receive(&rxq);
            }
        }

        dev.set_driver_ok();

        if vn.vq_pairs > 1 {
            let pairs = (vn.vq_pairs as u16).to_le_bytes();
            let vn_done = vn.clone();
            vn.ctrl_cmd(
                VIRTIO_NET_CTRL_MQ,
                VIRTIO_NET_CTRL_MQ_VQ_PAIRS_SET,
                &pairs,
                Box::new(move |result| match result {
                    Ok(()) => virtio_net_attach_complete(vn_done),
                    Err(e) => log::error!("virtio-net: MQ pair set failed: {}", e),
                }),
            );
        } else {
            virtio_net_attach_complete(vn);
        }
    }

    fn virtio_net_attach_complete(vn: Arc<VirtioNet>) {
        log::info!(
            "virtio-net: up, mac {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}, {} queue pair(s)",
            vn.mac[0], vn.mac[1], vn.mac[2], vn.mac[3], vn.mac[4], vn.mac[5],
            vn.vq_pairs
        );
        *VIRTIO_NET.lock() = Some(vn);
    }

    /// Register the PCI probe for virtio network devices.
    pub fn init_virtio_network() {
        register_pci_driver(Box::new(|pci: PciDev| {
            if !VtDev::probe(pci, VIRTIO_ID_NETWORK) {
                return false;
            }
            let dev = VtDev::attach(pci, driver_features());
            virtio_net_attach(dev);
            true
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference one's-complement sum over 16-bit words, byte-at-a-time.
    fn reference_csum(data: &[u8]) -> u16 {
        let mut sum: u32 = 0;
        let mut i = 0;
        while i + 1 < data.len() {
            sum += u16::from_ne_bytes([data[i], data[i + 1]]) as u32;
            i += 2;
        }
        if i < data.len() {
            // Trailing byte occupies the low byte of a native-endian
            // word, matching the 64-bit accumulator.
            sum += u16::from_ne_bytes([data[i], 0]) as u32;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }

    #[test]
    fn header_sizes() {
        assert_eq!(core::mem::size_of::<VirtioNetHdr>(), 10);
        assert_eq!(core::mem::size_of::<VirtioNetHdrMrgRxbuf>(), 12);
    }

    #[test]
    fn rx_buffer_length_padded() {
        // 10-byte legacy header: 10 + 14 + 4 + 1500 = 1528, already
        // 8-aligned. 12-byte header: 1530 pads to 1536.
        assert_eq!(rx_buf_len(10), 1528);
        assert_eq!(rx_buf_len(12), 1536);
        assert_eq!(rx_buf_len(10) % 8, 0);
    }

    #[test]
    fn checksum_matches_reference() {
        let mut data = [0u8; 61];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(37).wrapping_add(11);
        }
        for len in [0, 1, 2, 7, 8, 9, 15, 16, 46, 60, 61] {
            assert_eq!(net_checksum(&data[..len]), reference_csum(&data[..len]), "len {}", len);
        }
    }

    #[test]
    fn csum_fixup_writes_folded_sum() {
        // 60-byte frame, checksum over bytes [14..60) stored at offset
        // 14 + 16 = 30.
        let mut frame = [0u8; 60];
        for (i, b) in frame.iter_mut().enumerate() {
            *b = i as u8;
        }
        frame[30] = 0;
        frame[31] = 0;
        assert!(rx_csum_fixup(&mut frame, 14, 16));
        let mut expect_src = frame.to_vec();
        expect_src[30] = 0;
        expect_src[31] = 0;
        // The sum runs before the store, over the zeroed checksum field.
        let expected = reference_csum(&expect_src[14..]);
        let got = u16::from_ne_bytes([frame[30], frame[31]]);
        assert_eq!(got, expected);
    }

    #[test]
    fn csum_fixup_rejects_out_of_bounds() {
        let mut frame = [0u8; 60];
        assert!(!rx_csum_fixup(&mut frame, 50, 10)); // 50+10+2 > 60
        assert!(!rx_csum_fixup(&mut frame, 60, 0));
        assert!(rx_csum_fixup(&mut frame, 44, 14)); // 44+14+2 == 60
    }

    #[test]
    fn pair_plan_distributes_excess_first() {
        // 6 CPUs over 4 pairs: 2,2,1,1.
        assert_eq!(vq_pair_plan(6, 4), alloc::vec![(0, 2), (2, 2), (4, 1), (5, 1)]);
        // Even split.
        assert_eq!(vq_pair_plan(4, 2), alloc::vec![(0, 2), (2, 2)]);
        // Single pair takes everything.
        assert_eq!(vq_pair_plan(3, 1), alloc::vec![(0, 3)]);
    }

    #[test]
    fn pair_plan_covers_all_cpus() {
        for ncpu in 1..=16 {
            for pairs in 1..=ncpu {
                let plan = vq_pair_plan(ncpu, pairs);
                let total: usize = plan.iter().map(|&(_, n)| n).sum();
                assert_eq!(total, ncpu);
                let mut next = 0;
                for &(first, n) in &plan {
                    assert_eq!(first, next);
                    next += n;
                }
            }
        }
    }
}
