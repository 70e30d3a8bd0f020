/// smoltcp PHY adapter for virtio-net.
///
/// The driver's receive completions enqueue stripped frames here; the
/// stack's poll loop consumes them as RxTokens. Transmit tokens call
/// straight into the driver's per-CPU output path.
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use smoltcp::phy::{self, Device, DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use spin::Mutex;

use crate::drivers::virtio::net::{RxBuf, VIRTIO_NET};

/// A received frame: pooled buffer plus the payload window (net header
/// already stripped).
pub struct RxFrame {
    pub buf: RxBuf,
    pub offset: usize,
    pub len: usize,
}

impl RxFrame {
    fn payload_mut(&mut self) -> &mut [u8] {
        let (offset, len) = (self.offset, self.len);
        &mut self.buf.as_mut_slice()[offset..offset + len]
    }
}

/// Frames parked between driver completion and stack poll. Bounded so a
/// stalled stack cannot pin the whole buffer pool.
const RX_QUEUE_DEPTH: usize = 256;

static RX_QUEUE: Mutex<VecDeque<RxFrame>> = Mutex::new(VecDeque::new());

/// Hand a frame to the stack. Returns false (frame dropped, buffer back
/// to the pool) when the stack queue is full.
pub fn enqueue_rx(frame: RxFrame) -> bool {
    let mut q = RX_QUEUE.lock();
    if q.len() >= RX_QUEUE_DEPTH {
        return false;
    }
    q.push_back(frame);
    true
}

/// smoltcp `Device` over the driver queues.
pub struct VirtioNetDevice;

impl VirtioNetDevice {
    pub fn new() -> Self {
        Self
    }

    pub fn mac(&self) -> Option<[u8; 6]> {
        VIRTIO_NET.lock().as_ref().map(|vn| vn.mac())
    }
}

impl Device for VirtioNetDevice {
    type RxToken<'a> = RxToken;
    type TxToken<'a> = TxToken;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = RX_QUEUE.lock().pop_front()?;
        Some((RxToken { frame }, TxToken))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        // Queue-full is handled (and counted) in the driver.
        Some(TxToken)
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        caps.max_transmission_unit = super::MTU;
        caps.max_burst_size = Some(1);
        caps
    }
}

pub struct RxToken {
    frame: RxFrame,
}

impl phy::RxToken for RxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        // The RxBuf drops here, returning the storage to the pool.
        f(self.frame.payload_mut())
    }
}

pub struct TxToken;

impl phy::TxToken for TxToken {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf: Vec<u8> = alloc::vec![0u8; len];
        let result = f(&mut buf);
        if let Some(vn) = VIRTIO_NET.lock().as_ref() {
            vn.low_level_output(&buf);
        }
        result
    }
}
