/// Virtio over legacy PCI: feature negotiation, queue setup, interrupt
/// routing, and the split-ring virtqueue.
pub mod net;
pub mod virtqueue;

use bitflags::bitflags;

bitflags! {
    /// Legacy 32-bit feature word: transport features plus the network
    /// device features we understand.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Features: u32 {
        const NET_MAC        = 1 << 5;
        const NET_MRG_RXBUF  = 1 << 15;
        const NET_CTRL_VQ    = 1 << 17;
        const NET_MQ         = 1 << 22;
        const ANY_LAYOUT     = 1 << 27;
        const RING_EVENT_IDX = 1 << 29;
    }
}

/// Device status register bits.
pub const STATUS_ACKNOWLEDGE: u8 = 1;
pub const STATUS_DRIVER: u8 = 2;
pub const STATUS_DRIVER_OK: u8 = 4;

/// Virtio device types (legacy PCI subsystem id).
pub const VIRTIO_ID_NETWORK: u16 = 1;

#[cfg(not(test))]
pub use transport::*;

#[cfg(not(test))]
mod transport {
    use super::virtqueue::{self, Virtqueue};
    use super::*;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use spin::Mutex;

    use crate::drivers::pci::{
        pci_cfgread, pci_device_id, pci_enable_device, pci_platform_allocate_msi,
        pci_platform_has_msi, pci_setup_non_msi_irq, pci_subsystem_id, pci_vendor_id, PciBar,
        PciDev, PCIR_HEADER_TYPE,
    };
    use crate::mem::AllocError;

    /// Legacy register offsets from BAR0.
    mod regs {
        pub const DEVICE_FEATURES: u64 = 0x00; // 32-bit RO
        pub const DRIVER_FEATURES: u64 = 0x04; // 32-bit WO
        pub const QUEUE_ADDRESS: u64 = 0x08; // 32-bit RW (PFN)
        pub const QUEUE_SIZE: u64 = 0x0C; // 16-bit RO
        pub const QUEUE_SELECT: u64 = 0x0E; // 16-bit RW
        pub const QUEUE_NOTIFY: u64 = 0x10; // 16-bit WO
        pub const DEVICE_STATUS: u64 = 0x12; // 8-bit RW
        pub const ISR_STATUS: u64 = 0x13; // 8-bit RO, read-to-clear
        pub const DEVICE_CONFIG: u64 = 0x14; // device-specific window
    }

    pub const VIRTIO_PCI_VENDOR: u16 = 0x1AF4;

    #[derive(Debug)]
    pub enum VirtioError {
        QueueNotAvailable,
        OutOfMemory,
    }

    impl core::fmt::Display for VirtioError {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            match self {
                VirtioError::QueueNotAvailable => write!(f, "virtqueue not available"),
                VirtioError::OutOfMemory => write!(f, "out of memory"),
            }
        }
    }

    impl From<AllocError> for VirtioError {
        fn from(_: AllocError) -> Self {
            VirtioError::OutOfMemory
        }
    }

    /// A virtio device on its legacy PCI transport.
    pub struct VtDev {
        pub pci: PciDev,
        bar0: Arc<PciBar>,
        pub features: Features,
        /// Queues serviced when the device interrupt fires, in queue
        /// index order (polling queues are skipped).
        serviced: Mutex<Vec<Arc<Mutex<Virtqueue>>>>,
    }

    impl VtDev {
        /// Does this legacy PCI function carry the given virtio device
        /// type?
        pub fn probe(dev: PciDev, virtio_id: u16) -> bool {
            pci_vendor_id(dev) == VIRTIO_PCI_VENDOR
                && (0x1000..=0x103F).contains(&pci_device_id(dev))
                && pci_subsystem_id(dev) == virtio_id
                // Only standard header functions are devices.
                && pci_cfgread(dev, PCIR_HEADER_TYPE, 1) & 0x7F == 0
        }

        /// Reset the device and negotiate `driver_features`. The caller
        /// allocates queues and then flips DRIVER_OK.
        pub fn attach(dev: PciDev, driver_features: Features) -> Arc<VtDev> {
            pci_enable_device(dev);
            let bar0 = Arc::new(PciBar::probe(dev, 0));

            bar0.write_1(regs::DEVICE_STATUS, 0);
            bar0.write_1(regs::DEVICE_STATUS, STATUS_ACKNOWLEDGE);
            bar0.write_1(regs::DEVICE_STATUS, STATUS_ACKNOWLEDGE | STATUS_DRIVER);

            let offered = Features::from_bits_retain(bar0.read_4(regs::DEVICE_FEATURES));
            let negotiated = offered & driver_features;
            bar0.write_4(regs::DRIVER_FEATURES, negotiated.bits());
            // Legacy transport has no FEATURES_OK handshake.

            log::info!(
                "virtio {}: features offered {:#x}, using {:#x}",
                dev,
                offered.bits(),
                negotiated.bits()
            );

            Arc::new(VtDev {
                pci: dev,
                bar0,
                features: negotiated,
                serviced: Mutex::new(Vec::new()),
            })
        }

        /// Legacy transports never set VERSION_1.
        pub fn is_modern(&self) -> bool {
            false
        }

        /// Mark the driver ready; the device may start processing
        /// queues.
        pub fn set_driver_ok(&self) {
            self.bar0.write_1(
                regs::DEVICE_STATUS,
                STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_DRIVER_OK,
            );
        }

        // ---- Device-specific configuration ----

        pub fn cfg_read_1(&self, offset: u64) -> u8 {
            self.bar0.read_1(regs::DEVICE_CONFIG + offset)
        }

        pub fn cfg_read_2(&self, offset: u64) -> u16 {
            self.bar0.read_2(regs::DEVICE_CONFIG + offset)
        }

        /// Read `out.len()` bytes of device config starting at offset 0
        /// (MAC address etc).
        pub fn cfg_read_mem(&self, out: &mut [u8]) {
            for (i, b) in out.iter_mut().enumerate() {
                *b = self.cfg_read_1(i as u64);
            }
        }

        // ---- Queues ----

        /// Allocate virtqueue `index` with the device-reported size and
        /// hand its address to the device.
        pub fn alloc_virtqueue(
            self: &Arc<Self>,
            name: &'static str,
            index: u16,
        ) -> Result<Arc<Mutex<Virtqueue>>, VirtioError> {
            self.bar0.write_2(regs::QUEUE_SELECT, index);
            let size = self.bar0.read_2(regs::QUEUE_SIZE);
            if size == 0 {
                return Err(VirtioError::QueueNotAvailable);
            }
            let bar0 = self.bar0.clone();
            let notify: virtqueue::VqNotify = Box::new(move || {
                bar0.write_2(regs::QUEUE_NOTIFY, index);
            });
            let vq = Virtqueue::new(
                name,
                size,
                self.features.contains(Features::RING_EVENT_IDX),
                notify,
            )?;
            self.bar0.write_4(regs::QUEUE_ADDRESS, vq.pfn());
            let vq = Arc::new(Mutex::new(vq));
            self.serviced.lock().push(vq.clone());
            Ok(vq)
        }

        /// Record the CPU set whose interrupts should service this
        /// queue. With a single shared message vector the device
        /// interrupt lands on the first CPU of the first recorded set;
        /// per-queue steering would need MSI-X.
        pub fn set_vq_affinity(&self, vq: &Arc<Mutex<Virtqueue>>, cpu_bitmap: u64) {
            vq.lock().set_affinity(cpu_bitmap);
        }

        /// Service every non-polling queue: drain used rings and run the
        /// completions.
        pub fn service_queues(&self) {
            let queues: Vec<Arc<Mutex<Virtqueue>>> = self
                .serviced
                .lock()
                .iter()
                .filter(|q| !q.lock().is_polling())
                .cloned()
                .collect();
            for q in queues {
                virtqueue::service(&q);
            }
        }

        /// Wire the device interrupt: MSI when the platform offers it,
        /// else the legacy line through the IOAPIC. The ISR status read
        /// acknowledges and demultiplexes (bit 0 = queue, bit 1 =
        /// config); we react to queue interrupts only.
        pub fn setup_interrupt(self: &Arc<Self>, name: &'static str) {
            let cpu = self
                .serviced
                .lock()
                .iter()
                .find_map(|q| {
                    let a = q.lock().affinity();
                    if a != 0 { Some(a.trailing_zeros() as usize) } else { None }
                })
                .unwrap_or(0);

            let dev = self.clone();
            let handler: crate::irq::IrqHandler = Box::new(move || {
                let isr = dev.bar0.read_1(regs::ISR_STATUS);
                if isr & 0x1 != 0 {
                    dev.service_queues();
                }
            });

            if pci_platform_has_msi() {
                if pci_platform_allocate_msi(self.pci, handler, name, cpu).is_some() {
                    return;
                }
                log::warn!("virtio {}: MSI setup failed, falling back to INTx", self.pci);
                // The boxed handler was consumed; build an equivalent
                // one for the fallback path.
                let dev = self.clone();
                let handler: crate::irq::IrqHandler = Box::new(move || {
                    let isr = dev.bar0.read_1(regs::ISR_STATUS);
                    if isr & 0x1 != 0 {
                        dev.service_queues();
                    }
                });
                pci_setup_non_msi_irq(self.pci, handler, name);
            } else {
                pci_setup_non_msi_irq(self.pci, handler, name);
            }
        }
    }
}
