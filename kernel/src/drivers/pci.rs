/// PCI configuration space access, BAR management, and interrupt wiring.
///
/// Configuration transactions use the CONFIG#1 mechanism: a 32-bit
/// address written to 0x0CF8 followed by data I/O at 0x0CFC. The
/// address/data pair is not atomic across CPUs sharing the bus, and an
/// ISR preempting between the two I/O ops could start its own
/// transaction, so every config access and every BAR access runs with
/// local interrupts disabled.
use core::fmt;

pub const CONF1_ADDR_PORT: u16 = 0x0CF8;
pub const CONF1_DATA_PORT: u16 = 0x0CFC;

pub const PCI_BUSMAX: u8 = 255;
pub const PCI_SLOTMAX: u8 = 31;
pub const PCI_FUNCMAX: u8 = 7;
pub const PCI_REGMAX: u32 = 255;

// Standard configuration space registers.
pub const PCIR_VENDOR: u32 = 0x00;
pub const PCIR_DEVICE: u32 = 0x02;
pub const PCIR_COMMAND: u32 = 0x04;
pub const PCIR_STATUS: u32 = 0x06;
pub const PCIR_HEADER_TYPE: u32 = 0x0E;
pub const PCIR_SUBSYS_ID: u32 = 0x2E;
pub const PCIR_CAP_PTR: u32 = 0x34;
pub const PCIR_INTERRUPT_LINE: u32 = 0x3C;

pub const PCIM_CMD_IO: u32 = 1 << 0;
pub const PCIM_CMD_MEMORY: u32 = 1 << 1;
pub const PCIM_CMD_BUS_MASTER: u32 = 1 << 2;
pub const PCIM_STATUS_CAP_LIST: u32 = 1 << 4;

pub const PCIY_MSI: u8 = 0x05;

// BAR register encoding.
pub const PCI_BAR_B_TYPE_MASK: u32 = 0x1;
pub const PCI_BAR_IOPORT: u32 = 0x1;
pub const PCI_BAR_B_IOPORT_MASK: u32 = 0x3;
pub const PCI_BAR_B_MEMORY_MASK: u32 = 0xF;

pub const fn pcir_bar(index: u8) -> u32 {
    0x10 + 4 * index as u32
}

/// Immutable identity of a PCI function.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PciDev {
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl PciDev {
    pub fn new(bus: u8, slot: u8, function: u8) -> Self {
        debug_assert!(slot <= PCI_SLOTMAX && function <= PCI_FUNCMAX);
        Self { bus, slot, function }
    }
}

impl fmt::Display for PciDev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.bus, self.slot, self.function)
    }
}

/// CONFIG_ADDRESS word for a register, with the enable bit set and the
/// low two register bits masked off (they select the byte lane at the
/// data port instead).
pub fn cfg_address(dev: PciDev, reg: u32) -> u32 {
    (1u32 << 31)
        | (dev.bus as u32) << 16
        | (dev.slot as u32) << 11
        | (dev.function as u32) << 8
        | (reg & !0x03)
}

/// Validate an access and return the data port to use, or 0 when the
/// combination is unsupported: `reg` beyond config space, a width other
/// than 1/2/4, or a register not naturally aligned for the width.
pub fn cfgenable_dataport(dev: PciDev, reg: u32, bytes: u32) -> u16 {
    if dev.slot <= PCI_SLOTMAX
        && dev.function <= PCI_FUNCMAX
        && reg <= PCI_REGMAX
        && bytes != 3
        && bytes >= 1
        && bytes <= 4
        && reg & (bytes - 1) == 0
    {
        CONF1_DATA_PORT + (reg & 0x03) as u16
    } else {
        0
    }
}

/// BAR size from the all-ones readback, masked of its type bits. The
/// size is the two's complement of the writable mask.
pub fn bar_size_from_mask(mask: u32) -> u64 {
    if mask == 0 {
        return 0;
    }
    (!(mask as u64) + 1) & 0xFFFF_FFFF
}

#[cfg(not(test))]
pub use imp::*;

#[cfg(not(test))]
mod imp {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use spin::Mutex;

    use crate::arch::x86_64::{self as arch, IrqGuard};
    use crate::irq::{self, IrqHandler};
    use crate::mem::PhysAddr;

    /// Read 1/2/4 bytes from configuration space. Invalid accesses
    /// return all-ones. Interrupts are disabled across the address write
    /// and the data read.
    pub fn pci_cfgread(dev: PciDev, reg: u32, bytes: u32) -> u32 {
        let _guard = IrqGuard::new();
        let port = cfgenable_dataport(dev, reg, bytes);
        if port == 0 {
            return !0;
        }
        arch::out32(CONF1_ADDR_PORT, cfg_address(dev, reg));
        match bytes {
            1 => arch::in8(port) as u32,
            2 => arch::in16(port) as u32,
            _ => arch::in32(port),
        }
    }

    /// Write 1/2/4 bytes to configuration space. Invalid accesses are
    /// dropped.
    pub fn pci_cfgwrite(dev: PciDev, reg: u32, bytes: u32, value: u32) {
        let _guard = IrqGuard::new();
        let port = cfgenable_dataport(dev, reg, bytes);
        if port == 0 {
            return;
        }
        arch::out32(CONF1_ADDR_PORT, cfg_address(dev, reg));
        match bytes {
            1 => arch::out8(port, value as u8),
            2 => arch::out16(port, value as u16),
            _ => arch::out32(port, value),
        }
    }

    // ---- Identity helpers ----

    pub fn pci_vendor_id(dev: PciDev) -> u16 {
        pci_cfgread(dev, PCIR_VENDOR, 2) as u16
    }

    pub fn pci_device_id(dev: PciDev) -> u16 {
        pci_cfgread(dev, PCIR_DEVICE, 2) as u16
    }

    pub fn pci_subsystem_id(dev: PciDev) -> u16 {
        pci_cfgread(dev, PCIR_SUBSYS_ID, 2) as u16
    }

    /// Enable I/O, memory decoding and bus mastering.
    pub fn pci_enable_device(dev: PciDev) {
        let cmd = pci_cfgread(dev, PCIR_COMMAND, 2);
        pci_cfgwrite(dev, PCIR_COMMAND, 2, cmd | PCIM_CMD_IO | PCIM_CMD_MEMORY | PCIM_CMD_BUS_MASTER);
    }

    // ---- Base address registers ----

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub enum BarKind {
        Memory,
        IoPort,
    }

    /// A decoded BAR. Memory BARs are accessed through their HHDM
    /// pointer, I/O BARs through port instructions; each access disables
    /// interrupts so an ISR cannot slip its own port transaction between
    /// ours.
    pub struct PciBar {
        pub kind: BarKind,
        /// Physical base (memory) or port number (I/O).
        pub base: u64,
        pub size: u64,
        vaddr: *mut u8,
    }

    unsafe impl Send for PciBar {}
    unsafe impl Sync for PciBar {}

    impl PciBar {
        /// Decode BAR `index` of `dev`, probing its size.
        pub fn probe(dev: PciDev, index: u8) -> Self {
            let raw = pci_cfgread(dev, pcir_bar(index), 4);
            if raw & PCI_BAR_B_TYPE_MASK == PCI_BAR_IOPORT {
                let base = (raw & !PCI_BAR_B_IOPORT_MASK) as u64;
                let size = pci_bar_size(dev, BarKind::IoPort, index);
                Self { kind: BarKind::IoPort, base, size, vaddr: core::ptr::null_mut() }
            } else {
                let base = (raw & !PCI_BAR_B_MEMORY_MASK) as u64;
                let size = pci_bar_size(dev, BarKind::Memory, index);
                Self {
                    kind: BarKind::Memory,
                    base,
                    size,
                    vaddr: PhysAddr::new(base).as_ptr(),
                }
            }
        }

        pub fn read_1(&self, offset: u64) -> u8 {
            let _guard = IrqGuard::new();
            match self.kind {
                BarKind::Memory => unsafe { core::ptr::read_volatile(self.vaddr.add(offset as usize)) },
                BarKind::IoPort => arch::in8(self.base as u16 + offset as u16),
            }
        }

        pub fn write_1(&self, offset: u64, val: u8) {
            let _guard = IrqGuard::new();
            match self.kind {
                BarKind::Memory => unsafe { core::ptr::write_volatile(self.vaddr.add(offset as usize), val) },
                BarKind::IoPort => arch::out8(self.base as u16 + offset as u16, val),
            }
        }

        pub fn read_2(&self, offset: u64) -> u16 {
            let _guard = IrqGuard::new();
            match self.kind {
                BarKind::Memory => unsafe {
                    core::ptr::read_volatile(self.vaddr.add(offset as usize) as *const u16)
                },
                BarKind::IoPort => arch::in16(self.base as u16 + offset as u16),
            }
        }

        pub fn write_2(&self, offset: u64, val: u16) {
            let _guard = IrqGuard::new();
            match self.kind {
                BarKind::Memory => unsafe {
                    core::ptr::write_volatile(self.vaddr.add(offset as usize) as *mut u16, val)
                },
                BarKind::IoPort => arch::out16(self.base as u16 + offset as u16, val),
            }
        }

        pub fn read_4(&self, offset: u64) -> u32 {
            let _guard = IrqGuard::new();
            match self.kind {
                BarKind::Memory => unsafe {
                    core::ptr::read_volatile(self.vaddr.add(offset as usize) as *const u32)
                },
                BarKind::IoPort => arch::in32(self.base as u16 + offset as u16),
            }
        }

        pub fn write_4(&self, offset: u64, val: u32) {
            let _guard = IrqGuard::new();
            match self.kind {
                BarKind::Memory => unsafe {
                    core::ptr::write_volatile(self.vaddr.add(offset as usize) as *mut u32, val)
                },
                BarKind::IoPort => arch::out32(self.base as u16 + offset as u16, val),
            }
        }

        pub fn read_8(&self, offset: u64) -> u64 {
            let _guard = IrqGuard::new();
            match self.kind {
                BarKind::Memory => unsafe {
                    core::ptr::read_volatile(self.vaddr.add(offset as usize) as *const u64)
                },
                BarKind::IoPort => arch::in64(self.base as u16 + offset as u16),
            }
        }

        pub fn write_8(&self, offset: u64, val: u64) {
            let _guard = IrqGuard::new();
            match self.kind {
                BarKind::Memory => unsafe {
                    core::ptr::write_volatile(self.vaddr.add(offset as usize) as *mut u64, val)
                },
                BarKind::IoPort => arch::out64(self.base as u16 + offset as u16, val),
            }
        }
    }

    /// Size a BAR with the all-ones probe, restoring the original value.
    pub fn pci_bar_size(dev: PciDev, kind: BarKind, index: u8) -> u64 {
        let reg = pcir_bar(index);
        let saved = pci_cfgread(dev, reg, 4);
        pci_cfgwrite(dev, reg, 4, !0);
        let mask = pci_cfgread(dev, reg, 4);
        pci_cfgwrite(dev, reg, 4, saved);
        let mask = match kind {
            BarKind::Memory => mask & !PCI_BAR_B_MEMORY_MASK,
            BarKind::IoPort => mask & !PCI_BAR_B_IOPORT_MASK,
        };
        bar_size_from_mask(mask)
    }

    // ---- I/O memory window for unconfigured BARs ----

    /// First-fit range allocator over the platform's PCI I/O memory
    /// window. BAR allocations are size-aligned and never freed.
    struct IomemRange {
        next: u64,
        end: u64,
    }

    static IOMEM: Mutex<IomemRange> = Mutex::new(IomemRange { next: 0, end: 0 });

    /// Set the I/O memory window available for BAR allocation, from the
    /// platform memory map. Must lie below 4 GiB.
    pub fn pci_set_iomem_range(base: u64, end: u64) {
        let mut iomem = IOMEM.lock();
        iomem.next = base;
        iomem.end = end.min(1u64 << 32);
    }

    fn iomem_alloc(size: u64) -> Option<u64> {
        if size == 0 || !size.is_power_of_two() {
            return None;
        }
        let mut iomem = IOMEM.lock();
        let base = (iomem.next + size - 1) & !(size - 1);
        // 32-bit BARs only; the window was clamped below 4 GiB.
        if base + size > iomem.end {
            return None;
        }
        iomem.next = base + size;
        Some(base)
    }

    /// Assign an address to BAR `index` if the BIOS left it empty.
    /// I/O-port BARs and allocation failures are logged and skipped; a
    /// missing BAR never aborts device bring-up.
    pub fn pci_platform_init_bar(dev: PciDev, index: u8) {
        let base = pci_cfgread(dev, pcir_bar(index), 4);
        let is_io = base & PCI_BAR_B_TYPE_MASK == PCI_BAR_IOPORT;
        let addr_mask = if is_io { !PCI_BAR_B_IOPORT_MASK } else { !PCI_BAR_B_MEMORY_MASK };
        if base & addr_mask != 0 {
            return; // BAR configured by BIOS
        }
        if is_io {
            log::error!("pci: I/O port resource allocation not supported ({}, bar {})", dev, index);
            return;
        }
        let size = pci_bar_size(dev, BarKind::Memory, index);
        match iomem_alloc(size) {
            Some(base) => {
                pci_cfgwrite(dev, pcir_bar(index), 4, base as u32);
            }
            None => {
                log::error!("pci: failed to allocate I/O memory ({}, bar {})", dev, index);
            }
        }
    }

    // ---- Interrupt wiring ----

    /// Legacy interrupt routing: take the BIOS-programmed interrupt line
    /// as the GSI and register through the IOAPIC. A full ACPI _PRT walk
    /// would be more portable; the interrupt-line byte is correct on the
    /// virtual platforms we target.
    pub fn pci_setup_non_msi_irq(dev: PciDev, handler: IrqHandler, name: &'static str) -> Option<u8> {
        let gsi = pci_cfgread(dev, PCIR_INTERRUPT_LINE, 1);
        irq::ioapic_register_int(gsi, handler, name)
    }

    /// Walk the capability list for `cap_id`. Returns the config-space
    /// offset of the capability header.
    pub fn pci_find_capability(dev: PciDev, cap_id: u8) -> Option<u32> {
        if pci_cfgread(dev, PCIR_STATUS, 2) & PCIM_STATUS_CAP_LIST == 0 {
            return None;
        }
        let mut ptr = pci_cfgread(dev, PCIR_CAP_PTR, 1) & 0xFC;
        let mut guard = 0;
        while ptr != 0 && guard < 48 {
            let id = pci_cfgread(dev, ptr, 1) as u8;
            if id == cap_id {
                return Some(ptr);
            }
            ptr = pci_cfgread(dev, ptr + 1, 1) & 0xFC;
            guard += 1;
        }
        None
    }

    /// Allocate a vector, register `handler`, and program the device's
    /// MSI capability so it raises that vector on `cpu`. Returns the
    /// vector.
    pub fn pci_platform_allocate_msi(
        dev: PciDev,
        handler: IrqHandler,
        name: &'static str,
        cpu: usize,
    ) -> Option<u8> {
        let cap = pci_find_capability(dev, PCIY_MSI)?;
        let vector = irq::allocate_interrupt()?;
        irq::register_interrupt(vector, handler, name);
        let (address, data) = irq::msi_format(vector, cpu);

        let msgctl = pci_cfgread(dev, cap + 2, 2);
        pci_cfgwrite(dev, cap + 4, 4, address);
        if msgctl & (1 << 7) != 0 {
            // 64-bit address capable: upper dword then data.
            pci_cfgwrite(dev, cap + 8, 4, 0);
            pci_cfgwrite(dev, cap + 0xC, 2, data);
        } else {
            pci_cfgwrite(dev, cap + 8, 2, data);
        }
        // Enable, single message.
        pci_cfgwrite(dev, cap + 2, 2, (msgctl & !(0x7 << 4)) | 1);
        Some(vector)
    }

    /// Disable the device's MSI capability and release the vector.
    pub fn pci_platform_deallocate_msi(dev: PciDev, vector: u8) {
        if let Some(cap) = pci_find_capability(dev, PCIY_MSI) {
            let msgctl = pci_cfgread(dev, cap + 2, 2);
            pci_cfgwrite(dev, cap + 2, 2, msgctl & !1);
        }
        irq::unregister_interrupt(vector);
        irq::deallocate_interrupt(vector);
    }

    pub fn pci_platform_has_msi() -> bool {
        true
    }

    // ---- Enumeration ----

    pub type PciProbe = Box<dyn Fn(PciDev) -> bool + Send>;

    static DRIVERS: Mutex<Vec<PciProbe>> = Mutex::new(Vec::new());

    /// Register a driver probe, called for every discovered function.
    /// Returning true claims the device.
    pub fn register_pci_driver(probe: PciProbe) {
        DRIVERS.lock().push(probe);
    }

    fn pci_probe_function(dev: PciDev) {
        let drivers = DRIVERS.lock();
        for probe in drivers.iter() {
            if probe(dev) {
                return;
            }
        }
    }

    /// Walk every bus/slot/function, offering present functions to the
    /// registered drivers. Honors the multi-function bit of the header
    /// type.
    pub fn pci_discover() {
        for bus in 0..=PCI_BUSMAX {
            for slot in 0..=PCI_SLOTMAX {
                let dev = PciDev::new(bus, slot, 0);
                if pci_vendor_id(dev) == 0xFFFF {
                    continue;
                }
                let multi = pci_cfgread(dev, PCIR_HEADER_TYPE, 1) & 0x80 != 0;
                let max_func = if multi { PCI_FUNCMAX } else { 0 };
                for function in 0..=max_func {
                    let f = PciDev::new(bus, slot, function);
                    if pci_vendor_id(f) == 0xFFFF {
                        continue;
                    }
                    pci_probe_function(f);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_address_layout() {
        let dev = PciDev::new(2, 7, 3);
        let addr = cfg_address(dev, 0x41);
        assert_eq!(addr, (1 << 31) | (2 << 16) | (7 << 11) | (3 << 8) | 0x40);
    }

    #[test]
    fn cfgenable_accepts_aligned_widths() {
        let dev = PciDev::new(0, 0, 0);
        assert_eq!(cfgenable_dataport(dev, 0x10, 4), CONF1_DATA_PORT);
        assert_eq!(cfgenable_dataport(dev, 0x12, 2), CONF1_DATA_PORT + 2);
        assert_eq!(cfgenable_dataport(dev, 0x13, 1), CONF1_DATA_PORT + 3);
    }

    #[test]
    fn cfgenable_rejects_bad_access() {
        let dev = PciDev::new(0, 0, 0);
        // Register beyond config space.
        assert_eq!(cfgenable_dataport(dev, 256, 4), 0);
        // Unsupported widths.
        assert_eq!(cfgenable_dataport(dev, 0x10, 0), 0);
        assert_eq!(cfgenable_dataport(dev, 0x10, 3), 0);
        assert_eq!(cfgenable_dataport(dev, 0x10, 5), 0);
        assert_eq!(cfgenable_dataport(dev, 0x10, 8), 0);
        // Misaligned register for the width.
        assert_eq!(cfgenable_dataport(dev, 0x11, 2), 0);
        assert_eq!(cfgenable_dataport(dev, 0x12, 4), 0);
    }

    #[test]
    fn bar_size_power_of_two() {
        // A 16 KiB memory BAR reads back 0xFFFFC000 after the all-ones
        // write (low type bits already masked off by the caller).
        assert_eq!(bar_size_from_mask(0xFFFF_C000), 16 * 1024);
        assert_eq!(bar_size_from_mask(0xFFFF_F000), 4096);
        assert!(bar_size_from_mask(0xFFFF_C000).is_power_of_two());
        assert_eq!(bar_size_from_mask(0), 0);
    }
}
