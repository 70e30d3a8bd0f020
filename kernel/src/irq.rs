/// Interrupt router: vector allocation, handler registration, IOAPIC
/// line routing, and MSI message formatting.
///
/// Devices either take a vector directly (MSI) or hand in a GSI that is
/// routed through the IOAPIC. Handlers run in interrupt context and must
/// not block or allocate.
use alloc::boxed::Box;
use spin::Mutex;

use crate::arch::x86_64::idt::{DEVICE_VECTOR_START, DEVICE_VECTOR_END};
use crate::mem::PhysAddr;

pub type IrqHandler = Box<dyn Fn() + Send + Sync>;

struct Registration {
    handler: IrqHandler,
    name: &'static str,
}

const VECTORS: usize = 256;

struct RouterState {
    handlers: [Option<Registration>; VECTORS],
    /// Allocation bitmap for the device vector range.
    allocated: u64,
}

const NO_REG: Option<Registration> = None;

static ROUTER: Mutex<RouterState> = Mutex::new(RouterState {
    handlers: [NO_REG; VECTORS],
    allocated: 0,
});

/// Reserve a free device vector.
pub fn allocate_interrupt() -> Option<u8> {
    let mut state = ROUTER.lock();
    let span = (DEVICE_VECTOR_END - DEVICE_VECTOR_START + 1) as u64;
    for bit in 0..span {
        if state.allocated & (1 << bit) == 0 {
            state.allocated |= 1 << bit;
            return Some(DEVICE_VECTOR_START + bit as u8);
        }
    }
    None
}

/// Return a vector to the allocator. The handler must already be
/// unregistered.
pub fn deallocate_interrupt(vector: u8) {
    debug_assert!((DEVICE_VECTOR_START..=DEVICE_VECTOR_END).contains(&vector));
    let mut state = ROUTER.lock();
    state.allocated &= !(1 << (vector - DEVICE_VECTOR_START));
}

/// Attach a handler to a vector.
pub fn register_interrupt(vector: u8, handler: IrqHandler, name: &'static str) {
    let mut state = ROUTER.lock();
    if state.handlers[vector as usize].is_some() {
        log::warn!("irq: vector {} already registered, replacing", vector);
    }
    state.handlers[vector as usize] = Some(Registration { handler, name });
}

pub fn unregister_interrupt(vector: u8) {
    ROUTER.lock().handlers[vector as usize] = None;
}

/// Entry from the IDT device stubs. Runs the registered handler and
/// acknowledges the local APIC.
pub fn dispatch(vector: usize) {
    {
        let state = ROUTER.lock();
        if let Some(reg) = &state.handlers[vector] {
            (reg.handler)();
        } else {
            log::warn!("irq: spurious vector {}", vector);
        }
    }
    lapic_eoi();
}

// ---- Local APIC ----

const LAPIC_BASE: u64 = 0xFEE0_0000;
const LAPIC_EOI: u64 = 0xB0;

fn lapic_eoi() {
    let reg = PhysAddr::new(LAPIC_BASE + LAPIC_EOI).as_ptr::<u32>();
    unsafe { core::ptr::write_volatile(reg, 0) };
}

// ---- IOAPIC ----

const IOAPIC_BASE: u64 = 0xFEC0_0000;
const IOAPIC_REGSEL: u64 = 0x00;
const IOAPIC_REGWIN: u64 = 0x10;
const IOAPIC_REDIR_BASE: u32 = 0x10;

fn ioapic_write(reg: u32, val: u32) {
    unsafe {
        let sel = PhysAddr::new(IOAPIC_BASE + IOAPIC_REGSEL).as_ptr::<u32>();
        let win = PhysAddr::new(IOAPIC_BASE + IOAPIC_REGWIN).as_ptr::<u32>();
        core::ptr::write_volatile(sel, reg);
        core::ptr::write_volatile(win, val);
    }
}

/// Route a Global System Interrupt through the IOAPIC to a fresh vector
/// and register `handler` on it. Returns the vector, or None when the
/// vector space is exhausted.
pub fn ioapic_register_int(gsi: u32, handler: IrqHandler, name: &'static str) -> Option<u8> {
    let vector = allocate_interrupt()?;
    register_interrupt(vector, handler, name);
    // Redirection entry: fixed delivery, physical destination, active
    // high, edge triggered, unmasked, destination APIC 0.
    let lo = vector as u32;
    let hi = 0u32;
    ioapic_write(IOAPIC_REDIR_BASE + gsi * 2 + 1, hi);
    ioapic_write(IOAPIC_REDIR_BASE + gsi * 2, lo);
    log::debug!("irq: gsi {} -> vector {} ({})", gsi, vector, name);
    Some(vector)
}

// ---- MSI ----

/// Format the MSI (address, data) pair that raises `vector` on `cpu`,
/// per x86 conventions: address 0xFEE0_0000 with the destination APIC id
/// in bits 12..19; data is the vector with fixed delivery, edge trigger.
pub fn msi_format(vector: u8, cpu: usize) -> (u32, u32) {
    let address = 0xFEE0_0000u32 | (crate::arch::x86_64::apic_id(cpu) as u32) << 12;
    let data = vector as u32;
    (address, data)
}

#[allow(dead_code)]
pub fn handler_name(vector: u8) -> Option<&'static str> {
    ROUTER.lock().handlers[vector as usize].as_ref().map(|r| r.name)
}
