/// Interrupt Descriptor Table with exception handlers and a block of
/// dynamically allocatable device vectors.
///
/// Vectors 0-31 are CPU exceptions. Vectors in `DEVICE_VECTOR_START..=
/// DEVICE_VECTOR_END` are handed out by the interrupt router (`irq`) for
/// MSI and IOAPIC-routed lines; their stubs funnel into `irq::dispatch`.
use super::gdt;

/// First and last vector available to devices.
pub const DEVICE_VECTOR_START: u8 = 48;
pub const DEVICE_VECTOR_END: u8 = 111;

/// IDT entry (16 bytes on x86_64).
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    _reserved: u32,
}

impl IdtEntry {
    pub const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0, // not present
            offset_mid: 0,
            offset_high: 0,
            _reserved: 0,
        }
    }

    /// Present interrupt gate, DPL=0, optional IST stack.
    pub fn interrupt_gate_ist(handler: u64, ist_index: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector: gdt::KERNEL_CS,
            ist: ist_index & 0x7,
            type_attr: 0x8E, // present | interrupt gate | DPL=0
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            _reserved: 0,
        }
    }

    pub fn interrupt_gate(handler: u64) -> Self {
        Self::interrupt_gate_ist(handler, 0)
    }
}

/// The IDT — 256 entries.
#[repr(C, align(16))]
pub struct Idt {
    pub entries: [IdtEntry; 256],
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}

impl Idt {
    pub const fn new() -> Self {
        Self { entries: [IdtEntry::missing(); 256] }
    }

    /// Load this IDT into the CPU via LIDT.
    pub fn load(&'static self) {
        let ptr = IdtPointer {
            limit: (core::mem::size_of::<Self>() - 1) as u16,
            base: self as *const _ as u64,
        };
        unsafe {
            core::arch::asm!("lidt [{}]", in(reg) &ptr, options(nostack));
        }
    }
}

static IDT: spin::Once<Idt> = spin::Once::new();

/// Interrupt stack frame pushed by the CPU before our handler runs.
#[repr(C)]
pub struct InterruptFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Generate `extern "x86-interrupt"` stubs for a list of device vectors
/// and install them. Each stub hands its vector number to the router.
macro_rules! device_vector_stubs {
    ($idt:expr, $($v:literal),+ $(,)?) => {
        $(
            {
                extern "x86-interrupt" fn stub(_frame: InterruptFrame) {
                    crate::irq::dispatch($v);
                }
                $idt.entries[$v] = IdtEntry::interrupt_gate(stub as *const () as u64);
            }
        )+
    };
}

/// Initialize the IDT with exception handlers and device vector stubs,
/// then load it.
///
/// # Safety
/// Must be called after GDT init. Called once during boot.
pub unsafe fn init() {
    IDT.call_once(|| {
        let mut idt = Idt::new();

        idt.entries[0] = IdtEntry::interrupt_gate(isr_de as *const () as u64);
        idt.entries[3] = IdtEntry::interrupt_gate(isr_bp as *const () as u64);
        idt.entries[6] = IdtEntry::interrupt_gate(isr_ud as *const () as u64);
        // Double fault runs on IST1 so a kernel stack overflow cannot
        // triple-fault.
        idt.entries[8] = IdtEntry::interrupt_gate_ist(isr_df as *const () as u64, 1);
        idt.entries[13] = IdtEntry::interrupt_gate(isr_gp as *const () as u64);
        idt.entries[14] = IdtEntry::interrupt_gate(isr_pf as *const () as u64);

        device_vector_stubs!(
            idt, 48, 49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 63, 64, 65,
            66, 67, 68, 69, 70, 71, 72, 73, 74, 75, 76, 77, 78, 79, 80, 81, 82, 83, 84,
            85, 86, 87, 88, 89, 90, 91, 92, 93, 94, 95, 96, 97, 98, 99, 100, 101, 102,
            103, 104, 105, 106, 107, 108, 109, 110, 111
        );

        idt
    });

    IDT.get().unwrap().load();
}

// ---- Exception handlers ----

extern "x86-interrupt" fn isr_de(frame: InterruptFrame) {
    exception_handler("Division by zero (#DE)", &frame, None);
}

extern "x86-interrupt" fn isr_bp(frame: InterruptFrame) {
    // Breakpoint — log and continue.
    crate::serial_println!("[int] breakpoint at {:#x}", frame.rip);
}

extern "x86-interrupt" fn isr_ud(frame: InterruptFrame) {
    exception_handler("Invalid opcode (#UD)", &frame, None);
}

extern "x86-interrupt" fn isr_df(frame: InterruptFrame, error_code: u64) {
    crate::serial_println!("!!! DOUBLE FAULT (on IST1 stack) !!!");
    crate::serial_println!("  Error code: {:#x}", error_code);
    crate::serial_println!("  RIP: {:#x}  RSP: {:#x}", frame.rip, frame.rsp);
    loop {
        super::hlt();
    }
}

extern "x86-interrupt" fn isr_gp(frame: InterruptFrame, error_code: u64) {
    exception_handler("General protection fault (#GP)", &frame, Some(error_code));
}

extern "x86-interrupt" fn isr_pf(frame: InterruptFrame, error_code: u64) {
    let cr2: u64;
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nostack, nomem));
    }
    crate::serial_println!("!!! PAGE FAULT !!!");
    crate::serial_println!("  Address: {:#x}  Error: {:#x}", cr2, error_code);
    crate::serial_println!("  RIP: {:#x}  RSP: {:#x}", frame.rip, frame.rsp);
    loop {
        super::hlt();
    }
}

fn exception_handler(name: &str, frame: &InterruptFrame, error_code: Option<u64>) {
    crate::serial_println!("!!! CPU EXCEPTION: {} !!!", name);
    if let Some(code) = error_code {
        crate::serial_println!("  Error code: {:#x}", code);
    }
    crate::serial_println!("  RIP: {:#x}  CS: {:#x}  RFLAGS: {:#x}", frame.rip, frame.cs, frame.rflags);
    loop {
        super::hlt();
    }
}

// ---- Legacy 8259 PIC ----

/// Remap the legacy PICs away from the exception range and mask them.
/// All device interrupts go through the IOAPIC or MSI.
///
/// # Safety
/// Must be called during early boot.
pub unsafe fn mask_legacy_pic() {
    const PIC1_CMD: u16 = 0x20;
    const PIC1_DATA: u16 = 0x21;
    const PIC2_CMD: u16 = 0xA0;
    const PIC2_DATA: u16 = 0xA1;

    // ICW1: init + ICW4 needed; ICW2: offsets 32/40; ICW3: cascade; ICW4: 8086.
    super::out8(PIC1_CMD, 0x11);
    super::out8(PIC2_CMD, 0x11);
    super::out8(PIC1_DATA, 32);
    super::out8(PIC2_DATA, 40);
    super::out8(PIC1_DATA, 4);
    super::out8(PIC2_DATA, 2);
    super::out8(PIC1_DATA, 0x01);
    super::out8(PIC2_DATA, 0x01);
    // Mask everything.
    super::out8(PIC1_DATA, 0xFF);
    super::out8(PIC2_DATA, 0xFF);
}
