/// Global Descriptor Table (GDT) with Task State Segment (TSS).
///
/// Long mode needs null, kernel CS, and kernel DS descriptors. The TSS
/// provides IST1 as a dedicated stack for the double-fault handler so a
/// kernel stack overflow cannot triple-fault.
use core::mem::size_of;
use spin::Once;
use static_assertions::const_assert_eq;

pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
const TSS_SELECTOR: u16 = 0x18;

/// GDT entry (8 bytes).
#[repr(transparent)]
#[derive(Clone, Copy)]
struct GdtEntry(u64);

impl GdtEntry {
    const fn null() -> Self {
        Self(0)
    }

    /// Kernel code segment: present, DPL=0, exec/read, L=1 (long mode).
    const fn kernel_code() -> Self {
        Self(0x00_20_9A_00_0000_0000)
    }

    /// Kernel data segment: present, DPL=0, read/write.
    const fn kernel_data() -> Self {
        Self(0x00_00_92_00_0000_0000)
    }
}

/// Long-mode Task State Segment. Only the IST slots are used.
#[repr(C, packed)]
struct Tss {
    _reserved0: u32,
    rsp: [u64; 3],
    _reserved1: u64,
    ist: [u64; 7],
    _reserved2: u64,
    _reserved3: u16,
    iopb: u16,
}

const_assert_eq!(size_of::<Tss>(), 104);

/// GDT layout: null, code, data, TSS (two slots — system descriptors are
/// 16 bytes in long mode).
#[repr(C, align(16))]
struct Gdt {
    entries: [GdtEntry; 6],
}

#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u64,
}

const IST1_STACK_SIZE: usize = 16 * 1024;

struct GdtState {
    gdt: Gdt,
    tss: Tss,
    ist1_stack: [u8; IST1_STACK_SIZE],
}

static GDT: Once<GdtState> = Once::new();

/// Build and load the GDT and TSS.
///
/// # Safety
/// Must be called once during early boot, before the IDT is loaded.
pub unsafe fn init() {
    let state = GDT.call_once(|| {
        let mut state = GdtState {
            gdt: Gdt { entries: [GdtEntry::null(); 6] },
            tss: Tss {
                _reserved0: 0,
                rsp: [0; 3],
                _reserved1: 0,
                ist: [0; 7],
                _reserved2: 0,
                _reserved3: 0,
                iopb: size_of::<Tss>() as u16,
            },
            ist1_stack: [0; IST1_STACK_SIZE],
        };
        let stack_top = state.ist1_stack.as_ptr() as u64 + IST1_STACK_SIZE as u64;
        state.tss.ist[0] = stack_top & !0xF;
        state
    });

    // The TSS descriptor needs the final address of the TSS, which is only
    // known after call_once placed the state; patch it in now. The Once
    // guarantees a single writer here.
    let tss_base = &state.tss as *const Tss as u64;
    let tss_limit = (size_of::<Tss>() - 1) as u64;
    let low = tss_limit
        | (tss_base & 0xFFFFFF) << 16
        | 0x89 << 40                    // present | type=available 64-bit TSS
        | (tss_base >> 24 & 0xFF) << 56;
    let high = tss_base >> 32;
    let entries = &state.gdt.entries as *const _ as *mut GdtEntry;
    entries.add(1).write(GdtEntry::kernel_code());
    entries.add(2).write(GdtEntry::kernel_data());
    entries.add(3).write(GdtEntry(low));
    entries.add(4).write(GdtEntry(high));

    let ptr = GdtPointer {
        limit: (size_of::<Gdt>() - 1) as u16,
        base: &state.gdt as *const Gdt as u64,
    };
    core::arch::asm!(
        "lgdt [{gdtr}]",
        // Reload CS via far return, then the data selectors.
        "push {cs}",
        "lea {tmp}, [rip + 2f]",
        "push {tmp}",
        "retfq",
        "2:",
        "mov ds, {ds:x}",
        "mov es, {ds:x}",
        "mov ss, {ds:x}",
        "ltr {tss:x}",
        gdtr = in(reg) &ptr,
        cs = in(reg) KERNEL_CS as u64,
        ds = in(reg) KERNEL_DS,
        tss = in(reg) TSS_SELECTOR,
        tmp = out(reg) _,
    );
}
