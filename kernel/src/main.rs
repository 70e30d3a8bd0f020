//! Uniboot kernel — entry point.
//!
//! Booted by the Limine bootloader: long mode, HHDM page tables, and a
//! stack are already set up when kmain runs.
#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]

extern crate alloc;

use alloc::sync::Arc;

use limine::request::{HhdmRequest, MemoryMapRequest, MpRequest, RequestsEndMarker, RequestsStartMarker};
use limine::memory_map::EntryType;
use limine::BaseRevision;

use uniboot_kernel::arch::x86_64::{self, serial};
use uniboot_kernel::drivers::pci;
use uniboot_kernel::drivers::virtio::net as virtio_net;
use uniboot_kernel::net::stack as netstack;
use uniboot_kernel::serial_println;
use uniboot_kernel::unix::aio::{io_getevents, io_setup, io_submit, IoEvent, Iocb, IOCB_CMD_PREAD};
use uniboot_kernel::unix::fdesc::RamFile;
use uniboot_kernel::unix::process::{self, Task};
use uniboot_kernel::{logger, mem, time};

use core::panic::PanicInfo;

// ---- Limine requests ----
// Must be #[used] and in .requests so Limine discovers them.

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests"]
static MEMMAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests"]
static MP_REQUEST: MpRequest = MpRequest::new();

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

#[no_mangle]
pub extern "C" fn kmain() -> ! {
    serial::SERIAL.lock().init();
    serial_println!("uniboot booting...");

    assert!(BASE_REVISION.is_supported(), "Limine base revision not supported");

    let hhdm = HHDM_REQUEST.get_response().expect("Limine HHDM response missing");
    mem::set_hhdm_offset(hhdm.offset());

    unsafe {
        x86_64::gdt::init();
        x86_64::idt::mask_legacy_pic();
        x86_64::idt::init();
    }
    serial_println!("[cpu] GDT/IDT loaded, legacy PIC masked");

    let memmap = MEMMAP_REQUEST.get_response().expect("Limine memory map missing");
    let mut usable_regions = [(0u64, 0u64); 64];
    let mut region_count = 0usize;
    for entry in memmap.entries() {
        if entry.entry_type == EntryType::USABLE && region_count < usable_regions.len() {
            usable_regions[region_count] = (entry.base, entry.length);
            region_count += 1;
        }
    }
    mem::phys::PHYS_ALLOCATOR.init(&usable_regions[..region_count]);
    serial_println!("[mem] {} pages free", mem::phys::PHYS_ALLOCATOR.free_count());

    x86_64::timer::calibrate_tsc();
    logger::init();

    if let Some(mp) = MP_REQUEST.get_response() {
        x86_64::set_cpu_count(mp.cpus().len());
    }
    log::info!("{} cpu(s) online", x86_64::cpu_count());

    // PCI window for BARs the firmware left unconfigured (below 4 GiB).
    pci::pci_set_iomem_range(0xE000_0000, 0xF000_0000);

    virtio_net::init_virtio_network();
    pci::pci_discover();

    if netstack::init() {
        log::info!("network stack up");
    } else {
        log::warn!("no network device");
    }

    aio_selftest();

    x86_64::sti();
    serial_println!("uniboot boot complete.");

    loop {
        netstack::poll();
        time::service_timers();
        if let Some(vn) = virtio_net::VIRTIO_NET.lock().as_ref() {
            vn.service_tx();
        }
        x86_64::hlt();
    }
}

/// Exercise the AIO ring end to end against a RAM-backed file.
fn aio_selftest() {
    let p = process::current();
    let task = Task::new();

    let contents: alloc::vec::Vec<u8> = (0u8..16).collect();
    let fd = p.install_fd(Arc::new(RamFile::with_contents(&contents)));

    let mut ctx: u64 = 0;
    let rv = io_setup(&p, 4, &mut ctx as *mut u64 as u64);
    if rv != 0 {
        log::error!("aio: io_setup failed: {}", rv);
        return;
    }

    let mut buf = [0u8; 16];
    let iocb = Iocb {
        aio_data: 0xC0FFEE,
        aio_lio_opcode: IOCB_CMD_PREAD,
        aio_fildes: fd,
        aio_buf: buf.as_mut_ptr() as u64,
        aio_nbytes: 16,
        ..Default::default()
    };
    let iocb_ptr = &iocb as *const Iocb as u64;
    let submitted = io_submit(&p, ctx, 1, &iocb_ptr as *const u64 as u64);

    let mut evs = [IoEvent::default(); 1];
    let harvested = io_getevents(
        &p,
        &task,
        ctx,
        1,
        1,
        evs.as_mut_ptr() as u64,
        Some(0),
        alloc::boxed::Box::new(|_| {}),
    );
    log::info!(
        "aio selftest: submitted {}, harvested {:?}, res {}",
        submitted,
        harvested,
        evs[0].res
    );
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("!!! KERNEL PANIC !!!");
    serial_println!("{}", info);
    loop {
        x86_64::hlt();
    }
}
