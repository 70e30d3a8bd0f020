/// TSC calibration and monotonic clock.
///
/// PIT channel 2 (speaker gate) measures the TSC frequency without
/// interrupts:
///   1. Program PIT channel 2 for a ~10ms one-shot
///   2. Read TSC before and after the countdown
///   3. frequency = delta_tsc / elapsed
///
/// After calibration `monotonic_ns()` converts TSC deltas to nanoseconds.
use core::sync::atomic::{AtomicU64, Ordering};

use super::{in8, out8, rdtsc};

/// TSC ticks per microsecond, set during calibration (2 GHz fallback).
static TSC_PER_US: AtomicU64 = AtomicU64::new(2_000);

/// TSC value at calibration time.
static BOOT_TSC: AtomicU64 = AtomicU64::new(0);

const PIT_CH2_DATA: u16 = 0x42;
const PIT_CMD: u16 = 0x43;
const PIT_GATE: u16 = 0x61; // NMI status/control register (speaker gate)

/// PIT oscillator frequency: 1,193,182 Hz (standard PC).
const PIT_FREQ: u64 = 1_193_182;

/// Calibrate the TSC against PIT channel 2 in one-shot mode.
///
/// # Safety
/// Must be called during boot, with interrupts disabled.
pub fn calibrate_tsc() {
    // ~10ms window: 1_193_182 * 0.010
    let pit_count: u16 = 11_932;
    let expected_us: u64 = (pit_count as u64 * 1_000_000) / PIT_FREQ;

    // Gate low, speaker off, gate control enabled.
    let gate = in8(PIT_GATE);
    out8(PIT_GATE, (gate & !0x02) | 0x01);

    // Channel 2, mode 0 (one-shot), lobyte/hibyte, binary.
    out8(PIT_CMD, 0xB0);
    out8(PIT_CH2_DATA, (pit_count & 0xFF) as u8);
    out8(PIT_CH2_DATA, ((pit_count >> 8) & 0xFF) as u8);

    // Pulse the gate to start the countdown.
    let gate = in8(PIT_GATE);
    out8(PIT_GATE, gate & !0x01);
    out8(PIT_GATE, gate | 0x01);

    let tsc_start = rdtsc();
    // Wait for the output bit to go high.
    while in8(PIT_GATE) & 0x20 == 0 {
        core::hint::spin_loop();
    }
    let tsc_end = rdtsc();

    let delta = tsc_end - tsc_start;
    TSC_PER_US.store((delta / expected_us).max(1), Ordering::Release);
    BOOT_TSC.store(tsc_end, Ordering::Release);
}

/// Nanoseconds since calibration.
pub fn monotonic_ns() -> u64 {
    let boot = BOOT_TSC.load(Ordering::Acquire);
    let per_us = TSC_PER_US.load(Ordering::Acquire);
    let ticks = rdtsc().saturating_sub(boot);
    ticks * 1_000 / per_us
}

/// Busy-wait for `us` microseconds.
pub fn delay_us(us: u64) {
    let per_us = TSC_PER_US.load(Ordering::Acquire);
    let target = us * per_us;
    let start = rdtsc();
    while rdtsc() - start < target {
        core::hint::spin_loop();
    }
}
