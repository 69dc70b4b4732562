//! Programmable interval timer: the 100 Hz tick source.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::instructions::port::Port;

/// Tick frequency the kernel is calibrated for.
pub const TICK_HZ: u32 = 100;

const PIT_FREQUENCY: u32 = 1_193_182;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks since boot.
pub fn now_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Called from the IRQ0 handler on every timer interrupt.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::sched::scheduler_tick();
}

/// Program PIT channel 0 as a rate generator at [`TICK_HZ`].
pub fn init() {
    let divisor = (PIT_FREQUENCY / TICK_HZ) as u16;

    let mut cmd_port: Port<u8> = Port::new(0x43);
    let mut data_port: Port<u8> = Port::new(0x40);

    // SAFETY: PIT command/data ports; channel 0, lobyte/hibyte, mode 2.
    unsafe {
        cmd_port.write(0x36);
        data_port.write((divisor & 0xFF) as u8);
        data_port.write((divisor >> 8) as u8);
    }

    log::info!("pit: {} Hz tick source armed", TICK_HZ);
}
