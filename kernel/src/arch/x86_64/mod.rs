//! x86_64 architecture support
//!
//! Early boot, the GDT, and exception stubs are owned by the bootloader
//! and the interrupt subsystem; this module carries only what the core
//! kernel contracts need: the serial console, interrupt gating, the IDT
//! and PIC wiring for the PIT and keyboard lines, the 100 Hz tick source,
//! and the context-switch primitive.

pub mod context;
#[cfg(target_os = "none")]
pub mod cpu;
#[cfg(target_os = "none")]
pub mod idt;
#[cfg(target_os = "none")]
pub mod pit;
#[cfg(target_os = "none")]
pub mod serial;

/// Initialize the interrupt plumbing: IDT and PIC remap. The PIT itself
/// is armed by its driver during registry bring-up, and interrupts stay
/// disabled until the scheduler is ready to take ticks.
#[cfg(target_os = "none")]
pub fn init() {
    idt::init();
}
