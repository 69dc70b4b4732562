//! CPU-level helpers: interrupt gating and the idle loop.

use x86_64::instructions;

/// Run `f` with interrupts disabled, restoring the previous state after.
pub fn without_interrupts<T, F: FnOnce() -> T>(f: F) -> T {
    instructions::interrupts::without_interrupts(f)
}

/// Enable interrupts.
pub fn enable_interrupts() {
    instructions::interrupts::enable();
}

/// Wait for the next interrupt.
pub fn idle() {
    instructions::hlt();
}

/// Halt forever. Used by the panic path and the end of `_start`.
pub fn halt_loop() -> ! {
    loop {
        instructions::hlt();
    }
}
