//! Bare-metal test support
//!
//! Serial reporting plus QEMU exit codes through the `isa-debug-exit`
//! device. Integration tests are `harness = false` binaries that drive
//! the kernel directly and report through [`exit_qemu`].

use crate::error::KernelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Exit QEMU with the given code (requires `isa-debug-exit` at 0xF4).
pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    use x86_64::instructions::port::Port;

    // SAFETY: writing the debug-exit port terminates the VM.
    unsafe {
        let mut port = Port::new(0xF4);
        port.write(exit_code as u32);
    }
    crate::arch::halt_loop();
}

/// Trait every testable function implements.
pub trait Testable {
    fn run(&self) -> Result<(), KernelError>;
}

impl<T> Testable for T
where
    T: Fn() -> Result<(), KernelError>,
{
    fn run(&self) -> Result<(), KernelError> {
        serial_print!("{}...\t", core::any::type_name::<T>());
        match self() {
            Ok(()) => {
                serial_println!("[ok]");
                Ok(())
            }
            Err(e) => {
                serial_println!("[failed]: {}", e);
                Err(e)
            }
        }
    }
}

/// Runner for `#[test_case]` collections in bare-metal test binaries.
pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    serial_println!("Running {} tests", tests.len());
    let mut failed = 0;
    for test in tests {
        if test.run().is_err() {
            failed += 1;
        }
    }
    if failed == 0 {
        exit_qemu(QemuExitCode::Success)
    } else {
        exit_qemu(QemuExitCode::Failed)
    }
}

/// Panic handler body for test binaries.
pub fn test_panic_handler(info: &core::panic::PanicInfo) -> ! {
    serial_println!("[failed]");
    serial_println!("Error: {}", info);
    exit_qemu(QemuExitCode::Failed)
}
