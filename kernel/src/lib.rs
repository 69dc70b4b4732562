//! EmberOS kernel library
//!
//! Everything the kernel is made of, exported so the bare-metal binary,
//! the QEMU integration tests, and the host unit tests build against one
//! crate. Host builds (`cargo test` on the development machine) link std
//! for the test harness; the subsystems themselves stay `no_std`.

#![no_std]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target: std for the standard #[test] harness and its allocator.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod block;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod logger;
pub mod mm;
pub mod sched;
pub mod tty;

#[cfg(target_os = "none")]
pub mod test_framework;

pub use error::{KernelError, KernelResult};

#[cfg(target_os = "none")]
pub use test_framework::{exit_qemu, test_panic_handler, QemuExitCode, Testable};

/// Heap allocation failure is unrecoverable in the kernel proper.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
