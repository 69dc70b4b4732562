//! PS/2 keyboard input
//!
//! Scancode set 1 decoding through `pc_keyboard`; decoded characters feed
//! the TTY line discipline. The IRQ1 handler reads the data port and
//! calls [`handle_scancode`].

use crate::error::KernelResult;

#[cfg(target_os = "none")]
mod decode {
    use lazy_static::lazy_static;
    use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
    use spin::Mutex;

    lazy_static! {
        static ref KEYBOARD: Mutex<Keyboard<layouts::Us104Key, ScancodeSet1>> =
            Mutex::new(Keyboard::new(
                ScancodeSet1::new(),
                layouts::Us104Key,
                HandleControl::Ignore
            ));
    }

    /// Interrupt-side decode path.
    pub fn handle_scancode(scancode: u8) {
        let mut keyboard = KEYBOARD.lock();
        if let Ok(Some(event)) = keyboard.add_byte(scancode) {
            if let Some(DecodedKey::Unicode(c)) = keyboard.process_keyevent(event) {
                crate::tty::handle_char(c);
            }
        }
    }
}

#[cfg(target_os = "none")]
pub use decode::handle_scancode;

/// Host stand-in so the IRQ wiring compiles everywhere.
#[cfg(not(target_os = "none"))]
pub fn handle_scancode(_scancode: u8) {}

/// Driver entry: the controller was programmed by firmware; decoding is
/// stateless beyond the layout machine.
pub fn init() -> KernelResult<()> {
    log::info!("keyboard: ps/2 scancode set 1, us layout");
    Ok(())
}
