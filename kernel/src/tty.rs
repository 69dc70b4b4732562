//! TTY line discipline
//!
//! Line-buffered input with a single blocked reader. The keyboard
//! interrupt pushes decoded characters in; a newline completes the line
//! and unblocks the reader task, which picks the line up with
//! `read_line`. Characters are echoed to the console as they arrive.
//!
//! The buffer is single-producer (the interrupt) single-consumer (the
//! reader); the task side touches it only inside interrupt-disabled
//! sections.

use spin::Mutex;

use crate::arch;
use crate::error::KernelResult;

/// Maximum line length; further input before the newline is dropped.
pub const LINE_CAPACITY: usize = 256;

/// The buffering state machine, free of any scheduler coupling.
pub struct LineDiscipline {
    line: [u8; LINE_CAPACITY],
    len: usize,
    pending: Option<([u8; LINE_CAPACITY], usize)>,
}

impl LineDiscipline {
    pub const fn new() -> Self {
        Self {
            line: [0; LINE_CAPACITY],
            len: 0,
            pending: None,
        }
    }

    /// Feed one decoded character. Returns `true` when a full line became
    /// available (the caller wakes the reader).
    pub fn push_char(&mut self, c: char) -> bool {
        match c {
            '\n' | '\r' => {
                // Only one completed line is held; a second newline before
                // the reader ran overwrites it.
                self.pending = Some((self.line, self.len));
                self.len = 0;
                true
            }
            '\u{8}' | '\u{7f}' => {
                if self.len > 0 {
                    self.len -= 1;
                }
                false
            }
            _ => {
                if self.len < LINE_CAPACITY && c.is_ascii() {
                    self.line[self.len] = c as u8;
                    self.len += 1;
                }
                false
            }
        }
    }

    /// Take the completed line, if any.
    pub fn take_line(&mut self) -> Option<([u8; LINE_CAPACITY], usize)> {
        self.pending.take()
    }
}

impl Default for LineDiscipline {
    fn default() -> Self {
        Self::new()
    }
}

struct Tty {
    discipline: LineDiscipline,
    /// Pid of the single blocked reader, if one is waiting.
    reader: Option<u64>,
}

static TTY: Mutex<Tty> = Mutex::new(Tty {
    discipline: LineDiscipline::new(),
    reader: None,
});

/// Driver entry.
pub fn init() -> KernelResult<()> {
    log::info!("tty: line discipline ready ({} byte lines)", LINE_CAPACITY);
    Ok(())
}

/// Interrupt-side input path: buffer the character, echo it, and wake the
/// reader on a completed line.
pub fn handle_char(c: char) {
    let woken = {
        let mut tty = TTY.lock();
        match c {
            '\u{8}' | '\u{7f}' => print!("\u{8} \u{8}"),
            _ => print!("{}", c),
        }
        if tty.discipline.push_char(c) {
            tty.reader.take()
        } else {
            None
        }
    };
    if let Some(pid) = woken {
        let _ = crate::sched::task_unblock(pid);
    }
}

/// Blocking read of one line into `buf`. Returns the number of bytes
/// copied (without the newline). Only one task may wait at a time; a
/// second concurrent reader is refused.
///
/// Registration and blocking happen inside one interrupt-disabled region:
/// a newline arriving between the two would otherwise unblock a task that
/// has not blocked yet and strand it forever.
pub fn read_line(buf: &mut [u8]) -> KernelResult<usize> {
    loop {
        let mut taken: Option<([u8; LINE_CAPACITY], usize)> = None;
        arch::without_interrupts(|| -> KernelResult<()> {
            {
                let mut tty = TTY.lock();
                if let Some(line) = tty.discipline.take_line() {
                    taken = Some(line);
                    return Ok(());
                }
                if tty.reader.is_some() {
                    return Err(crate::error::KernelError::Permission {
                        operation: "second concurrent tty reader",
                    });
                }
                tty.reader = crate::sched::current_pid();
            }
            // The TTY lock is dropped (the interrupt path takes it) but
            // interrupts stay off until the switch away is complete.
            crate::sched::task_block();
            Ok(())
        })?;

        if let Some((line, len)) = taken {
            let n = len.min(buf.len());
            buf[..n].copy_from_slice(&line[..n]);
            return Ok(n);
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn feed(d: &mut LineDiscipline, s: &str) -> usize {
        s.chars().filter(|&c| d.push_char(c)).count()
    }

    #[test]
    fn newline_completes_a_line() {
        let mut d = LineDiscipline::new();
        assert_eq!(feed(&mut d, "hello"), 0);
        assert!(d.take_line().is_none());

        assert_eq!(feed(&mut d, "\n"), 1);
        let (line, len) = d.take_line().unwrap();
        assert_eq!(&line[..len], b"hello");
        // Consumed once.
        assert!(d.take_line().is_none());
    }

    #[test]
    fn carriage_return_acts_as_newline() {
        let mut d = LineDiscipline::new();
        feed(&mut d, "ok\r");
        let (line, len) = d.take_line().unwrap();
        assert_eq!(&line[..len], b"ok");
    }

    #[test]
    fn backspace_erases_and_underflow_is_harmless() {
        let mut d = LineDiscipline::new();
        feed(&mut d, "\u{8}\u{8}abc\u{8}d\n");
        let (line, len) = d.take_line().unwrap();
        assert_eq!(&line[..len], b"abd");
    }

    #[test]
    fn overlong_input_is_truncated_at_capacity() {
        let mut d = LineDiscipline::new();
        for _ in 0..LINE_CAPACITY + 50 {
            d.push_char('x');
        }
        d.push_char('\n');
        let (_, len) = d.take_line().unwrap();
        assert_eq!(len, LINE_CAPACITY);
    }
}
