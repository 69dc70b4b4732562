//! Context switch primitive
//!
//! The saved context of a task is a frame on its own stack: the six
//! callee-saved registers of the SysV ABI plus the resumption address.
//! `context_switch` pushes that frame, parks the outgoing stack pointer in
//! the caller-supplied slot, adopts the incoming stack pointer, pops the
//! incoming frame and returns into the incoming task. Being an extern
//! assembly routine, the call is opaque to the optimizer on both sides.
//!
//! A freshly created task's stack is pre-laid to look like the result of a
//! prior switch: zeroed callee-saved registers (r12 holding the entry
//! function) and `ember_task_entry` as the resumption address, so the
//! first switch "returns" into the entry trampoline. The trampoline
//! re-enables interrupts, runs the entry function, and traps its return
//! into `ember_task_exit`.

#[cfg(target_os = "none")]
core::arch::global_asm!(
    ".global ember_context_switch",
    "ember_context_switch:",
    "    push rbp",
    "    push rbx",
    "    push r12",
    "    push r13",
    "    push r14",
    "    push r15",
    "    mov [rdi], rsp",
    "    mov rsp, rsi",
    "    pop r15",
    "    pop r14",
    "    pop r13",
    "    pop r12",
    "    pop rbx",
    "    pop rbp",
    "    ret",
    ".global ember_task_entry",
    "ember_task_entry:",
    "    sti",
    "    call r12",
    "    jmp ember_task_exit",
);

#[cfg(target_os = "none")]
extern "C" {
    /// Switch from the current stack to `next_sp`, storing the outgoing
    /// stack pointer through `prev_sp`.
    ///
    /// # Safety
    ///
    /// `prev_sp` must point at the outgoing task's saved-context slot and
    /// `next_sp` must be a stack pointer previously produced by this
    /// routine (or pre-laid by `Task::new`). Interrupts must be disabled.
    pub fn ember_context_switch(prev_sp: *mut u64, next_sp: u64);

    fn ember_task_entry();
}

/// See [`ember_context_switch`].
///
/// # Safety
///
/// Same contract as the assembly routine.
#[cfg(target_os = "none")]
pub unsafe fn context_switch(prev_sp: *mut u64, next_sp: u64) {
    // SAFETY: forwarded contract; the caller upholds it.
    unsafe { ember_context_switch(prev_sp, next_sp) }
}

/// Address of the first-execution trampoline, used when pre-laying a new
/// task's initial stack frame.
#[cfg(target_os = "none")]
pub fn task_entry_trampoline() -> u64 {
    ember_task_entry as usize as u64
}

/// Host stand-in: unit tests never run the pre-laid frame, they only check
/// its layout against this address.
#[cfg(not(target_os = "none"))]
pub fn task_entry_trampoline() -> u64 {
    0xDEAD_BEEF_0000
}

/// Number of callee-saved registers in a context frame.
pub const SAVED_REGISTERS: usize = 6;

/// Index of the slot holding the entry function in a pre-laid frame
/// (r15, r14, r13, r12, rbx, rbp from the bottom up; r12 carries entry).
pub const ENTRY_REGISTER_SLOT: usize = 3;
