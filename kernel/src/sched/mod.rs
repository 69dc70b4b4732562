//! Preemptive round-robin scheduling
//!
//! Public surface over the task table ([`task`]), the FIFO ready queue
//! ([`queue`]), and the scheduler core ([`scheduler`]). All state
//! transitions run with interrupts disabled; the context switch itself is
//! performed after the scheduler lock is dropped, so the lock is never
//! held across a switch.

pub mod queue;
pub mod scheduler;
pub mod task;

use core::ptr::NonNull;

use spin::Mutex;

use crate::arch;
use crate::error::{KernelError, KernelResult};
use scheduler::{Scheduler, SwitchDecision};
use task::{Task, TaskEntry, TaskState};

pub use task::{QUANTUM_TICKS, MAX_TASKS, STACK_SIZE};

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Initialize the task table.
pub fn task_init() {
    task::init();
}

/// Create the idle task and make it the running bootstrap context. The
/// idle task adopts the boot thread of control at the first switch away.
pub fn scheduler_init() -> KernelResult<()> {
    let pid = task::create("idle", idle_entry)?;
    let idle = task::get(pid).expect("idle task just created");
    arch::without_interrupts(|| SCHEDULER.lock().init(idle));
    log::info!("sched: round-robin scheduler ready, quantum {} ticks", QUANTUM_TICKS);
    Ok(())
}

extern "C" fn idle_entry() {
    loop {
        #[cfg(target_os = "none")]
        crate::arch::idle();
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}

/// Create a task (not yet scheduled). Returns its pid.
pub fn task_create(name: &str, entry: TaskEntry) -> KernelResult<u64> {
    task::create(name, entry)
}

/// Create a task and put it straight into rotation.
pub fn spawn(name: &str, entry: TaskEntry) -> KernelResult<u64> {
    let pid = task_create(name, entry)?;
    add_task(pid)?;
    Ok(pid)
}

/// Destroy a task that never ran or has terminated. Idempotent.
pub fn task_destroy(pid: u64) -> KernelResult<()> {
    task::destroy(pid)
}

/// Enqueue an existing task at the tail of the ready queue.
pub fn add_task(pid: u64) -> KernelResult<()> {
    let t = task::get(pid).ok_or(KernelError::NotFound { what: "task" })?;
    arch::without_interrupts(|| SCHEDULER.lock().enqueue(t));
    Ok(())
}

/// Pull a task out of the rotation.
pub fn remove_task(pid: u64) -> bool {
    match task::get(pid) {
        Some(t) => remove_task_ptr(t),
        None => false,
    }
}

pub(crate) fn remove_task_ptr(t: NonNull<Task>) -> bool {
    arch::without_interrupts(|| SCHEDULER.lock().remove(t))
}

/// Timer-tick hook, called on every timer interrupt (and by `task_yield`).
pub fn scheduler_tick() {
    let decision = SCHEDULER.lock().tick();
    perform(decision);
}

/// Give up the rest of the current quantum.
pub fn task_yield() {
    arch::without_interrupts(|| {
        let decision = {
            let mut sched = SCHEDULER.lock();
            if let Some(mut current) = sched.current() {
                // SAFETY: current is live; interrupts are disabled.
                unsafe {
                    current.as_mut().time_slice = 0;
                }
            }
            sched.tick()
        };
        perform(decision);
    });
}

/// Block the calling task until `task_unblock` names it.
pub fn task_block() {
    arch::without_interrupts(|| {
        let decision = SCHEDULER.lock().block_current();
        perform(decision);
    });
}

/// Make a blocked task runnable again (tail of the queue). Unblocking a
/// task in any other state is a diagnosed no-op.
pub fn task_unblock(pid: u64) -> KernelResult<()> {
    let t = task::get(pid).ok_or(KernelError::NotFound { what: "task" })?;
    arch::without_interrupts(|| SCHEDULER.lock().unblock(t));
    Ok(())
}

/// Pid of the task currently holding the CPU.
pub fn current_pid() -> Option<u64> {
    arch::without_interrupts(|| {
        SCHEDULER
            .lock()
            .current()
            // SAFETY: current is live while the lock pins the scheduler.
            .map(|t| unsafe { t.as_ref() }.pid)
    })
}

/// State of a task, for diagnostics and tests.
pub fn task_state(pid: u64) -> Option<TaskState> {
    // SAFETY: table entries are live.
    task::get(pid).map(|t| unsafe { t.as_ref() }.state)
}

/// Total ticks a task has been charged.
pub fn task_runtime(pid: u64) -> Option<u64> {
    // SAFETY: table entries are live.
    task::get(pid).map(|t| unsafe { t.as_ref() }.total_runtime)
}

fn perform(decision: Option<SwitchDecision>) {
    if let Some(d) = decision {
        // SAFETY: the decision carries the outgoing task's context slot
        // and a stack pointer previously produced by the switch (or
        // pre-laid at task creation); interrupts are disabled here.
        unsafe {
            arch::context_switch(d.prev_sp, d.next_sp);
        }
    }
}

/// Return trap for task entry functions: the trampoline jumps here when
/// an entry function returns. Never returns.
#[no_mangle]
extern "C" fn ember_task_exit() -> ! {
    loop {
        arch::without_interrupts(|| {
            let decision = SCHEDULER.lock().exit_current();
            perform(decision);
        });
        // Unreachable in practice: the switch above never resumes a
        // terminated task.
        core::hint::spin_loop();
    }
}
