//! Task control blocks and the task table
//!
//! Every task owns an 8 KiB kernel stack. A task that has never run
//! carries a pre-laid context frame near the top of that stack shaped
//! exactly like the result of a prior context switch: zeroed callee-saved
//! registers (r12 holding the entry function) under the entry trampoline's
//! address, so the first switch into the task "returns" into its entry.

use alloc::boxed::Box;
use alloc::string::String;
use core::ptr::NonNull;

use spin::Mutex;

use crate::arch::x86_64::context::{task_entry_trampoline, ENTRY_REGISTER_SLOT, SAVED_REGISTERS};
use crate::error::{KernelError, KernelResult};

/// Capacity of the task table.
pub const MAX_TASKS: usize = 64;

/// Longest accepted task name.
pub const MAX_NAME_LEN: usize = 31;

/// Kernel stack size per task.
pub const STACK_SIZE: usize = 8192;

/// Ticks granted per quantum (100 ms at 100 Hz).
pub const QUANTUM_TICKS: u32 = 10;

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// Task entry function. Returning from it traps into the exit path.
pub type TaskEntry = extern "C" fn();

#[repr(C, align(16))]
pub struct TaskStack(pub [u8; STACK_SIZE]);

/// Task control block
pub struct Task {
    pub pid: u64,
    pub name: String,
    pub state: TaskState,
    /// Saved stack pointer; points at the context frame on this task's
    /// own stack whenever the task is not running.
    pub context_sp: u64,
    pub stack_base: u64,
    pub stack_top: u64,
    pub time_slice: u32,
    pub total_runtime: u64,
    /// Intrusive ready-queue link.
    pub next: Option<NonNull<Task>>,
    stack: Box<TaskStack>,
}

impl Task {
    /// Build a task with a pre-laid first-switch frame.
    pub fn new(pid: u64, name: &str, entry: TaskEntry) -> KernelResult<Box<Task>> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(KernelError::InvalidArgument { what: "task name" });
        }

        let stack = Box::new(TaskStack([0; STACK_SIZE]));
        let stack_base = stack.0.as_ptr() as u64;
        let stack_top = stack_base + STACK_SIZE as u64;

        let mut task = Box::new(Task {
            pid,
            name: String::from(name),
            state: TaskState::Ready,
            context_sp: 0,
            stack_base,
            stack_top,
            time_slice: QUANTUM_TICKS,
            total_runtime: 0,
            next: None,
            stack,
        });
        task.lay_initial_frame(entry);
        Ok(task)
    }

    /// Write the frame the first context switch will pop: the saved
    /// callee-saved registers (all zero, r12 = entry) and the trampoline
    /// as the resumption address.
    fn lay_initial_frame(&mut self, entry: TaskEntry) {
        let words = SAVED_REGISTERS + 1;
        let frame_base = self.stack_top - (words * 8) as u64;
        let frame = frame_base as *mut u64;
        // SAFETY: the frame lies inside this task's owned stack.
        unsafe {
            for i in 0..SAVED_REGISTERS {
                frame.add(i).write(0);
            }
            frame.add(ENTRY_REGISTER_SLOT).write(entry as usize as u64);
            frame.add(SAVED_REGISTERS).write(task_entry_trampoline());
        }
        self.context_sp = frame_base;
    }
}

struct TaskTable {
    tasks: [Option<NonNull<Task>>; MAX_TASKS],
    next_pid: u64,
}

// SAFETY: table entries point at leaked boxes; access is behind the lock.
unsafe impl Send for TaskTable {}

static TASKS: Mutex<TaskTable> = Mutex::new(TaskTable {
    tasks: [None; MAX_TASKS],
    next_pid: 1,
});

// The table lock is taken from interrupt context too (the TTY wakeup path
// resolves pids); every acquisition below therefore runs with interrupts
// disabled.

/// Reset the task table. Called once during bring-up.
pub fn init() {
    crate::arch::without_interrupts(|| {
        let mut table = TASKS.lock();
        table.tasks = [None; MAX_TASKS];
        table.next_pid = 1;
    });
    log::info!("task: table ready ({} slots)", MAX_TASKS);
}

/// Allocate a task and record it in the table. The task is not yet
/// scheduled; `sched::add_task` enqueues it.
pub fn create(name: &str, entry: TaskEntry) -> KernelResult<u64> {
    let task_box = Task::new(0, name, entry)?;
    crate::arch::without_interrupts(|| {
        let mut table = TASKS.lock();
        let slot = table
            .tasks
            .iter()
            .position(|t| t.is_none())
            .ok_or(KernelError::InvalidArgument {
                what: "task table full",
            })?;
        let pid = table.next_pid;
        table.next_pid += 1;
        let mut task = task_box;
        task.pid = pid;
        table.tasks[slot] = NonNull::new(Box::into_raw(task));
        Ok(pid)
    })
}

/// Look up a live task by pid.
pub fn get(pid: u64) -> Option<NonNull<Task>> {
    crate::arch::without_interrupts(|| {
        let table = TASKS.lock();
        table
            .tasks
            .iter()
            .flatten()
            // SAFETY: table entries are live leaked boxes.
            .find(|t| unsafe { t.as_ref() }.pid == pid)
            .copied()
    })
}

/// Free a task. Valid on tasks that never ran or that terminated;
/// destroying an unknown pid is a no-op (idempotence).
pub fn destroy(pid: u64) -> KernelResult<()> {
    let reclaimed = crate::arch::without_interrupts(|| {
        let mut table = TASKS.lock();
        let Some(slot) = table
            .tasks
            .iter()
            // SAFETY: live entries.
            .position(|t| t.is_some_and(|t| unsafe { t.as_ref() }.pid == pid))
        else {
            return Ok(None);
        };
        let task = table.tasks[slot].expect("slot checked occupied");
        // SAFETY: entry is live until we reclaim it below.
        let (state, runtime) = unsafe {
            let t = task.as_ref();
            (t.state, t.total_runtime)
        };
        match state {
            TaskState::Running => Err(KernelError::Permission {
                operation: "destroying the running task",
            }),
            TaskState::Blocked => Err(KernelError::Permission {
                operation: "destroying a blocked task",
            }),
            TaskState::Ready if runtime > 0 => Err(KernelError::Permission {
                operation: "destroying a task still in rotation",
            }),
            _ => {
                crate::sched::remove_task_ptr(task);
                table.tasks[slot] = None;
                Ok(Some(task))
            }
        }
    })?;
    if let Some(task) = reclaimed {
        // SAFETY: the pointer came from Box::into_raw and no other
        // reference survives removal from table and queue.
        drop(unsafe { Box::from_raw(task.as_ptr()) });
    }
    Ok(())
}
