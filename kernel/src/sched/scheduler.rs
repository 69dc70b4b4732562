//! Round-robin scheduler core
//!
//! Pure bookkeeping: the tick accounting, the queue rotation, and the
//! state transitions. A tick that warrants preemption returns a
//! [`SwitchDecision`]; the caller performs the actual context switch
//! after the scheduler lock is released, with interrupts disabled.
//!
//! The idle task is never enqueued; `pick_next` falls back to it only
//! when the ready queue is empty. At quantum expiry the outgoing task is
//! enqueued before the next one is dequeued, so a lone compute task keeps
//! running instead of bouncing through idle.

use core::ptr::NonNull;

use super::queue::ReadyQueue;
use super::task::{Task, TaskState, QUANTUM_TICKS};

/// A pending context switch: where to save the outgoing stack pointer and
/// which stack pointer to adopt.
#[derive(Debug, Clone, Copy)]
pub struct SwitchDecision {
    pub prev_sp: *mut u64,
    pub next_sp: u64,
}

pub struct Scheduler {
    current: Option<NonNull<Task>>,
    idle: Option<NonNull<Task>>,
    ready: ReadyQueue,
    context_switches: u64,
}

// SAFETY: raw task pointers reference table-owned tasks; the scheduler is
// used behind a lock with interrupts disabled.
unsafe impl Send for Scheduler {}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            current: None,
            idle: None,
            ready: ReadyQueue::new(),
            context_switches: 0,
        }
    }

    /// Install the idle task and make it the running bootstrap context.
    pub fn init(&mut self, mut idle: NonNull<Task>) {
        // SAFETY: idle is a live table-owned task.
        unsafe {
            idle.as_mut().state = TaskState::Running;
            idle.as_mut().time_slice = QUANTUM_TICKS;
        }
        self.idle = Some(idle);
        self.current = Some(idle);
    }

    pub fn current(&self) -> Option<NonNull<Task>> {
        self.current
    }

    pub fn context_switches(&self) -> u64 {
        self.context_switches
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Put a task into rotation at the tail of the ready queue.
    pub fn enqueue(&mut self, mut task: NonNull<Task>) {
        debug_assert!(Some(task) != self.idle, "the idle task is never enqueued");
        // SAFETY: task is live and not currently queued.
        unsafe {
            task.as_mut().state = TaskState::Ready;
        }
        self.ready.push_back(task);
    }

    /// Drop a task from the rotation, preserving queue order.
    pub fn remove(&mut self, task: NonNull<Task>) -> bool {
        self.ready.remove(task)
    }

    /// Head of the ready queue, or the idle task when the queue is empty.
    pub fn pick_next(&mut self) -> NonNull<Task> {
        self.ready
            .pop_front()
            .or(self.idle)
            .expect("scheduler used before init")
    }

    /// Timer-tick hook: charge the current task one tick; when its slice
    /// is spent, rotate.
    pub fn tick(&mut self) -> Option<SwitchDecision> {
        let mut current = self.current?;
        // SAFETY: the current task is live; we run with the scheduler
        // lock held and interrupts disabled.
        unsafe {
            let cur = current.as_mut();
            cur.total_runtime += 1;
            if cur.time_slice > 0 {
                cur.time_slice -= 1;
            }
            if cur.time_slice > 0 {
                return None;
            }
        }
        self.reschedule()
    }

    /// Rotate: requeue the outgoing task if it is still runnable, take
    /// the next ready task (idle as fallback), and emit the switch
    /// decision when the winner differs from the outgoing task.
    pub fn reschedule(&mut self) -> Option<SwitchDecision> {
        let mut current = self.current?;

        // SAFETY: current is live.
        unsafe {
            let cur = current.as_mut();
            if cur.state == TaskState::Running {
                cur.time_slice = QUANTUM_TICKS;
                if Some(current) != self.idle {
                    cur.state = TaskState::Ready;
                    self.ready.push_back(current);
                }
            }
        }

        let mut next = self.pick_next();
        if next == current {
            // Sole runnable task: it came straight back off the queue.
            // SAFETY: current is live.
            unsafe {
                current.as_mut().state = TaskState::Running;
            }
            return None;
        }

        // SAFETY: both tasks are live; addresses are stable (boxed).
        unsafe {
            next.as_mut().state = TaskState::Running;
            next.as_mut().time_slice = QUANTUM_TICKS;
            self.current = Some(next);
            self.context_switches += 1;
            Some(SwitchDecision {
                prev_sp: &mut current.as_mut().context_sp,
                next_sp: next.as_ref().context_sp,
            })
        }
    }

    /// Transition the current task to blocked and rotate away from it.
    /// Blocking the idle task is an invariant violation.
    pub fn block_current(&mut self) -> Option<SwitchDecision> {
        let mut current = self.current?;
        assert!(
            Some(current) != self.idle,
            "the idle task must never block"
        );
        // SAFETY: current is live.
        unsafe {
            current.as_mut().state = TaskState::Blocked;
        }
        // Defensive: a running task is off the queue already.
        self.ready.remove(current);
        self.reschedule()
    }

    /// Make a blocked task ready again, at the tail. Unblocking a task in
    /// any other state is a diagnosed no-op.
    pub fn unblock(&mut self, task: NonNull<Task>) {
        // SAFETY: task is live.
        let state = unsafe { task.as_ref().state };
        if state != TaskState::Blocked {
            log::warn!(
                "sched: unblock of task in state {:?} ignored",
                state
            );
            return;
        }
        self.enqueue(task);
    }

    /// Mark the current task terminated and rotate away forever.
    pub fn exit_current(&mut self) -> Option<SwitchDecision> {
        let mut current = self.current?;
        // SAFETY: current is live.
        unsafe {
            current.as_mut().state = TaskState::Terminated;
        }
        self.reschedule()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
