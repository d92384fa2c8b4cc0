//! The single-slot task holder owned by each worker.
//!
//! The holder has its own lock so task handoff never contends with the
//! pool-wide free-list scan. It accepts at most one pending task; a worker
//! that is running still occupies its slot, so [TaskHolder::put] refuses and
//! the pool scan moves on.

use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};
use thiserror::Error;
use turnstile_runtime::Task;

/// What the worker should do next.
pub(crate) enum Directive {
    Run(Task),
    Exit,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("the exit directive is already scheduled")]
pub(crate) struct AlreadyExiting;

struct Slot {
    task: Option<Task>,
    running: bool,
    exiting: bool,
}

pub(crate) struct TaskHolder {
    slot: Mutex<Slot>,
    available: Condvar,
}

impl TaskHolder {
    /// A holder starts occupied by the worker's initial task.
    pub(crate) fn new(initial: Task) -> Self {
        Self {
            slot: Mutex::new(Slot {
                task: Some(initial),
                running: false,
                exiting: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Hand over a task. Gives it back if the holder is occupied (pending
    /// task, running worker, or scheduled exit).
    pub(crate) fn put(&self, task: Task) -> Result<(), Task> {
        let mut slot = self.slot.lock().unwrap();
        if slot.task.is_some() || slot.running || slot.exiting {
            return Err(task);
        }
        slot.task = Some(task);
        self.available.notify_all();
        Ok(())
    }

    /// Schedule the exit directive whatever the clear/busy status.
    pub(crate) fn exit(&self) -> Result<(), AlreadyExiting> {
        let mut slot = self.slot.lock().unwrap();
        if slot.exiting {
            return Err(AlreadyExiting);
        }
        slot.exiting = true;
        self.available.notify_all();
        Ok(())
    }

    /// Take the next directive, waiting once up to `timeout` for a task.
    ///
    /// A zero timeout means don't bother waiting. After the wait this is
    /// almost always a timeout, in which case the thread retires itself;
    /// a spurious wakeup retires it too, and we won't mind the loss of one
    /// thread.
    pub(crate) fn next(&self, timeout: Duration) -> Directive {
        let mut slot = self.slot.lock().unwrap();
        if let Some(task) = slot.task.take() {
            slot.running = true;
            return Directive::Run(task);
        }
        if slot.exiting {
            return Directive::Exit;
        }
        if !timeout.is_zero() {
            let (next, _) = self.available.wait_timeout(slot, timeout).unwrap();
            slot = next;
        }
        if let Some(task) = slot.task.take() {
            slot.running = true;
            return Directive::Run(task);
        }
        slot.exiting = true;
        Directive::Exit
    }

    /// Mark the current task consumed so another can be accepted.
    ///
    /// Returns whether the holder is now clear.
    ///
    /// # Panics
    ///
    /// Panics if no task was running.
    pub(crate) fn finish(&self) -> bool {
        let mut slot = self.slot.lock().unwrap();
        assert!(slot.running, "nothing to consume");
        slot.running = false;
        slot.task.is_none() && !slot.exiting
    }

    /// For metrics only. An exiting worker is not clear, and neither is a
    /// starting one (it holds its initial task).
    pub(crate) fn is_clear(&self) -> bool {
        let slot = self.slot.lock().unwrap();
        slot.task.is_none() && !slot.running && !slot.exiting
    }
}
