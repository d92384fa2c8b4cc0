//! A deterministic single-queue executor for reproducible tests.
//!
//! Instead of real worker threads, submitted tasks accumulate in one FIFO
//! queue and execute only under explicit control: either a thread parked in
//! [ManualExecutor::enter] or a test calling
//! [ManualExecutor::run_until_idle]. Serializing execution this way makes
//! orderings reproducible without sleeps or synchronization in the test
//! body.

use crate::{Executor, Rejected, Task};
use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
};

enum Command {
    Run(Task),
    Exit,
}

/// Deterministic [Executor] backed by a single FIFO queue.
#[derive(Default)]
pub struct ManualExecutor {
    queue: Mutex<VecDeque<Command>>,
    available: Condvar,
}

impl ManualExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve the queue on the calling thread until an exit command posted by
    /// [ManualExecutor::post_exit] is consumed.
    ///
    /// Returns the number of tasks executed. Note one task can perform
    /// multiple actor invocations, so this can undercount calls.
    pub fn enter(&self) -> usize {
        let mut executed = 0;
        loop {
            let command = {
                let mut queue = self.queue.lock().unwrap();
                loop {
                    match queue.pop_front() {
                        Some(command) => break command,
                        None => queue = self.available.wait(queue).unwrap(),
                    }
                }
            };
            match command {
                Command::Run(task) => {
                    task();
                    executed += 1;
                }
                Command::Exit => return executed,
            }
        }
    }

    /// Cause one thread parked in [ManualExecutor::enter] to return.
    pub fn post_exit(&self) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(Command::Exit);
        self.available.notify_all();
    }

    /// Run queued tasks (including ones they enqueue) without blocking, until
    /// the queue is empty or an exit command is consumed. Returns the number
    /// of tasks executed.
    pub fn run_until_idle(&self) -> usize {
        let mut executed = 0;
        loop {
            let command = self.queue.lock().unwrap().pop_front();
            match command {
                Some(Command::Run(task)) => {
                    task();
                    executed += 1;
                }
                Some(Command::Exit) | None => return executed,
            }
        }
    }
}

impl Executor for ManualExecutor {
    fn execute(&self, task: Task) -> Result<(), Rejected> {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(Command::Run(task));
        self.available.notify_all();
        Ok(())
    }
}
