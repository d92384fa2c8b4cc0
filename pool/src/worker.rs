//! The worker thread loop.

use crate::holder::{Directive, TaskHolder};
use std::{
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};
use turnstile_runtime::Task;

/// The pool, as seen by its workers.
pub(crate) trait WorkerOwner: Send + Sync + 'static {
    /// The given worker just became clear and wants to maximize its
    /// utilization.
    fn promote(&self, worker: &Arc<Worker>);

    /// Removes the given worker; its holder is occupied by the exit
    /// directive.
    fn discard(&self, worker: &Arc<Worker>);
}

pub(crate) struct Worker {
    holder: TaskHolder,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub(crate) fn holder(&self) -> &TaskHolder {
        &self.holder
    }

    pub(crate) fn take_handle(&self) -> Option<JoinHandle<()>> {
        self.handle.lock().unwrap().take()
    }
}

/// Start a worker occupied by `initial`.
pub(crate) fn spawn(
    name: String,
    initial: Task,
    owner: Arc<dyn WorkerOwner>,
    idle_timeout: Duration,
) -> Arc<Worker> {
    let worker = Arc::new(Worker {
        holder: TaskHolder::new(initial),
        handle: Mutex::new(None),
    });
    let handle = thread::Builder::new()
        .name(name)
        .spawn({
            let worker = worker.clone();
            move || run(worker, owner, idle_timeout)
        })
        .expect("failed to spawn pool worker thread");
    *worker.handle.lock().unwrap() = Some(handle);
    worker
}

fn run(worker: Arc<Worker>, owner: Arc<dyn WorkerOwner>, idle_timeout: Duration) {
    loop {
        match worker.holder.next(idle_timeout) {
            Directive::Run(task) => {
                // Tasks are contracted to return normally.
                task();
                if worker.holder.finish() {
                    owner.promote(&worker);
                }
            }
            Directive::Exit => break,
        }
    }
    owner.discard(&worker);
}
