//! Adaptively-sized worker thread pool that concentrates load on warm
//! threads.
//!
//! Like an unbounded cached pool, thread count is not capped, to avoid
//! deadlock when many actors block on the same result. Unlike a plain cached
//! pool, this one maximizes the utilization of every thread: a worker that
//! becomes clear moves to the front of the free-list, so dispatch keeps
//! hitting warm threads and the redundant ones time out and retire. Thread
//! creation can additionally be throttled, so a burst of short-lived tasks
//! does not balloon into lots and lots of threads: excess submissions are
//! deferred to a resubmission timer, never rejected (until disposal).
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use turnstile_pool::ThreadPool;
//!
//! let pool = ThreadPool::new(Duration::from_millis(200), Duration::ZERO);
//! let (tx, rx) = std::sync::mpsc::channel();
//! pool.execute(Box::new(move || tx.send(7u32).unwrap())).unwrap();
//! assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
//! pool.dispose().unwrap();
//! ```

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, Weak},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, trace};
use turnstile_runtime::{Executor, Rejected, Task};

mod holder;
mod worker;

use worker::{Worker, WorkerOwner};

/// The pool was already disposed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("already disposed")]
pub struct AlreadyDisposed;

/// A point-in-time reading of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    /// The largest size the pool ever reached.
    pub largest_size: usize,
    /// Current number of worker threads.
    pub size: usize,
    /// Workers whose holder is occupied.
    pub active_count: usize,
}

struct PoolState {
    accept_new: bool,
    /// From most recently cleared to most likely occupied.
    workers: VecDeque<Arc<Worker>>,
    next_worker: usize,
    largest: usize,
    /// Earliest instant a new worker may be created.
    min_create_at: Instant,
    /// Tasks deferred by the creation throttle; resubmitted newest-first.
    deferred: Vec<Task>,
}

struct PoolInner {
    weak: Weak<PoolInner>,
    idle_timeout: Duration,
    min_create_period: Duration,
    state: Mutex<PoolState>,
    resubmit: Resubmitter,
}

/// An adaptively-sized [Executor] over real worker threads.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Create a pool.
    ///
    /// `idle_timeout` is how long a clear worker waits for its next task
    /// before retiring. `min_create_period` spaces out thread creation
    /// (e.g. 100ms limits creation to 10 threads per second); zero means no
    /// throttle.
    pub fn new(idle_timeout: Duration, min_create_period: Duration) -> Self {
        let inner = Arc::new_cyclic(|weak| PoolInner {
            weak: weak.clone(),
            idle_timeout,
            min_create_period,
            state: Mutex::new(PoolState {
                accept_new: true,
                workers: VecDeque::new(),
                next_worker: 1,
                largest: 0,
                min_create_at: Instant::now(),
                deferred: Vec::new(),
            }),
            resubmit: Resubmitter::new(),
        });
        inner.resubmit.start(Arc::downgrade(&inner));
        Self { inner }
    }

    /// Run `task` on a clear worker, a freshly created one, or, when the
    /// creation throttle is closed, later via the resubmission timer.
    pub fn execute(&self, task: Task) -> Result<(), Rejected> {
        PoolInner::execute(&self.inner, task)
    }

    /// Snapshot the pool's metrics.
    pub fn take_metrics(&self) -> Metrics {
        // Snapshot under the pool lock, then count occupancy outside it so
        // metrics never serialize against dispatch.
        let (largest_size, workers) = {
            let state = self.inner.state.lock().unwrap();
            (state.largest, state.workers.iter().cloned().collect::<Vec<_>>())
        };
        let active_count = workers
            .iter()
            .filter(|worker| !worker.holder().is_clear())
            .count();
        Metrics {
            largest_size,
            size: workers.len(),
            active_count,
        }
    }

    /// Stop accepting submissions, let in-flight tasks finish, and wait for
    /// every worker thread to terminate. Queued-but-undispatched
    /// resubmissions are dropped.
    pub fn dispose(&self) -> Result<(), AlreadyDisposed> {
        // Stop the timer first: anything it would have resubmitted is gone.
        self.inner.resubmit.shutdown();
        let workers = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.accept_new {
                return Err(AlreadyDisposed);
            }
            state.accept_new = false;
            state.deferred.clear();
            for worker in &state.workers {
                // A worker that already scheduled its own exit is fine.
                let _ = worker.holder().exit();
            }
            state.workers.iter().cloned().collect::<Vec<_>>()
        };
        // Join outside the pool lock: each dying worker calls discard, which
        // needs it.
        for worker in workers {
            if let Some(handle) = worker.take_handle() {
                if handle.join().is_err() {
                    error!("pool worker panicked");
                }
            }
        }
        Ok(())
    }
}

impl Executor for ThreadPool {
    fn execute(&self, task: Task) -> Result<(), Rejected> {
        ThreadPool::execute(self, task)
    }
}

impl PoolInner {
    fn execute(inner: &Arc<Self>, mut task: Task) -> Result<(), Rejected> {
        let mut state = inner.state.lock().unwrap();
        if !state.accept_new {
            return Err(Rejected);
        }
        // Try to find a clear worker, starting with the most likely to be
        // clear; a successful handoff makes it the least likely, so it moves
        // to the end.
        for index in 0..state.workers.len() {
            match state.workers[index].holder().put(task) {
                Ok(()) => {
                    let worker = state.workers.remove(index).unwrap();
                    state.workers.push_back(worker);
                    return Ok(());
                }
                Err(returned) => task = returned,
            }
        }
        // No clear worker: create one, unless the minimum creation spacing
        // has not elapsed yet, in which case the task waits for the timer.
        let now = Instant::now();
        if now < state.min_create_at {
            let deadline = state.min_create_at;
            trace!(delay = ?(deadline - now), "deferring task until the creation throttle opens");
            state.deferred.push(task);
            inner.resubmit.schedule(deadline);
            return Ok(());
        }
        debug!(size = state.workers.len() + 1, "creating pool worker");
        let name = format!("turnstile-pool-{}", state.next_worker);
        state.next_worker += 1;
        let owner: Arc<dyn WorkerOwner> = inner.clone();
        let worker = worker::spawn(name, task, owner, inner.idle_timeout);
        state.workers.push_back(worker);
        state.largest = state.largest.max(state.workers.len());
        state.min_create_at = now + inner.min_create_period;
        Ok(())
    }

    /// Dispatch one deferred task, newest first. `scheduled` distinguishes
    /// the timer path from the early path taken when a worker is promoted.
    fn resubmit_one(inner: &Arc<Self>, scheduled: bool) {
        let deferred = {
            let mut state = inner.state.lock().unwrap();
            state.deferred.pop()
        };
        match deferred {
            None => {
                if scheduled {
                    trace!("nothing to resubmit");
                }
            }
            Some(task) => {
                trace!(on_time = scheduled, "resubmitting deferred task");
                if PoolInner::execute(inner, task).is_err() {
                    // Should not happen before disposal.
                    error!("failed to resubmit deferred task");
                }
            }
        }
    }
}

impl WorkerOwner for PoolInner {
    fn promote(&self, worker: &Arc<Worker>) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(index) = state
                .workers
                .iter()
                .position(|candidate| Arc::ptr_eq(candidate, worker))
            {
                let worker = state.workers.remove(index).unwrap();
                state.workers.push_front(worker);
            }
        }
        // A clear worker is an opportunity to dispatch a deferred task early.
        if let Some(inner) = self.weak.upgrade() {
            PoolInner::resubmit_one(&inner, false);
        }
    }

    fn discard(&self, worker: &Arc<Worker>) {
        let mut state = self.state.lock().unwrap();
        if let Some(index) = state
            .workers
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, worker))
        {
            state.workers.remove(index);
            debug!(size = state.workers.len(), "pool size decremented");
        }
    }
}

struct ResubmitState {
    deadlines: VecDeque<Instant>,
    shutdown: bool,
}

struct ResubmitShared {
    state: Mutex<ResubmitState>,
    wake: Condvar,
}

/// Owns the timer thread that re-dispatches throttled submissions once the
/// creation spacing elapses.
struct Resubmitter {
    shared: Arc<ResubmitShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Resubmitter {
    fn new() -> Self {
        Self {
            shared: Arc::new(ResubmitShared {
                state: Mutex::new(ResubmitState {
                    deadlines: VecDeque::new(),
                    shutdown: false,
                }),
                wake: Condvar::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    fn start(&self, pool: Weak<PoolInner>) {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("turnstile-pool-resubmit".into())
            .spawn(move || timer_loop(shared, pool))
            .expect("failed to spawn pool resubmit thread");
        *self.handle.lock().unwrap() = Some(handle);
    }

    fn schedule(&self, deadline: Instant) {
        let mut state = self.shared.state.lock().unwrap();
        // The throttle deadline never moves backwards, so pushing keeps the
        // queue sorted.
        state.deadlines.push_back(deadline);
        self.shared.wake.notify_all();
    }

    fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn timer_loop(shared: Arc<ResubmitShared>, pool: Weak<PoolInner>) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.shutdown {
            return;
        }
        match state.deadlines.front().copied() {
            None => state = shared.wake.wait(state).unwrap(),
            Some(deadline) => {
                let now = Instant::now();
                if now < deadline {
                    let (next, _) = shared.wake.wait_timeout(state, deadline - now).unwrap();
                    state = next;
                } else {
                    state.deadlines.pop_front();
                    drop(state);
                    let Some(pool) = pool.upgrade() else { return };
                    PoolInner::resubmit_one(&pool, true);
                    drop(pool);
                    state = shared.state.lock().unwrap();
                }
            }
        }
    }
}
