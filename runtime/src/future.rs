//! Single-assignment, blocking-waitable result cells.
//!
//! A [Promise] is created for every call posted to an actor and is the only
//! channel through which the outcome of that call travels back to the caller.
//! It starts out pending and makes exactly one terminal transition: to a
//! value, to a [Failure], or to cancelled. Waiters block on a monitor;
//! subscribers registered with [Promise::on_done] run once the transition has
//! happened, outside of the internal lock.

use std::{
    any::Any,
    error::Error as StdError,
    fmt,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error};

/// A type-erased call result, shared by reference across every member of a
/// batch.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Wrap a concrete result into a [Value].
pub fn value<T: Any + Send + Sync>(v: T) -> Value {
    Arc::new(v)
}

/// Raised when reading a cell whose call was cancelled.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cancelled")]
pub struct Cancelled;

/// A failure produced by a call, stored verbatim in the cell and cheap to
/// fan out to batch siblings.
///
/// Join-style continuations attach secondary failures to the first one via
/// [Failure::suppress].
#[derive(Clone)]
pub struct Failure {
    cause: Arc<dyn StdError + Send + Sync>,
    suppressed: Vec<Failure>,
}

/// Internal marker for protocol-misuse reports surfaced as outcomes rather
/// than panics.
#[derive(Debug, Error)]
#[error("{0}")]
struct StateError(String);

/// Reported when a failure's cause does not match the type the caller's
/// contract declares.
#[derive(Debug, Error)]
#[error("unexpected failure cause: {0}")]
pub struct Unexpected(pub String);

impl Failure {
    /// Wrap an application error.
    pub fn new<E: StdError + Send + Sync + 'static>(cause: E) -> Self {
        Self {
            cause: Arc::new(cause),
            suppressed: Vec::new(),
        }
    }

    /// Wrap an already-shared cause.
    pub fn from_arc(cause: Arc<dyn StdError + Send + Sync>) -> Self {
        Self {
            cause,
            suppressed: Vec::new(),
        }
    }

    pub(crate) fn state(message: impl Into<String>) -> Self {
        Self::new(StateError(message.into()))
    }

    /// The failure recorded when an actor dies while work is still pending
    /// on it.
    pub fn dead_actor() -> Self {
        Self::new(crate::DeadActor)
    }

    /// The failure recorded when a dependency of a continuation was
    /// cancelled.
    pub fn cancelled() -> Self {
        Self::new(Cancelled)
    }

    /// The original cause.
    pub fn cause(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.cause.as_ref()
    }

    /// Attempt to view the cause as a concrete error type.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.cause().downcast_ref::<E>()
    }

    /// Recover the concrete application error, or report that the cause does
    /// not fit the caller's declared contract.
    pub fn expect_cause<E: StdError + 'static>(&self) -> Result<&E, Unexpected> {
        self.downcast_ref::<E>()
            .ok_or_else(|| Unexpected(self.cause.to_string()))
    }

    /// Attach a secondary failure (the first failure of a join suppresses
    /// all subsequent ones).
    pub fn suppress(&mut self, other: Failure) {
        self.suppressed.push(other);
    }

    /// Secondary failures attached via [Failure::suppress].
    pub fn suppressed(&self) -> &[Failure] {
        &self.suppressed
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cause)?;
        if !self.suppressed.is_empty() {
            write!(f, " (+{} suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("cause", &self.cause)
            .field("suppressed", &self.suppressed.len())
            .finish()
    }
}

impl StdError for Failure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.cause.as_ref() as &(dyn StdError + 'static))
    }
}

/// The terminal state of a [Promise].
#[derive(Clone)]
pub enum Outcome<T> {
    /// The call returned normally.
    Value(T),
    /// The call failed.
    Failed(Failure),
    /// The call was cancelled before it produced a result.
    Cancelled,
}

impl<T> Outcome<T> {
    /// Unwrap the outcome, surfacing failure and cancellation as [GetError].
    pub fn into_result(self) -> Result<T, GetError> {
        match self {
            Outcome::Value(v) => Ok(v),
            Outcome::Failed(f) => Err(GetError::Failed(f)),
            Outcome::Cancelled => Err(GetError::Cancelled),
        }
    }
}

impl<T> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Value(_) => f.write_str("Value"),
            Outcome::Failed(failure) => write!(f, "Failed({failure})"),
            Outcome::Cancelled => f.write_str("Cancelled"),
        }
    }
}

/// An error returned by the unwrap-and-rethrow reads.
#[derive(Debug, Error, Clone)]
pub enum GetError {
    /// The call was cancelled.
    #[error("cancelled")]
    Cancelled,
    /// The call failed; the original cause is preserved.
    #[error(transparent)]
    Failed(Failure),
}

impl From<GetError> for Failure {
    fn from(err: GetError) -> Self {
        match err {
            GetError::Cancelled => Failure::cancelled(),
            GetError::Failed(f) => f,
        }
    }
}

/// A bounded wait elapsed before the cell completed. The cell itself remains
/// pending and may still complete later.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("timed out waiting for completion")]
pub struct WaitTimeout;

enum Lifecycle<T> {
    Pending {
        callbacks: Vec<Box<dyn FnOnce(&Outcome<T>) + Send>>,
        /// Set by the first waiter; exists so completion can skip `notify_all`
        /// when nobody ever blocked. Never reset.
        notify_armed: bool,
    },
    Done(Outcome<T>),
}

struct Inner<T> {
    state: Mutex<Lifecycle<T>>,
    done: Condvar,
}

/// A single-assignment result cell.
///
/// Clones share the same cell. The completing side uses [Promise::complete],
/// [Promise::fail], or [Promise::cancel]; each of these is terminal and a
/// second transition panics, since it indicates a defect in the completing
/// code rather than an environmental failure.
///
/// There is deliberately no `cancel`-the-call operation here: once batching
/// and continuations can fan a call out, the cell no longer identifies a
/// unique unit of work. Cancellation is driven through the mailbox instead.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Create a pending cell.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(Lifecycle::Pending {
                    callbacks: Vec::new(),
                    notify_armed: false,
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// Complete the cell with a value.
    ///
    /// # Panics
    ///
    /// Panics if the cell is already done.
    pub fn complete(&self, v: T) {
        assert!(
            self.transition(Outcome::Value(v)),
            "promise already completed"
        );
    }

    /// Complete the cell with a failure.
    ///
    /// # Panics
    ///
    /// Panics if the cell is already done.
    pub fn fail(&self, failure: Failure) {
        assert!(
            self.transition(Outcome::Failed(failure)),
            "promise already completed"
        );
    }

    /// Mark the cell cancelled.
    ///
    /// # Panics
    ///
    /// Panics if the cell is already done.
    pub fn cancel(&self) {
        assert!(self.transition(Outcome::Cancelled), "promise already completed");
    }

    /// Transition if still pending; reports whether this call performed the
    /// transition. Used by runtime paths that may legitimately race with a
    /// kill-driven cancellation.
    pub(crate) fn transition_if_pending(&self, outcome: Outcome<T>) -> bool {
        self.transition(outcome)
    }

    fn transition(&self, outcome: Outcome<T>) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock().unwrap();
            if matches!(&*state, Lifecycle::Done(_)) {
                return false;
            }
            let prior = std::mem::replace(&mut *state, Lifecycle::Done(outcome.clone()));
            let Lifecycle::Pending {
                callbacks,
                notify_armed,
            } = prior
            else {
                unreachable!()
            };
            if notify_armed {
                self.inner.done.notify_all();
            }
            callbacks
        };
        // Run subscribers outside the lock so a callback that re-enters the
        // cell (or posts to an actor) cannot deadlock.
        for callback in callbacks {
            callback(&outcome);
        }
        true
    }

    /// Whether the cell has made its terminal transition.
    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.state.lock().unwrap(), Lifecycle::Done(_))
    }

    /// Whether the cell was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            &*self.inner.state.lock().unwrap(),
            Lifecycle::Done(Outcome::Cancelled)
        )
    }

    /// The outcome, if the cell is already done.
    pub fn try_outcome(&self) -> Option<Outcome<T>> {
        match &*self.inner.state.lock().unwrap() {
            Lifecycle::Done(outcome) => Some(outcome.clone()),
            Lifecycle::Pending { .. } => None,
        }
    }

    /// Block until the cell is done and return the outcome.
    pub fn wait(&self) -> Outcome<T> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            match &mut *state {
                Lifecycle::Done(outcome) => return outcome.clone(),
                Lifecycle::Pending { notify_armed, .. } => {
                    *notify_armed = true;
                    state = self.inner.done.wait(state).unwrap();
                }
            }
        }
    }

    /// Block until the cell is done or `timeout` elapses.
    ///
    /// Spurious wakeups are absorbed by re-checking the elapsed time against
    /// the remaining budget. A timeout never mutates the cell: it stays
    /// pending and may still complete later.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Outcome<T>, WaitTimeout> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.state.lock().unwrap();
        loop {
            match &mut *state {
                Lifecycle::Done(outcome) => return Ok(outcome.clone()),
                Lifecycle::Pending { notify_armed, .. } => {
                    let Some(deadline) = deadline else {
                        // Effectively unbounded.
                        *notify_armed = true;
                        state = self.inner.done.wait(state).unwrap();
                        continue;
                    };
                    let remaining = match deadline.checked_duration_since(Instant::now()) {
                        Some(remaining) if !remaining.is_zero() => remaining,
                        _ => return Err(WaitTimeout),
                    };
                    *notify_armed = true;
                    let (next, result) = self.inner.done.wait_timeout(state, remaining).unwrap();
                    state = next;
                    if !result.timed_out() && matches!(&*state, Lifecycle::Pending { .. }) {
                        debug!("absorbing spurious wakeup");
                    }
                }
            }
        }
    }

    /// Block until done and unwrap the outcome.
    pub fn get(&self) -> Result<T, GetError> {
        self.wait().into_result()
    }

    /// Bounded variant of [Promise::get].
    pub fn get_timeout(&self, timeout: Duration) -> Result<Result<T, GetError>, WaitTimeout> {
        Ok(self.wait_timeout(timeout)?.into_result())
    }

    /// Run `callback` once the cell is done.
    ///
    /// If the cell is already done, the callback runs immediately on the
    /// registering thread; otherwise it is queued and run, outside of the
    /// internal lock, by whichever thread performs the transition.
    pub fn on_done<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let immediate = {
            let mut state = self.inner.state.lock().unwrap();
            match &mut *state {
                Lifecycle::Pending { callbacks, .. } => {
                    callbacks.push(Box::new(callback));
                    None
                }
                Lifecycle::Done(outcome) => Some((outcome.clone(), callback)),
            }
        };
        if let Some((outcome, callback)) = immediate {
            callback(&outcome);
        }
    }

    /// Declare that nobody will read this cell: any non-cancelled failure is
    /// logged once the cell completes.
    pub fn and_forget(&self) {
        self.on_done(|outcome| {
            if let Outcome::Failed(failure) = outcome {
                error!(%failure, "fire-and-forget failure");
            }
        });
    }
}
