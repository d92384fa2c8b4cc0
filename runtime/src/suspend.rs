//! Suspension and join: deferring a call's outcome until other asynchronous
//! results resolve, then resuming on the same actor.
//!
//! A call suspends by returning [Ret::Suspended] with a [Suspension]: an
//! ordered set of dependencies plus a continuation. With no dependencies the
//! continuation is evaluated immediately and inline, as a direct tail of the
//! current call. With dependencies, each one re-posts the continuation to
//! the owning actor's mailbox when it resolves, so a continuation can never
//! run concurrently with any other invocation of the same actor. It gains
//! no head-of-line privilege either, it queues like any fresh request.

use crate::{
    actor::{Actor, Ret},
    future::{Failure, Outcome, Promise},
    invocation::{Completer, TaskFn},
    Value,
};
use std::sync::{Arc, Mutex};

/// Something a suspension can wait on.
pub trait Awaitable: Send + Sync {
    /// Run `waker` once this dependency is done, which may be immediately.
    fn when_done(&self, waker: Box<dyn FnOnce() + Send>);
}

/// The dependency that never resolves. Re-suspending on it means "wait for
/// the rest of the original dependencies".
pub struct NeverDone;

impl Awaitable for NeverDone {
    fn when_done(&self, _waker: Box<dyn FnOnce() + Send>) {}
}

impl<T: Clone + Send + 'static> Awaitable for Promise<T> {
    fn when_done(&self, waker: Box<dyn FnOnce() + Send>) {
        self.on_done(move |_| waker());
    }
}

/// Code to run as the suspended call's dependencies resolve.
///
/// Most users want the builders on [Suspension] instead of implementing this
/// directly.
pub trait Continuation: Send {
    /// Called once per completed dependency, as an ordinary request of the
    /// owning actor. Return [Ret::Suspended] with [Suspension::suspend_only]
    /// to keep waiting for the remaining dependencies.
    fn resume(&mut self, dep: usize) -> Ret;

    /// Called inline, without a thread hand-off, when the suspension had no
    /// dependencies.
    fn resume_immediately(&mut self) -> Ret;
}

/// A deferred outcome: dependencies plus the continuation that produces the
/// suspended call's result.
///
/// A suspension exists only between being raised and being fully resolved;
/// a continuation that suspends again creates a new, equally ephemeral
/// instance.
pub struct Suspension {
    deps: Vec<Arc<dyn Awaitable>>,
    continuation: Box<dyn Continuation>,
}

impl Suspension {
    /// Raw constructor for custom continuations.
    pub fn new(deps: Vec<Arc<dyn Awaitable>>, continuation: Box<dyn Continuation>) -> Self {
        Self { deps, continuation }
    }

    /// Suspend on exactly one dependency and return its value verbatim when
    /// it is ready.
    pub fn delegate(dep: Promise<Value>) -> Self {
        Self {
            deps: vec![Arc::new(dep.clone())],
            continuation: Box::new(Delegate { dep }),
        }
    }

    /// Suspend on `deps` and run `task` once all of them are done.
    ///
    /// The task observes every dependency's outcome and its return value
    /// becomes the suspended call's result (it may suspend again).
    pub fn join<F>(deps: Vec<Promise<Value>>, task: F) -> Self
    where
        F: FnOnce(&[Promise<Value>]) -> Ret + Send + 'static,
    {
        let awaitables = deps
            .iter()
            .map(|p| Arc::new(p.clone()) as Arc<dyn Awaitable>)
            .collect();
        Self {
            deps: awaitables,
            continuation: Box::new(Join {
                deps,
                completed: 0,
                task: Some(task),
            }),
        }
    }

    /// Suspend on `deps`, then surface the first failure (in iteration
    /// order) with subsequent failures attached as suppressed, and otherwise
    /// return `result`.
    pub fn join_all(deps: Vec<Promise<Value>>, result: Value) -> Self {
        Self::join(deps, move |deps| {
            let mut primary: Option<Failure> = None;
            for dep in deps {
                let outcome = dep
                    .try_outcome()
                    .expect("join dependency resolved before firing");
                if let Err(err) = outcome.into_result() {
                    let failure = Failure::from(err);
                    match &mut primary {
                        None => primary = Some(failure),
                        Some(first) => first.suppress(failure),
                    }
                }
            }
            match primary {
                Some(failure) => Ret::Failure(failure),
                None => Ret::Value(result),
            }
        })
    }

    /// A suspension with one never-resolving dependency: used by a join
    /// continuation that is not yet ready to produce the final result.
    pub fn suspend_only() -> Self {
        Self {
            deps: vec![Arc::new(NeverDone)],
            continuation: Box::new(SuspendOnly),
        }
    }
}

struct Delegate {
    dep: Promise<Value>,
}

impl Continuation for Delegate {
    fn resume(&mut self, _dep: usize) -> Ret {
        match self
            .dep
            .try_outcome()
            .expect("delegated dependency resolved before firing")
        {
            Outcome::Value(value) => Ret::Value(value),
            Outcome::Failed(failure) => Ret::Failure(failure),
            Outcome::Cancelled => Ret::Failure(Failure::cancelled()),
        }
    }

    fn resume_immediately(&mut self) -> Ret {
        Ret::Failure(Failure::state("delegation requires a dependency"))
    }
}

struct Join<F> {
    deps: Vec<Promise<Value>>,
    completed: usize,
    task: Option<F>,
}

impl<F> Continuation for Join<F>
where
    F: FnOnce(&[Promise<Value>]) -> Ret + Send,
{
    fn resume(&mut self, _dep: usize) -> Ret {
        self.completed += 1;
        if self.completed < self.deps.len() {
            return Ret::Suspended(Suspension::suspend_only());
        }
        let task = self.task.take().expect("join continuation already fired");
        task(&self.deps)
    }

    fn resume_immediately(&mut self) -> Ret {
        let task = self.task.take().expect("join continuation already fired");
        task(&self.deps)
    }
}

struct SuspendOnly;

impl Continuation for SuspendOnly {
    fn resume(&mut self, _dep: usize) -> Ret {
        unreachable!("a never-resolving dependency resolved");
    }

    fn resume_immediately(&mut self) -> Ret {
        // Asserts that there was at least one outer dependency to wait for.
        Ret::Failure(Failure::state(
            "suspend-only continuation fired without dependencies",
        ))
    }
}

/// Drive a raised suspension: inline for zero dependencies, otherwise
/// register a continuation post against each dependency.
pub(crate) fn apply(mut suspension: Suspension, completer: Completer, actor: &Actor) {
    loop {
        if suspension.deps.is_empty() {
            // A direct tail continuation of the current call; a nested
            // zero-dependency suspension just iterates.
            match suspension.continuation.resume_immediately() {
                Ret::Value(value) => return completer.complete(value),
                Ret::Failure(failure) => return completer.fail(failure),
                Ret::Suspended(next) => suspension = next,
            }
        } else {
            let shared = Arc::new(Mutex::new(suspension.continuation));
            for (index, dep) in suspension.deps.iter().enumerate() {
                let actor = actor.clone();
                let completer = completer.clone();
                let shared = shared.clone();
                // Even an already-done dependency routes through the posting
                // path, preserving per-actor serialization.
                dep.when_done(Box::new(move || {
                    let resume: TaskFn =
                        Box::new(move || shared.lock().unwrap().resume(index));
                    actor.post_private(resume, completer);
                }));
            }
            return;
        }
    }
}
