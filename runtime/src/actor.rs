//! Actor handles, the target trait, and the runtime that spawns them.
//!
//! An [Actor] is a cloneable handle over one mailbox and one exclusively
//! owned [Target]. Posting never blocks: it enqueues a request, extends the
//! live drain's claim (or submits a fresh drain to the executor), and hands
//! back the [Promise] the outcome will land in. Because the drain is the
//! only entity that executes, target code needs no internal locking.

use crate::{
    directory::Directory,
    drain::Drain,
    future::{Failure, Promise},
    invocation::{Args, CancelToken, Completer, TaskFn},
    mailbox::{DwellInfo, Mailbox, Payload, Request},
    registry::{Flags, Registry, SignatureId},
    DeadActor, Executor, Rejected, Value,
};
use std::{
    fmt,
    sync::{Arc, Mutex, Weak},
    time::Instant,
};
use thiserror::Error;

/// The outcome of one call on a [Target]: a value, a failure, or a
/// suspension that defers the outcome until other results resolve.
pub enum Ret {
    Value(Value),
    Failure(Failure),
    Suspended(crate::suspend::Suspension),
}

impl Ret {
    /// Return a concrete value.
    pub fn value<T: std::any::Any + Send + Sync>(v: T) -> Self {
        Ret::Value(Arc::new(v))
    }

    /// Return unit.
    pub fn unit() -> Self {
        Ret::value(())
    }

    /// Return a failure wrapping an application error.
    pub fn failure<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Ret::Failure(Failure::new(err))
    }

    /// Defer the outcome.
    pub fn suspend(suspension: crate::suspend::Suspension) -> Self {
        Ret::Suspended(suspension)
    }
}

impl From<crate::suspend::Suspension> for Ret {
    fn from(suspension: crate::suspend::Suspension) -> Self {
        Ret::Suspended(suspension)
    }
}

impl fmt::Debug for Ret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ret::Value(_) => f.write_str("Value"),
            Ret::Failure(failure) => write!(f, "Failure({failure})"),
            Ret::Suspended(_) => f.write_str("Suspended"),
        }
    }
}

/// One dispatched (possibly batched) call.
pub struct Call {
    /// The signature being invoked, resolved against the actor's registry.
    pub signature: SignatureId,
    /// Single argument list, or parallel per-position arrays for a batch.
    pub args: Args,
    /// Cooperative cancellation signal; long calls should poll it.
    pub cancel: CancelToken,
}

/// The state owned by an actor, invoked serially by the runtime.
///
/// Implementations translate a [Call] into work against their own fields.
/// They must return normally: failures travel as [Ret::Failure], not as
/// panics.
pub trait Target: Send + 'static {
    /// Posted once at spawn, before any other request, with the actor's own
    /// handle.
    fn init(&mut self, _actor: &Actor) -> Ret {
        Ret::unit()
    }

    /// Execute one call.
    fn invoke(&mut self, call: Call) -> Ret;

    /// Cleanup hook, run after every invocation whatever the outcome
    /// (value, failure, or suspension). Errors are logged and never affect
    /// the primary outcome.
    fn after_invoke(&mut self) -> Result<(), Failure> {
        Ok(())
    }
}

/// An error posting to an actor.
#[derive(Debug, Error)]
pub enum PostError {
    /// The mailbox was killed.
    #[error(transparent)]
    DeadActor(#[from] DeadActor),
    /// The signature id does not belong to this actor's registry.
    #[error("unknown signature")]
    UnknownSignature,
    /// Property signatures are served by the dispatch layer, never posted;
    /// the reserved init signature is posted only by the runtime.
    #[error("signature is not postable")]
    NotPostable,
    /// Wrong number of arguments for the signature.
    #[error("expected {expected} arguments, got {actual}")]
    Arity { expected: usize, actual: usize },
    /// The executor is no longer accepting work.
    #[error(transparent)]
    Rejected(#[from] Rejected),
}

pub(crate) struct ActorInner {
    label: Arc<str>,
    registry: Arc<Registry>,
    mailbox: Mailbox,
    target: Mutex<Box<dyn Target>>,
    executor: Arc<dyn Executor>,
    current_drain: Mutex<Weak<Drain>>,
}

/// A handle to a spawned actor. Clones share the same mailbox and target.
#[derive(Clone)]
pub struct Actor {
    inner: Arc<ActorInner>,
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor")
            .field("label", &self.inner.label)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Actor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Actor {}

impl Actor {
    pub(crate) fn from_inner(inner: Arc<ActorInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ActorInner> {
        Arc::downgrade(&self.inner)
    }

    /// The label given at spawn.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// The signature registry this actor was spawned with.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Post a call. Returns the cell its outcome will land in.
    pub fn post(
        &self,
        signature: SignatureId,
        args: Vec<Value>,
    ) -> Result<Promise<Value>, PostError> {
        if signature == Registry::INIT {
            return Err(PostError::NotPostable);
        }
        let declared = self
            .inner
            .registry
            .get(signature)
            .ok_or(PostError::UnknownSignature)?;
        if declared.flags().property {
            return Err(PostError::NotPostable);
        }
        if args.len() != declared.arity() {
            return Err(PostError::Arity {
                expected: declared.arity(),
                actual: args.len(),
            });
        }
        let cell = Promise::new();
        self.enqueue(Request {
            label: declared.label(),
            flags: declared.flags(),
            payload: Payload::Invoke { signature, args },
            completer: Completer::single(cell.clone()),
            enqueued: Instant::now(),
        })?;
        Ok(cell)
    }

    /// Post a task that queues like a normal invocation but runs without
    /// access to the target. Useful for running code just before or after a
    /// real invocation on the same actor.
    pub fn post_task<F>(&self, task: F) -> Result<Promise<Value>, PostError>
    where
        F: FnOnce() -> Ret + Send + 'static,
    {
        let cell = Promise::new();
        self.enqueue(Request {
            label: Arc::from("task"),
            flags: Flags::default(),
            payload: Payload::Task(Box::new(task)),
            completer: Completer::single(cell.clone()),
            enqueued: Instant::now(),
        })?;
        Ok(cell)
    }

    /// Variant of [Actor::post_task] used to resume suspensions: carries the
    /// suspended call's completer instead of returning a fresh cell, and
    /// reports delivery problems into that completer.
    pub(crate) fn post_private(&self, task: TaskFn, completer: Completer) {
        let result = self.enqueue(Request {
            label: Arc::from("continuation"),
            flags: Flags::default(),
            payload: Payload::Task(task),
            completer: completer.clone(),
            enqueued: Instant::now(),
        });
        match result {
            Ok(()) => {}
            Err(PostError::DeadActor(_)) => completer.fail_if_pending(Failure::dead_actor()),
            Err(PostError::Rejected(err)) => completer.fail_if_pending(Failure::new(err)),
            Err(_) => unreachable!("private posts bypass signature checks"),
        }
    }

    fn enqueue(&self, request: Request) -> Result<(), PostError> {
        self.inner.mailbox.add(request)?;
        self.ensure_drain()?;
        Ok(())
    }

    /// Extend the live drain's claim, or submit a fresh drain. The increment
    /// failing because the drain is concurrently finishing is expected; the
    /// fresh drain takes over.
    fn ensure_drain(&self) -> Result<(), Rejected> {
        let mut current = self.inner.current_drain.lock().unwrap();
        if let Some(drain) = current.upgrade() {
            if drain.incr_or_false() {
                return Ok(());
            }
        }
        let drain = Arc::new(Drain::new(self.clone()));
        let task = {
            let drain = drain.clone();
            Box::new(move || drain.run())
        };
        self.inner.executor.execute(task)?;
        *current = Arc::downgrade(&drain);
        Ok(())
    }

    /// Discard the mailbox along with all pending invocations, preventing
    /// any new posts, and send a cooperative interrupt to the current
    /// invocation. Expensive in-flight work must observe its [CancelToken]
    /// for the interrupt to take effect.
    pub fn kill(&self) {
        self.inner.mailbox.kill();
    }

    /// Messages awaiting processing, not counting the one currently being
    /// processed.
    pub fn mailbox_size(&self) -> Result<usize, DeadActor> {
        self.inner.mailbox.size()
    }

    /// Current dwell reading, as a thread-safe function of a caller-supplied
    /// `Instant`.
    pub fn dwell_info(&self) -> DwellInfo {
        self.inner.mailbox.dwell_info()
    }

    pub(crate) fn mailbox(&self) -> &Mailbox {
        &self.inner.mailbox
    }

    pub(crate) fn with_target<R>(&self, f: impl FnOnce(&mut dyn Target) -> R) -> R {
        let mut target = self.inner.target.lock().unwrap();
        f(&mut **target)
    }
}

/// A freshly spawned actor plus the cell its init call reports into.
pub struct Spawned {
    pub actor: Actor,
    pub init: Promise<Value>,
}

/// Spawns actors against an injected thread supply.
pub struct Runtime {
    executor: Arc<dyn Executor>,
    directory: Directory,
}

impl Runtime {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            directory: Directory::new(),
        }
    }

    /// Wrap `target` in a new actor and post its init call.
    ///
    /// Fails only if the executor is no longer accepting work.
    pub fn spawn(
        &self,
        label: &str,
        registry: Arc<Registry>,
        target: Box<dyn Target>,
    ) -> Result<Spawned, Rejected> {
        let actor = Actor {
            inner: Arc::new(ActorInner {
                label: Arc::from(label),
                mailbox: Mailbox::new(Arc::from(label)),
                registry: registry.clone(),
                target: Mutex::new(target),
                executor: self.executor.clone(),
                current_drain: Mutex::new(Weak::new()),
            }),
        };
        // Register before posting init so diagnostics can already see the
        // actor from inside its own init.
        self.directory.purge_and_add(&actor);
        let init = Promise::new();
        let result = actor.enqueue(Request {
            label: registry.init_label(),
            flags: Flags::default(),
            payload: Payload::Init,
            completer: Completer::single(init.clone()),
            enqueued: Instant::now(),
        });
        match result {
            Ok(()) => Ok(Spawned { actor, init }),
            Err(PostError::Rejected(err)) => Err(err),
            Err(_) => unreachable!("a fresh mailbox accepts the init post"),
        }
    }

    /// The diagnostics table of live actors.
    pub fn directory(&self) -> &Directory {
        &self.directory
    }
}
