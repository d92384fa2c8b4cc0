//! Serialize work on actor-owned state with a configurable thread supply.
//!
//! Each actor owns a mailbox of pending invocations and one piece of mutable
//! state; the runtime guarantees that exactly one invocation executes
//! against that state at any instant, no matter how many threads post
//! concurrently. A call that needs the results of other asynchronous work
//! can suspend itself and resume on the same actor later, without parking a
//! worker thread in between.
//!
//! # Pieces
//!
//! - [Promise]: the single-assignment, blocking-waitable result cell every
//!   post returns.
//! - [Registry]/[Flags]: the immutable per-signature metadata (batching,
//!   yield, jump-queue, ...) the dispatch layer declares up front.
//! - [Runtime]/[Actor]/[Target]: spawning, posting, and the serially-invoked
//!   state.
//! - [Suspension]: the continuation protocol for deferring an outcome until
//!   other results resolve.
//! - [Executor]: the injected thread supply. Production code uses an
//!   adaptive pool (see the companion pool crate); tests use the
//!   deterministic [ManualExecutor].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use turnstile_runtime::{
//!     value, Call, Flags, ManualExecutor, RegistryBuilder, Ret, Runtime, SignatureId, Target,
//! };
//!
//! struct Counter {
//!     total: u64,
//!     add: SignatureId,
//! }
//!
//! impl Target for Counter {
//!     fn invoke(&mut self, call: Call) -> Ret {
//!         assert_eq!(call.signature, self.add);
//!         let args = call.args.into_single();
//!         self.total += *args[0].downcast_ref::<u64>().unwrap();
//!         Ret::value(self.total)
//!     }
//! }
//!
//! let mut signatures = RegistryBuilder::new();
//! let add = signatures.declare("add", 1, Flags::default());
//! let registry = signatures.build();
//!
//! let executor = Arc::new(ManualExecutor::new());
//! let runtime = Runtime::new(executor.clone());
//! let spawned = runtime
//!     .spawn("counter", registry, Box::new(Counter { total: 0, add }))
//!     .unwrap();
//!
//! let result = spawned.actor.post(add, vec![value(5u64)]).unwrap();
//! executor.run_until_idle();
//! assert_eq!(*result.get().unwrap().downcast_ref::<u64>().unwrap(), 5);
//! ```

use thiserror::Error;

mod actor;
mod directory;
mod drain;
mod future;
mod invocation;
mod mailbox;
mod manual;
mod registry;
mod suspend;

pub use actor::{Actor, Call, PostError, Ret, Runtime, Spawned, Target};
pub use directory::Directory;
pub use future::{
    value, Cancelled, Failure, GetError, Outcome, Promise, Unexpected, Value, WaitTimeout,
};
pub use invocation::{Args, CancelToken};
pub use mailbox::DwellInfo;
pub use manual::ManualExecutor;
pub use registry::{Flags, Registry, RegistryBuilder, Signature, SignatureId};
pub use suspend::{Awaitable, Continuation, NeverDone, Suspension};

/// A unit of work handed to an [Executor]. Must return normally.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The actor's mailbox was killed: it accepts no further work.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("dead actor")]
pub struct DeadActor;

/// The executor has been disposed and no longer accepts tasks.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("not accepting new tasks")]
pub struct Rejected;

/// The thread supply contract consumed by the runtime.
///
/// One or more threads, not necessarily disjoint with other executors.
/// Implementations may assume every [Task] returns normally.
pub trait Executor: Send + Sync + 'static {
    /// Run `task` on some thread, now or later.
    fn execute(&self, task: Task) -> Result<(), Rejected>;
}
