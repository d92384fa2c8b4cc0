//! The executable unit: one or more same-signature requests merged into a
//! single physical call.
//!
//! Batch members' argument lists become parallel per-position arrays and
//! their cells are fronted by one fan-out [Completer], so every outcome
//! (value, failure, cancellation) is applied identically to all of them.

use crate::{
    actor::{Actor, Call, Ret},
    future::{Failure, Outcome, Promise},
    mailbox::{Loaded, Payload, Request},
    suspend, Value,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error, info};

/// A queued task body: a posted task or a continuation resume.
pub(crate) type TaskFn = Box<dyn FnOnce() -> Ret + Send>;

/// Cooperative cancellation signal for one in-flight invocation.
///
/// Firing the token never stops the call; the call must observe
/// [CancelToken::is_cancelled] itself. Once fired while the invocation is in
/// flight, the outcome becomes cancelled even if the call returns a value
/// afterwards; firing after completion is a no-op.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fire(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether a cooperative interrupt has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Applies one outcome to every member cell of a batch.
#[derive(Clone)]
pub(crate) struct Completer {
    cells: Arc<Vec<Promise<Value>>>,
}

impl Completer {
    pub(crate) fn single(cell: Promise<Value>) -> Self {
        Self {
            cells: Arc::new(vec![cell]),
        }
    }

    fn merge(head: &Completer, tail: &[Request]) -> Completer {
        if tail.is_empty() {
            return head.clone();
        }
        let mut cells: Vec<Promise<Value>> = head.cells.iter().cloned().collect();
        for request in tail {
            cells.extend(request.completer.cells.iter().cloned());
        }
        Completer {
            cells: Arc::new(cells),
        }
    }

    pub(crate) fn complete(&self, value: Value) {
        for cell in self.cells.iter() {
            cell.complete(value.clone());
        }
    }

    pub(crate) fn fail(&self, failure: Failure) {
        for cell in self.cells.iter() {
            cell.fail(failure.clone());
        }
    }

    /// Tolerant: a kill may cancel several queued continuation posts that
    /// share the same cells.
    pub(crate) fn cancel(&self) {
        for cell in self.cells.iter() {
            cell.transition_if_pending(Outcome::Cancelled);
        }
    }

    /// Tolerant, for the same reason as [Completer::cancel].
    pub(crate) fn fail_if_pending(&self, failure: Failure) {
        for cell in self.cells.iter() {
            cell.transition_if_pending(Outcome::Failed(failure.clone()));
        }
    }
}

/// The arguments handed to the target for one invocation.
pub enum Args {
    /// Arguments of a single, non-batchable call.
    Single(Vec<Value>),
    /// Parallel per-position arrays. Batchable signatures always receive
    /// this shape, even for a batch of one.
    Batched {
        /// Number of merged requests.
        members: usize,
        /// One inner array per parameter position, each `members` long.
        positions: Vec<Vec<Value>>,
    },
}

impl Args {
    /// Number of merged requests represented by these arguments.
    pub fn members(&self) -> usize {
        match self {
            Args::Single(_) => 1,
            Args::Batched { members, .. } => *members,
        }
    }

    /// Unwrap a non-batched argument list.
    ///
    /// # Panics
    ///
    /// Panics when called on a batch; only use for signatures that are not
    /// batchable.
    pub fn into_single(self) -> Vec<Value> {
        match self {
            Args::Single(args) => args,
            Args::Batched { .. } => panic!("batched arguments for a non-batch read"),
        }
    }

    /// Unwrap the per-position arrays of a batch.
    ///
    /// # Panics
    ///
    /// Panics when called on a non-batched argument list.
    pub fn into_batched(self) -> Vec<Vec<Value>> {
        match self {
            Args::Single(_) => panic!("single arguments for a batch read"),
            Args::Batched { positions, .. } => positions,
        }
    }
}

enum Work {
    Invoke { signature: crate::SignatureId, args: Args },
    Init,
    Task(TaskFn),
}

/// Distinguishes a real execution from a yield skip in mailbox tests.
#[cfg(test)]
pub(crate) enum RunOutcome {
    Execute,
    YieldSkip,
}

pub(crate) enum Invocation {
    Execute(Execute),
    YieldSkip(YieldSkip),
}

pub(crate) struct Execute {
    label: Arc<str>,
    work: Work,
    completer: Completer,
    cancel: CancelToken,
    batch_size: usize,
    yielding: bool,
    slow: bool,
    enqueued: std::time::Instant,
}

/// Cancels every member without invoking the target: low-priority batched
/// work is judged as a whole at dequeue time.
pub(crate) struct YieldSkip {
    label: Arc<str>,
    completer: Completer,
    batch_size: usize,
    enqueued: std::time::Instant,
}

impl Invocation {
    /// Build a real invocation from the head request and its batch tail.
    pub(crate) fn execute(head: Request, tail: Vec<Request>) -> Self {
        let completer = Completer::merge(&head.completer, &tail);
        let batch_size = 1 + tail.len();
        let work = match head.payload {
            Payload::Invoke { signature, args } => {
                if head.flags.batched {
                    let arity = args.len();
                    let mut positions: Vec<Vec<Value>> = args
                        .into_iter()
                        .map(|arg| {
                            let mut column = Vec::with_capacity(batch_size);
                            column.push(arg);
                            column
                        })
                        .collect();
                    for request in tail {
                        let Payload::Invoke { args, .. } = request.payload else {
                            unreachable!("batch tail shares the head signature");
                        };
                        debug_assert_eq!(args.len(), arity);
                        for (position, arg) in args.into_iter().enumerate() {
                            positions[position].push(arg);
                        }
                    }
                    Work::Invoke {
                        signature,
                        args: Args::Batched {
                            members: batch_size,
                            positions,
                        },
                    }
                } else {
                    debug_assert!(tail.is_empty());
                    Work::Invoke {
                        signature,
                        args: Args::Single(args),
                    }
                }
            }
            Payload::Init => Work::Init,
            Payload::Task(task) => Work::Task(task),
        };
        Invocation::Execute(Execute {
            label: head.label,
            work,
            completer,
            cancel: CancelToken::new(),
            batch_size,
            yielding: head.flags.yielding,
            slow: head.flags.slow,
            enqueued: head.enqueued,
        })
    }

    /// Build the lightweight invocation that cancels a yielded batch.
    pub(crate) fn yield_skip(head: Request, tail: Vec<Request>) -> Self {
        let completer = Completer::merge(&head.completer, &tail);
        Invocation::YieldSkip(YieldSkip {
            label: head.label,
            completer,
            batch_size: 1 + tail.len(),
            enqueued: head.enqueued,
        })
    }

    pub(crate) fn batch_size(&self) -> usize {
        match self {
            Invocation::Execute(e) => e.batch_size,
            Invocation::YieldSkip(y) => y.batch_size,
        }
    }

    #[cfg(test)]
    pub(crate) fn outcome_kind(&self) -> RunOutcome {
        match self {
            Invocation::Execute(_) => RunOutcome::Execute,
            Invocation::YieldSkip(_) => RunOutcome::YieldSkip,
        }
    }

    pub(crate) fn loaded_meta(&self) -> Loaded {
        match self {
            Invocation::Execute(e) => Loaded {
                token: e.cancel.clone(),
                yielding: e.yielding,
                slow: e.slow,
                enqueued: e.enqueued,
            },
            // Runs for such a short time that slow/yield handling is moot;
            // the token is never consulted.
            Invocation::YieldSkip(y) => Loaded {
                token: CancelToken::new(),
                yielding: false,
                slow: false,
                enqueued: y.enqueued,
            },
        }
    }

    /// Execute synchronously on the current worker thread and apply the
    /// outcome to every member cell.
    pub(crate) fn run(self, actor: &Actor) {
        match self {
            Invocation::YieldSkip(skip) => {
                info!(actor = %actor.label(), signature = %skip.label, "yielding instead of invoking");
                skip.completer.cancel();
            }
            Invocation::Execute(execute) => execute.run(actor),
        }
    }
}

impl Execute {
    fn run(self, actor: &Actor) {
        let cancel = self.cancel.clone();
        let label = self.label.clone();
        let ret = actor.with_target(|target| {
            let ret = match self.work {
                Work::Init => target.init(actor),
                Work::Invoke { signature, args } => target.invoke(Call {
                    signature,
                    args,
                    cancel: cancel.clone(),
                }),
                Work::Task(task) => task(),
            };
            // The cleanup hook runs whatever the outcome, including
            // suspension; its failures never reach the cells.
            if let Err(hook) = target.after_invoke() {
                error!(actor = %actor.label(), signature = %label, failure = %hook, "after-invoke hook failed");
            }
            ret
        });
        if cancel.is_cancelled() {
            // The signal arrived while the call was in flight: the signal
            // wins, whatever the call computed.
            self.completer.cancel();
            return;
        }
        match ret {
            Ret::Value(value) => self.completer.complete(value),
            Ret::Failure(failure) => {
                // Many callers never read their cell, so the cause is
                // recorded here too.
                debug!(actor = %actor.label(), signature = %label, %failure, "invocation failed");
                self.completer.fail(failure);
            }
            Ret::Suspended(suspension) => suspend::apply(suspension, self.completer, actor),
        }
    }
}
