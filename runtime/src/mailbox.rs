//! Per-actor ordered queue of invocation requests.
//!
//! The mailbox enforces the single-active-worker invariant together with the
//! drain: at most one invocation is ever loaded at a time, and only the
//! active drain loads. Queue discipline: jump-queue requests are inserted
//! behind the contiguous run of jump-queue requests already at the head;
//! everything else appends. A killed mailbox holds no requests and accepts
//! none, permanently.

use crate::{
    invocation::{CancelToken, Completer, Invocation, TaskFn},
    registry::{Flags, SignatureId},
    DeadActor, Value,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::debug;

/// What a queued request will execute.
pub(crate) enum Payload {
    /// A dispatched call on the target.
    Invoke {
        signature: SignatureId,
        args: Vec<Value>,
    },
    /// The reserved init call posted at spawn.
    Init,
    /// A posted task: runs without target access. Also carries continuation
    /// resumes, which reuse the suspended call's completer.
    Task(TaskFn),
}

/// An immutable queued request.
pub(crate) struct Request {
    pub(crate) label: Arc<str>,
    pub(crate) flags: Flags,
    pub(crate) payload: Payload,
    pub(crate) completer: Completer,
    pub(crate) enqueued: Instant,
}

impl Request {
    fn same_signature(&self, other: &Request) -> bool {
        match (&self.payload, &other.payload) {
            (Payload::Invoke { signature: a, .. }, Payload::Invoke { signature: b, .. }) => a == b,
            _ => false,
        }
    }
}

/// Metadata about the invocation currently in flight.
pub(crate) struct Loaded {
    pub(crate) token: CancelToken,
    pub(crate) yielding: bool,
    pub(crate) slow: bool,
    pub(crate) enqueued: Instant,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum LoadError {
    #[error(transparent)]
    DeadActor(DeadActor),
    #[error("an invocation is already loaded")]
    AlreadyLoaded,
}

/// The age of the oldest relevant mailbox item, for latency monitoring.
///
/// An idle or killed mailbox reads as trivially zero. An in-flight item
/// flagged slow contributes only while it was queued, not while executing.
#[derive(Debug, Clone, Copy)]
pub struct DwellInfo {
    oldest: Option<Instant>,
    mailbox_size: usize,
}

impl DwellInfo {
    const TRIVIAL: DwellInfo = DwellInfo {
        oldest: None,
        mailbox_size: 0,
    };

    /// Elapsed time of the oldest relevant item as of `now`.
    pub fn dwell(&self, now: Instant) -> Duration {
        self.oldest
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default()
    }

    /// Pending (not-yet-loaded) requests at snapshot time.
    pub fn mailbox_size(&self) -> usize {
        self.mailbox_size
    }
}

struct State {
    /// `None` once killed.
    queue: Option<VecDeque<Request>>,
    loaded: Option<Loaded>,
}

pub(crate) struct Mailbox {
    label: Arc<str>,
    state: Mutex<State>,
}

impl Mailbox {
    pub(crate) fn new(label: Arc<str>) -> Self {
        Self {
            label,
            state: Mutex::new(State {
                queue: Some(VecDeque::new()),
                loaded: None,
            }),
        }
    }

    /// Enqueue a request.
    ///
    /// An impatient (non-patient) request sends a cooperative interrupt to a
    /// yielding invocation currently in flight; the invocation is not forced
    /// to stop, it must observe the signal itself.
    pub(crate) fn add(&self, request: Request) -> Result<(), DeadActor> {
        let mut state = self.state.lock().unwrap();
        if state.queue.is_none() {
            return Err(DeadActor);
        }
        if !request.flags.patient {
            if let Some(loaded) = &state.loaded {
                if loaded.yielding {
                    // Could already be done, or fire more than once if the
                    // invocation sticks around.
                    loaded.token.fire();
                }
            }
        }
        let queue = state.queue.as_mut().unwrap();
        if request.flags.jump_queue {
            // Insert behind the contiguous jump-queue run at the head.
            let at = queue
                .iter()
                .position(|r| !r.flags.jump_queue)
                .unwrap_or(queue.len());
            queue.insert(at, request);
        } else {
            queue.push_back(request);
        }
        Ok(())
    }

    /// Remove the head request (greedily batching up to `max_batch` requests
    /// of the same signature when batchable) and build the invocation to
    /// execute.
    ///
    /// The yield check runs after batching, so a batch is judged as a whole:
    /// a yielding head with any impatient request still queued produces a
    /// lightweight invocation that cancels every member without touching the
    /// target.
    pub(crate) fn load(&self, max_batch: usize) -> Result<Invocation, LoadError> {
        let mut state = self.state.lock().unwrap();
        if state.queue.is_none() {
            return Err(LoadError::DeadActor(DeadActor));
        }
        if state.loaded.is_some() {
            return Err(LoadError::AlreadyLoaded);
        }
        let queue = state.queue.as_mut().unwrap();
        let head = queue
            .pop_front()
            .expect("drain holds a claim for a pending request");
        let mut tail = Vec::new();
        if head.flags.batched {
            while let Some(next) = queue.front() {
                if 1 + tail.len() >= max_batch || !head.same_signature(next) {
                    break;
                }
                tail.push(queue.pop_front().unwrap());
            }
        }
        let impatient = queue.iter().any(|r| !r.flags.patient);
        let invocation = if head.flags.yielding && impatient {
            Invocation::yield_skip(head, tail)
        } else {
            Invocation::execute(head, tail)
        };
        state.loaded = Some(invocation.loaded_meta());
        Ok(invocation)
    }

    /// Clear the in-flight marker.
    ///
    /// # Panics
    ///
    /// Panics if nothing was loaded.
    pub(crate) fn unload(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.loaded.take().is_some(), "nothing loaded");
    }

    /// Pending (not-yet-loaded) requests.
    pub(crate) fn size(&self) -> Result<usize, DeadActor> {
        let state = self.state.lock().unwrap();
        state.queue.as_ref().map(|q| q.len()).ok_or(DeadActor)
    }

    pub(crate) fn dwell_info(&self) -> DwellInfo {
        let state = self.state.lock().unwrap();
        let Some(queue) = state.queue.as_ref() else {
            // Legit, it's just permanent now.
            return DwellInfo::TRIVIAL;
        };
        let mailbox_size = queue.len();
        if let Some(loaded) = &state.loaded {
            if !loaded.slow {
                return DwellInfo {
                    oldest: Some(loaded.enqueued),
                    mailbox_size,
                };
            }
        }
        if let Some(head) = queue.front() {
            return DwellInfo {
                oldest: Some(head.enqueued),
                mailbox_size,
            };
        }
        DwellInfo::TRIVIAL
    }

    /// Permanently mark the mailbox dead: force an interrupt on any loaded
    /// invocation, cancel every queued request, and reject all further adds.
    pub(crate) fn kill(&self) {
        let mut state = self.state.lock().unwrap();
        let Some(queue) = state.queue.take() else {
            // Already killed.
            return;
        };
        if let Some(loaded) = &state.loaded {
            loaded.token.fire();
        }
        drop(state);
        // Cells are completed outside the mailbox lock: a subscriber may
        // re-enter the actor.
        for request in queue {
            debug!(actor = %self.label, signature = %request.label, "rejecting queued request");
            request.completer.cancel();
        }
    }
}
