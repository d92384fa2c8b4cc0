//! The claim representing the one worker currently allowed to run an actor's
//! work.

use crate::{actor::Actor, mailbox::LoadError};
use std::sync::Mutex;
use tracing::debug;

/// A drain processes `remaining` items from the mailbox on one worker thread.
///
/// It is created with a claim of one; posts arriving while it is live extend
/// the claim via [Drain::incr_or_false] instead of handing off to a second
/// thread. Because a post never starts a second drain while one is live, and
/// a drain is the only entity that loads, exactly one thread ever executes a
/// given actor's invocations at a time.
pub(crate) struct Drain {
    actor: Actor,
    remaining: Mutex<usize>,
}

impl Drain {
    pub(crate) fn new(actor: Actor) -> Self {
        Self {
            actor,
            remaining: Mutex::new(1),
        }
    }

    /// Try to commit this drain to one more item. Fails permanently once the
    /// claim has reached zero; the caller then submits a fresh drain. This
    /// race is expected and harmless.
    pub(crate) fn incr_or_false(&self) -> bool {
        let mut remaining = self.remaining.lock().unwrap();
        if *remaining == 0 {
            return false;
        }
        *remaining += 1;
        true
    }

    /// The run loop. Must return normally.
    pub(crate) fn run(&self) {
        let mut max_batch = *self.remaining.lock().unwrap();
        loop {
            // There is something in the mailbox for every unit of the claim;
            // never remove more than the authorized amount.
            let invocation = match self.actor.mailbox().load(max_batch) {
                Ok(invocation) => invocation,
                Err(LoadError::DeadActor(_)) => {
                    // The mailbox has already cancelled the remaining tasks.
                    debug!(actor = %self.actor.label(), "abort drain due to actor kill");
                    return;
                }
                Err(LoadError::AlreadyLoaded) => {
                    unreachable!("only the active drain loads invocations")
                }
            };
            let consumed = invocation.batch_size();
            invocation.run(&self.actor);
            self.actor.mailbox().unload();
            let mut remaining = self.remaining.lock().unwrap();
            *remaining -= consumed;
            if *remaining == 0 {
                return;
            }
            max_batch = *remaining;
        }
    }
}
