//! Weakly-held table of live actors, for diagnostics only.

use crate::actor::{Actor, ActorInner};
use std::sync::{Arc, Mutex, Weak};

/// Holds a weak reference to every spawned actor so external monitoring can
/// scan mailbox sizes and dwell times. Never consulted on the execution
/// path; pruning happens on each add and on demand via [Directory::purge].
#[derive(Default)]
pub struct Directory {
    actors: Mutex<Vec<Weak<ActorInner>>>,
}

impl Directory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn purge_and_add(&self, actor: &Actor) {
        let mut actors = self.actors.lock().unwrap();
        actors.retain(|weak| weak.strong_count() > 0);
        actors.push(actor.downgrade());
    }

    /// Drop entries whose actors are gone.
    pub fn purge(&self) {
        self.actors
            .lock()
            .unwrap()
            .retain(|weak| weak.strong_count() > 0);
    }

    /// Handles to every actor still alive.
    pub fn snapshot(&self) -> Vec<Actor> {
        self.actors
            .lock()
            .unwrap()
            .iter()
            .filter_map(|weak| weak.upgrade().map(Actor::from_inner))
            .collect()
    }
}
