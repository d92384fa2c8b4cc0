//! Per-interface signature registry.
//!
//! The dispatch layer that turns language-level calls into `(signature,
//! arguments)` pairs lives outside this crate. What the core needs from it is
//! an immutable lookup from a [SignatureId] to the metadata that drives queue
//! discipline: the [Flags] and the expected argument count. A [Registry] is
//! built once per actor interface with [RegistryBuilder] and shared by handle
//! at spawn time; the core never consults any global state.

use std::sync::Arc;

/// Queue-discipline metadata attached to a signature.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    /// Adjacent same-signature requests may be merged into one physical call
    /// with parallel argument arrays.
    pub batched: bool,
    /// Low-priority work: skipped outright when impatient work is queued
    /// behind it, and receptive to cooperative interruption.
    pub yielding: bool,
    /// Exempts a request from triggering cooperative preemption of yielding
    /// work already in flight.
    pub patient: bool,
    /// Insert ahead of ordinary requests, behind earlier jump-queue ones.
    pub jump_queue: bool,
    /// Expected to run long: excluded from dwell time while executing.
    pub slow: bool,
    /// Served directly by the dispatch layer; never postable.
    pub property: bool,
}

impl Flags {
    pub fn batched(mut self) -> Self {
        self.batched = true;
        self
    }

    pub fn yielding(mut self) -> Self {
        self.yielding = true;
        self
    }

    pub fn patient(mut self) -> Self {
        self.patient = true;
        self
    }

    pub fn jump_queue(mut self) -> Self {
        self.jump_queue = true;
        self
    }

    pub fn slow(mut self) -> Self {
        self.slow = true;
        self
    }

    pub fn property(mut self) -> Self {
        self.property = true;
        self
    }
}

/// Identifies a signature within one [Registry].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SignatureId(u32);

/// One registered signature: a name (used only for logging), the argument
/// count, and the [Flags].
#[derive(Debug)]
pub struct Signature {
    name: Arc<str>,
    arity: usize,
    flags: Flags,
}

impl Signature {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn label(&self) -> Arc<str> {
        self.name.clone()
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }
}

/// Immutable signature table for one actor interface.
#[derive(Debug)]
pub struct Registry {
    signatures: Vec<Signature>,
}

impl Registry {
    /// The reserved init signature, posted once at spawn and never postable
    /// by callers.
    pub(crate) const INIT: SignatureId = SignatureId(0);

    pub(crate) fn init_label(&self) -> Arc<str> {
        self.signatures[Self::INIT.0 as usize].label()
    }

    /// Look up a signature.
    pub fn get(&self, id: SignatureId) -> Option<&Signature> {
        self.signatures.get(id.0 as usize)
    }

    /// All registered signatures, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (SignatureId, &Signature)> {
        self.signatures
            .iter()
            .enumerate()
            .map(|(i, s)| (SignatureId(i as u32), s))
    }
}

/// Builds a [Registry], one [RegistryBuilder::declare] call per signature.
pub struct RegistryBuilder {
    signatures: Vec<Signature>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            signatures: vec![Signature {
                name: Arc::from("init"),
                arity: 0,
                flags: Flags::default(),
            }],
        }
    }

    /// Declare a signature and return its id.
    pub fn declare(&mut self, name: &str, arity: usize, flags: Flags) -> SignatureId {
        let id = SignatureId(self.signatures.len() as u32);
        self.signatures.push(Signature {
            name: Arc::from(name),
            arity,
            flags,
        });
        id
    }

    pub fn build(self) -> Arc<Registry> {
        Arc::new(Registry {
            signatures: self.signatures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn declare_and_lookup() {
        let mut builder = RegistryBuilder::new();
        let ping = builder.declare("ping", 1, Flags::default());
        let flush = builder.declare("flush", 0, Flags::default().batched().yielding());
        let registry = builder.build();

        assert_eq!(registry.get(ping).unwrap().name(), "ping");
        assert_eq!(registry.get(ping).unwrap().arity(), 1);
        let flush = registry.get(flush).unwrap();
        assert!(flush.flags().batched);
        assert!(flush.flags().yielding);
        assert!(!flush.flags().patient);
    }

    #[test]
    fn init_is_reserved() {
        let registry = RegistryBuilder::new().build();
        assert_eq!(registry.get(Registry::INIT).unwrap().name(), "init");
        // Declared signatures never collide with the reserved slot.
        let mut builder = RegistryBuilder::new();
        let first = builder.declare("first", 0, Flags::default());
        assert_ne!(first, Registry::INIT);
    }

    #[test_case(Flags::default().batched() => (true, false, false); "batched only")]
    #[test_case(Flags::default().yielding().patient() => (false, true, true); "yield and patient")]
    #[test_case(Flags::default() => (false, false, false); "plain")]
    fn flag_builders(flags: Flags) -> (bool, bool, bool) {
        (flags.batched, flags.yielding, flags.patient)
    }

    #[test]
    fn unknown_id_from_other_registry() {
        let sparse = RegistryBuilder::new().build();
        let mut builder = RegistryBuilder::new();
        builder.declare("a", 0, Flags::default());
        builder.declare("b", 0, Flags::default());
        let rich = builder.build();
        let b = rich.iter().last().unwrap().0;
        assert!(sparse.get(b).is_none());
    }
}
