//! Conditional write batches.

/// A precondition on the current value of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    /// The key must not exist.
    Absent,
    /// The key must hold exactly these bytes.
    Equals(Vec<u8>),
}

impl Expect {
    /// Reports whether `current` satisfies this expectation.
    pub fn holds(&self, current: Option<&[u8]>) -> bool {
        match (self, current) {
            (Expect::Absent, None) => true,
            (Expect::Equals(want), Some(got)) => want.as_slice() == got,
            _ => false,
        }
    }
}

/// A single write in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Put(String, Vec<u8>),
    Delete(String),
}

/// An ordered set of writes guarded by per-key expectations.
///
/// Expectations are evaluated against the committed state before any
/// operation of the batch is applied. Operations apply in insertion order,
/// so a later `Put` of a key wins over an earlier `Delete` of it.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    checks: Vec<(String, Expect)>,
    ops: Vec<Op>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a precondition. Adding a second expectation for the same key
    /// replaces the first.
    pub fn expect(&mut self, key: impl Into<String>, expect: Expect) -> &mut Self {
        let key = key.into();
        match self.checks.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = expect,
            None => self.checks.push((key, expect)),
        }
        self
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(Op::Put(key.into(), value.into()));
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(Op::Delete(key.into()));
        self
    }

    pub fn checks(&self) -> &[(String, Expect)] {
        &self.checks
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// True when the batch has no operations (expectations alone write
    /// nothing).
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
