//! Store mutations
//!
//! An [`Operation`] is one Put or Delete against a [`BlockKey`]. A [`Batch`]
//! collects the operations produced by one filesystem call, in order. A batch
//! is only atomic within a single shard.

use crate::key::BlockKey;
use bytes::Bytes;

/// What an operation does to its key
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Put(Bytes),
    Delete,
}

/// One Put or Delete tagged with its key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    pub key: BlockKey,
    pub action: Action,
}

impl Operation {
    pub fn put(key: BlockKey, value: impl Into<Bytes>) -> Self {
        Self {
            key,
            action: Action::Put(value.into()),
        }
    }

    #[must_use]
    pub const fn delete(key: BlockKey) -> Self {
        Self {
            key,
            action: Action::Delete,
        }
    }

    /// Bytes carried by a Put, zero for a Delete
    #[must_use]
    pub fn value_len(&self) -> usize {
        match &self.action {
            Action::Put(value) => value.len(),
            Action::Delete => 0,
        }
    }
}

/// Ordered operations of one logical filesystem call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<Operation>,
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a Put
    pub fn put(&mut self, key: BlockKey, value: impl Into<Bytes>) {
        self.ops.push(Operation::put(key, value));
    }

    /// Queue a Delete
    pub fn delete(&mut self, key: BlockKey) {
        self.ops.push(Operation::delete(key));
    }

    pub fn push(&mut self, op: Operation) {
        self.ops.push(op);
    }

    /// Append all operations of another batch
    pub fn extend(&mut self, other: Self) {
        self.ops.extend(other.ops);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Operation> {
        self.ops.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Operation] {
        &self.ops
    }
}

impl IntoIterator for Batch {
    type Item = Operation;
    type IntoIter = std::vec::IntoIter<Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a Operation;
    type IntoIter = std::slice::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}
