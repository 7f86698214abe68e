// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Append-only typed record buffers with partial-flush support.
//!
//! Each record kind gets its own [`Store`]. Records are identified by their
//! insertion index, so ids are monotonic within a trial. A store remembers a
//! drain cursor (high-water mark): [`Store::drain_into`] hands the pending
//! suffix to a sink exactly once, which makes partial flushes idempotent and
//! order-preserving.

use prov_shared::records;

/// An append-only buffer of records of one kind.
#[derive(Debug)]
pub struct Store<T> {
    items: Vec<T>,
    drained: usize,
}

impl<T> Store<T> {
    pub fn new() -> Self {
        Store {
            items: Vec::new(),
            drained: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Next id to be assigned.
    pub fn next_id(&self) -> i64 {
        self.items.len() as i64
    }

    /// Construct and enqueue a record, handing the new id to the constructor.
    pub fn add_with(&mut self, build: impl FnOnce(i64) -> T) -> i64 {
        let id = self.next_id();
        self.items.push(build(id));
        id
    }

    /// Construct a record and return its stable id *without* enqueuing it for
    /// persistence: the drain cursor is advanced past it immediately. Only
    /// valid while the store has nothing pending; used for synthetic roots.
    pub fn dry_add(&mut self, build: impl FnOnce(i64) -> T) -> i64 {
        debug_assert_eq!(self.drained, self.items.len());
        let id = self.add_with(build);
        self.drained = self.items.len();
        id
    }

    pub fn get(&self, id: i64) -> Option<&T> {
        usize::try_from(id).ok().and_then(|ix| self.items.get(ix))
    }

    pub fn get_mut(&mut self, id: i64) -> Option<&mut T> {
        usize::try_from(id)
            .ok()
            .and_then(|ix| self.items.get_mut(ix))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Records added since the last drain.
    pub fn pending(&self) -> &[T] {
        &self.items[self.drained..]
    }

    /// Hand the pending suffix to `sink` and advance the drain cursor. The
    /// sink is not invoked for an empty batch. Returns the number of records
    /// drained; on sink failure the cursor stays put, so the batch is
    /// re-offered by the next flush.
    pub fn drain_into<E>(&mut self, sink: impl FnOnce(&[T]) -> Result<(), E>) -> Result<usize, E> {
        let batch = &self.items[self.drained..];
        if batch.is_empty() {
            return Ok(0);
        }
        sink(batch)?;
        let n = batch.len();
        self.drained = self.items.len();
        Ok(n)
    }

    /// Like [`Store::drain_into`] but projects each record through `map`
    /// first; used where the in-memory object carries transient state the
    /// persisted row must not.
    pub fn drain_map_into<R, E>(
        &mut self,
        map: impl FnMut(&T) -> R,
        sink: impl FnOnce(&[R]) -> Result<(), E>,
    ) -> Result<usize, E> {
        let batch: Vec<R> = self.items[self.drained..].iter().map(map).collect();
        if batch.is_empty() {
            return Ok(0);
        }
        sink(&batch)?;
        self.drained = self.items.len();
        Ok(batch.len())
    }
}

impl<T> Default for Store<T> {
    fn default() -> Self {
        Store::new()
    }
}

/// The per-kind record buffers of one trial. Activations live in their own
/// arena (`crate::activation::Activations`) because they carry transient
/// runtime state next to the persisted row.
#[derive(Debug, Default)]
pub struct Stores {
    pub code_components: Store<records::CodeComponent>,
    pub evaluations: Store<records::Evaluation>,
    pub dependencies: Store<records::Dependency>,
    pub values: Store<records::Value>,
    pub compartments: Store<records::Compartment>,
    pub exceptions: Store<records::Exception>,
}

impl Stores {
    pub fn new() -> Self {
        Stores::default()
    }
}
