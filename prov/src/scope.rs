// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Dependency-aware scopes.
//!
//! While a sub-expression evaluates, the dependencies it produces accumulate
//! in the scope its "before" hook pushed. The "after" hook pops the scope and
//! either materialises a dependency record into the enclosing scope or, for
//! collections, attaches per-item triples used later to build compartments.

use derive_more::{Deref, DerefMut};
use prov_shared::{ActivationId, DependencyMode, EvaluationId, Moment, ValueId};

use crate::value::ObjRef;

/// How an argument dependency was supplied at the call site.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ArgKind {
    #[default]
    Argument,
    Keyword,
}

/// A pending dependency: collected in a scope, materialised into a
/// `records::Dependency` when the enclosing hook resolves. Keeps a handle on
/// the observed object so the bind rule can compare identities.
#[derive(Clone, Debug)]
pub struct Dep {
    pub activation_id: ActivationId,
    pub evaluation_id: EvaluationId,
    pub value: ObjRef,
    /// `None` when the source evaluation has not been closed yet.
    pub value_id: Option<ValueId>,
    pub mode: DependencyMode,
    /// Element-wise dependencies of a collection literal, consumed by
    /// unpack-assignment.
    pub sub: Vec<Dep>,
    /// Argument label: a keyword name, or the `*` / `**` expansion markers.
    pub arg: Option<String>,
    pub arg_kind: ArgKind,
}

impl Dep {
    pub fn new(
        activation_id: ActivationId,
        evaluation_id: EvaluationId,
        value: ObjRef,
        value_id: Option<ValueId>,
        mode: DependencyMode,
    ) -> Self {
        Dep {
            activation_id,
            evaluation_id,
            value,
            value_id,
            mode,
            sub: Vec::new(),
            arg: None,
            arg_kind: ArgKind::Argument,
        }
    }
}

/// One item of a collection literal: rendered later as a compartment.
#[derive(Clone, Debug)]
pub struct CollectedItem {
    pub key: ObjRef,
    pub value_id: Option<ValueId>,
    pub moment: Moment,
}

/// Auxiliary slots distinguishing the scope variants.
#[derive(Clone, Debug, Default)]
pub enum ScopeKind {
    #[default]
    Plain,
    /// Holds the key captured for the enclosing collection.
    Compartment { key: Option<ObjRef> },
    /// Collects `(key, member value, moment)` triples for compartments.
    Collection { items: Vec<CollectedItem> },
}

/// A dependency-aware scope. All variants share the ordered dependency list;
/// the variant only adds auxiliary slots.
#[derive(Clone, Debug, Default, Deref, DerefMut)]
pub struct Scope {
    #[deref]
    #[deref_mut]
    pub deps: Vec<Dep>,
    pub kind: ScopeKind,
}

impl Scope {
    pub fn plain() -> Self {
        Scope::default()
    }

    pub fn compartment() -> Self {
        Scope {
            deps: Vec::new(),
            kind: ScopeKind::Compartment { key: None },
        }
    }

    pub fn collection() -> Self {
        Scope {
            deps: Vec::new(),
            kind: ScopeKind::Collection { items: Vec::new() },
        }
    }

    /// Copy of this scope's dependencies with every mode replaced; used as
    /// the aggregate fallback during unpack-assignment.
    pub fn clone_with_mode(&self, mode: DependencyMode) -> Scope {
        let deps = self
            .deps
            .iter()
            .map(|dep| Dep {
                mode,
                ..dep.clone()
            })
            .collect();
        Scope {
            deps,
            kind: ScopeKind::Plain,
        }
    }

    /// Concatenation of several scopes' dependency lists.
    pub fn join(scopes: &[Scope]) -> Scope {
        let deps = scopes.iter().flat_map(|s| s.deps.iter().cloned()).collect();
        Scope {
            deps,
            kind: ScopeKind::Plain,
        }
    }

    pub fn set_key(&mut self, key: ObjRef) {
        if let ScopeKind::Compartment { key: slot } = &mut self.kind {
            *slot = Some(key);
        }
    }

    pub fn take_key(&mut self) -> Option<ObjRef> {
        match &mut self.kind {
            ScopeKind::Compartment { key } => key.take(),
            _ => None,
        }
    }

    pub fn items(&self) -> Option<&[CollectedItem]> {
        match &self.kind {
            ScopeKind::Collection { items } => Some(items),
            _ => None,
        }
    }

    pub fn push_item(&mut self, item: CollectedItem) -> bool {
        match &mut self.kind {
            ScopeKind::Collection { items } => {
                items.push(item);
                true
            }
            _ => false,
        }
    }
}
