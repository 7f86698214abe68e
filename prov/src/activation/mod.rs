// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Activations: the dynamic invocations of code blocks.
//!
//! Activations are arena-allocated for the lifetime of the trial (a `Store`
//! keyed by dense ids): they outlive the span in which they are "current"
//! because later dependencies may still reference their evaluations. The
//! in-memory object carries transient runtime state (context, scope stack,
//! pending assignments, the callable being entered) next to the fields that
//! project onto the persisted row.

use std::collections::HashMap;

use prov_shared::{records, ActivationId, CodeBlockId, DependencyMode, EvaluationId, Moment};

use crate::collector::Assign;
use crate::scope::Scope;
use crate::value::ObjRef;

/// Name of the synthesised root activation.
pub const ROOT_NAME: &str = "<now>";

#[derive(Debug)]
pub struct Activation {
    pub id: ActivationId,
    pub name: String,
    pub start: Moment,
    /// Definition of the code being run; `None` until known (builtins stay
    /// unknown, defined functions fill it on entry).
    pub code_block_id: Option<CodeBlockId>,
    pub evaluation_id: EvaluationId,
    /// Lexical parent for name lookup. Defaults to the caller; function entry
    /// relinks it to the defining activation.
    pub closure: Option<ActivationId>,
    pub caller: Option<ActivationId>,

    // Transient runtime state, never persisted.
    pub context: HashMap<String, EvaluationId>,
    pub scopes: Vec<Scope>,
    pub assignments: Vec<Assign>,
    pub func: Option<ObjRef>,
    pub result_mode: DependencyMode,
}

impl Activation {
    pub fn new(
        id: ActivationId,
        name: impl Into<String>,
        start: Moment,
        code_block_id: Option<CodeBlockId>,
        evaluation_id: EvaluationId,
        caller: Option<ActivationId>,
    ) -> Self {
        Activation {
            id,
            name: name.into(),
            start,
            code_block_id,
            evaluation_id,
            closure: caller,
            caller,
            context: HashMap::new(),
            scopes: vec![Scope::plain()],
            assignments: Vec::new(),
            func: None,
            result_mode: prov_shared::mode::DEPENDENCY,
        }
    }

    pub fn row(&self) -> records::Activation {
        records::Activation {
            id: self.id,
            name: self.name.clone(),
            start: self.start,
            code_block_id: self.code_block_id,
            evaluation_id: self.evaluation_id,
            closure_id: self.closure,
            caller_id: self.caller,
        }
    }
}
