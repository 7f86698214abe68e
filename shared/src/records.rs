// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Immutable record rows.
//!
//! Rows are committed to the persistence collaborator as ordered batches and
//! are serialized as tuples so a relational sink can map them onto columns
//! positionally. Identifiers are assigned by the engine, monotonically within
//! one trial; the trial id itself travels next to each batch, not inside the
//! rows.

use serde::{Deserialize, Serialize};
use serde_tuple::{Deserialize_tuple, Serialize_tuple};

use crate::ids::{
    ActivationId, CodeBlockId, CodeComponentId, DependencyId, EvaluationId, ExceptionId, ValueId,
};
use crate::mode::DependencyMode;
use crate::moment::Moment;

/// One observation of a value produced by a code component at a moment.
///
/// `moment` and `value_id` are `None` between an activation's start and its
/// close; the engine fills them when the activation's value is known.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct Evaluation {
    pub id: EvaluationId,
    pub code_component_id: CodeComponentId,
    pub activation_id: ActivationId,
    pub moment: Option<Moment>,
    pub value_id: Option<ValueId>,
}

/// One dynamic invocation of a code block.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct Activation {
    pub id: ActivationId,
    pub name: String,
    pub start: Moment,
    /// `None` when the callable has no known definition (builtins).
    pub code_block_id: Option<CodeBlockId>,
    pub evaluation_id: EvaluationId,
    pub closure_id: Option<ActivationId>,
    pub caller_id: Option<ActivationId>,
}

/// An observed runtime value. `type_id` points at the value representing the
/// object's type; the type-of-types row points at itself, so transitive type
/// lookup terminates by identity, never by null.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct Value {
    pub id: ValueId,
    pub repr: String,
    pub type_id: ValueId,
}

/// A tagged provenance edge between two evaluations.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct Dependency {
    pub id: DependencyId,
    pub dependent_activation_id: ActivationId,
    pub dependent_id: EvaluationId,
    pub dependency_activation_id: ActivationId,
    pub dependency_id: EvaluationId,
    pub mode: DependencyMode,
}

/// Time-stamped membership of a member value inside a container value at a
/// given key. Multiple rows with the same `(whole_id, name)` form the key's
/// history.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct Compartment {
    /// Rendered key, e.g. `['a']` or `[0]`.
    pub name: String,
    pub moment: Moment,
    pub whole_id: ValueId,
    pub part_id: Option<ValueId>,
}

/// Access mode of a code component.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ComponentAccess {
    Read,
    Write,
    Delete,
}

impl ComponentAccess {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentAccess::Read => "r",
            ComponentAccess::Write => "w",
            ComponentAccess::Delete => "d",
        }
    }
}

impl Serialize for ComponentAccess {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ComponentAccess {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match String::deserialize(deserializer)?.as_str() {
            "r" => Ok(ComponentAccess::Read),
            "w" => Ok(ComponentAccess::Write),
            "d" => Ok(ComponentAccess::Delete),
            other => Err(serde::de::Error::custom(format!(
                "unknown component access {other:?}"
            ))),
        }
    }
}

/// A syntactic element of the instrumented script. Created by the
/// definition-time analyser; the engine only adds synthetic `global`
/// components for names resolved from the builtins table.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct CodeComponent {
    pub id: CodeComponentId,
    pub name: String,
    pub kind: String,
    pub mode: ComponentAccess,
    pub first_line: i32,
    pub first_col: i32,
    pub last_line: i32,
    pub last_col: i32,
    pub container_id: Option<CodeComponentId>,
}

/// A guest exception recorded against the activation it escaped from.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct Exception {
    pub id: ExceptionId,
    pub exception: String,
    pub activation_id: ActivationId,
}
