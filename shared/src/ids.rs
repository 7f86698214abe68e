// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

/// Identity of one instrumented script execution. Assigned by the persistence
/// collaborator, never by the engine.
pub type TrialId = i64;

/// Identifier of an evaluation record, monotonically assigned within a trial.
pub type EvaluationId = i64;

/// Identifier of an activation record, monotonically assigned within a trial.
pub type ActivationId = i64;

/// Identifier of a value record.
pub type ValueId = i64;

/// Identifier of a dependency record.
pub type DependencyId = i64;

/// Identifier of a code component, assigned by the definition-time analyser.
pub type CodeComponentId = i64;

/// Identifier of a code block (a function body or the script itself). Code
/// blocks share the code-component id space.
pub type CodeBlockId = i64;

/// Identifier of an exception record.
pub type ExceptionId = i64;

/// Sentinel for "no code component", e.g. synthetic global evaluations.
pub const NO_COMPONENT: CodeComponentId = -1;

/// Sentinel for "no known definition", e.g. builtin callables.
pub const NO_BLOCK: CodeBlockId = -1;

/// Sentinel owner of evaluations that happen outside any activation
/// (the root placeholder and lazily materialised globals).
pub const NO_ACTIVATION: ActivationId = -1;
