// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Shared types for the execution-provenance collector.
//!
//! This crate holds everything the engine and the persistence collaborator
//! need to agree on: identifier aliases, the moment (timestamp) type, the
//! closed set of dependency modes, the immutable record rows, and the trial
//! status state machine. The engine (the `prov` crate) produces these records;
//! the persistence layer consumes them as ordered batches.

pub mod ids;
pub mod mode;
pub mod moment;
pub mod records;
pub mod trial;

pub use ids::{
    ActivationId, CodeBlockId, CodeComponentId, DependencyId, EvaluationId, ExceptionId, TrialId,
    ValueId, NO_ACTIVATION, NO_BLOCK, NO_COMPONENT,
};
pub use mode::{DependencyMode, Relation};
pub use moment::Moment;
pub use trial::TrialStatus;
