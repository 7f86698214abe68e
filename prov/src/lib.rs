// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Execution-provenance collector.
//!
//! As a transformed script executes, it calls the hook surface ([`Hooks`],
//! implemented by [`DefaultCollector`]) at every expression and statement
//! site. The collector maintains an activation tree, per-activation
//! dependency scopes, a value interner, and a clock, and periodically drains
//! the accumulated records to a persistence collaborator ([`Machine`]).
//!
//! The engine is single-threaded and cooperative by design: guest values are
//! `Rc`-based, so the collector is neither `Send` nor `Sync`. Instrumented
//! code running on auxiliary threads is unsupported.

pub mod activation;
pub mod clock;
pub mod collector;
pub mod executor;
pub mod machine;
pub mod scope;
pub mod store;
pub mod value;

pub use activation::ROOT_NAME;
pub use collector::error::{ExecutionError, Result, UserError};
pub use collector::{
    ArgKind, Assign, AssignSource, AssignTarget, CallArgs, DefaultCollector, Hooks,
};
pub use executor::{run_script, RunOutcome};
pub use machine::{Config, Machine, Metascript};
pub use value::{ObjKind, ObjRef, ParamSpec};
