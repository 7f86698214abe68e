// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! The hook surface.
//!
//! Transformed scripts see the collector only through [`Hooks`]: one method
//! per capture site, receiving the current activation first. Hooks are
//! semantically transparent: the "after" form of every expression hook hands
//! the computed value back unchanged.
//!
//! Paired hooks follow a before/after protocol. The before form pushes a
//! dependency-aware scope; the matching `*_after` form pops it and
//! materialises the collected dependencies. The transformer emits direct
//! calls to both, so the pairing is by construction, but the collector still
//! treats a pop of an empty stack as a fatal invariant violation.

use prov_shared::{ActivationId, CodeBlockId, CodeComponentId, DependencyMode};

pub mod assign;
pub mod default;
pub(crate) mod error;

pub use assign::{Assign, AssignSource, AssignTarget};
pub use default::DefaultCollector;
pub use error::{ExecutionError, Result, UserError};

pub use crate::scope::ArgKind;
pub use crate::value::{BodyFn, CallArgs, ObjRef, ParamSpec};

pub trait Hooks {
    /// Start script collection: the module-level activation.
    fn start_script(
        &mut self,
        module_name: &str,
        code_component_id: CodeComponentId,
    ) -> Result<ActivationId>;

    /// Close the script activation, interning the module object as its value.
    fn close_script(&mut self, activation: ActivationId) -> Result<()>;

    /// Capture a literal value.
    fn literal(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        value: ObjRef,
        mode: DependencyMode,
    ) -> Result<ObjRef>;

    /// Capture a name. `code` is `None` when the transformer marked the site
    /// as uninteresting (the "no code component" sentinel); the value then
    /// passes through uncaptured.
    fn name(
        &mut self,
        activation: ActivationId,
        code: Option<(CodeComponentId, &str)>,
        value: ObjRef,
        mode: DependencyMode,
    ) -> Result<ObjRef>;

    fn operation(&mut self, activation: ActivationId) -> Result<()>;
    fn operation_after(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        value: ObjRef,
        mode: DependencyMode,
    ) -> Result<ObjRef>;

    /// Container-base capture: stores the value as the key slot for the
    /// enclosing collection.
    fn container(&mut self, activation: ActivationId) -> Result<()>;
    fn container_after(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        value: ObjRef,
    ) -> Result<ObjRef>;

    fn dict(&mut self, activation: ActivationId) -> Result<()>;
    fn dict_after(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        value: ObjRef,
        mode: DependencyMode,
    ) -> Result<ObjRef>;

    fn dict_key(&mut self, activation: ActivationId) -> Result<()>;
    fn dict_key_after(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        value: ObjRef,
    ) -> Result<ObjRef>;

    fn dict_value(&mut self, activation: ActivationId) -> Result<()>;
    fn dict_value_after(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        value: ObjRef,
    ) -> Result<ObjRef>;

    fn list(&mut self, activation: ActivationId) -> Result<()>;
    fn tuple(&mut self, activation: ActivationId) -> Result<()>;
    fn set(&mut self, activation: ActivationId) -> Result<()>;
    /// Shared after-form of `list` / `tuple` / `set`.
    fn list_after(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        value: ObjRef,
        mode: DependencyMode,
    ) -> Result<ObjRef>;

    fn item(&mut self, activation: ActivationId) -> Result<()>;
    /// `key` is `None` for keyless collections (sets): the value is its own
    /// key.
    fn item_after(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        value: ObjRef,
        key: Option<ObjRef>,
    ) -> Result<ObjRef>;

    fn assign_value(&mut self, activation: ActivationId) -> Result<()>;
    fn assign_value_after(&mut self, activation: ActivationId, value: ObjRef) -> Result<ObjRef>;

    /// Retrieve the pending assignment recorded by `assign_value_after`.
    fn pop_assign(&mut self, activation: ActivationId) -> Result<Assign>;

    /// Walk the target tree of an assignment, creating one evaluation per
    /// bound name and wiring per-element dependencies.
    fn assign(
        &mut self,
        activation: ActivationId,
        assign: Assign,
        target: &AssignTarget,
    ) -> Result<()>;

    fn func(&mut self, activation: ActivationId) -> Result<()>;
    /// Collapse the callee scope, then start the call (see [`Hooks::call`]).
    fn func_after(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        func_code: CodeComponentId,
        func: ObjRef,
        mode: DependencyMode,
    ) -> Result<()>;

    /// Start an activation for `func`. Argument hooks fire between this and
    /// `call_after`.
    fn call(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        func: ObjRef,
        mode: DependencyMode,
    ) -> Result<()>;

    /// Invoke the callable of the current activation and close it. Runs the
    /// close sequence on every exit path; a guest exception is recorded and
    /// re-raised.
    fn call_after(&mut self, args: CallArgs) -> Result<ObjRef>;

    fn argument(&mut self, activation: ActivationId) -> Result<()>;
    /// `arg` carries the keyword name or a `*` / `**` expansion marker.
    fn argument_after(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        value: ObjRef,
        mode: Option<DependencyMode>,
        arg: Option<&str>,
        kind: ArgKind,
    ) -> Result<ObjRef>;

    /// Start collecting default-value dependencies of a function definition.
    fn function_def(&mut self, activation: ActivationId) -> Result<()>;
    /// Produce the defined function object; its evaluation lands in the
    /// enclosing scope tagged `decorate`.
    fn function_def_after(
        &mut self,
        activation: ActivationId,
        block_id: CodeBlockId,
        name: &str,
        params: ParamSpec,
        body: BodyFn,
    ) -> Result<ObjRef>;
    /// After all decorators ran: bind the function name in the defining
    /// activation's context.
    fn collect_function_def(&mut self, activation: ActivationId, name: &str) -> Result<()>;

    fn return_(&mut self, activation: ActivationId) -> Result<()>;
    fn return_after(&mut self, activation: ActivationId, value: ObjRef) -> Result<ObjRef>;
}
