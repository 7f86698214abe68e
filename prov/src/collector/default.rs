// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use anyhow::Context as _;
use once_cell::unsync::OnceCell;
use prov_shared::{
    mode, records, ActivationId, CodeBlockId, CodeComponentId, DependencyMode, EvaluationId,
    Moment, Relation, TrialStatus, ValueId, NO_ACTIVATION, NO_COMPONENT,
};

use super::assign::{Assign, AssignSource, AssignTarget};
use super::error::{ExecutionError, Result, UserError};
use super::{ArgKind, Hooks};
use crate::activation::{Activation, ROOT_NAME};
use crate::clock::Clock;
use crate::machine::{Machine, Metascript};
use crate::scope::{CollectedItem, Dep, Scope};
use crate::store::{Store, Stores};
use crate::value::{
    builtin_globals, BodyFn, CallArgs, Function, ObjKind, ObjRef, ParamSpec, TypeRegistry,
};

/// The default hook implementation.
///
/// One collector serves one trial. It owns the record buffers and the
/// activation arena; configuration and the persistence machine live in the
/// weakly referenced [`Metascript`]. Once the metascript is dropped, hooks
/// pass values through without collecting.
pub struct DefaultCollector<M: Machine> {
    pub(crate) meta: Weak<Metascript<M>>,
    pub(crate) clock: Clock,
    pub(crate) stores: Stores,
    pub(crate) activations: Store<Activation>,
    pub(crate) types: TypeRegistry,

    /// The builtins table global lookup falls back to.
    pub(crate) globals: HashMap<&'static str, ObjRef>,
    /// Lazily materialised evaluations for global names.
    pub(crate) global_evaluations: HashMap<String, EvaluationId>,
    /// Value ids shared by all instances of a type, keyed by type identity.
    pub(crate) shared_types: HashMap<usize, ValueId>,
    pub(crate) type_root_id: OnceCell<ValueId>,

    pub(crate) first_activation: ActivationId,
    pub(crate) last_activation: ActivationId,

    pub(crate) save_frequency: Option<Duration>,
    pub(crate) last_partial_save: Moment,
    pub(crate) partial_saves: u64,
}

/// The bind rule's value lookup: if a dependency in `depa` references the
/// observed object by identity, reuse its value id and rewrite its mode. For
/// immutable values only the single-dependency case qualifies.
fn bind_value_id(value: &ObjRef, depa: Option<&mut Scope>) -> Option<ValueId> {
    let depa = depa?;
    if value.is_immutable() && depa.len() != 1 {
        return None;
    }
    for dep in depa.iter_mut() {
        if dep.value.is(value) {
            dep.mode = dep.mode.rebind();
            return dep.value_id;
        }
    }
    None
}

impl<M: Machine> DefaultCollector<M> {
    pub fn new(meta: &Rc<Metascript<M>>) -> Self {
        let clock = Clock::new();
        let save_frequency = match meta.config().save_frequency {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        let mut stores = Stores::new();
        let mut activations = Store::new();
        // The synthetic root: a placeholder evaluation wrapped in the `<now>`
        // activation, allocated dry so neither is ever persisted.
        let root_eval = stores.evaluations.dry_add(|id| records::Evaluation {
            id,
            code_component_id: NO_COMPONENT,
            activation_id: NO_ACTIVATION,
            moment: None,
            value_id: None,
        });
        let start = clock.now();
        let first_activation =
            activations.dry_add(|id| Activation::new(id, ROOT_NAME, start, None, root_eval, None));

        let last_partial_save = clock.now();
        DefaultCollector {
            meta: Rc::downgrade(meta),
            clock,
            stores,
            activations,
            types: TypeRegistry::new(),
            globals: builtin_globals(),
            global_evaluations: HashMap::new(),
            shared_types: HashMap::new(),
            type_root_id: OnceCell::new(),
            first_activation,
            last_activation: first_activation,
            save_frequency,
            last_partial_save,
            partial_saves: 0,
        }
    }

    /// Whether the owning metascript is still alive. Hook entry is a
    /// value-transparent no-op once it is gone.
    pub fn alive(&self) -> bool {
        self.meta.strong_count() > 0
    }

    /// Current moment. Also the partial-flush suspension point: if the
    /// configured interval elapsed, all buffers are drained before returning.
    /// Flushes happen only here, never mid-update of the scope stack.
    pub fn now(&mut self) -> Result<Moment> {
        let moment = self.clock.now();
        if let Some(frequency) = self.save_frequency {
            if moment.elapsed_since(self.last_partial_save) > frequency {
                self.store(true, TrialStatus::Running)?;
            }
        }
        Ok(moment)
    }

    /// Drain every buffer to the persistence machine. A non-partial store
    /// additionally issues the final trial update.
    pub fn store(&mut self, partial: bool, status: TrialStatus) -> Result<()> {
        let Some(meta) = self.meta.upgrade() else {
            return Ok(());
        };
        let trial = meta.config().trial_id;
        {
            let mut machine = meta.machine_mut();
            self.stores
                .code_components
                .drain_into(|rows| machine.persist_code_components(trial, rows))
                .context("failed to persist code components")?;
            self.stores
                .evaluations
                .drain_into(|rows| machine.persist_evaluations(trial, rows))
                .context("failed to persist evaluations")?;
            self.activations
                .drain_map_into(Activation::row, |rows| {
                    machine.persist_activations(trial, rows)
                })
                .context("failed to persist activations")?;
            self.stores
                .dependencies
                .drain_into(|rows| machine.persist_dependencies(trial, rows))
                .context("failed to persist dependencies")?;
            self.stores
                .values
                .drain_into(|rows| machine.persist_values(trial, rows))
                .context("failed to persist values")?;
            self.stores
                .compartments
                .drain_into(|rows| machine.persist_compartments(trial, rows))
                .context("failed to persist compartments")?;
            self.stores
                .exceptions
                .drain_into(|rows| machine.persist_exceptions(trial, rows))
                .context("failed to persist exceptions")?;
        }

        let now = self.clock.now();
        if !partial {
            meta.machine_mut()
                .update_trial(trial, meta.config().main_id, now, status)
                .context("failed to update trial")?;
            log::debug!("trial {trial} stored as {status}");
        } else {
            self.partial_saves += 1;
            log::trace!("partial save #{} of trial {trial}", self.partial_saves);
        }
        self.last_partial_save = now;
        Ok(())
    }

    /// Number of partial flushes performed so far.
    pub fn partial_saves(&self) -> u64 {
        self.partial_saves
    }

    /// Boundary for the definition-time analyser: registers a code component
    /// and returns its id.
    #[allow(clippy::too_many_arguments)]
    pub fn register_code_component(
        &mut self,
        name: &str,
        kind: &str,
        mode: records::ComponentAccess,
        first_line: i32,
        first_col: i32,
        last_line: i32,
        last_col: i32,
        container_id: Option<CodeComponentId>,
    ) -> CodeComponentId {
        self.stores.code_components.add_with(|id| records::CodeComponent {
            id,
            name: name.to_owned(),
            kind: kind.to_owned(),
            mode,
            first_line,
            first_col,
            last_line,
            last_col,
            container_id,
        })
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn activation(&self, id: ActivationId) -> Option<&Activation> {
        self.activations.get(id)
    }

    pub fn last_activation(&self) -> ActivationId {
        self.last_activation
    }

    pub fn root_activation(&self) -> ActivationId {
        self.first_activation
    }

    /// The builtin object bound to `name`, if any.
    pub fn global(&self, name: &str) -> Option<ObjRef> {
        self.globals.get(name).cloned()
    }

    pub(crate) fn activation_ref(&self, id: ActivationId) -> Result<&Activation> {
        self.activations
            .get(id)
            .ok_or_else(|| ExecutionError::invariant(format!("unknown activation {id}")))
    }

    pub(crate) fn activation_mut(&mut self, id: ActivationId) -> Result<&mut Activation> {
        self.activations
            .get_mut(id)
            .ok_or_else(|| ExecutionError::invariant(format!("unknown activation {id}")))
    }

    fn push_scope(&mut self, activation: ActivationId, scope: Scope) -> Result<()> {
        self.activation_mut(activation)?.scopes.push(scope);
        Ok(())
    }

    fn pop_scope(&mut self, activation: ActivationId) -> Result<Scope> {
        self.activation_mut(activation)?
            .scopes
            .pop()
            .ok_or_else(|| ExecutionError::invariant("scope stack empty on pop"))
    }

    fn top_scope_mut(&mut self, activation: ActivationId) -> Result<&mut Scope> {
        self.activation_mut(activation)?
            .scopes
            .last_mut()
            .ok_or_else(|| ExecutionError::invariant("scope stack empty"))
    }

    fn evaluation_value_id(&self, id: EvaluationId) -> Option<ValueId> {
        self.stores.evaluations.get(id).and_then(|e| e.value_id)
    }

    /// Intern a value observation. Types are cached by identity and shared
    /// across instances; instance values are deliberately *not* interned, so
    /// successive observations of the same object stay distinguishable.
    pub fn intern_value(&mut self, value: &ObjRef) -> ValueId {
        if self.types.is_root(value) {
            // The self-typed root is allocated once per trial.
            if let Some(&id) = self.type_root_id.get() {
                return id;
            }
            let id = self.stores.values.add_with(|id| records::Value {
                id,
                repr: value.repr(),
                type_id: id,
            });
            self.shared_types.insert(value.identity(), id);
            let _ = self.type_root_id.set(id);
            return id;
        }
        let type_obj = self.types.type_of(value);
        let type_id = match self.shared_types.get(&type_obj.identity()) {
            Some(&id) => id,
            None => {
                let id = self.intern_value(&type_obj);
                self.shared_types.insert(type_obj.identity(), id);
                id
            }
        };
        self.stores.values.add_with(|id| records::Value {
            id,
            repr: value.repr(),
            type_id,
        })
    }

    /// Walk the closure chain, then process-wide globals, then the builtins
    /// table. A builtin hit lazily materialises a synthetic `global` code
    /// component and evaluation, cached for the rest of the trial. `None` is
    /// the unknown-name sentinel; callers fall back to interning fresh.
    pub fn lookup(&mut self, activation: ActivationId, name: &str) -> Result<Option<EvaluationId>> {
        let mut cursor = Some(activation);
        while let Some(id) = cursor {
            let act = self.activation_ref(id)?;
            if let Some(&evaluation) = act.context.get(name) {
                return Ok(Some(evaluation));
            }
            cursor = act.closure;
        }
        if let Some(&evaluation) = self.global_evaluations.get(name) {
            return Ok(Some(evaluation));
        }
        if let Some(object) = self.globals.get(name).cloned() {
            let component = self.stores.code_components.add_with(|id| records::CodeComponent {
                id,
                name: name.to_owned(),
                kind: "global".to_owned(),
                mode: records::ComponentAccess::Write,
                first_line: -1,
                first_col: -1,
                last_line: -1,
                last_col: -1,
                container_id: None,
            });
            let moment = self.now()?;
            let value_id = self.intern_value(&object);
            let evaluation = self.stores.evaluations.add_with(|id| records::Evaluation {
                id,
                code_component_id: component,
                activation_id: NO_ACTIVATION,
                moment: Some(moment),
                value_id: Some(value_id),
            });
            self.global_evaluations.insert(name.to_owned(), evaluation);
            return Ok(Some(evaluation));
        }
        Ok(None)
    }

    /// Start a new activation under `parent`. Its evaluation is created with
    /// placeholder moment and value, filled at close.
    pub fn start_activation(
        &mut self,
        name: &str,
        code_component_id: CodeComponentId,
        definition_id: Option<CodeBlockId>,
        parent: ActivationId,
    ) -> Result<ActivationId> {
        let evaluation = self.stores.evaluations.add_with(|id| records::Evaluation {
            id,
            code_component_id,
            activation_id: parent,
            moment: None,
            value_id: None,
        });
        let start = self.now()?;
        let activation = self.activations.add_with(|id| {
            Activation::new(id, name, start, definition_id, evaluation, Some(parent))
        });
        self.last_activation = activation;
        log::trace!("activation {activation} started ({name})");
        Ok(activation)
    }

    /// Close an activation: fill its evaluation's moment and value, then pop
    /// `last_activation` back to the caller, falling back to the root.
    pub fn close_activation(&mut self, activation: ActivationId, value_id: ValueId) -> Result<()> {
        let moment = self.now()?;
        let evaluation = self.activation_ref(activation)?.evaluation_id;
        let parent = {
            let row = self
                .stores
                .evaluations
                .get_mut(evaluation)
                .ok_or_else(|| ExecutionError::invariant("activation without evaluation"))?;
            row.moment = Some(moment);
            row.value_id = Some(value_id);
            row.activation_id
        };
        self.last_activation = if self.activations.get(parent).is_some() {
            parent
        } else {
            self.first_activation
        };
        log::trace!("activation {activation} closed");
        Ok(())
    }

    /// Record a guest exception against an activation.
    pub fn collect_exception(&mut self, activation: ActivationId, error: &UserError) {
        self.stores.exceptions.add_with(|id| records::Exception {
            id,
            exception: error.to_string(),
            activation_id: activation,
        });
    }

    /// Create an evaluation for a code component, resolving its value id
    /// through the bind rule and wiring the collected dependencies.
    pub(crate) fn evaluate(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        value: &ObjRef,
        moment: Option<Moment>,
        mut depa: Option<&mut Scope>,
    ) -> Result<EvaluationId> {
        let moment = match moment {
            Some(moment) => moment,
            None => self.now()?,
        };
        let value_id = match bind_value_id(value, depa.as_deref_mut()) {
            Some(id) => id,
            None => self.intern_value(value),
        };
        let evaluation = self.stores.evaluations.add_with(|id| records::Evaluation {
            id,
            code_component_id: code,
            activation_id: activation,
            moment: Some(moment),
            value_id: Some(value_id),
        });
        if let Some(depa) = depa {
            self.create_dependencies(activation, evaluation, depa);
        }
        Ok(evaluation)
    }

    /// Materialise every dependency of `depa` as an edge out of the given
    /// evaluation.
    pub(crate) fn create_dependencies(
        &mut self,
        dependent_activation: ActivationId,
        dependent: EvaluationId,
        depa: &Scope,
    ) {
        for dep in depa.iter() {
            self.stores.dependencies.add_with(|id| records::Dependency {
                id,
                dependent_activation_id: dependent_activation,
                dependent_id: dependent,
                dependency_activation_id: dep.activation_id,
                dependency_id: dep.evaluation_id,
                mode: dep.mode,
            });
        }
    }

    /// For calls without a known definition: make the call's evaluation
    /// transitively depend on each collected argument.
    pub(crate) fn create_argument_dependencies(
        &mut self,
        dependent_activation: ActivationId,
        dependent: EvaluationId,
        depa: &Scope,
    ) {
        for dep in depa.iter().filter(|d| d.mode.relation == Relation::Argument) {
            self.stores.dependencies.add_with(|id| records::Dependency {
                id,
                dependent_activation_id: dependent_activation,
                dependent_id: dependent,
                dependency_activation_id: dep.activation_id,
                dependency_id: dep.evaluation_id,
                mode: mode::DEPENDENCY,
            });
        }
    }

    /// Search every scope of `activation` for a dependency on the result
    /// object, applying the bind rewrite on the first identity hit per scope.
    fn find_result_value_id(&mut self, activation: ActivationId, value: &ObjRef) -> Option<ValueId> {
        let scopes = self.activations.get(activation)?.scopes.len();
        for index in 0..scopes {
            let mut scope = std::mem::take(&mut self.activations.get_mut(activation)?.scopes[index]);
            let found = bind_value_id(value, Some(&mut scope));
            self.activations.get_mut(activation)?.scopes[index] = scope;
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Run the callable bound to `activation`. Defined functions get their
    /// closure and code block linked and their parameters matched before the
    /// body runs; builtins are invoked directly.
    fn invoke(&mut self, activation: ActivationId, func: ObjRef, args: &CallArgs) -> Result<ObjRef> {
        match func.kind() {
            ObjKind::Builtin(builtin) => (builtin.call)(args).map_err(ExecutionError::from),
            ObjKind::Function(function) => {
                let Function {
                    closure,
                    block_id,
                    params,
                    defaults,
                    body,
                    ..
                } = function.clone();
                {
                    let act = self.activation_mut(activation)?;
                    act.closure = Some(closure);
                    act.code_block_id = Some(block_id);
                }
                self.match_arguments(activation, &params, &defaults)?;
                body(self, activation, args)
            }
            _ => Err(UserError::type_error(format!(
                "{} object is not callable",
                func.repr()
            ))
            .into()),
        }
    }
}

impl<M: Machine> Hooks for DefaultCollector<M> {
    fn start_script(
        &mut self,
        module_name: &str,
        code_component_id: CodeComponentId,
    ) -> Result<ActivationId> {
        if !self.alive() {
            return Ok(self.last_activation);
        }
        log::debug!("script collection started ({module_name})");
        self.start_activation(
            module_name,
            code_component_id,
            Some(code_component_id),
            self.last_activation,
        )
    }

    fn close_script(&mut self, activation: ActivationId) -> Result<()> {
        if !self.alive() {
            return Ok(());
        }
        let module = ObjRef::module(self.activation_ref(activation)?.name.clone());
        let value_id = self.intern_value(&module);
        self.close_activation(activation, value_id)
    }

    fn literal(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        value: ObjRef,
        mode: DependencyMode,
    ) -> Result<ObjRef> {
        if !self.alive() {
            return Ok(value);
        }
        let value_id = self.intern_value(&value);
        let moment = self.now()?;
        let evaluation = self.stores.evaluations.add_with(|id| records::Evaluation {
            id,
            code_component_id: code,
            activation_id: activation,
            moment: Some(moment),
            value_id: Some(value_id),
        });
        let dep = Dep::new(activation, evaluation, value.clone(), Some(value_id), mode);
        self.top_scope_mut(activation)?.push(dep);
        Ok(value)
    }

    fn name(
        &mut self,
        activation: ActivationId,
        code: Option<(CodeComponentId, &str)>,
        value: ObjRef,
        mode: DependencyMode,
    ) -> Result<ObjRef> {
        if !self.alive() {
            return Ok(value);
        }
        let Some((code, name)) = code else {
            // No code component: the site is not captured.
            return Ok(value);
        };
        let old = self.lookup(activation, name)?;
        let value_id = match old {
            Some(evaluation) => self.evaluation_value_id(evaluation),
            None => Some(self.intern_value(&value)),
        };
        let moment = self.now()?;
        let evaluation = self.stores.evaluations.add_with(|id| records::Evaluation {
            id,
            code_component_id: code,
            activation_id: activation,
            moment: Some(moment),
            value_id,
        });
        self.top_scope_mut(activation)?
            .push(Dep::new(activation, evaluation, value.clone(), value_id, mode));

        if let Some(old) = old {
            let old_activation = self
                .stores
                .evaluations
                .get(old)
                .map(|e| e.activation_id)
                .unwrap_or(NO_ACTIVATION);
            self.stores.dependencies.add_with(|id| records::Dependency {
                id,
                dependent_activation_id: activation,
                dependent_id: evaluation,
                dependency_activation_id: old_activation,
                dependency_id: old,
                mode: mode::ASSIGNMENT,
            });
        }
        Ok(value)
    }

    fn operation(&mut self, activation: ActivationId) -> Result<()> {
        if !self.alive() {
            return Ok(());
        }
        self.push_scope(activation, Scope::plain())
    }

    fn operation_after(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        value: ObjRef,
        mode: DependencyMode,
    ) -> Result<ObjRef> {
        if !self.alive() {
            return Ok(value);
        }
        let mut depa = self.pop_scope(activation)?;
        let evaluation = self.evaluate(activation, code, &value, None, Some(&mut depa))?;
        let value_id = self.evaluation_value_id(evaluation);
        self.top_scope_mut(activation)?
            .push(Dep::new(activation, evaluation, value.clone(), value_id, mode));
        Ok(value)
    }

    fn container(&mut self, activation: ActivationId) -> Result<()> {
        if !self.alive() {
            return Ok(());
        }
        self.push_scope(activation, Scope::compartment())
    }

    fn container_after(
        &mut self,
        activation: ActivationId,
        _code: CodeComponentId,
        value: ObjRef,
    ) -> Result<ObjRef> {
        if !self.alive() {
            return Ok(value);
        }
        self.top_scope_mut(activation)?.set_key(value.clone());
        Ok(value)
    }

    fn dict(&mut self, activation: ActivationId) -> Result<()> {
        if !self.alive() {
            return Ok(());
        }
        self.push_scope(activation, Scope::collection())
    }

    fn dict_after(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        value: ObjRef,
        mode: DependencyMode,
    ) -> Result<ObjRef> {
        if !self.alive() {
            return Ok(value);
        }
        let mut depa = self.pop_scope(activation)?;
        let evaluation = self.evaluate(activation, code, &value, None, Some(&mut depa))?;
        let whole_id = self.evaluation_value_id(evaluation);
        if let (Some(items), Some(whole_id)) = (depa.items(), whole_id) {
            for item in items {
                let name = format!("[{}]", item.key.repr());
                let (moment, part_id) = (item.moment, item.value_id);
                self.stores.compartments.add_with(|_| records::Compartment {
                    name,
                    moment,
                    whole_id,
                    part_id,
                });
            }
        }
        self.top_scope_mut(activation)?
            .push(Dep::new(activation, evaluation, value.clone(), whole_id, mode));
        Ok(value)
    }

    fn dict_key(&mut self, activation: ActivationId) -> Result<()> {
        self.container(activation)
    }

    fn dict_key_after(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        value: ObjRef,
    ) -> Result<ObjRef> {
        self.container_after(activation, code, value)
    }

    fn dict_value(&mut self, activation: ActivationId) -> Result<()> {
        if !self.alive() {
            return Ok(());
        }
        self.push_scope(activation, Scope::plain())
    }

    fn dict_value_after(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        value: ObjRef,
    ) -> Result<ObjRef> {
        if !self.alive() {
            return Ok(value);
        }
        let mut value_depa = self.pop_scope(activation)?;
        let mut comp_depa = self.pop_scope(activation)?;
        // Bind against the value scope before merging so the rewritten modes
        // reach the merged dependency set.
        let value_id = match bind_value_id(&value, Some(&mut value_depa)) {
            Some(id) => id,
            None => self.intern_value(&value),
        };
        comp_depa.deps.extend(value_depa.deps.iter().cloned());
        let moment = self.now()?;
        let evaluation = self.stores.evaluations.add_with(|id| records::Evaluation {
            id,
            code_component_id: code,
            activation_id: activation,
            moment: Some(moment),
            value_id: Some(value_id),
        });
        self.create_dependencies(activation, evaluation, &comp_depa);
        let key = comp_depa.take_key().unwrap_or_else(ObjRef::none);
        let top = self.top_scope_mut(activation)?;
        top.push(Dep::new(
            activation,
            evaluation,
            value.clone(),
            Some(value_id),
            mode::ITEM,
        ));
        top.push_item(CollectedItem {
            key,
            value_id: Some(value_id),
            moment,
        });
        Ok(value)
    }

    fn list(&mut self, activation: ActivationId) -> Result<()> {
        if !self.alive() {
            return Ok(());
        }
        self.push_scope(activation, Scope::collection())
    }

    fn tuple(&mut self, activation: ActivationId) -> Result<()> {
        self.list(activation)
    }

    fn set(&mut self, activation: ActivationId) -> Result<()> {
        self.list(activation)
    }

    fn list_after(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        value: ObjRef,
        mode: DependencyMode,
    ) -> Result<ObjRef> {
        if !self.alive() {
            return Ok(value);
        }
        let mut depa = self.pop_scope(activation)?;
        let evaluation = self.evaluate(activation, code, &value, None, Some(&mut depa))?;
        let whole_id = self.evaluation_value_id(evaluation);
        if let (Some(items), Some(whole_id)) = (depa.items(), whole_id) {
            for item in items {
                let name = format!("[{}]", item.key.repr());
                let (moment, part_id) = (item.moment, item.value_id);
                self.stores.compartments.add_with(|_| records::Compartment {
                    name,
                    moment,
                    whole_id,
                    part_id,
                });
            }
        }
        // Element dependencies ride along for unpack-assignment.
        let mut dep = Dep::new(activation, evaluation, value.clone(), whole_id, mode);
        dep.sub = depa.deps.clone();
        self.top_scope_mut(activation)?.push(dep);
        Ok(value)
    }

    fn item(&mut self, activation: ActivationId) -> Result<()> {
        if !self.alive() {
            return Ok(());
        }
        self.push_scope(activation, Scope::plain())
    }

    fn item_after(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        value: ObjRef,
        key: Option<ObjRef>,
    ) -> Result<ObjRef> {
        if !self.alive() {
            return Ok(value);
        }
        let key = key.unwrap_or_else(|| value.clone());
        let mut depa = self.pop_scope(activation)?;
        let dep = if depa.len() == 1 {
            depa.deps.remove(0)
        } else {
            let value_id = match bind_value_id(&value, Some(&mut depa)) {
                Some(id) => id,
                None => self.intern_value(&value),
            };
            let moment = self.now()?;
            let evaluation = self.stores.evaluations.add_with(|id| records::Evaluation {
                id,
                code_component_id: code,
                activation_id: activation,
                moment: Some(moment),
                value_id: Some(value_id),
            });
            self.create_dependencies(activation, evaluation, &depa);
            Dep::new(activation, evaluation, value.clone(), Some(value_id), mode::ITEM)
        };
        let value_id = dep.value_id;
        let moment = self.now()?;
        let top = self.top_scope_mut(activation)?;
        top.push(dep);
        top.push_item(CollectedItem {
            key,
            value_id,
            moment,
        });
        Ok(value)
    }

    fn assign_value(&mut self, activation: ActivationId) -> Result<()> {
        if !self.alive() {
            return Ok(());
        }
        self.push_scope(activation, Scope::plain())
    }

    fn assign_value_after(&mut self, activation: ActivationId, value: ObjRef) -> Result<ObjRef> {
        if !self.alive() {
            return Ok(value);
        }
        let depa = self.pop_scope(activation)?;
        let moment = self.now()?;
        self.activation_mut(activation)?.assignments.push(Assign {
            moment,
            value: value.clone(),
            source: AssignSource::Collected(depa),
        });
        Ok(value)
    }

    fn pop_assign(&mut self, activation: ActivationId) -> Result<Assign> {
        if !self.alive() {
            return Ok(Assign {
                moment: self.clock.now(),
                value: ObjRef::none(),
                source: AssignSource::Collected(Scope::plain()),
            });
        }
        self.activation_mut(activation)?
            .assignments
            .pop()
            .ok_or_else(|| ExecutionError::invariant("no pending assignment"))
    }

    fn assign(
        &mut self,
        activation: ActivationId,
        assign: Assign,
        target: &AssignTarget,
    ) -> Result<()> {
        if !self.alive() {
            return Ok(());
        }
        let Assign {
            moment,
            value,
            source,
        } = assign;
        self.assign_inner(activation, moment, &value, source, target)
            .map(|_| ())
    }

    fn func(&mut self, activation: ActivationId) -> Result<()> {
        if !self.alive() {
            return Ok(());
        }
        self.push_scope(activation, Scope::plain())
    }

    fn func_after(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        func_code: CodeComponentId,
        func: ObjRef,
        mode: DependencyMode,
    ) -> Result<()> {
        if !self.alive() {
            return Ok(());
        }
        let mut depa = self.pop_scope(activation)?;
        let dependency = if depa.len() == 1 {
            depa.deps.remove(0)
        } else {
            let moment = self.now()?;
            let evaluation = self.evaluate(activation, func_code, &func, Some(moment), Some(&mut depa))?;
            let value_id = self.evaluation_value_id(evaluation);
            Dep::new(activation, evaluation, func.clone(), value_id, mode::FUNC)
        };
        self.call(activation, code, func, mode)?;
        let callee = self.last_activation;
        self.top_scope_mut(callee)?.push(dependency);
        Ok(())
    }

    fn call(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        func: ObjRef,
        mode: DependencyMode,
    ) -> Result<()> {
        if !self.alive() {
            return Ok(());
        }
        let name = func.callable_name();
        let callee = self.start_activation(&name, code, None, activation)?;
        let act = self.activation_mut(callee)?;
        act.func = Some(func);
        act.result_mode = mode;
        Ok(())
    }

    fn call_after(&mut self, args: CallArgs) -> Result<ObjRef> {
        let activation = self.last_activation;
        if !self.alive() {
            // The engine is gone but guest semantics must hold: run any
            // callable that was already entered, without collecting.
            if let Some(func) = self.activation(activation).and_then(|a| a.func.clone()) {
                return self.invoke(activation, func, &args);
            }
            return Ok(ObjRef::none());
        }
        let func = self
            .activation_mut(activation)?
            .func
            .take()
            .ok_or_else(|| ExecutionError::invariant("call_after without a pending call"))?;
        let evaluation = self.activation_ref(activation)?.evaluation_id;
        let caller = self
            .stores
            .evaluations
            .get(evaluation)
            .map(|e| e.activation_id)
            .unwrap_or(NO_ACTIVATION);

        let result = self.invoke(activation, func, &args);
        if let Some(user) = result.as_ref().err().and_then(ExecutionError::raised) {
            self.collect_exception(activation, user);
        }

        // Guaranteed cleanup: find the result's value through the bind rule,
        // close the activation, and wire the call's dependencies, on every
        // exit path.
        let observed = match &result {
            Ok(value) => value.clone(),
            Err(_) => ObjRef::none(),
        };
        let value_id = match self.find_result_value_id(activation, &observed) {
            Some(id) => id,
            None => self.intern_value(&observed),
        };
        let closed = self.close_activation(activation, value_id);

        let call_scope = {
            let act = self.activation_mut(activation)?;
            if act.scopes.is_empty() {
                return Err(ExecutionError::invariant("activation lost its call scope"));
            }
            std::mem::take(&mut act.scopes[0])
        };
        self.create_dependencies(caller, evaluation, &call_scope);
        if self.activation_ref(activation)?.code_block_id.is_none() {
            self.create_argument_dependencies(caller, evaluation, &call_scope);
        }
        self.activation_mut(activation)?.scopes[0] = call_scope;

        if let Err(store_failure) = closed {
            match result {
                // A storage failure must not mask the guest exception.
                Err(guest) => {
                    log::error!("storage failure during close suppressed: {store_failure}");
                    return Err(guest);
                }
                Ok(_) => return Err(store_failure),
            }
        }
        let result = result?;

        let fresh_id = self.intern_value(&result);
        let result_mode = self.activation_ref(activation)?.result_mode;
        let enclosing = self.last_activation;
        self.top_scope_mut(enclosing)?.push(Dep::new(
            caller,
            evaluation,
            result.clone(),
            Some(fresh_id),
            result_mode,
        ));
        Ok(result)
    }

    fn argument(&mut self, activation: ActivationId) -> Result<()> {
        if !self.alive() {
            return Ok(());
        }
        self.push_scope(activation, Scope::plain())
    }

    fn argument_after(
        &mut self,
        activation: ActivationId,
        code: CodeComponentId,
        value: ObjRef,
        mode: Option<DependencyMode>,
        arg: Option<&str>,
        kind: ArgKind,
    ) -> Result<ObjRef> {
        if !self.alive() {
            return Ok(value);
        }
        let mode = mode.unwrap_or(mode::ARGUMENT);
        let mut depa = self.pop_scope(activation)?;
        let mut dependency = if depa.len() == 1 {
            depa.deps.remove(0)
        } else {
            let moment = self.now()?;
            let evaluation = self.evaluate(activation, code, &value, Some(moment), Some(&mut depa))?;
            let value_id = self.evaluation_value_id(evaluation);
            Dep::new(activation, evaluation, value.clone(), value_id, mode)
        };
        dependency.arg = arg.map(str::to_owned);
        dependency.arg_kind = kind;
        let callee = self.last_activation;
        self.top_scope_mut(callee)?.push(dependency);
        Ok(value)
    }

    fn function_def(&mut self, activation: ActivationId) -> Result<()> {
        if !self.alive() {
            return Ok(());
        }
        self.push_scope(activation, Scope::plain())
    }

    fn function_def_after(
        &mut self,
        activation: ActivationId,
        block_id: CodeBlockId,
        name: &str,
        params: ParamSpec,
        body: BodyFn,
    ) -> Result<ObjRef> {
        if !self.alive() {
            // Still hand back a callable function object.
            return Ok(ObjRef::function(Function {
                name: name.to_owned(),
                block_id,
                closure: activation,
                params,
                defaults: Vec::new(),
                body,
            }));
        }
        let defaults = self.pop_scope(activation)?;
        let func = ObjRef::function(Function {
            name: name.to_owned(),
            block_id,
            closure: activation,
            params,
            defaults: defaults.deps,
            body,
        });
        self.push_scope(activation, Scope::plain())?;
        let moment = self.now()?;
        let evaluation = self.evaluate(activation, block_id, &func, Some(moment), None)?;
        let value_id = self.evaluation_value_id(evaluation);
        self.top_scope_mut(activation)?.push(Dep::new(
            activation,
            evaluation,
            func.clone(),
            value_id,
            mode::DECORATE,
        ));
        Ok(func)
    }

    fn collect_function_def(&mut self, activation: ActivationId, name: &str) -> Result<()> {
        if !self.alive() {
            return Ok(());
        }
        let mut depa = self.pop_scope(activation)?;
        let dependency = depa
            .deps
            .pop()
            .ok_or_else(|| ExecutionError::invariant("function definition left no dependency"))?;
        self.activation_mut(activation)?
            .context
            .insert(name.to_owned(), dependency.evaluation_id);
        Ok(())
    }

    fn return_(&mut self, activation: ActivationId) -> Result<()> {
        if !self.alive() {
            return Ok(());
        }
        self.push_scope(activation, Scope::plain())
    }

    fn return_after(&mut self, activation: ActivationId, value: ObjRef) -> Result<ObjRef> {
        if !self.alive() {
            return Ok(value);
        }
        let depa = self.pop_scope(activation)?;
        let evaluation = self.activation_ref(activation)?.evaluation_id;
        let owner = self
            .stores
            .evaluations
            .get(evaluation)
            .map(|e| e.activation_id)
            .unwrap_or(NO_ACTIVATION);
        self.create_dependencies(owner, evaluation, &depa);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use pretty_assertions::assert_eq;
    use prov_shared::records::ComponentAccess;

    use super::*;
    use crate::machine::{Config, MemoryMachine, Metascript};

    fn harness() -> (Rc<Metascript<MemoryMachine>>, DefaultCollector<MemoryMachine>) {
        let meta = Rc::new(Metascript::new(Config::new(1), MemoryMachine::new()));
        let collector = DefaultCollector::new(&meta);
        (meta, collector)
    }

    fn script(collector: &mut DefaultCollector<MemoryMachine>) -> ActivationId {
        let main = collector.register_code_component(
            "script",
            "script",
            ComponentAccess::Read,
            1,
            0,
            1,
            0,
            None,
        );
        collector.start_script("script", main).unwrap()
    }

    #[test]
    fn interner_shares_types_but_not_instances() {
        let (_meta, mut collector) = harness();
        let a = ObjRef::int(1);
        let b = ObjRef::int(1);
        let id_a = collector.intern_value(&a);
        let id_b = collector.intern_value(&b);
        assert_ne!(id_a, id_b, "instance observations must stay distinct");

        let row_a = collector.stores().values.get(id_a).unwrap().clone();
        let row_b = collector.stores().values.get(id_b).unwrap().clone();
        assert_eq!(row_a.type_id, row_b.type_id, "type value is shared");

        // The type chain terminates on the self-typed root.
        let int_type = collector.stores().values.get(row_a.type_id).unwrap().clone();
        let root = collector.stores().values.get(int_type.type_id).unwrap().clone();
        assert_eq!(root.id, root.type_id);
        assert_eq!(root.repr, "<class 'type'>");
    }

    #[test]
    fn interning_the_root_twice_reuses_the_row() {
        let (_meta, mut collector) = harness();
        let root = collector.types.root().clone();
        let first = collector.intern_value(&root);
        let second = collector.intern_value(&root);
        assert_eq!(first, second);
    }

    #[test]
    fn lookup_materialises_builtin_globals_once() {
        let (_meta, mut collector) = harness();
        let act = script(&mut collector);
        let first = collector.lookup(act, "len").unwrap().unwrap();
        let second = collector.lookup(act, "len").unwrap().unwrap();
        assert_eq!(first, second);
        let component = collector
            .stores()
            .code_components
            .iter()
            .find(|c| c.kind == "global")
            .unwrap();
        assert_eq!(component.name, "len");
        assert_eq!(component.first_line, -1);
        assert!(collector.lookup(act, "no_such_name").unwrap().is_none());
    }

    #[test]
    fn scope_stack_is_conserved_across_hook_pairs() {
        let (_meta, mut collector) = harness();
        let act = script(&mut collector);
        let code = collector.register_code_component(
            "x + y",
            "operation",
            ComponentAccess::Read,
            1,
            0,
            1,
            5,
            None,
        );
        let before = collector.activation(act).unwrap().scopes.len();
        collector.operation(act).unwrap();
        assert_eq!(collector.activation(act).unwrap().scopes.len(), before + 1);
        collector
            .operation_after(act, code, ObjRef::int(3), mode::DEPENDENCY)
            .unwrap();
        assert_eq!(collector.activation(act).unwrap().scopes.len(), before);
    }

    #[test]
    fn bind_rule_rewrites_the_antecedent_mode() {
        let (_meta, mut collector) = harness();
        let act = script(&mut collector);
        let c_lit = collector.register_code_component(
            "5",
            "literal",
            ComponentAccess::Read,
            1,
            0,
            1,
            1,
            None,
        );
        let c_op = collector.register_code_component(
            "(5)",
            "operation",
            ComponentAccess::Read,
            1,
            0,
            1,
            3,
            None,
        );
        collector.operation(act).unwrap();
        let five = collector
            .literal(act, c_lit, ObjRef::int(5), mode::DEPENDENCY)
            .unwrap();
        let lit_value = collector
            .stores()
            .evaluations
            .iter()
            .last()
            .unwrap()
            .value_id;
        // The operation observes the same object: the literal's value id is
        // reused and its dependency mode rewritten to assign.
        collector
            .operation_after(act, c_op, five, mode::DEPENDENCY)
            .unwrap();
        let edge = collector.stores().dependencies.iter().last().unwrap();
        assert_eq!(edge.mode, mode::ASSIGN);
        let op_eval = collector.stores().evaluations.iter().last().unwrap();
        assert_eq!(op_eval.value_id, lit_value);
    }

    #[test]
    fn popping_an_exhausted_scope_stack_is_fatal() {
        let (_meta, mut collector) = harness();
        let act = script(&mut collector);
        // The only scope is the initial one; a stray after-hook drains it and
        // the next resolution step trips the invariant.
        let err = collector
            .operation_after(act, 0, ObjRef::none(), mode::DEPENDENCY)
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Invariant(_)));
    }

    #[test]
    fn close_activation_pops_back_to_the_caller() {
        let (_meta, mut collector) = harness();
        let act = script(&mut collector);
        let callee = collector
            .start_activation("callee", NO_COMPONENT, None, act)
            .unwrap();
        assert_eq!(collector.last_activation(), callee);
        let value = ObjRef::none();
        let value_id = collector.intern_value(&value);
        collector.close_activation(callee, value_id).unwrap();
        assert_eq!(collector.last_activation(), act);
        let row = collector.stores().evaluations.get(
            collector.activation(callee).unwrap().evaluation_id,
        );
        assert_eq!(row.unwrap().value_id, Some(value_id));
    }
}
