// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! The assignment engine.
//!
//! `assign_value` records the RHS dependency scope; visiting the LHS target
//! tree later consumes it. Single targets create one evaluation and bind the
//! name; sequence targets resolve a dependency source per element, preferring
//! the collection's element-wise sub-dependencies, then the compartment
//! history of the RHS value, then a clone of the aggregate. Starred targets
//! absorb the middle slice. Parameter matching reuses the same machinery at
//! function entry.

use prov_shared::{
    mode, ActivationId, CodeComponentId, EvaluationId, Moment, Relation, ValueId, NO_COMPONENT,
};

use super::default::DefaultCollector;
use super::error::{ExecutionError, Result};
use crate::machine::Machine;
use crate::scope::{ArgKind, Dep, Scope};
use crate::value::{ObjRef, ParamSpec};

/// A pending assignment: the RHS value and the dependencies its evaluation
/// collected, stamped at the moment the RHS resolved.
#[derive(Debug)]
pub struct Assign {
    pub moment: Moment,
    pub value: ObjRef,
    pub source: AssignSource,
}

/// Where an assignment's dependencies come from: one collected scope, or a
/// per-element list produced by slicing a sequence for a starred target.
#[derive(Debug)]
pub enum AssignSource {
    Collected(Scope),
    PerElement(Vec<Scope>),
}

/// The LHS target tree. Targets embed the runtime value the host language
/// already bound to them; the engine only records provenance.
#[derive(Debug)]
pub enum AssignTarget {
    Single {
        component: Option<CodeComponentId>,
        name: Option<String>,
        value: ObjRef,
    },
    Multiple {
        parts: Vec<AssignTarget>,
        value: ObjRef,
    },
    Starred(Box<AssignTarget>),
}

impl AssignTarget {
    pub fn single(component: CodeComponentId, name: &str, value: ObjRef) -> Self {
        AssignTarget::Single {
            component: Some(component),
            name: Some(name.to_owned()),
            value,
        }
    }

    /// A target the transformer chose not to capture.
    pub fn anonymous(value: ObjRef) -> Self {
        AssignTarget::Single {
            component: None,
            name: None,
            value,
        }
    }

    pub fn multiple(parts: Vec<AssignTarget>, value: ObjRef) -> Self {
        AssignTarget::Multiple { parts, value }
    }

    pub fn starred(target: AssignTarget) -> Self {
        AssignTarget::Starred(Box::new(target))
    }

    fn embedded_value(&self) -> &ObjRef {
        match self {
            AssignTarget::Single { value, .. } => value,
            AssignTarget::Multiple { value, .. } => value,
            AssignTarget::Starred(inner) => inner.embedded_value(),
        }
    }
}

impl<M: Machine> DefaultCollector<M> {
    /// Recursive target walk. Returns the width consumed in the enclosing
    /// sequence (always 1; the starred element is handled by its parent).
    pub(crate) fn assign_inner(
        &mut self,
        activation: ActivationId,
        moment: Moment,
        rhs: &ObjRef,
        source: AssignSource,
        target: &AssignTarget,
    ) -> Result<usize> {
        let (ldepa, mut depa) = match source {
            AssignSource::PerElement(list) => {
                let joined = Scope::join(&list);
                (list, joined)
            }
            AssignSource::Collected(scope) => (Vec::new(), scope),
        };
        match target {
            AssignTarget::Single {
                component,
                name,
                value,
            } => {
                let evaluation = self.evaluate(
                    activation,
                    component.unwrap_or(NO_COMPONENT),
                    value,
                    Some(moment),
                    Some(&mut depa),
                )?;
                if let Some(name) = name {
                    self.activation_mut(activation)?
                        .context
                        .insert(name.clone(), evaluation);
                }
                Ok(1)
            }
            AssignTarget::Multiple { parts, value } => {
                self.assign_multiple(activation, moment, rhs, value, parts, ldepa, depa)?;
                Ok(1)
            }
            // A bare starred target outside a sequence is a host syntax
            // error; recurse for robustness.
            AssignTarget::Starred(inner) => {
                self.assign_inner(activation, moment, rhs, AssignSource::Collected(depa), inner)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assign_multiple(
        &mut self,
        activation: ActivationId,
        moment: Moment,
        rhs: &ObjRef,
        target_value: &ObjRef,
        parts: &[AssignTarget],
        ldepa: Vec<Scope>,
        depa: Scope,
    ) -> Result<()> {
        // Propagation applies when the whole RHS arrived as one assign-mode
        // dependency over an iterable value.
        let propagate = depa.len() == 1
            && depa[0].mode.relation == Relation::Assign
            && target_value.is_iterable();
        let clone_depa = depa.clone_with_mode(mode::DEPENDENCY);
        let width = rhs.len().unwrap_or(0);

        // Resolve the dependency source for every element position up front.
        let upper = width.max(parts.len());
        let mut per_index: Vec<Scope> = Vec::with_capacity(upper);
        for index in 0..upper {
            let scope = if !ldepa.is_empty() {
                ldepa.get(index).cloned().unwrap_or_else(|| clone_depa.clone())
            } else if propagate {
                self.element_dependency(&depa[0], rhs, index)
                    .unwrap_or_else(|| clone_depa.clone())
            } else {
                clone_depa.clone()
            };
            per_index.push(scope);
        }
        let at = |index: usize| {
            per_index
                .get(index)
                .cloned()
                .unwrap_or_else(|| clone_depa.clone())
        };

        // Left-to-right until a starred target interrupts.
        let mut starred = None;
        let mut delta = 0usize;
        for (index, part) in parts.iter().enumerate() {
            if matches!(part, AssignTarget::Starred(_)) {
                starred = Some(index);
                break;
            }
            let element = part.embedded_value().clone();
            delta += self.assign_inner(
                activation,
                moment,
                &element,
                AssignSource::Collected(at(index)),
                part,
            )?;
        }

        let Some(star_at) = starred else {
            return Ok(());
        };

        // Right-to-left from the end, counting consumed width from the back.
        let mut rdelta: i64 = -1;
        for index in (star_at + 1..parts.len()).rev() {
            let part = &parts[index];
            let element = part.embedded_value().clone();
            let new_index = width as i64 + rdelta;
            let adepa = if new_index >= 0 {
                at(new_index as usize)
            } else {
                clone_depa.clone()
            };
            rdelta -= self.assign_inner(
                activation,
                moment,
                &element,
                AssignSource::Collected(adepa),
                part,
            )? as i64;
        }

        // The starred target binds the middle slice.
        let AssignTarget::Starred(star_target) = &parts[star_at] else {
            return Err(ExecutionError::invariant("starred index lost its target"));
        };
        let end = (width as i64 + rdelta + 1).max(delta as i64) as usize;
        let star_value = rhs.slice(delta, end);
        let depas: Vec<Scope> = (delta..end).map(at).collect();
        self.assign_inner(
            activation,
            moment,
            &star_value,
            AssignSource::PerElement(depas),
            star_target,
        )?;
        Ok(())
    }

    /// Derive the dependency scope for element `index` of a propagated
    /// sequence assignment: the collection's recorded sub-dependency if it
    /// has one, else the latest compartment at `[index]` of the RHS value
    /// traced back to the evaluation that produced it.
    fn element_dependency(&self, dep: &Dep, rhs: &ObjRef, index: usize) -> Option<Scope> {
        let (activation_id, evaluation_id, part_id) = if let Some(sub) = dep.sub.get(index) {
            (sub.activation_id, sub.evaluation_id, sub.value_id?)
        } else {
            let address = format!("[{index}]");
            let part_id = self.compartment_part(dep.value_id?, &address)?;
            let (activation_id, evaluation_id) = self.last_evaluation_by_value_id(part_id)?;
            (activation_id, evaluation_id, part_id)
        };
        let element = rhs.index(index)?;
        let mut scope = Scope::plain();
        scope.push(Dep::new(
            activation_id,
            evaluation_id,
            element,
            Some(part_id),
            mode::ASSIGN,
        ));
        Some(scope)
    }

    /// Latest compartment member for `(whole, address)`.
    fn compartment_part(&self, whole_id: ValueId, address: &str) -> Option<ValueId> {
        self.stores()
            .compartments
            .iter()
            .rev()
            .find(|c| c.whole_id == whole_id && c.name == address)
            .and_then(|c| c.part_id)
    }

    /// Latest evaluation that produced the given value.
    fn last_evaluation_by_value_id(
        &self,
        value_id: ValueId,
    ) -> Option<(ActivationId, EvaluationId)> {
        self.stores()
            .evaluations
            .iter()
            .rev()
            .find(|e| e.value_id == Some(value_id))
            .map(|e| (e.activation_id, e.id))
    }

    /// Match collected argument dependencies to declared parameters, binding
    /// one evaluation per parameter into the activation's context.
    pub(crate) fn match_arguments(
        &mut self,
        activation: ActivationId,
        params: &ParamSpec,
        defaults: &[Dep],
    ) -> Result<()> {
        let time = self.now()?;

        let collected: Vec<Dep> = {
            let act = self.activation_ref(activation)?;
            let call_scope = act
                .scopes
                .first()
                .ok_or_else(|| ExecutionError::invariant("activation lost its call scope"))?;
            call_scope
                .iter()
                .filter(|d| d.mode.relation == Relation::Argument)
                .cloned()
                .collect()
        };
        let (arguments, keywords): (Vec<Dep>, Vec<Dep>) = collected
            .into_iter()
            .partition(|d| d.arg_kind == ArgKind::Argument);

        struct Param {
            name: String,
            code_id: CodeComponentId,
            is_vararg: bool,
            filled: bool,
            default: Option<Dep>,
        }

        let mut order: Vec<Param> = Vec::new();
        let len_positional = params.args.len().saturating_sub(defaults.len());
        for (pos, decl) in params.args.iter().enumerate() {
            let default = if pos >= len_positional {
                defaults.get(pos - len_positional).cloned()
            } else {
                None
            };
            order.push(Param {
                name: decl.name.clone(),
                code_id: decl.code_id,
                is_vararg: false,
                filled: false,
                default,
            });
        }
        let vararg_index = params.vararg.as_ref().map(|decl| {
            order.push(Param {
                name: decl.name.clone(),
                code_id: decl.code_id,
                is_vararg: true,
                filled: false,
                default: None,
            });
            order.len() - 1
        });
        for decl in &params.kw_only {
            order.push(Param {
                name: decl.name.clone(),
                code_id: decl.code_id,
                is_vararg: false,
                filled: false,
                default: None,
            });
        }
        let kwarg_index = params.kwarg.as_ref().map(|decl| {
            order.push(Param {
                name: decl.name.clone(),
                code_id: decl.code_id,
                is_vararg: false,
                filled: false,
                default: None,
            });
            order.len() - 1
        });

        // Positionals, left to right; a `*` marker expands by value length
        // and is absorbed by the vararg once plain positionals are filled.
        let mut last_unfilled = 0usize;
        for dep in &arguments {
            if dep.arg.as_deref() == Some("*") {
                let count = dep.value.len().unwrap_or(0);
                for _ in 0..count {
                    let param = order.get(last_unfilled).ok_or_else(|| {
                        ExecutionError::invariant("too many positional arguments")
                    })?;
                    let (name, code_id, is_vararg) =
                        (param.name.clone(), param.code_id, param.is_vararg);
                    self.bind_parameter(activation, time, dep, &name, code_id)?;
                    if is_vararg {
                        break;
                    }
                    order[last_unfilled].filled = true;
                    last_unfilled += 1;
                }
            } else {
                let param = order
                    .get(last_unfilled)
                    .ok_or_else(|| ExecutionError::invariant("too many positional arguments"))?;
                let (name, code_id, is_vararg) =
                    (param.name.clone(), param.code_id, param.is_vararg);
                self.bind_parameter(activation, time, dep, &name, code_id)?;
                if !is_vararg {
                    order[last_unfilled].filled = true;
                    last_unfilled += 1;
                }
            }
        }
        if let Some(index) = vararg_index {
            order[index].filled = true;
        }

        // Keywords by name; unmatched names route to `**kwargs`. A `**`
        // marker without a kwarg parameter expands into individual bindings.
        for dep in &keywords {
            let by_name = dep
                .arg
                .as_deref()
                .and_then(|n| order.iter().position(|p| p.name == n));
            match by_name.or(kwarg_index) {
                Some(index) => {
                    let (name, code_id) = (order[index].name.clone(), order[index].code_id);
                    self.bind_parameter(activation, time, dep, &name, code_id)?;
                    order[index].filled = true;
                }
                None if dep.arg.as_deref() == Some("**") => {
                    for key in dep.value.dict_keys().unwrap_or_default() {
                        let Some(key) = key.as_str() else { continue };
                        if let Some(index) = order.iter().position(|p| p.name == key) {
                            let (name, code_id) =
                                (order[index].name.clone(), order[index].code_id);
                            self.bind_parameter(activation, time, dep, &name, code_id)?;
                            order[index].filled = true;
                        }
                    }
                }
                None => {}
            }
        }

        // Unfilled parameters fall back to their stored default dependency.
        for index in 0..order.len() {
            if order[index].filled {
                continue;
            }
            let Some(default) = order[index].default.clone() else {
                continue;
            };
            let (name, code_id) = (order[index].name.clone(), order[index].code_id);
            self.bind_parameter(activation, time, &default, &name, code_id)?;
        }
        Ok(())
    }

    /// Bind one parameter: an evaluation at the parameter's code component,
    /// depending on the supplied argument with mode `argument`.
    fn bind_parameter(
        &mut self,
        activation: ActivationId,
        time: Moment,
        dep: &Dep,
        name: &str,
        code_id: CodeComponentId,
    ) -> Result<()> {
        let mut scope = Scope::plain();
        let mut argument = dep.clone();
        argument.mode = mode::ARGUMENT;
        scope.push(argument);
        let evaluation =
            self.evaluate(activation, code_id, &dep.value, Some(time), Some(&mut scope))?;
        self.activation_mut(activation)?
            .context
            .insert(name.to_owned(), evaluation);
        Ok(())
    }
}
