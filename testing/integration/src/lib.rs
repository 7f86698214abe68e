// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Test harness for driving the collector the way transformed scripts do.
//!
//! A [`Harness`] bundles a metascript (config + in-memory machine) with a
//! collector, plays the definition-time analyser by registering code
//! components, and can be torn down into the machine for assertions on the
//! persisted rows. [`check_invariants`] verifies the universal graph
//! invariants every scenario must uphold.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use prov::machine::MemoryMachine;
use prov::{Config, DefaultCollector, Metascript};
use prov_shared::records::ComponentAccess;
use prov_shared::CodeComponentId;

pub struct Harness {
    pub meta: Rc<Metascript<MemoryMachine>>,
    pub collector: DefaultCollector<MemoryMachine>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::new(1))
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_machine(config, MemoryMachine::new())
    }

    pub fn with_machine(config: Config, machine: MemoryMachine) -> Self {
        let meta = Rc::new(Metascript::new(config, machine));
        let collector = DefaultCollector::new(&meta);
        Harness { meta, collector }
    }

    /// Register a code component, playing the definition-time analyser.
    pub fn component(&mut self, name: &str, kind: &str, mode: ComponentAccess) -> CodeComponentId {
        self.collector
            .register_code_component(name, kind, mode, 1, 0, 1, 0, None)
    }

    /// A name read site.
    pub fn read(&mut self, name: &str) -> CodeComponentId {
        self.component(name, "name", ComponentAccess::Read)
    }

    /// A name write site.
    pub fn write(&mut self, name: &str) -> CodeComponentId {
        self.component(name, "name", ComponentAccess::Write)
    }

    /// A literal site.
    pub fn lit(&mut self, repr: &str) -> CodeComponentId {
        self.component(repr, "literal", ComponentAccess::Read)
    }

    /// Tear the harness down and hand back the machine with everything that
    /// was persisted.
    pub fn finish(self) -> MemoryMachine {
        let Harness { meta, collector } = self;
        drop(collector);
        match Rc::try_unwrap(meta) {
            Ok(meta) => meta.into_machine(),
            Err(_) => panic!("harness metascript still referenced"),
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Harness::new()
    }
}

/// Universal invariants over the persisted graph:
///
/// 1. every dependency references evaluations that exist in the store,
/// 2. every value's type chain terminates at the self-typed root,
/// 3. activation caller pointers are acyclic (terminating at the
///    unpersisted root).
pub fn check_invariants(machine: &MemoryMachine) {
    let evaluations: HashSet<i64> = machine.evaluations.iter().map(|e| e.id).collect();
    for dep in &machine.dependencies {
        assert!(
            evaluations.contains(&dep.dependent_id),
            "dependency {} has a dangling dependent evaluation {}",
            dep.id,
            dep.dependent_id,
        );
        assert!(
            evaluations.contains(&dep.dependency_id),
            "dependency {} has a dangling dependency evaluation {}",
            dep.id,
            dep.dependency_id,
        );
    }

    let types: HashMap<i64, i64> = machine.values.iter().map(|v| (v.id, v.type_id)).collect();
    for value in &machine.values {
        let mut cursor = value.id;
        let mut steps = 0;
        loop {
            let next = *types
                .get(&cursor)
                .unwrap_or_else(|| panic!("value {cursor} has no type row"));
            if next == cursor {
                break;
            }
            cursor = next;
            steps += 1;
            assert!(steps <= 4, "type chain of value {} does not terminate", value.id);
        }
    }

    let activations: HashSet<i64> = machine.activations.iter().map(|a| a.id).collect();
    for activation in &machine.activations {
        let mut visited = HashSet::new();
        let mut cursor = Some(activation.id);
        while let Some(id) = cursor {
            assert!(
                visited.insert(id),
                "activation {} sits on a caller cycle",
                activation.id,
            );
            if !activations.contains(&id) {
                break; // reached the unpersisted root
            }
            cursor = machine.activation(id).and_then(|a| a.caller_id);
        }
    }
}
