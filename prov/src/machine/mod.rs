// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! The persistence seam.
//!
//! The collector never talks to a database; it drains ordered record batches
//! into a [`Machine`] and, at finalisation, issues a single trial update. A
//! node embedding the collector supplies the concrete machine; tests use the
//! in-memory one.

use std::cell::{Ref, RefCell, RefMut};

use prov_shared::{records, CodeBlockId, Moment, TrialId, TrialStatus, NO_BLOCK};

#[cfg(any(test, feature = "testing"))]
pub mod memory;

#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryMachine;

/// Durable sink for provenance records.
///
/// Batches arrive in insertion order, each at most once: the engine keeps a
/// high-water mark per record kind, so a batch delivered by a partial flush
/// is never re-delivered. Implementations must make partial batches durable
/// before returning.
pub trait Machine: 'static {
    fn persist_code_components(
        &mut self,
        trial: TrialId,
        rows: &[records::CodeComponent],
    ) -> anyhow::Result<()>;

    fn persist_evaluations(
        &mut self,
        trial: TrialId,
        rows: &[records::Evaluation],
    ) -> anyhow::Result<()>;

    fn persist_activations(
        &mut self,
        trial: TrialId,
        rows: &[records::Activation],
    ) -> anyhow::Result<()>;

    fn persist_dependencies(
        &mut self,
        trial: TrialId,
        rows: &[records::Dependency],
    ) -> anyhow::Result<()>;

    fn persist_values(&mut self, trial: TrialId, rows: &[records::Value]) -> anyhow::Result<()>;

    fn persist_compartments(
        &mut self,
        trial: TrialId,
        rows: &[records::Compartment],
    ) -> anyhow::Result<()>;

    fn persist_exceptions(
        &mut self,
        trial: TrialId,
        rows: &[records::Exception],
    ) -> anyhow::Result<()>;

    /// Finalisation step: update the trial row with the main block, finish
    /// time and terminal status. Only issued by non-partial stores.
    fn update_trial(
        &mut self,
        trial: TrialId,
        main_id: CodeBlockId,
        finish: Moment,
        status: TrialStatus,
    ) -> anyhow::Result<()>;
}

/// Collector configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Trial identity, assigned by the persistence collaborator.
    pub trial_id: TrialId,

    /// The top-level code block id.
    ///
    /// DEFAULT: none (`NO_BLOCK`)
    pub main_id: CodeBlockId,

    /// Partial-save interval in milliseconds.
    ///
    /// DEFAULT: 0 (partial saves disabled)
    pub save_frequency: u64,
}

impl Config {
    pub fn new(trial_id: TrialId) -> Self {
        Config {
            trial_id,
            main_id: NO_BLOCK,
            save_frequency: 0,
        }
    }

    /// Set [`Config::main_id`].
    pub fn set_main_id(&mut self, main_id: CodeBlockId) -> &mut Self {
        self.main_id = main_id;
        self
    }

    /// Enable partial saves every `ms` milliseconds. Zero disables them.
    pub fn set_save_frequency(&mut self, ms: u64) -> &mut Self {
        self.save_frequency = ms;
        self
    }
}

/// The owner of one trial's configuration and persistence machine.
///
/// The collector holds a *weak* reference to its metascript to break the
/// ownership cycle between the two; once the metascript is dropped, hook
/// calls become value-transparent no-ops instead of crashing.
pub struct Metascript<M: Machine> {
    config: Config,
    machine: RefCell<M>,
}

impl<M: Machine> Metascript<M> {
    pub fn new(config: Config, machine: M) -> Self {
        Metascript {
            config,
            machine: RefCell::new(machine),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn machine(&self) -> Ref<'_, M> {
        self.machine.borrow()
    }

    pub fn machine_mut(&self) -> RefMut<'_, M> {
        self.machine.borrow_mut()
    }

    /// Consume the metascript and return the owned machine.
    pub fn into_machine(self) -> M {
        self.machine.into_inner()
    }
}
