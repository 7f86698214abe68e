// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! In-memory persistence machine for tests.

use prov_shared::{records, CodeBlockId, Moment, TrialId, TrialStatus};

use super::Machine;

#[derive(Clone, Debug, PartialEq)]
pub struct TrialUpdate {
    pub trial: TrialId,
    pub main_id: CodeBlockId,
    pub finish: Moment,
    pub status: TrialStatus,
}

/// Accumulates every batch it receives, in order. Batch counts let tests
/// observe how many flushes actually delivered rows.
#[derive(Default)]
pub struct MemoryMachine {
    pub code_components: Vec<records::CodeComponent>,
    pub evaluations: Vec<records::Evaluation>,
    pub activations: Vec<records::Activation>,
    pub dependencies: Vec<records::Dependency>,
    pub values: Vec<records::Value>,
    pub compartments: Vec<records::Compartment>,
    pub exceptions: Vec<records::Exception>,
    pub trial_updates: Vec<TrialUpdate>,
    pub evaluation_batches: usize,
    /// When set, every persist call fails; exercises the store I/O paths.
    pub fail_persists: bool,
}

impl MemoryMachine {
    pub fn new() -> Self {
        MemoryMachine::default()
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.fail_persists {
            anyhow::bail!("persistence sink is down");
        }
        Ok(())
    }

    pub fn total_rows(&self) -> usize {
        self.code_components.len()
            + self.evaluations.len()
            + self.activations.len()
            + self.dependencies.len()
            + self.values.len()
            + self.compartments.len()
            + self.exceptions.len()
    }

    pub fn evaluation(&self, id: i64) -> Option<&records::Evaluation> {
        self.evaluations.iter().find(|e| e.id == id)
    }

    pub fn value(&self, id: i64) -> Option<&records::Value> {
        self.values.iter().find(|v| v.id == id)
    }

    pub fn activation(&self, id: i64) -> Option<&records::Activation> {
        self.activations.iter().find(|a| a.id == id)
    }

    /// Dependencies pointing out of the given evaluation.
    pub fn dependencies_of(&self, dependent_id: i64) -> Vec<&records::Dependency> {
        self.dependencies
            .iter()
            .filter(|d| d.dependent_id == dependent_id)
            .collect()
    }
}

impl Machine for MemoryMachine {
    fn persist_code_components(
        &mut self,
        _trial: TrialId,
        rows: &[records::CodeComponent],
    ) -> anyhow::Result<()> {
        self.check()?;
        self.code_components.extend_from_slice(rows);
        Ok(())
    }

    fn persist_evaluations(
        &mut self,
        _trial: TrialId,
        rows: &[records::Evaluation],
    ) -> anyhow::Result<()> {
        self.check()?;
        self.evaluations.extend_from_slice(rows);
        self.evaluation_batches += 1;
        Ok(())
    }

    fn persist_activations(
        &mut self,
        _trial: TrialId,
        rows: &[records::Activation],
    ) -> anyhow::Result<()> {
        self.check()?;
        self.activations.extend_from_slice(rows);
        Ok(())
    }

    fn persist_dependencies(
        &mut self,
        _trial: TrialId,
        rows: &[records::Dependency],
    ) -> anyhow::Result<()> {
        self.check()?;
        self.dependencies.extend_from_slice(rows);
        Ok(())
    }

    fn persist_values(&mut self, _trial: TrialId, rows: &[records::Value]) -> anyhow::Result<()> {
        self.check()?;
        self.values.extend_from_slice(rows);
        Ok(())
    }

    fn persist_compartments(
        &mut self,
        _trial: TrialId,
        rows: &[records::Compartment],
    ) -> anyhow::Result<()> {
        self.check()?;
        self.compartments.extend_from_slice(rows);
        Ok(())
    }

    fn persist_exceptions(
        &mut self,
        _trial: TrialId,
        rows: &[records::Exception],
    ) -> anyhow::Result<()> {
        self.check()?;
        self.exceptions.extend_from_slice(rows);
        Ok(())
    }

    fn update_trial(
        &mut self,
        trial: TrialId,
        main_id: CodeBlockId,
        finish: Moment,
        status: TrialStatus,
    ) -> anyhow::Result<()> {
        self.check()?;
        self.trial_updates.push(TrialUpdate {
            trial,
            main_id,
            finish,
            status,
        });
        Ok(())
    }
}
