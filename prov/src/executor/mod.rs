// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Trial lifecycle driver.
//!
//! Brackets a transformed script between `start_script` and `close_script`,
//! maps the outcome onto the trial state machine
//! (`running → finished | unfinished`), and issues the final non-partial
//! store. Guest exceptions are recorded against the script activation and
//! surface in the outcome; a storage failure during finalisation never masks
//! them.

use prov_shared::{CodeComponentId, TrialStatus};

use crate::collector::error::{ExecutionError, Result};
use crate::collector::{DefaultCollector, Hooks};
use crate::machine::Machine;
use crate::value::ObjRef;

/// What a driven script run produced.
#[derive(Debug)]
pub struct RunOutcome {
    /// Terminal trial status issued by the final store.
    pub status: TrialStatus,
    /// The script's value, or the error that ended it.
    pub result: Result<ObjRef>,
}

impl RunOutcome {
    pub fn finished(&self) -> bool {
        self.status == TrialStatus::Finished
    }
}

/// Run a transformed script under the collector.
///
/// Returns `Err` only for a provenance-fatal failure with no guest error in
/// flight; every guest-visible outcome, including a recorded exception, comes
/// back as a [`RunOutcome`].
pub fn run_script<M: Machine>(
    collector: &mut DefaultCollector<M>,
    module_name: &str,
    main_component: CodeComponentId,
    body: impl FnOnce(&mut DefaultCollector<M>, prov_shared::ActivationId) -> Result<ObjRef>,
) -> Result<RunOutcome> {
    let activation = collector.start_script(module_name, main_component)?;
    let result = body(collector, activation);

    let status = match &result {
        Ok(_) => TrialStatus::Finished,
        Err(_) => TrialStatus::Unfinished,
    };
    if let Some(user) = result.as_ref().err().and_then(ExecutionError::raised) {
        collector.collect_exception(activation, user);
    }

    let finalized = collector
        .close_script(activation)
        .and_then(|_| collector.store(false, status));
    if let Err(failure) = finalized {
        return match result {
            // The guest error is the primary outcome; the storage failure is
            // logged, not surfaced.
            Err(guest) => {
                log::error!("storage failure during finalisation suppressed: {failure}");
                Ok(RunOutcome {
                    status,
                    result: Err(guest),
                })
            }
            Ok(_) => Err(failure),
        };
    }

    Ok(RunOutcome { status, result })
}
