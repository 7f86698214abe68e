// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a trial.
///
/// A trial moves `Running → (Finished | Unfinished | Backup)`. Partial saves
/// only occur while `Running`; leaving `Running` requires the final
/// non-partial store.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TrialStatus {
    Running,
    Finished,
    Unfinished,
    Backup,
}

impl TrialStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TrialStatus::Running => "running",
            TrialStatus::Finished => "finished",
            TrialStatus::Unfinished => "unfinished",
            TrialStatus::Backup => "backup",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TrialStatus::Running)
    }

    pub fn can_transition_to(self, next: TrialStatus) -> bool {
        match self {
            TrialStatus::Running => true,
            terminal => terminal == next,
        }
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TrialStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TrialStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match String::deserialize(deserializer)?.as_str() {
            "running" => Ok(TrialStatus::Running),
            "finished" => Ok(TrialStatus::Finished),
            "unfinished" => Ok(TrialStatus::Unfinished),
            "backup" => Ok(TrialStatus::Backup),
            other => Err(serde::de::Error::custom(format!(
                "unknown trial status {other:?}"
            ))),
        }
    }
}
