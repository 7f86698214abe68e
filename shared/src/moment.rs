// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A capture timestamp: nanoseconds since the UNIX epoch, derived from a wall
/// anchor plus a monotonic offset so that moments within one trial never go
/// backwards even if the wall clock does.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Moment(u64);

impl Moment {
    pub fn from_nanos(nanos: u64) -> Self {
        Moment(nanos)
    }

    pub fn as_nanos(self) -> u64 {
        self.0
    }

    /// Time elapsed since an earlier moment. Saturates at zero, so callers
    /// comparing against an interval never underflow.
    pub fn elapsed_since(self, earlier: Moment) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Moment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_saturates() {
        let a = Moment::from_nanos(5);
        let b = Moment::from_nanos(1_000_000_005);
        assert_eq!(b.elapsed_since(a), Duration::from_secs(1));
        assert_eq!(a.elapsed_since(b), Duration::ZERO);
    }

    #[test]
    fn display_is_seconds_dot_nanos() {
        assert_eq!(Moment::from_nanos(1_500_000_000).to_string(), "1.500000000");
    }
}
