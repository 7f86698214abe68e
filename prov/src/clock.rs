// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use std::time::{SystemTime, UNIX_EPOCH};

use minstant::Instant;
use prov_shared::Moment;

/// Time source for capture moments.
///
/// The wall clock is read once at construction; afterwards every moment is
/// the anchor plus a monotonic offset. Moments within one trial therefore
/// never go backwards, even if the wall clock is adjusted mid-run.
#[derive(Debug)]
pub struct Clock {
    anchor_nanos: u64,
    anchor: Instant,
}

impl Clock {
    pub fn new() -> Self {
        let anchor_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Clock {
            anchor_nanos,
            anchor: Instant::now(),
        }
    }

    pub fn now(&self) -> Moment {
        let offset = self.anchor.elapsed().as_nanos() as u64;
        Moment::from_nanos(self.anchor_nanos + offset)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}
