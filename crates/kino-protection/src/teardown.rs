//! Teardown coordination
//!
//! Teardown closes every registered session concurrently and joins on all
//! of them before detaching the playback surface. The join is a countdown:
//! each session's terminal outcome, success or failure, counts down once.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Progress of a teardown request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TeardownState {
    #[default]
    Idle,
    Draining,
    Complete,
}

impl TeardownState {
    pub fn can_transition_to(&self, next: TeardownState) -> bool {
        use TeardownState::*;
        matches!(
            (self, next),
            (Idle, Draining) | (Draining, Complete) | (Complete, Draining)
        )
    }
}

impl std::fmt::Display for TeardownState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeardownState::Idle => write!(f, "idle"),
            TeardownState::Draining => write!(f, "draining"),
            TeardownState::Complete => write!(f, "complete"),
        }
    }
}

/// Join over a fixed number of arrivals
#[derive(Debug)]
pub struct CountdownLatch {
    remaining: AtomicUsize,
}

impl CountdownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
        }
    }

    /// Record one arrival. Returns true for the arrival that reaches zero.
    pub fn arrive(&self) -> bool {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        matches!(previous, Ok(1))
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}
