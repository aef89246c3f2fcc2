//! Per-follower reconciliation state machine
//!
//! Pure transition function over discrete events; the manager performs the
//! returned actions.

use serde::{Deserialize, Serialize};

/// Consecutive clean comparisons required before re-admission
pub const CLEAN_PASSES_REQUIRED: u8 = 2;

/// State of one (shard, follower) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairState {
    InSync,
    Suspect { misses: u32 },
    Dropped,
    Resyncing { attempt: u32, clean_passes: u8 },
}

impl PairState {
    /// Whether the follower may receive replicated operations
    pub fn in_replication_set(&self) -> bool {
        matches!(self, PairState::InSync | PairState::Suspect { .. })
    }

    /// Whether enough clean comparisons were seen to admit the follower
    pub fn ready_for_admission(&self) -> bool {
        matches!(self, PairState::Resyncing { clean_passes, .. } if *clean_passes >= CLEAN_PASSES_REQUIRED)
    }

    /// Clean comparisons seen since the last divergence
    pub fn clean_passes(&self) -> u8 {
        match self {
            PairState::Resyncing { clean_passes, .. } => *clean_passes,
            _ => 0,
        }
    }
}

impl std::fmt::Display for PairState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PairState::InSync => write!(f, "IN_SYNC"),
            PairState::Suspect { misses } => write!(f, "SUSPECT({})", misses),
            PairState::Dropped => write!(f, "DROPPED"),
            PairState::Resyncing { attempt, .. } => write!(f, "RESYNCING({})", attempt),
        }
    }
}

/// Something observed about a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Ack,
    Timeout,
    Incompatible,
    Lagging,
    HardRejection,
    ResyncScheduled,
    ComparisonClean,
    ComparisonDiverged,
    ResyncExpired,
    Admitted,
}

/// Side effect requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    MarkSuspect,
    ClearSuspect,
    Drop,
    ScheduleResync,
}

/// Next state and actions for `event` in `state`
pub fn transition(state: PairState, event: Event, budget: u32) -> (PairState, Vec<Action>) {
    use Event::*;
    use PairState::*;

    let budget = budget.max(1);
    let miss = |misses: u32| {
        if misses >= budget {
            (Dropped, vec![Action::Drop, Action::ScheduleResync])
        } else {
            (Suspect { misses }, vec![Action::MarkSuspect])
        }
    };

    match (state, event) {
        (InSync, Ack) => (InSync, vec![]),
        (InSync, Timeout | Incompatible | Lagging) => miss(1),
        (Suspect { misses }, Timeout | Incompatible | Lagging) => miss(misses + 1),
        (Suspect { .. }, Ack) => (InSync, vec![Action::ClearSuspect]),
        (InSync | Suspect { .. }, HardRejection) => {
            (Dropped, vec![Action::Drop, Action::ScheduleResync])
        }

        (Dropped, ResyncScheduled) => (
            Resyncing {
                attempt: 1,
                clean_passes: 0,
            },
            vec![],
        ),

        (Resyncing { attempt, clean_passes }, ComparisonClean) => (
            Resyncing {
                attempt,
                clean_passes: clean_passes.saturating_add(1),
            },
            vec![],
        ),
        (Resyncing { attempt, .. }, ComparisonDiverged) => (
            Resyncing {
                attempt,
                clean_passes: 0,
            },
            vec![],
        ),
        (Resyncing { attempt, .. }, ResyncExpired) => (
            Resyncing {
                attempt: attempt + 1,
                clean_passes: 0,
            },
            vec![],
        ),
        (Resyncing { .. } | Dropped, Admitted) => (InSync, vec![]),

        // Everything else leaves the pair untouched, including resync
        // requests for a pair that is already in sync
        (state, _) => (state, vec![]),
    }
}
