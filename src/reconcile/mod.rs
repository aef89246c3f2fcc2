//! Reconciliation
//!
//! Decides when a follower has fallen out of the replication set and brings
//! it back: suspicion accounting, drops, and digest-driven resync.

mod machine;
mod manager;
mod resync;

pub use machine::{transition, Action, Event, PairState, CLEAN_PASSES_REQUIRED};
pub use manager::{Reconciler, Signal, Verdict};
pub use resync::RemoteDigestSource;
