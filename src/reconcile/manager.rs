//! Reconciliation Manager
//!
//! Tracks the state of every (shard, follower) pair, turns replication
//! signals into suspicion and drops, and owns the background resync tasks
//! that bring dropped followers back.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::machine::{transition, Action, Event, PairState};
use crate::config::ReconcileConfig;
use crate::digest::DigestEngine;
use crate::error::{Error, Result};
use crate::metrics::ReplicationMetrics;
use crate::replication::{ReplicaTransport, ShardRounds};
use crate::state::{ParticipantRegistry, TargetPlan};

/// What the replicator observed about a follower in one round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Ack,
    Timeout,
    Incompatible { reason: String },
    Lagging,
    HardRejection { reason: String },
}

impl Signal {
    /// Signal a failed delivery stands for; `None` when it must not count
    /// against the follower
    pub fn from_error(error: &Error) -> Option<Signal> {
        if error.is_benign() {
            return None;
        }
        if error.forces_drop() {
            return Some(Signal::HardRejection {
                reason: error.to_string(),
            });
        }
        if error.is_retryable() {
            return Some(Signal::Timeout);
        }
        Some(match error {
            Error::Lagging { .. } => Signal::Lagging,
            other => Signal::Incompatible {
                reason: other.to_string(),
            },
        })
    }

    fn event(&self) -> Event {
        match self {
            Signal::Ack => Event::Ack,
            Signal::Timeout => Event::Timeout,
            Signal::Incompatible { .. } => Event::Incompatible,
            Signal::Lagging => Event::Lagging,
            Signal::HardRejection { .. } => Event::HardRejection,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Ack => write!(f, "ack"),
            Signal::Timeout => write!(f, "no acknowledgement before timeout"),
            Signal::Incompatible { reason } => write!(f, "incompatible: {}", reason),
            Signal::Lagging => write!(f, "lagging beyond the sequence gap"),
            Signal::HardRejection { reason } => write!(f, "hard rejection: {}", reason),
        }
    }
}

/// Standing of a follower after a signal was processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Suspect,
    Dropped,
}

type PairKey = (String, String);

fn key(shard: &str, follower: &str) -> PairKey {
    (shard.to_string(), follower.to_string())
}

/// Reconciliation manager of the shards this node leads
pub struct Reconciler {
    pub(super) node_id: String,
    pub(super) config: ReconcileConfig,
    pub(super) registry: Arc<ParticipantRegistry>,
    pub(super) rounds: Arc<ShardRounds>,
    pub(super) transport: Arc<dyn ReplicaTransport>,
    pub(super) engine: Arc<DigestEngine>,
    pub(super) metrics: Arc<ReplicationMetrics>,
    pairs: Mutex<HashMap<PairKey, PairState>>,
    tasks: Mutex<HashMap<PairKey, CancellationToken>>,
    shutdown: CancellationToken,
}

impl Reconciler {
    pub fn new(
        node_id: String,
        config: ReconcileConfig,
        registry: Arc<ParticipantRegistry>,
        rounds: Arc<ShardRounds>,
        transport: Arc<dyn ReplicaTransport>,
        engine: Arc<DigestEngine>,
        metrics: Arc<ReplicationMetrics>,
    ) -> Self {
        Self {
            node_id,
            config,
            registry,
            rounds,
            transport,
            engine,
            metrics,
            pairs: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Current state of a pair; unknown pairs are in sync
    pub async fn state(&self, shard: &str, follower: &str) -> PairState {
        self.pairs
            .lock()
            .await
            .get(&key(shard, follower))
            .copied()
            .unwrap_or(PairState::InSync)
    }

    /// States of all pairs of a shard that are not in sync
    pub async fn unsettled(&self, shard: &str) -> Vec<(String, PairState)> {
        let pairs = self.pairs.lock().await;
        let mut unsettled: Vec<(String, PairState)> = pairs
            .iter()
            .filter(|((s, _), state)| s == shard && **state != PairState::InSync)
            .map(|((_, f), state)| (f.clone(), *state))
            .collect();
        unsettled.sort_by(|a, b| a.0.cmp(&b.0));
        unsettled
    }

    /// Process one replication signal
    pub async fn observe(self: &Arc<Self>, shard: &str, follower: &str, signal: Signal) -> Verdict {
        if signal != Signal::Ack {
            tracing::debug!("Follower {} of shard {}: {}", follower, shard, signal);
        }
        let state = self.record(shard, follower, signal.event()).await;
        match state {
            PairState::InSync => Verdict::Healthy,
            PairState::Suspect { .. } => Verdict::Suspect,
            PairState::Dropped | PairState::Resyncing { .. } => Verdict::Dropped,
        }
    }

    /// Apply an event to a pair and perform the resulting actions
    pub(super) async fn record(self: &Arc<Self>, shard: &str, follower: &str, event: Event) -> PairState {
        let actions = self.apply_event(shard, follower, event).await;
        for action in actions {
            if let Err(e) = self.perform(shard, follower, action).await {
                tracing::warn!(
                    "Failed to {:?} follower {} of shard {}: {}",
                    action,
                    follower,
                    shard,
                    e
                );
            }
        }
        self.state(shard, follower).await
    }

    /// Apply an event to a pair, returning the actions it requests
    pub(super) async fn apply_event(&self, shard: &str, follower: &str, event: Event) -> Vec<Action> {
        let (before, after, actions) = {
            let mut pairs = self.pairs.lock().await;
            let entry = pairs.entry(key(shard, follower)).or_insert(PairState::InSync);
            let before = *entry;
            let (after, actions) = transition(before, event, self.config.suspicion_budget);
            *entry = after;
            if after == PairState::InSync {
                pairs.remove(&key(shard, follower));
            }
            (before, after, actions)
        };

        if before != after {
            tracing::info!(
                "Follower {} of shard {}: {} -> {} on {:?}",
                follower,
                shard,
                before,
                after,
                event
            );
        }
        actions
    }

    async fn perform(self: &Arc<Self>, shard: &str, follower: &str, action: Action) -> Result<()> {
        match action {
            Action::MarkSuspect => self.registry.set_suspect(shard, follower, true).await,
            Action::ClearSuspect => self.registry.set_suspect(shard, follower, false).await,
            Action::Drop => {
                let view = self.registry.view(shard).await?;
                if !view.role_of(follower).is_some_and(|r| r.subject_to_drop()) {
                    return Ok(());
                }
                let generation = self.registry.drop_follower(shard, follower).await?;
                // The leader already stops sending; fencing is best effort here and
                // repeated before every resync attempt
                if let Err(e) = self.transport.fence(follower, shard, generation).await {
                    tracing::debug!("Could not fence {} on shard {} yet: {}", follower, shard, e);
                }
                Ok(())
            }
            Action::ScheduleResync => {
                self.spawn_resync(shard, follower).await;
                Ok(())
            }
        }
    }

    /// Start a resync for a dropped follower. No-op for a pair in sync.
    pub async fn request_resync(self: &Arc<Self>, shard: &str, follower: &str) -> bool {
        match self.state(shard, follower).await {
            PairState::Dropped => {
                self.spawn_resync(shard, follower).await;
                true
            }
            _ => false,
        }
    }

    async fn spawn_resync(self: &Arc<Self>, shard: &str, follower: &str) {
        let token = {
            let mut tasks = self.tasks.lock().await;
            if tasks.contains_key(&key(shard, follower)) {
                return;
            }
            let token = self.shutdown.child_token();
            tasks.insert(key(shard, follower), token.clone());
            token
        };

        {
            let mut pairs = self.pairs.lock().await;
            let entry = pairs.entry(key(shard, follower)).or_insert(PairState::Dropped);
            let (next, _) = transition(*entry, Event::ResyncScheduled, self.config.suspicion_budget);
            *entry = next;
        }

        tracing::info!("Scheduling resync of {} for shard {}", follower, shard);
        let this = self.clone();
        let shard = shard.to_string();
        let follower = follower.to_string();
        tokio::spawn(async move {
            this.clone().run_resync(shard.clone(), follower.clone(), token).await;
            this.tasks.lock().await.remove(&key(&shard, &follower));
        });
    }

    /// Whether a resync task is running for a pair
    pub async fn resync_running(&self, shard: &str, follower: &str) -> bool {
        self.tasks.lock().await.contains_key(&key(shard, follower))
    }

    /// Align a shard with its target configuration.
    ///
    /// Added followers start dropped and are resynchronized; removed ones
    /// have their resync cancelled and are fenced.
    pub async fn on_target_change(self: &Arc<Self>, shard: &str) -> Result<TargetPlan> {
        let plan = self.registry.plan_against_target(shard).await?;

        for follower in &plan.removed {
            if let Some(token) = self.tasks.lock().await.remove(&key(shard, follower)) {
                token.cancel();
            }
            self.pairs.lock().await.remove(&key(shard, follower));
            let generation = self.registry.view(shard).await?.generation;
            if let Err(e) = self.transport.fence(follower, shard, generation).await {
                tracing::debug!("Could not fence removed follower {}: {}", follower, e);
            }
        }

        for follower in &plan.added {
            self.pairs
                .lock()
                .await
                .insert(key(shard, follower), PairState::Dropped);
            self.spawn_resync(shard, follower).await;
        }

        Ok(plan)
    }

    /// Resynchronize every excluded follower of a shard, e.g. after a restart
    pub async fn resume_excluded(self: &Arc<Self>, shard: &str) -> Result<usize> {
        let view = self.registry.view(shard).await?;
        let excluded: Vec<String> = view
            .followers
            .values()
            .filter(|p| p.excluded)
            .map(|p| p.id.clone())
            .collect();
        for follower in &excluded {
            {
                let mut pairs = self.pairs.lock().await;
                pairs
                    .entry(key(shard, follower))
                    .or_insert(PairState::Dropped);
            }
            self.spawn_resync(shard, follower).await;
        }
        Ok(excluded.len())
    }

    /// Cancel the resync tasks of a shard and forget its pairs; returns the number cancelled
    pub async fn forget_shard(&self, shard: &str) -> usize {
        let cancelled = {
            let mut tasks = self.tasks.lock().await;
            let before = tasks.len();
            tasks.retain(|(s, _), token| {
                if s == shard {
                    token.cancel();
                    false
                } else {
                    true
                }
            });
            before - tasks.len()
        };
        self.pairs.lock().await.retain(|(s, _), _| s != shard);
        cancelled
    }

    /// Cancel every resync task
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub(super) fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
