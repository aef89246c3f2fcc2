//! Participant Registry
//!
//! Per-shard source of truth for term, generation, leader and follower set.
//! Every effective change of the follower set bumps the generation, and
//! generation-guarded mutations from a stale view are rejected. Changes are
//! persisted through the [`StateTracker`] and published to the
//! [`ConfigurationStore`] while the shard's own lock is held, so published
//! generations of a shard are observed in order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use super::target::{ConfigurationStore, FollowerRecord, ShardSnapshot};
use super::tracker::StateTracker;
use crate::error::{Error, Result};
use crate::metrics::ReplicationMetrics;
use crate::store::Seq;

/// Role of a participant for one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    /// Whether this participant assigns sequence numbers to writes
    pub fn originates_writes(&self) -> bool {
        matches!(self, Role::Leader)
    }

    /// Whether this participant can be excluded from the replication set
    pub fn subject_to_drop(&self) -> bool {
        matches!(self, Role::Follower)
    }

    /// Whether this participant's state wins during repair
    pub fn authoritative_for_repair(&self) -> bool {
        matches!(self, Role::Leader)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "LEADER"),
            Role::Follower => write!(f, "FOLLOWER"),
        }
    }
}

/// Participation status derived from the participant flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantStatus {
    Active,
    Suspect,
    Excluded,
}

impl std::fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParticipantStatus::Active => write!(f, "ACTIVE"),
            ParticipantStatus::Suspect => write!(f, "SUSPECT"),
            ParticipantStatus::Excluded => write!(f, "EXCLUDED"),
        }
    }
}

/// A server taking part in one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub role: Role,
    /// Last durably applied sequence number
    pub applied_index: Seq,
    pub excluded: bool,
    pub suspect: bool,
    pub last_failure: Option<String>,
}

impl Participant {
    fn new(id: &str, role: Role) -> Self {
        Self {
            id: id.to_string(),
            role,
            applied_index: 0,
            excluded: false,
            suspect: false,
            last_failure: None,
        }
    }

    pub fn status(&self) -> ParticipantStatus {
        if self.excluded {
            ParticipantStatus::Excluded
        } else if self.suspect {
            ParticipantStatus::Suspect
        } else {
            ParticipantStatus::Active
        }
    }
}

/// Generation-stamped view of one shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardView {
    pub shard: String,
    pub term: u64,
    pub generation: u64,
    pub leader: Participant,
    pub followers: BTreeMap<String, Participant>,
    pub degraded: bool,
}

impl ShardView {
    /// Role of a node in this shard
    pub fn role_of(&self, id: &str) -> Option<Role> {
        if self.leader.id == id {
            Some(self.leader.role)
        } else {
            self.followers.get(id).map(|p| p.role)
        }
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        if self.leader.id == id {
            Some(&self.leader)
        } else {
            self.followers.get(id)
        }
    }

    /// Followers currently in the replication set
    pub fn active_followers(&self) -> Vec<&Participant> {
        self.followers.values().filter(|p| !p.excluded).collect()
    }

    /// Last sequence the leader assigned
    pub fn leader_seq(&self) -> Seq {
        self.leader.applied_index
    }

    pub fn snapshot(&self) -> ShardSnapshot {
        ShardSnapshot {
            shard: self.shard.clone(),
            term: self.term,
            generation: self.generation,
            leader: self.leader.id.clone(),
            leader_seq: self.leader.applied_index,
            followers: self
                .followers
                .values()
                .map(|p| FollowerRecord {
                    id: p.id.clone(),
                    status: p.status(),
                    applied_index: p.applied_index,
                    last_failure: p.last_failure.clone(),
                })
                .collect(),
            degraded: self.degraded,
            published_at: chrono::Utc::now(),
        }
    }

    fn refresh_degraded(&mut self) {
        self.degraded = self.followers.values().all(|p| p.excluded);
    }
}

/// Outcome of diffing a shard against its target configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetPlan {
    /// Followers added to the set; they start excluded and need a resync
    pub added: Vec<String>,
    /// Followers removed from the set
    pub removed: Vec<String>,
}

impl TargetPlan {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

struct ShardEntry {
    state: Mutex<ShardState>,
    establishing: Mutex<()>,
}

struct ShardState {
    view: ShardView,
    /// Set on decommission; holders of a stale entry must not resurrect the shard
    retired: bool,
}

impl ShardEntry {
    fn new(view: ShardView) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ShardState {
                view,
                retired: false,
            }),
            establishing: Mutex::new(()),
        })
    }
}

impl ShardState {
    fn live(&mut self) -> Result<&mut ShardView> {
        if self.retired {
            return Err(Error::ShardNotFound(self.view.shard.clone()));
        }
        Ok(&mut self.view)
    }
}

/// Registry of shard participants.
///
/// The shard map lock is only taken to look up, add or remove a shard.
/// Mutations, persistence and publication run under the lock of the one
/// shard they touch, so a slow store never stalls the other shards.
pub struct ParticipantRegistry {
    shards: RwLock<HashMap<String, Arc<ShardEntry>>>,
    tracker: Option<Arc<StateTracker>>,
    config_store: Option<Arc<dyn ConfigurationStore>>,
    metrics: Arc<ReplicationMetrics>,
}

impl ParticipantRegistry {
    /// Create an in-memory registry
    pub fn new(metrics: Arc<ReplicationMetrics>) -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            tracker: None,
            config_store: None,
            metrics,
        }
    }

    /// Persist every change through `tracker`
    pub fn with_tracker(mut self, tracker: Arc<StateTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Publish every change to `store`
    pub fn with_config_store(mut self, store: Arc<dyn ConfigurationStore>) -> Self {
        self.config_store = Some(store);
        self
    }

    /// Reload persisted shards, returning how many were restored
    pub async fn restore(&self) -> Result<usize> {
        let Some(tracker) = &self.tracker else {
            return Ok(0);
        };
        let views = tracker.load_shards().await?;
        let restored = views.len();
        let mut shards = self.shards.write().await;
        for view in views {
            self.metrics.set_degraded(&view.shard, view.degraded);
            tracing::info!(
                "Restored shard {} at term {} generation {}",
                view.shard,
                view.term,
                view.generation
            );
            shards.insert(view.shard.clone(), ShardEntry::new(view));
        }
        Ok(restored)
    }

    /// Create a shard with its leader and initial followers
    pub async fn provision(&self, shard: &str, leader: &str, followers: &[String]) -> Result<ShardView> {
        if followers.iter().any(|f| f == leader) {
            return Err(Error::Config(format!(
                "leader {} of shard {} cannot also follow it",
                leader, shard
            )));
        }

        let mut view = ShardView {
            shard: shard.to_string(),
            term: 1,
            generation: 1,
            leader: Participant::new(leader, Role::Leader),
            followers: followers
                .iter()
                .map(|f| (f.clone(), Participant::new(f, Role::Follower)))
                .collect(),
            degraded: false,
        };
        view.refresh_degraded();

        let entry = ShardEntry::new(view.clone());
        let mut state = entry.state.lock().await;
        {
            let mut shards = self.shards.write().await;
            if let Some(existing) = shards.get(shard).cloned() {
                drop(shards);
                drop(state);
                let mut existing = existing.state.lock().await;
                let view = existing.live()?.clone();
                return Ok(view);
            }
            shards.insert(shard.to_string(), entry.clone());
        }

        tracing::info!(
            "Provisioned shard {} led by {} with {} followers",
            shard,
            view.leader.id,
            view.followers.len()
        );
        if let Err(e) = self.commit_change(&view).await {
            state.retired = true;
            self.shards.write().await.remove(shard);
            return Err(e);
        }
        Ok(view)
    }

    /// Remove a shard and all its participants
    pub async fn decommission(&self, shard: &str) -> Result<()> {
        let entry = self
            .shards
            .write()
            .await
            .remove(shard)
            .ok_or_else(|| Error::ShardNotFound(shard.to_string()))?;
        let mut state = entry.state.lock().await;
        state.retired = true;
        for follower in state.view.followers.keys() {
            self.metrics.clear_follower_seq(shard, follower);
        }
        self.metrics.set_degraded(shard, false);
        if let Some(tracker) = &self.tracker {
            tracker.delete_shard(shard).await?;
        }
        tracing::debug!("Shard {} removed from the registry", shard);
        Ok(())
    }

    async fn entry(&self, shard: &str) -> Result<Arc<ShardEntry>> {
        self.shards
            .read()
            .await
            .get(shard)
            .cloned()
            .ok_or_else(|| Error::ShardNotFound(shard.to_string()))
    }

    /// Generation-stamped view of a shard
    pub async fn view(&self, shard: &str) -> Result<ShardView> {
        let entry = self.entry(shard).await?;
        let mut state = entry.state.lock().await;
        let view = state.live()?.clone();
        Ok(view)
    }

    /// Views of all shards, ordered by id
    pub async fn views(&self) -> Vec<ShardView> {
        let entries: Vec<Arc<ShardEntry>> = self.shards.read().await.values().cloned().collect();
        let mut views = Vec::with_capacity(entries.len());
        for entry in entries {
            let state = entry.state.lock().await;
            if !state.retired {
                views.push(state.view.clone());
            }
        }
        views.sort_by(|a, b| a.shard.cmp(&b.shard));
        views
    }

    /// Re-include an excluded follower, guarded by the generation it was verified against
    pub async fn admit(&self, shard: &str, follower: &str, expected_generation: u64) -> Result<u64> {
        self.mutate(shard, |view| {
            if view.generation != expected_generation {
                return Err(Error::StaleGeneration {
                    shard: view.shard.clone(),
                    expected: expected_generation,
                    current: view.generation,
                });
            }
            let participant = view.followers.get_mut(follower).ok_or_else(|| {
                Error::ParticipantNotFound {
                    shard: view.shard.clone(),
                    participant: follower.to_string(),
                }
            })?;
            if !participant.excluded {
                return Ok(false);
            }

            participant.excluded = false;
            participant.suspect = false;
            participant.last_failure = None;
            participant.applied_index = view.leader.applied_index;
            view.generation += 1;
            view.refresh_degraded();
            tracing::info!(
                "Admitted {} to shard {} at generation {}",
                follower,
                view.shard,
                view.generation
            );
            Ok(true)
        })
        .await
        .map(|view| view.generation)
    }

    /// Exclude a follower from the replication set. Idempotent.
    pub async fn drop_follower(&self, shard: &str, follower: &str) -> Result<u64> {
        let mut dropped = false;
        let view = self
            .mutate(shard, |view| {
                if let Some(role) = view.role_of(follower) {
                    if !role.subject_to_drop() {
                        return Err(Error::State(format!(
                            "{} is the {} of shard {} and cannot be dropped",
                            follower, role, view.shard
                        )));
                    }
                }
                let Some(participant) = view.followers.get_mut(follower) else {
                    return Ok(false);
                };
                if participant.excluded {
                    return Ok(false);
                }

                participant.excluded = true;
                participant.suspect = false;
                view.generation += 1;
                view.refresh_degraded();
                tracing::warn!(
                    "Dropped {} from shard {} at generation {}",
                    follower,
                    view.shard,
                    view.generation
                );
                dropped = true;
                Ok(true)
            })
            .await?;

        if dropped {
            self.metrics.increment_dropped_followers();
        }
        Ok(view.generation)
    }

    /// Make `candidate` the leader of a shard under a new term.
    ///
    /// Establishment is serialized per shard; a concurrent attempt fails fast.
    pub async fn establish_leader(&self, shard: &str, candidate: &str) -> Result<u64> {
        let entry = self.entry(shard).await?;
        let _guard = entry
            .establishing
            .try_lock()
            .map_err(|_| Error::EstablishmentInProgress(shard.to_string()))?;

        let view = self
            .mutate_entry(&entry, |view| {
                if view.leader.id == candidate {
                    return Ok(false);
                }

                let mut previous = std::mem::replace(
                    &mut view.leader,
                    view.followers
                        .remove(candidate)
                        .unwrap_or_else(|| Participant::new(candidate, Role::Follower)),
                );
                view.leader.role = Role::Leader;
                view.leader.excluded = false;
                view.leader.suspect = false;

                // The old leader rejoins as a follower once it has been verified
                previous.role = Role::Follower;
                previous.excluded = true;
                view.followers.insert(previous.id.clone(), previous);

                view.term += 1;
                view.generation += 1;
                view.refresh_degraded();
                tracing::info!(
                    "{} leads shard {} in term {}",
                    candidate,
                    view.shard,
                    view.term
                );
                Ok(true)
            })
            .await?;

        Ok(view.term)
    }

    /// Record a follower's applied index. Never decreases, never passes the leader.
    pub async fn record_applied(&self, shard: &str, follower: &str, index: Seq) -> Result<()> {
        let entry = self.entry(shard).await?;
        let mut state = entry.state.lock().await;
        let view = state.live()?;
        let leader_seq = view.leader.applied_index;
        let participant = view.followers.get_mut(follower).ok_or_else(|| {
            Error::ParticipantNotFound {
                shard: shard.to_string(),
                participant: follower.to_string(),
            }
        })?;

        if index > leader_seq {
            tracing::warn!(
                "{} reported applied index {} beyond leader seq {} on shard {}",
                follower,
                index,
                leader_seq,
                shard
            );
        }
        let index = index.min(leader_seq);
        if index > participant.applied_index {
            participant.applied_index = index;
            self.metrics.set_follower_seq(shard, follower, index);
        }
        Ok(())
    }

    /// Reserve `seq` as the last sequence number the leader assigned.
    ///
    /// The reservation is durable before it becomes visible, so a restarted
    /// leader never reuses a sequence number. On error nothing changes.
    pub async fn record_leader_seq(&self, shard: &str, seq: Seq) -> Result<()> {
        let entry = self.entry(shard).await?;
        let mut state = entry.state.lock().await;
        let view = state.live()?;
        if seq <= view.leader.applied_index {
            return Ok(());
        }
        let mut next = view.clone();
        next.leader.applied_index = seq;
        if let Some(tracker) = &self.tracker {
            tracker.save_shard(&next).await?;
        }
        *view = next;
        Ok(())
    }

    /// Flag or clear a follower as suspect
    pub async fn set_suspect(&self, shard: &str, follower: &str, suspect: bool) -> Result<()> {
        self.update_follower(shard, follower, |p| p.suspect = suspect && !p.excluded)
            .await
    }

    /// Remember why a follower last failed to commit
    pub async fn record_failure(&self, shard: &str, follower: &str, reason: &str) -> Result<()> {
        self.update_follower(shard, follower, |p| p.last_failure = Some(reason.to_string()))
            .await
    }

    /// Align the follower set with the target held by the configuration store
    pub async fn plan_against_target(&self, shard: &str) -> Result<TargetPlan> {
        let Some(store) = self.config_store.clone() else {
            return Ok(TargetPlan::default());
        };
        let Some(target) = store.read_target(shard).await? else {
            return Ok(TargetPlan::default());
        };

        let mut plan = TargetPlan::default();
        self.mutate(shard, |view| {
            if target.leader != view.leader.id {
                tracing::warn!(
                    "Target leader {} of shard {} differs from current leader {}",
                    target.leader,
                    view.shard,
                    view.leader.id
                );
            }

            for id in &target.followers {
                if id != &view.leader.id && !view.followers.contains_key(id) {
                    let mut participant = Participant::new(id, Role::Follower);
                    participant.excluded = true;
                    view.followers.insert(id.clone(), participant);
                    plan.added.push(id.clone());
                }
            }
            let removed: Vec<String> = view
                .followers
                .keys()
                .filter(|id| !target.followers.contains(id))
                .cloned()
                .collect();
            for id in &removed {
                view.followers.remove(id);
            }
            plan.removed = removed;

            if plan.is_empty() {
                return Ok(false);
            }
            view.generation += 1;
            view.refresh_degraded();
            tracing::info!(
                "Shard {} target applied: +{:?} -{:?} at generation {}",
                view.shard,
                plan.added,
                plan.removed,
                view.generation
            );
            Ok(true)
        })
        .await?;

        for id in &plan.removed {
            self.metrics.clear_follower_seq(shard, id);
        }
        Ok(plan)
    }

    /// Change advisory follower flags. These are published but not persisted;
    /// a restarted leader re-derives them from fresh deliveries.
    async fn update_follower<F>(&self, shard: &str, follower: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Participant),
    {
        let entry = self.entry(shard).await?;
        let mut state = entry.state.lock().await;
        let view = state.live()?;
        let participant = view.followers.get_mut(follower).ok_or_else(|| {
            Error::ParticipantNotFound {
                shard: shard.to_string(),
                participant: follower.to_string(),
            }
        })?;
        let before = participant.clone();
        f(participant);
        if *participant != before {
            self.publish(view).await;
        }
        Ok(())
    }

    async fn mutate<F>(&self, shard: &str, f: F) -> Result<ShardView>
    where
        F: FnOnce(&mut ShardView) -> Result<bool>,
    {
        let entry = self.entry(shard).await?;
        self.mutate_entry(&entry, f).await
    }

    /// Apply a mutation to a copy of the view; keep it only if it reports a change
    async fn mutate_entry<F>(&self, entry: &ShardEntry, f: F) -> Result<ShardView>
    where
        F: FnOnce(&mut ShardView) -> Result<bool>,
    {
        let mut state = entry.state.lock().await;
        let current = state.live()?;

        let mut view = current.clone();
        if !f(&mut view)? {
            return Ok(view);
        }

        self.commit_change(&view).await?;
        *current = view.clone();
        Ok(view)
    }

    /// Persist, publish and mirror into metrics a changed view
    async fn commit_change(&self, view: &ShardView) -> Result<()> {
        if let Some(tracker) = &self.tracker {
            tracker.save_shard(view).await?;
        }
        self.metrics.set_degraded(&view.shard, view.degraded);
        self.publish(view).await;
        Ok(())
    }

    async fn publish(&self, view: &ShardView) {
        if let Some(store) = &self.config_store {
            if let Err(e) = store.publish_current(view.snapshot()).await {
                tracing::warn!("Failed to publish configuration of shard {}: {}", view.shard, e);
            }
        }
    }
}
