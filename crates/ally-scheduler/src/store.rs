//! Plan store: owns the current timetable.
//!
//! Single writer, many readers: every mutation runs under the write half of
//! a `tokio::sync::RwLock` and bumps the plan version, so readers never see a
//! half-applied plan and re-plans computed off-lock can detect that they went
//! stale before swapping in.

use std::collections::BTreeSet;

use ally_core::config::PlannerConfig;
use ally_core::error::{AllyError, Result};
use ally_core::types::{AvailabilitySlot, Session, SessionStatus, Topic, TopicStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::allocator::{self, Allocation, AllocationRequest};
use crate::replan::{self, DirtyScope, ReplanJob};

/// Consistent copy of the plan at one version.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanSnapshot {
    pub topics: Vec<Topic>,
    pub slots: Vec<AvailabilitySlot>,
    pub sessions: Vec<Session>,
    pub at_risk: BTreeSet<String>,
    /// Sessions are never placed at or after this instant.
    pub horizon_end: Option<DateTime<Utc>>,
    pub version: u64,
}

impl PlanSnapshot {
    pub fn topic(&self, id: &str) -> Option<&Topic> {
        self.topics.iter().find(|t| t.id == id)
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    /// Planned and Shifted sessions, ordered by start.
    pub fn pending_sessions(&self) -> Vec<&Session> {
        let mut pending: Vec<&Session> = self.sessions.iter().filter(|s| s.is_pending()).collect();
        pending.sort_by_key(|s| s.start);
        pending
    }

    /// Sessions overlapping `[from, to)`, ordered by start.
    pub fn sessions_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| s.overlaps(from, to))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    fn in_some_slot(&self, slots: &[AvailabilitySlot], session: &Session) -> bool {
        slots.iter().any(|slot| slot.contains(session.start, session.end))
    }

    fn next_seq(&self) -> u64 {
        self.topics.iter().map(|t| t.seq + 1).max().unwrap_or(0)
    }
}

struct PlanState {
    plan: PlanSnapshot,
    dirty: DirtyScope,
}

impl PlanState {
    fn bump(&mut self) {
        self.plan.version += 1;
    }

    fn session_mut(&mut self, id: &str) -> Result<&mut Session> {
        self.plan
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| AllyError::NotFound(format!("session {id}")))
    }

    /// Swap an allocation into the plan: drop the future pending sessions of
    /// `scope` and insert the new ones. A new session placed exactly where a
    /// dropped one of the same topic was keeps the old id, so reminders keyed
    /// on it are not sent twice.
    ///
    /// Returns the ids that left the plan and the sessions that were placed.
    fn swap_future(
        &mut self,
        scope: &DirtyScope,
        now: DateTime<Utc>,
        allocation: Allocation,
    ) -> (Vec<String>, Vec<Session>) {
        let mut replaced: Vec<Session> = Vec::new();
        self.plan.sessions.retain(|s| {
            let replace = s.is_pending() && s.start >= now && scope.contains(&s.topic_id);
            if replace {
                replaced.push(s.clone());
            }
            !replace
        });

        let mut placed = Vec::with_capacity(allocation.sessions.len());
        for mut session in allocation.sessions {
            let same_spot = replaced.iter().position(|old| {
                old.topic_id == session.topic_id
                    && old.start == session.start
                    && old.end == session.end
            });
            if let Some(pos) = same_spot {
                session.id = replaced.remove(pos).id;
            }
            placed.push(session);
        }
        let removed = replaced.into_iter().map(|s| s.id).collect();
        self.plan.sessions.extend(placed.iter().cloned());
        self.plan.sessions.sort_by_key(|s| s.start);

        let topic_ids: Vec<String> = self.plan.topics.iter().map(|t| t.id.clone()).collect();
        self.plan.at_risk.retain(|id| !scope.contains(id));
        for id in topic_ids {
            if scope.contains(&id) && allocation.at_risk.contains(&id) {
                self.plan.at_risk.insert(id);
            }
        }
        (removed, placed)
    }
}

/// Result of committing a re-plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied {
        removed: Vec<String>,
        added: Vec<Session>,
    },
    /// The plan changed after the job's snapshot was taken; nothing was applied.
    Superseded,
}

/// The plan store. Cheap to share behind an `Arc`.
pub struct PlanStore {
    state: RwLock<PlanState>,
    policy: PlannerConfig,
}

impl PlanStore {
    pub fn new(policy: PlannerConfig) -> Self {
        Self {
            state: RwLock::new(PlanState {
                plan: PlanSnapshot::default(),
                dirty: DirtyScope::default(),
            }),
            policy,
        }
    }

    pub fn policy(&self) -> &PlannerConfig {
        &self.policy
    }

    /// Replace the whole plan, e.g. when restoring from storage.
    pub async fn restore(&self, snapshot: PlanSnapshot) {
        let mut state = self.state.write().await;
        let version = state.plan.version.max(snapshot.version) + 1;
        state.plan = snapshot;
        state.plan.version = version;
        state.dirty = DirtyScope::default();
        tracing::info!(
            "📂 Plan restored: {} topics, {} slots, {} sessions",
            state.plan.topics.len(),
            state.plan.slots.len(),
            state.plan.sessions.len()
        );
    }

    pub async fn snapshot(&self) -> PlanSnapshot {
        self.state.read().await.plan.clone()
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.plan.version
    }

    /// Sessions overlapping `[from, to)`. Never mutates.
    pub async fn current_plan(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Session> {
        self.state.read().await.plan.sessions_between(from, to)
    }

    pub async fn topics_at_risk(&self) -> Vec<Topic> {
        let state = self.state.read().await;
        state
            .plan
            .topics
            .iter()
            .filter(|t| t.is_active() && state.plan.at_risk.contains(&t.id))
            .cloned()
            .collect()
    }

    /// Add topics and place them into free capacity. Atomic: on error nothing
    /// is added.
    pub async fn create_plan(
        &self,
        topics: Vec<Topic>,
        horizon_end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        for topic in &topics {
            topic.validate()?;
        }

        let mut state = self.state.write().await;
        let mut next_seq = state.plan.next_seq();
        let mut new_topics = Vec::with_capacity(topics.len());
        for mut topic in topics {
            if state.plan.topic(&topic.id).is_some() {
                return Err(AllyError::InvalidState(format!("topic {} already exists", topic.id)));
            }
            topic.seq = next_seq;
            next_seq += 1;
            new_topics.push(topic);
        }

        let horizon_end = horizon_end.or(state.plan.horizon_end);
        let allocation = allocator::allocate(
            &AllocationRequest {
                topics: &new_topics,
                availability: &state.plan.slots,
                fixed: &state.plan.sessions,
                now,
                horizon_end,
            },
            &self.policy,
        )?;

        let scope = DirtyScope::topics(new_topics.iter().map(|t| t.id.clone()));
        state.plan.topics.extend(new_topics);
        state.plan.horizon_end = horizon_end;
        state.swap_future(&scope, now, allocation);
        state.bump();

        let created: Vec<Session> = state
            .plan
            .sessions
            .iter()
            .filter(|s| scope.contains(&s.topic_id))
            .cloned()
            .collect();
        tracing::info!(
            "🗓️ Plan created: {} topics, {} sessions, {} at risk",
            scope.len(),
            created.len(),
            state.plan.at_risk.len()
        );
        Ok(created)
    }

    /// Planned session whose end has passed → Missed. The topic is queued for re-plan.
    pub async fn mark_missed(&self, session_id: &str, now: DateTime<Utc>) -> Result<Session> {
        let mut state = self.state.write().await;
        let session = state.session_mut(session_id)?;
        if !session.is_pending() {
            return Err(AllyError::InvalidState(format!(
                "session {session_id} is {:?}, not planned",
                session.status
            )));
        }
        if session.end >= now {
            return Err(AllyError::InvalidState(format!(
                "session {session_id} has not ended yet"
            )));
        }
        session.status = SessionStatus::Missed;
        let session = session.clone();
        state.dirty.mark_topic(&session.topic_id);
        state.bump();
        tracing::info!("❌ Session missed: {} ({})", session.subject, session.id);
        Ok(session)
    }

    /// Pending session → Completed; the topic's remaining effort shrinks.
    pub async fn record_completed(&self, session_id: &str) -> Result<Session> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let session = state.session_mut(session_id)?;
        if !session.is_pending() {
            return Err(AllyError::InvalidState(format!(
                "session {session_id} is {:?}, not planned",
                session.status
            )));
        }
        session.status = SessionStatus::Completed;
        let session = session.clone();

        if let Some(topic) = state.plan.topics.iter_mut().find(|t| t.id == session.topic_id) {
            topic.remaining_minutes = (topic.remaining_minutes - session.minutes()).max(0);
            if topic.remaining_minutes == 0 && topic.is_active() {
                topic.status = TopicStatus::Completed;
                tracing::info!("🎓 Topic completed: {}", topic.subject);
                let id = topic.id.clone();
                state.dirty.mark_topic(&id);
            }
        }
        state.bump();
        Ok(session)
    }

    /// Move one pending session to `new_start`, keeping its duration.
    pub async fn shift_session(
        &self,
        session_id: &str,
        new_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        let mut state = self.state.write().await;
        let current = state
            .plan
            .session(session_id)
            .cloned()
            .ok_or_else(|| AllyError::NotFound(format!("session {session_id}")))?;
        if !current.is_pending() {
            return Err(AllyError::InvalidState(format!(
                "session {session_id} is {:?}, not planned",
                current.status
            )));
        }
        if new_start < now {
            return Err(AllyError::InvalidState(format!(
                "cannot shift session {session_id} into the past"
            )));
        }

        let new_end = new_start + (current.end - current.start);
        if let Some(other) = state
            .plan
            .sessions
            .iter()
            .find(|s| s.id != current.id && s.occupies_time() && s.overlaps(new_start, new_end))
        {
            return Err(AllyError::ConflictingSlot(format!(
                "{}..{} overlaps session {}",
                new_start, new_end, other.id
            )));
        }
        if !state.plan.slots.iter().any(|slot| slot.contains(new_start, new_end)) {
            return Err(AllyError::ConflictingSlot(format!(
                "{new_start}..{new_end} is outside every availability slot"
            )));
        }

        let session = state.session_mut(session_id)?;
        session.start = new_start;
        session.end = new_end;
        session.status = SessionStatus::Shifted;
        let session = session.clone();
        state.plan.sessions.sort_by_key(|s| s.start);
        state.bump();
        tracing::info!("↔️ Session shifted: {} → {}", session.id, session.start);
        Ok(session)
    }

    /// Add a non-overlapping availability slot. Queues a full re-plan.
    pub async fn add_availability(&self, slot: AvailabilitySlot) -> Result<AvailabilitySlot> {
        slot.validate()?;
        let mut state = self.state.write().await;
        let clash = state
            .plan
            .slots
            .iter()
            .find(|s| s.overlaps(&slot) || s.id == slot.id);
        if let Some(existing) = clash {
            return Err(AllyError::ConflictingSlot(format!(
                "slot {}..{} overlaps slot {}",
                slot.start, slot.end, existing.id
            )));
        }
        state.plan.slots.push(slot.clone());
        state.plan.slots.sort_by_key(|s| s.start);
        state.dirty.mark_all();
        state.bump();
        tracing::info!("➕ Availability added: {} → {}", slot.start, slot.end);
        Ok(slot)
    }

    /// Remove a slot. Fails with `CapacityViolation` when sessions placed in
    /// it cannot be re-homed in the remaining availability.
    pub async fn remove_availability(&self, slot_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.plan.slots.iter().any(|s| s.id == slot_id) {
            return Err(AllyError::NotFound(format!("slot {slot_id}")));
        }
        let remaining: Vec<AvailabilitySlot> = state
            .plan
            .slots
            .iter()
            .filter(|s| s.id != slot_id)
            .cloned()
            .collect();
        self.replace_slots(&mut state, remaining, now)?;
        tracing::info!("➖ Availability removed: {slot_id}");
        Ok(())
    }

    /// Replace the whole availability set.
    pub async fn set_availability(
        &self,
        slots: Vec<AvailabilitySlot>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for slot in &slots {
            slot.validate()?;
        }
        for (i, a) in slots.iter().enumerate() {
            if let Some(b) = slots.iter().skip(i + 1).find(|b| a.overlaps(b)) {
                return Err(AllyError::ConflictingSlot(format!(
                    "slots {} and {} overlap",
                    a.id, b.id
                )));
            }
        }
        let mut state = self.state.write().await;
        self.replace_slots(&mut state, slots, now)?;
        tracing::info!("🗂️ Availability replaced: {} slots", state.plan.slots.len());
        Ok(())
    }

    fn replace_slots(
        &self,
        state: &mut PlanState,
        mut slots: Vec<AvailabilitySlot>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        slots.sort_by_key(|s| s.start);
        let orphans: Vec<&Session> = state
            .plan
            .sessions
            .iter()
            .filter(|s| s.is_pending() && s.end > now && !state.plan.in_some_slot(&slots, s))
            .collect();

        if orphans.is_empty() {
            state.plan.slots = slots;
            state.dirty.mark_all();
            state.bump();
            return Ok(());
        }

        if let Some(running) = orphans.iter().find(|s| s.start < now) {
            return Err(AllyError::CapacityViolation(format!(
                "session {} is in progress inside the slot",
                running.id
            )));
        }

        // Dry run: can the orphaned topics be re-homed without the slot?
        let orphan_count = orphans.len();
        let scope = DirtyScope::topics(orphans.iter().map(|s| s.topic_id.clone()));
        let (topics, fixed) = replan::scoped_inputs(&state.plan, &scope, now);
        let allocation = allocator::allocate(
            &AllocationRequest {
                topics: &topics,
                availability: &slots,
                fixed: &fixed,
                now,
                horizon_end: state.plan.horizon_end,
            },
            &self.policy,
        )
        .map_err(|e| {
            AllyError::CapacityViolation(format!(
                "{orphan_count} future sessions would be orphaned ({e}); \
                 re-plan or add availability first"
            ))
        })?;
        if !allocation.unplaced.is_empty() {
            return Err(AllyError::CapacityViolation(format!(
                "{orphan_count} future sessions would be orphaned; {} chunks cannot be re-homed",
                allocation.unplaced.len()
            )));
        }

        state.plan.slots = slots;
        let (moved, _) = state.swap_future(&scope, now, allocation);
        state.dirty.mark_all();
        state.bump();
        tracing::info!("🔀 Re-homed {} sessions after availability change", moved.len());
        Ok(())
    }

    /// Stop planning a topic. Its future sessions are dropped by the next re-plan.
    pub async fn remove_topic(&self, topic_id: &str) -> Result<Topic> {
        let mut state = self.state.write().await;
        let topic = state
            .plan
            .topics
            .iter_mut()
            .find(|t| t.id == topic_id)
            .ok_or_else(|| AllyError::NotFound(format!("topic {topic_id}")))?;
        if topic.status == TopicStatus::Removed {
            return Err(AllyError::InvalidState(format!("topic {topic_id} already removed")));
        }
        topic.status = TopicStatus::Removed;
        let topic = topic.clone();
        state.dirty.mark_topic(topic_id);
        state.bump();
        tracing::info!("🗑️ Topic removed: {}", topic.subject);
        Ok(topic)
    }

    /// Snapshot the dirty scope for an off-lock re-plan. `None` when nothing changed.
    pub(crate) async fn begin_replan(&self, now: DateTime<Utc>) -> Option<ReplanJob> {
        let state = self.state.read().await;
        if state.dirty.is_empty() {
            return None;
        }
        Some(ReplanJob {
            version: state.plan.version,
            scope: state.dirty.clone(),
            snapshot: state.plan.clone(),
            now,
        })
    }

    /// Swap a re-plan result in, unless the plan moved on since the job started.
    pub(crate) async fn commit_replan(
        &self,
        job: &ReplanJob,
        allocation: Allocation,
    ) -> CommitOutcome {
        let mut state = self.state.write().await;
        if state.plan.version != job.version {
            tracing::debug!(
                "⏭️ Discarding stale re-plan (v{} != v{})",
                job.version,
                state.plan.version
            );
            return CommitOutcome::Superseded;
        }
        let (removed, added) = state.swap_future(&job.scope, job.now, allocation);
        state.dirty = DirtyScope::default();
        state.bump();
        CommitOutcome::Applied { removed, added }
    }

    /// Flag the active topics of a failed re-plan as at risk, unless the plan
    /// moved on meanwhile. The scope stays dirty so the next run retries.
    pub(crate) async fn flag_at_risk(&self, job: &ReplanJob) -> Vec<String> {
        let mut state = self.state.write().await;
        if state.plan.version != job.version {
            return Vec::new();
        }
        let flagged: Vec<String> = state
            .plan
            .topics
            .iter()
            .filter(|t| {
                t.is_active() && job.scope.contains(&t.id) && !state.plan.at_risk.contains(&t.id)
            })
            .map(|t| t.id.clone())
            .collect();
        if !flagged.is_empty() {
            state.plan.at_risk.extend(flagged.iter().cloned());
            state.bump();
            tracing::warn!("⚠️ {} topics flagged at risk after a failed re-plan", flagged.len());
        }
        flagged
    }
}
