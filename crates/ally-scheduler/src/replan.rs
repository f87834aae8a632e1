//! Re-plan trigger: re-allocates only the part of the plan a mutation touched.
//!
//! ```text
//! mutation ──► dirty scope (topics | all)
//!   run():  read lock  → snapshot + scope + version
//!           no lock    → allocate(scoped topics, now..)
//!           write lock → version unchanged? swap future sessions : discard
//! ```
//!
//! Past and completed sessions are never touched; only pending sessions of
//! the scoped topics that start at or after `now` are replaced.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use ally_core::config::PlannerConfig;
use ally_core::error::{AllyError, Result};
use ally_core::types::{Session, Topic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::allocator::{self, AllocationRequest};
use crate::store::{CommitOutcome, PlanSnapshot, PlanStore};

/// Which topics need re-planning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyScope {
    all: bool,
    topics: BTreeSet<String>,
}

impl DirtyScope {
    pub fn topics(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            all: false,
            topics: ids.into_iter().collect(),
        }
    }

    pub fn everything() -> Self {
        Self {
            all: true,
            topics: BTreeSet::new(),
        }
    }

    pub fn mark_topic(&mut self, id: &str) {
        if !self.all {
            self.topics.insert(id.to_string());
        }
    }

    pub fn mark_all(&mut self) {
        self.all = true;
        self.topics.clear();
    }

    pub fn contains(&self, topic_id: &str) -> bool {
        self.all || self.topics.contains(topic_id)
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.topics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_all(&self) -> bool {
        self.all
    }
}

/// Work item captured under the read lock.
#[derive(Debug, Clone)]
pub struct ReplanJob {
    pub version: u64,
    pub scope: DirtyScope,
    pub snapshot: PlanSnapshot,
    pub now: DateTime<Utc>,
}

/// Allocator inputs for a scope: the scoped active topics with the effort
/// still to be placed, and every session that stays put.
pub fn scoped_inputs(
    plan: &PlanSnapshot,
    scope: &DirtyScope,
    now: DateTime<Utc>,
) -> (Vec<Topic>, Vec<Session>) {
    let replaced = |s: &Session| s.is_pending() && s.start >= now && scope.contains(&s.topic_id);

    let fixed: Vec<Session> = plan.sessions.iter().filter(|&s| !replaced(s)).cloned().collect();

    let topics = plan
        .topics
        .iter()
        .filter(|t| t.is_active() && scope.contains(&t.id))
        .map(|t| {
            // Pending sessions that already started stay and still count.
            let kept: i64 = fixed
                .iter()
                .filter(|s| s.topic_id == t.id && s.is_pending())
                .map(Session::minutes)
                .sum();
            let mut projected = t.clone();
            projected.remaining_minutes = (t.remaining_minutes - kept).max(0);
            projected
        })
        .collect();

    (topics, fixed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplanOutcome {
    /// Nothing was dirty.
    Idle,
    Applied,
    /// A newer mutation landed first; the result was discarded.
    Superseded,
}

/// What a re-plan run did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanReport {
    pub outcome: ReplanOutcome,
    /// Sessions starting before this instant were left untouched.
    pub horizon_start: DateTime<Utc>,
    /// Topic ids in scope; empty with `all_topics` set for a full re-plan.
    pub scope: Vec<String>,
    pub all_topics: bool,
    /// Ids of the future sessions that left the plan.
    pub removed: Vec<String>,
    /// Sessions placed by this run. Unmoved ones keep their old ids.
    pub added: Vec<Session>,
    pub at_risk: Vec<String>,
}

impl ReplanReport {
    fn idle(now: DateTime<Utc>) -> Self {
        Self {
            outcome: ReplanOutcome::Idle,
            horizon_start: now,
            scope: Vec::new(),
            all_topics: false,
            removed: Vec::new(),
            added: Vec::new(),
            at_risk: Vec::new(),
        }
    }
}

/// Counters for observability and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplanStats {
    pub runs: u64,
    pub applied: u64,
    pub superseded: u64,
    pub failed: u64,
}

/// Runs scoped re-plans against a [`PlanStore`].
pub struct Replanner {
    policy: PlannerConfig,
    runs: AtomicU64,
    applied: AtomicU64,
    superseded: AtomicU64,
    failed: AtomicU64,
}

impl Replanner {
    pub fn new(policy: PlannerConfig) -> Self {
        Self {
            policy,
            runs: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            superseded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Re-plan whatever is dirty. Infeasible results leave the future sessions
    /// intact and flag the scoped topics at risk.
    pub async fn run(&self, store: &PlanStore, now: DateTime<Utc>) -> Result<ReplanReport> {
        let Some(job) = store.begin_replan(now).await else {
            return Ok(ReplanReport::idle(now));
        };
        self.runs.fetch_add(1, Ordering::Relaxed);

        let mut report = match self.compute(&job) {
            Ok(report) => report,
            Err(e) => {
                if matches!(e, AllyError::InfeasibleConstraints { .. }) {
                    store.flag_at_risk(&job).await;
                }
                return Err(e);
            }
        };
        match store.commit_replan(&job, report.1).await {
            CommitOutcome::Applied { removed, added } => {
                self.applied.fetch_add(1, Ordering::Relaxed);
                report.0.removed = removed;
                report.0.added = added;
                tracing::info!(
                    "🔁 Re-plan applied: {} replaced, {} added, {} at risk",
                    report.0.removed.len(),
                    report.0.added.len(),
                    report.0.at_risk.len()
                );
                Ok(report.0)
            }
            CommitOutcome::Superseded => {
                self.superseded.fetch_add(1, Ordering::Relaxed);
                report.0.outcome = ReplanOutcome::Superseded;
                report.0.added.clear();
                Ok(report.0)
            }
        }
    }

    /// Allocate a job without touching the store.
    pub(crate) fn compute(&self, job: &ReplanJob) -> Result<(ReplanReport, allocator::Allocation)> {
        let (topics, fixed) = scoped_inputs(&job.snapshot, &job.scope, job.now);
        let allocation = allocator::allocate(
            &AllocationRequest {
                topics: &topics,
                availability: &job.snapshot.slots,
                fixed: &fixed,
                now: job.now,
                horizon_end: job.snapshot.horizon_end,
            },
            &self.policy,
        )
        .inspect_err(|e| {
            self.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("⚠️ Re-plan failed, keeping previous plan: {e}");
        })?;

        let report = ReplanReport {
            outcome: ReplanOutcome::Applied,
            horizon_start: job.now,
            scope: job.scope.topics.iter().cloned().collect(),
            all_topics: job.scope.is_all(),
            removed: Vec::new(),
            added: allocation.sessions.clone(),
            at_risk: allocation.at_risk.iter().cloned().collect(),
        };
        Ok((report, allocation))
    }

    pub fn stats(&self) -> ReplanStats {
        ReplanStats {
            runs: self.runs.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
