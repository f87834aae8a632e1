//! Reminder scheduler: turns the plan into timed reminders and emits each
//! logical occurrence at most once.
//!
//! The queue is a cache: on every tick where the plan version moved forward,
//! the wanted reminders are re-derived from the snapshot, stale ones are
//! cancelled and new ones queued. A reminder that is already due survives the
//! re-derivation as long as its session or topic is still there at the same
//! time. Keys that already fired are never queued again, so a session shifted
//! five times still produces one start reminder.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use ally_core::config::{MAX_MINUTES, ReminderConfig};
use ally_core::error::{AllyError, Result};
use ally_core::types::{new_id, ReminderEvent, ReminderKey, ReminderState};
use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::store::PlanSnapshot;

/// Fired reminders kept in memory.
const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    trigger_at: DateTime<Utc>,
    seq: u64,
    event_id: String,
    key: ReminderKey,
}

/// Derive every reminder the plan currently calls for.
pub fn derive_events(
    plan: &PlanSnapshot,
    config: &ReminderConfig,
    now: DateTime<Utc>,
) -> Vec<ReminderEvent> {
    let mut events = Vec::new();
    let pending = plan.pending_sessions();
    let lead = Duration::minutes(config.session_lead_minutes);
    let break_window = Duration::minutes(config.break_window_minutes);

    for session in pending.iter().filter(|s| s.start >= now) {
        events.push(ReminderEvent {
            id: new_id("rem"),
            key: ReminderKey::SessionStart {
                session_id: session.id.clone(),
            },
            trigger_at: session.start - lead,
            scheduled_time: session.start,
            subject_name: session.subject.clone(),
            session_id: Some(session.id.clone()),
            topic_id: Some(session.topic_id.clone()),
            state: ReminderState::Pending,
        });
    }

    for pair in pending.windows(2) {
        let (current, next) = (pair[0], pair[1]);
        let gap = next.start - current.end;
        if current.end >= now && gap >= Duration::zero() && gap <= break_window {
            events.push(ReminderEvent {
                id: new_id("rem"),
                key: ReminderKey::BreakStart {
                    session_id: current.id.clone(),
                },
                trigger_at: current.end,
                scheduled_time: current.end,
                // The break announces what comes next.
                subject_name: next.subject.clone(),
                session_id: Some(current.id.clone()),
                topic_id: Some(next.topic_id.clone()),
                state: ReminderState::Pending,
            });
        }
    }

    let warning = Duration::hours(config.exam_warning_hours);
    for topic in plan.topics.iter().filter(|t| t.is_active()) {
        let Some(deadline) = topic.deadline else {
            continue;
        };
        if deadline < now {
            continue;
        }
        events.push(ReminderEvent {
            id: new_id("rem"),
            key: ReminderKey::ExamApproaching {
                topic_id: topic.id.clone(),
            },
            trigger_at: deadline - warning,
            scheduled_time: deadline,
            subject_name: topic.subject.clone(),
            session_id: None,
            topic_id: Some(topic.id.clone()),
            state: ReminderState::Pending,
        });
    }

    if config.daily_motivation {
        let mut seen: HashSet<NaiveDate> = HashSet::new();
        for session in pending.iter().filter(|s| s.start >= now) {
            let date = session.start.date_naive();
            if !seen.insert(date) {
                continue;
            }
            let Some(at) = date
                .and_hms_opt(config.daily_motivation_hour, 0, 0)
                .map(|naive| naive.and_utc())
            else {
                continue;
            };
            if at < now {
                continue;
            }
            events.push(ReminderEvent {
                id: new_id("rem"),
                key: ReminderKey::DailyMotivation { date },
                trigger_at: at,
                scheduled_time: at,
                subject_name: session.subject.clone(),
                session_id: None,
                topic_id: None,
                state: ReminderState::Pending,
            });
        }
    }

    events
}

/// `derive_events` drops an occurrence once its moment has passed, so a due
/// reminder is kept while its referent is unchanged in `plan`.
fn still_due(plan: &PlanSnapshot, event: &ReminderEvent, now: DateTime<Utc>) -> bool {
    if event.trigger_at > now {
        return false;
    }
    match &event.key {
        ReminderKey::SessionStart { session_id } => plan
            .session(session_id)
            .is_some_and(|s| s.is_pending() && s.start == event.scheduled_time),
        ReminderKey::BreakStart { session_id } => plan
            .session(session_id)
            .is_some_and(|s| s.is_pending() && s.end == event.scheduled_time),
        ReminderKey::ExamApproaching { topic_id } => plan
            .topic(topic_id)
            .is_some_and(|t| t.is_active() && t.deadline == Some(event.scheduled_time)),
        ReminderKey::DailyMotivation { date } => plan
            .pending_sessions()
            .iter()
            .any(|s| s.start.date_naive() == *date),
    }
}

/// Counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReminderStats {
    pub pending: usize,
    pub fired: u64,
    pub cancelled: u64,
}

/// Min-ordered reminder queue with at-most-once emission.
pub struct ReminderScheduler {
    config: ReminderConfig,
    /// Pending events by logical key.
    pending: HashMap<ReminderKey, ReminderEvent>,
    queue: BinaryHeap<Reverse<QueueEntry>>,
    fired: HashSet<ReminderKey>,
    dismissed: HashSet<ReminderKey>,
    snoozed: HashMap<ReminderKey, DateTime<Utc>>,
    derived_version: Option<u64>,
    history: VecDeque<ReminderEvent>,
    seq: u64,
    fired_total: u64,
    cancelled_total: u64,
}

impl ReminderScheduler {
    pub fn new(config: ReminderConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            queue: BinaryHeap::new(),
            fired: HashSet::new(),
            dismissed: HashSet::new(),
            snoozed: HashMap::new(),
            derived_version: None,
            history: VecDeque::new(),
            seq: 0,
            fired_total: 0,
            cancelled_total: 0,
        }
    }

    /// Seed user overrides saved before a restart.
    pub fn restore_overrides(
        &mut self,
        dismissed: impl IntoIterator<Item = ReminderKey>,
        snoozed: impl IntoIterator<Item = (ReminderKey, DateTime<Utc>)>,
    ) {
        for key in dismissed {
            self.pending.remove(&key);
            self.snoozed.remove(&key);
            self.dismissed.insert(key);
        }
        for (key, at) in snoozed {
            if !self.dismissed.contains(&key) {
                self.snoozed.insert(key, at);
            }
        }
        // Re-derive so the overrides apply to whatever is already queued.
        self.derived_version = None;
    }

    /// Seed the set of already-fired keys, e.g. after a restart.
    pub fn restore_fired(&mut self, keys: impl IntoIterator<Item = ReminderKey>) {
        for key in keys {
            self.pending.remove(&key);
            self.fired.insert(key);
        }
    }

    pub fn has_fired(&self, key: &ReminderKey) -> bool {
        self.fired.contains(key)
    }

    fn enqueue(&mut self, event: ReminderEvent) {
        self.seq += 1;
        self.queue.push(Reverse(QueueEntry {
            trigger_at: event.trigger_at,
            seq: self.seq,
            event_id: event.id.clone(),
            key: event.key.clone(),
        }));
        self.pending.insert(event.key.clone(), event);
    }

    fn cancel(&mut self, key: &ReminderKey) -> Option<ReminderEvent> {
        let mut event = self.pending.remove(key)?;
        event.state = ReminderState::Cancelled;
        self.cancelled_total += 1;
        tracing::debug!("🚫 Reminder cancelled: {}", event.key);
        Some(event)
    }

    /// Re-derive pending reminders if the plan moved past the last version
    /// seen. Older snapshots are ignored.
    pub fn refresh(&mut self, plan: &PlanSnapshot, now: DateTime<Utc>) {
        if self.derived_version.is_some_and(|seen| plan.version <= seen) {
            return;
        }

        let mut wanted: HashMap<ReminderKey, ReminderEvent> = HashMap::new();
        for mut event in derive_events(plan, &self.config, now) {
            if self.fired.contains(&event.key) || self.dismissed.contains(&event.key) {
                continue;
            }
            if let Some(at) = self.snoozed.get(&event.key) {
                event.trigger_at = *at;
            }
            wanted.insert(event.key.clone(), event);
        }

        let stale: Vec<ReminderKey> = self
            .pending
            .values()
            .filter(|event| !wanted.contains_key(&event.key) && !still_due(plan, event, now))
            .map(|event| event.key.clone())
            .collect();
        for key in &stale {
            self.cancel(key);
            self.snoozed.remove(key);
        }

        let mut inserted = 0usize;
        for (key, event) in wanted {
            let unchanged = self.pending.get(&key).is_some_and(|current| {
                current.trigger_at == event.trigger_at
                    && current.scheduled_time == event.scheduled_time
                    && current.subject_name == event.subject_name
            });
            if unchanged {
                continue;
            }
            self.cancel(&key);
            self.enqueue(event);
            inserted += 1;
        }

        self.derived_version = Some(plan.version);
        tracing::debug!(
            "🔄 Reminders refreshed at v{}: {} pending, {} new, {} stale",
            plan.version,
            self.pending.len(),
            inserted,
            stale.len()
        );
    }

    /// Refresh from `plan`, then fire everything due at `now`.
    pub fn tick(&mut self, plan: &PlanSnapshot, now: DateTime<Utc>) -> Vec<ReminderEvent> {
        self.refresh(plan, now);

        let mut fired = Vec::new();
        while let Some(Reverse(entry)) = self.queue.peek() {
            if entry.trigger_at > now {
                break;
            }
            let Some(Reverse(entry)) = self.queue.pop() else {
                break;
            };
            let live = self
                .pending
                .get(&entry.key)
                .is_some_and(|e| e.id == entry.event_id);
            if !live || self.fired.contains(&entry.key) {
                continue;
            }
            let Some(mut event) = self.pending.remove(&entry.key) else {
                continue;
            };
            event.state = ReminderState::Fired;
            self.fired.insert(event.key.clone());
            self.snoozed.remove(&event.key);
            self.fired_total += 1;

            self.history.push_back(event.clone());
            if self.history.len() > HISTORY_LIMIT {
                self.history.pop_front();
            }
            tracing::info!("🔔 Reminder fired: {} ({})", event.key, event.subject_name);
            fired.push(event);
        }
        fired
    }

    /// Pending reminders ordered by trigger time.
    pub fn pending(&self) -> Vec<ReminderEvent> {
        let mut events: Vec<ReminderEvent> = self.pending.values().cloned().collect();
        events.sort_by(|a, b| {
            a.trigger_at
                .cmp(&b.trigger_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        events
    }

    fn key_for(&self, event_id: &str) -> Result<ReminderKey> {
        if let Some(event) = self.pending.values().find(|e| e.id == event_id) {
            return Ok(event.key.clone());
        }
        if self.history.iter().any(|e| e.id == event_id) {
            return Err(AllyError::InvalidState(format!(
                "reminder {event_id} already fired"
            )));
        }
        Err(AllyError::NotFound(format!("reminder {event_id}")))
    }

    /// Push a pending reminder back by `minutes`. Survives re-derivation.
    pub fn snooze(
        &mut self,
        event_id: &str,
        minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<ReminderEvent> {
        if minutes <= 0 || minutes > MAX_MINUTES {
            return Err(AllyError::InvalidInput(format!(
                "snooze must be 1..={MAX_MINUTES} minutes, got {minutes}"
            )));
        }
        let key = self.key_for(event_id)?;
        let Some(mut event) = self.cancel(&key) else {
            return Err(AllyError::NotFound(format!("reminder {event_id}")));
        };
        // A snooze is a move, not a cancellation.
        self.cancelled_total -= 1;

        let at = event.trigger_at.max(now) + Duration::minutes(minutes);
        event.id = new_id("rem");
        event.trigger_at = at;
        event.state = ReminderState::Pending;
        self.snoozed.insert(key, at);
        self.enqueue(event.clone());
        tracing::info!("😴 Reminder snoozed until {}: {}", at, event.key);
        Ok(event)
    }

    /// Cancel a pending reminder and keep it from being derived again.
    pub fn dismiss(&mut self, event_id: &str) -> Result<ReminderEvent> {
        let key = self.key_for(event_id)?;
        let event = self
            .cancel(&key)
            .ok_or_else(|| AllyError::NotFound(format!("reminder {event_id}")))?;
        self.snoozed.remove(&key);
        self.dismissed.insert(key);
        Ok(event)
    }

    /// Recently fired reminders, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ReminderEvent> {
        self.history.iter()
    }

    pub fn stats(&self) -> ReminderStats {
        ReminderStats {
            pending: self.pending.len(),
            fired: self.fired_total,
            cancelled: self.cancelled_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ally_core::types::{AvailabilitySlot, Chunk, ReminderKind, Session, SessionStatus, Topic};
    use chrono::TimeZone;

    fn monday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    fn quiet_config() -> ReminderConfig {
        ReminderConfig {
            daily_motivation: false,
            ..ReminderConfig::default()
        }
    }

    /// One topic with sessions at the given offsets (minutes from monday 08:00).
    fn plan_with_sessions(offsets: &[i64], version: u64) -> PlanSnapshot {
        let topic = Topic::new("OS", 500, 1.0, monday());
        let sessions = offsets
            .iter()
            .enumerate()
            .map(|(i, offset)| {
                let chunk = Chunk {
                    topic_id: topic.id.clone(),
                    index: i as u32,
                    minutes: 50,
                };
                Session::new(&topic, &chunk, monday() + Duration::minutes(*offset))
            })
            .collect();
        PlanSnapshot {
            topics: vec![topic],
            slots: vec![AvailabilitySlot::new(monday(), monday() + Duration::days(1))],
            sessions,
            version,
            ..PlanSnapshot::default()
        }
    }

    #[test]
    fn test_session_start_fires_once_at_lead_time() {
        let mut scheduler = ReminderScheduler::new(quiet_config());
        let plan = plan_with_sessions(&[120], 1);

        assert!(scheduler.tick(&plan, monday()).is_empty());
        let fired = scheduler.tick(&plan, monday() + Duration::minutes(110));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind(), ReminderKind::SessionStart);
        assert_eq!(fired[0].payload().scheduled_time, monday() + Duration::minutes(120));

        // Never again, even after a re-derivation.
        let mut bumped = plan.clone();
        bumped.version = 2;
        assert!(scheduler.tick(&bumped, monday() + Duration::minutes(111)).is_empty());
    }

    #[test]
    fn test_shifted_session_fires_once() {
        let mut scheduler = ReminderScheduler::new(quiet_config());
        let mut plan = plan_with_sessions(&[120], 1);
        scheduler.tick(&plan, monday());

        // Shift three times before the reminder is due.
        for (i, offset) in [180, 240, 300].iter().enumerate() {
            let session = &mut plan.sessions[0];
            session.start = monday() + Duration::minutes(*offset);
            session.end = session.start + Duration::minutes(50);
            session.status = SessionStatus::Shifted;
            plan.version = 2 + i as u64;
            assert!(scheduler.tick(&plan, monday() + Duration::minutes(30)).is_empty());
        }
        assert_eq!(scheduler.stats().cancelled, 3);

        let mut total = 0;
        for minute in (0..400).step_by(5) {
            total += scheduler.tick(&plan, monday() + Duration::minutes(minute)).len();
        }
        assert_eq!(total, 1);
        assert_eq!(scheduler.stats().fired, 1);
    }

    #[test]
    fn test_due_break_fires_after_unrelated_change() {
        let mut scheduler = ReminderScheduler::new(quiet_config());
        let plan = plan_with_sessions(&[600, 660], 1);
        let fired = scheduler.tick(&plan, monday() + Duration::minutes(600));
        assert_eq!(fired.len(), 1);

        // The first session ends at 650; the plan moves on without touching it
        // before the next tick comes round.
        let mut bumped = plan.clone();
        bumped.version = 2;
        let fired = scheduler.tick(&bumped, monday() + Duration::minutes(651));
        let breaks: Vec<&ReminderEvent> = fired
            .iter()
            .filter(|e| e.kind() == ReminderKind::BreakStart)
            .collect();
        assert_eq!(breaks.len(), 1);
        assert_eq!(breaks[0].scheduled_time, monday() + Duration::minutes(650));
        assert_eq!(scheduler.stats().cancelled, 0);
    }

    #[test]
    fn test_older_snapshot_does_not_revive_removed_session() {
        let mut scheduler = ReminderScheduler::new(quiet_config());
        let v1 = plan_with_sessions(&[120], 1);
        assert!(scheduler.tick(&v1, monday()).is_empty());

        let mut v2 = v1.clone();
        v2.sessions.clear();
        v2.version = 2;
        scheduler.refresh(&v2, monday() + Duration::minutes(1));
        assert!(scheduler.pending().is_empty());

        // A tick that read the plan before v2 landed.
        assert!(scheduler.tick(&v1, monday() + Duration::minutes(115)).is_empty());
        assert!(scheduler.pending().is_empty());
        assert_eq!(scheduler.stats().fired, 0);
    }

    #[test]
    fn test_removed_session_reminder_cancelled() {
        let mut scheduler = ReminderScheduler::new(quiet_config());
        let plan = plan_with_sessions(&[120], 1);
        scheduler.tick(&plan, monday());
        assert_eq!(scheduler.pending().len(), 1);

        let mut emptied = plan.clone();
        emptied.sessions.clear();
        emptied.version = 2;
        assert!(scheduler.tick(&emptied, monday() + Duration::hours(3)).is_empty());
        assert!(scheduler.pending().is_empty());
    }

    #[test]
    fn test_break_and_exam_reminders() {
        let mut scheduler = ReminderScheduler::new(quiet_config());
        let mut plan = plan_with_sessions(&[600, 660], 1);
        plan.topics[0].deadline = Some(monday() + Duration::days(2));

        let events = derive_events(&plan, &quiet_config(), monday());
        let kinds: Vec<ReminderKind> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.iter().filter(|k| **k == ReminderKind::SessionStart).count(), 2);
        assert_eq!(kinds.iter().filter(|k| **k == ReminderKind::BreakStart).count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == ReminderKind::ExamApproaching).count(), 1);

        let exam_day = monday() + Duration::days(1);
        let fired = scheduler.tick(&plan, exam_day);
        assert!(fired.iter().any(|e| e.kind() == ReminderKind::ExamApproaching));
    }

    #[test]
    fn test_daily_motivation_once_per_day() {
        let config = ReminderConfig::default();
        let plan = plan_with_sessions(&[600, 720], 1);
        let events = derive_events(&plan, &config, monday() - Duration::hours(2));
        let daily: Vec<&ReminderEvent> = events
            .iter()
            .filter(|e| e.kind() == ReminderKind::DailyMotivation)
            .collect();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].trigger_at, monday());
    }

    #[test]
    fn test_late_reminder_fires_immediately() {
        let mut scheduler = ReminderScheduler::new(quiet_config());
        let plan = plan_with_sessions(&[5], 1);
        // Lead time already passed when the plan first appears.
        let fired = scheduler.tick(&plan, monday());
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn test_snooze_survives_refresh() {
        let mut scheduler = ReminderScheduler::new(quiet_config());
        let plan = plan_with_sessions(&[120], 1);
        scheduler.tick(&plan, monday());
        let id = scheduler.pending()[0].id.clone();

        let snoozed = scheduler.snooze(&id, 15, monday() + Duration::minutes(110)).unwrap();
        assert_eq!(snoozed.trigger_at, monday() + Duration::minutes(125));

        let mut bumped = plan.clone();
        bumped.version = 2;
        assert!(scheduler.tick(&bumped, monday() + Duration::minutes(111)).is_empty());
        assert_eq!(scheduler.tick(&bumped, monday() + Duration::minutes(125)).len(), 1);

        // Fired reminders can no longer be snoozed.
        assert!(matches!(
            scheduler.snooze(&snoozed.id, 5, monday()),
            Err(AllyError::InvalidState(_))
        ));
    }

    #[test]
    fn test_dismissed_reminder_is_not_rederived() {
        let mut scheduler = ReminderScheduler::new(quiet_config());
        let plan = plan_with_sessions(&[120], 1);
        scheduler.tick(&plan, monday());
        let id = scheduler.pending()[0].id.clone();
        scheduler.dismiss(&id).unwrap();

        let mut bumped = plan.clone();
        bumped.version = 2;
        assert!(scheduler.tick(&bumped, monday() + Duration::minutes(115)).is_empty());
        assert!(matches!(scheduler.dismiss("rem-unknown"), Err(AllyError::NotFound(_))));
    }

    #[test]
    fn test_restored_overrides_apply() {
        let plan = plan_with_sessions(&[120, 300], 1);
        let dismissed = ReminderKey::SessionStart {
            session_id: plan.sessions[0].id.clone(),
        };
        let snoozed = ReminderKey::SessionStart {
            session_id: plan.sessions[1].id.clone(),
        };
        let until = monday() + Duration::minutes(310);

        let mut scheduler = ReminderScheduler::new(quiet_config());
        scheduler.restore_overrides(vec![dismissed], vec![(snoozed, until)]);
        assert!(scheduler.tick(&plan, monday() + Duration::minutes(295)).is_empty());
        let fired = scheduler.tick(&plan, until);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].session_id.as_deref(), Some(plan.sessions[1].id.as_str()));
    }

    #[test]
    fn test_snooze_rejects_out_of_range_minutes() {
        let mut scheduler = ReminderScheduler::new(quiet_config());
        let plan = plan_with_sessions(&[120], 1);
        scheduler.tick(&plan, monday());
        let id = scheduler.pending()[0].id.clone();
        for minutes in [0, -5, i64::MAX] {
            assert!(matches!(
                scheduler.snooze(&id, minutes, monday()),
                Err(AllyError::InvalidInput(_))
            ));
        }
        assert_eq!(scheduler.pending()[0].id, id);
    }

    #[test]
    fn test_restored_fired_keys_are_suppressed() {
        let plan = plan_with_sessions(&[120], 1);
        let key = ReminderKey::SessionStart {
            session_id: plan.sessions[0].id.clone(),
        };
        let mut scheduler = ReminderScheduler::new(quiet_config());
        scheduler.restore_fired(vec![key.clone()]);
        assert!(scheduler.has_fired(&key));
        assert!(scheduler.tick(&plan, monday() + Duration::minutes(115)).is_empty());
    }
}
