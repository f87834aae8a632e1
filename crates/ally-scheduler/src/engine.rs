//! Planner engine: owns the plan store, re-planner, reminder scheduler and
//! notification router, and runs the periodic reminder tick.
//! Uses tokio::interval for zero-overhead ticking (sleeps between checks).

use std::path::Path;
use std::sync::Arc;

use ally_core::clock::Clock;
use ally_core::config::AllyConfig;
use ally_core::error::{AllyError, Result};
use ally_core::types::{
    AvailabilitySlot, ReminderEvent, ReminderKey, ReminderPayload, Session, Topic,
};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use tokio::sync::{Mutex, watch};

use crate::commands::Outcome;
use crate::dispatch;
use crate::notify::{Notification, NotifyRouter};
use crate::persistence::PlanDb;
use crate::reminders::{ReminderScheduler, ReminderStats};
use crate::replan::{ReplanReport, ReplanStats, Replanner};
use crate::store::{PlanSnapshot, PlanStore};

/// Longest planning horizon accepted by `create_plan`.
const MAX_HORIZON_DAYS: i64 = 366;

/// The study planner. Share it behind an `Arc`.
pub struct StudyPlanner {
    config: AllyConfig,
    clock: Arc<dyn Clock>,
    store: PlanStore,
    replanner: Replanner,
    reminders: Mutex<ReminderScheduler>,
    router: NotifyRouter,
    db: Option<std::sync::Mutex<PlanDb>>,
}

impl StudyPlanner {
    /// In-memory planner with notification targets taken from `config`.
    pub fn new(config: AllyConfig, clock: Arc<dyn Clock>) -> Self {
        let router = NotifyRouter::new(dispatch::targets_from_config(&config.notify));
        Self {
            store: PlanStore::new(config.planner.clone()),
            replanner: Replanner::new(config.planner.clone()),
            reminders: Mutex::new(ReminderScheduler::new(config.reminders.clone())),
            router,
            db: None,
            clock,
            config,
        }
    }

    /// Planner backed by the SQLite file at `db_path`, restored from it.
    pub async fn open(config: AllyConfig, clock: Arc<dyn Clock>, db_path: &Path) -> Result<Self> {
        let db = PlanDb::open(db_path)?;
        let planner = Self::new(config, clock).with_db(db);
        planner.restore().await?;
        Ok(planner)
    }

    pub fn with_db(mut self, db: PlanDb) -> Self {
        self.db = Some(std::sync::Mutex::new(db));
        self
    }

    pub fn with_router(mut self, router: NotifyRouter) -> Self {
        self.router = router;
        self
    }

    pub fn config(&self) -> &AllyConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn router(&self) -> &NotifyRouter {
        &self.router
    }

    pub async fn snapshot(&self) -> PlanSnapshot {
        self.store.snapshot().await
    }

    pub fn replan_stats(&self) -> ReplanStats {
        self.replanner.stats()
    }

    pub async fn reminder_stats(&self) -> ReminderStats {
        self.reminders.lock().await.stats()
    }

    // ─── Plan mutations ───────────────────────────────────────

    /// Add topics and place them. `horizon_days` bounds placement from now.
    pub async fn create_plan(
        &self,
        topics: Vec<Topic>,
        horizon_days: Option<i64>,
    ) -> Result<Vec<Session>> {
        if let Some(days) = horizon_days
            && !(1..=MAX_HORIZON_DAYS).contains(&days)
        {
            return Err(AllyError::InvalidInput(format!(
                "horizon must be 1..={MAX_HORIZON_DAYS} days, got {days}"
            )));
        }
        let now = self.now();
        let horizon_end = horizon_days.map(|d| now + Duration::days(d));
        let created = self.store.create_plan(topics, horizon_end, now).await?;
        self.persist().await;
        Ok(created)
    }

    /// Record what happened to a session, then re-plan once. The outcome
    /// stays recorded when the re-plan fails; the topic is then at risk.
    pub async fn record_outcome(
        &self,
        session_id: &str,
        outcome: Outcome,
    ) -> Result<(Session, ReplanReport)> {
        let now = self.now();
        let session = match outcome {
            Outcome::Completed => self.store.record_completed(session_id).await?,
            Outcome::Missed => self.store.mark_missed(session_id, now).await?,
        };
        let report = self.replan_after_change().await?;
        Ok((session, report))
    }

    pub async fn mark_missed(&self, session_id: &str) -> Result<(Session, ReplanReport)> {
        self.record_outcome(session_id, Outcome::Missed).await
    }

    pub async fn shift_session(
        &self,
        session_id: &str,
        new_start: DateTime<Utc>,
    ) -> Result<Session> {
        let session = self.store.shift_session(session_id, new_start, self.now()).await?;
        self.persist().await;
        Ok(session)
    }

    pub async fn add_availability(
        &self,
        slot: AvailabilitySlot,
    ) -> Result<(AvailabilitySlot, ReplanReport)> {
        let slot = self.store.add_availability(slot).await?;
        let report = self.replan_after_change().await?;
        Ok((slot, report))
    }

    pub async fn remove_availability(&self, slot_id: &str) -> Result<ReplanReport> {
        self.store.remove_availability(slot_id, self.now()).await?;
        self.replan_after_change().await
    }

    pub async fn set_availability(&self, slots: Vec<AvailabilitySlot>) -> Result<ReplanReport> {
        self.store.set_availability(slots, self.now()).await?;
        self.replan_after_change().await
    }

    pub async fn remove_topic(&self, topic_id: &str) -> Result<(Topic, ReplanReport)> {
        let topic = self.store.remove_topic(topic_id).await?;
        let report = self.replan_after_change().await?;
        Ok((topic, report))
    }

    /// Re-plan whatever is dirty, from now on.
    pub async fn replan(&self) -> Result<ReplanReport> {
        self.replanner.run(&self.store, self.now()).await
    }

    /// The mutation is already committed; a failed re-plan keeps the old
    /// future sessions and is reported to the caller.
    async fn replan_after_change(&self) -> Result<ReplanReport> {
        let result = self.replan().await;
        self.persist().await;
        result
    }

    // ─── Queries ──────────────────────────────────────────────

    /// Sessions overlapping the current UTC day.
    pub async fn query_today(&self) -> Vec<Session> {
        let start = self.now().date_naive().and_time(NaiveTime::MIN).and_utc();
        self.store.current_plan(start, start + Duration::days(1)).await
    }

    pub async fn current_plan(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        if from >= to {
            return Err(AllyError::InvalidInput(format!("empty range {from} .. {to}")));
        }
        Ok(self.store.current_plan(from, to).await)
    }

    pub async fn topics_at_risk(&self) -> Vec<Topic> {
        self.store.topics_at_risk().await
    }

    // ─── Reminders ────────────────────────────────────────────

    /// Fire every due reminder and hand it to the notification router.
    pub async fn tick(&self) -> Vec<ReminderPayload> {
        let now = self.now();
        let plan = self.store.snapshot().await;
        let fired = self.reminders.lock().await.tick(&plan, now);
        if fired.is_empty() {
            return Vec::new();
        }

        for event in &fired {
            self.log_reminder(&event.key, |db| db.record_fired(event, now));
        }

        for event in &fired {
            let notification = Notification::from_reminder(event, now);
            self.router.route(&notification).await;
        }
        fired.iter().map(ReminderEvent::payload).collect()
    }

    /// Pending reminders, refreshed against the current plan.
    pub async fn reminders(&self) -> Vec<ReminderEvent> {
        let plan = self.store.snapshot().await;
        let mut reminders = self.reminders.lock().await;
        reminders.refresh(&plan, self.now());
        reminders.pending()
    }

    pub async fn snooze_reminder(
        &self,
        reminder_id: &str,
        minutes: Option<i64>,
    ) -> Result<ReminderEvent> {
        let minutes = minutes.unwrap_or(self.config.reminders.default_snooze_minutes);
        let now = self.now();
        let event = self.reminders.lock().await.snooze(reminder_id, minutes, now)?;
        self.log_reminder(&event.key, |db| db.record_snooze(&event.key, event.trigger_at, now));
        Ok(event)
    }

    pub async fn dismiss_reminder(&self, reminder_id: &str) -> Result<ReminderEvent> {
        let event = self.reminders.lock().await.dismiss(reminder_id)?;
        self.log_reminder(&event.key, |db| db.record_dismissed(&event.key, self.now()));
        Ok(event)
    }

    // ─── Persistence ──────────────────────────────────────────

    /// Load the plan and reminder log from the database, if any.
    pub async fn restore(&self) -> Result<bool> {
        let Some(db) = &self.db else {
            return Ok(false);
        };
        let (snapshot, fired, overrides) = {
            let db = db.lock().unwrap_or_else(|e| e.into_inner());
            (db.load_snapshot()?, db.load_fired_keys()?, db.load_overrides()?)
        };
        {
            let mut reminders = self.reminders.lock().await;
            reminders.restore_fired(fired);
            reminders.restore_overrides(overrides.dismissed, overrides.snoozed);
        }
        match snapshot {
            Some(snapshot) => {
                self.store.restore(snapshot).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Best-effort write to the reminder tables.
    fn log_reminder(&self, key: &ReminderKey, write: impl FnOnce(&PlanDb) -> Result<()>) {
        let Some(db) = &self.db else {
            return;
        };
        let db = db.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = write(&db) {
            tracing::warn!("⚠️ Failed to log reminder {key}: {e}");
        }
    }

    /// Best-effort save; failures are logged, never returned.
    async fn persist(&self) {
        let Some(db) = &self.db else {
            return;
        };
        let plan = self.store.snapshot().await;
        let mut db = db.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = db.save_snapshot(&plan) {
            tracing::warn!("⚠️ Failed to persist plan v{}: {e}", plan.version);
        }
    }
}

/// Spawn the reminder loop as a background tokio task.
/// Stops when `shutdown` flips to `true` or its sender is dropped.
pub fn spawn_reminder_loop(
    planner: Arc<StudyPlanner>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let tick_secs = planner.config.reminders.tick_secs.max(1);
    tokio::spawn(async move {
        tracing::info!("⏰ Reminder loop started (check every {}s)", tick_secs);
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_secs));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let fired = planner.tick().await;
                    if !fired.is_empty() {
                        tracing::debug!("📣 {} reminders sent", fired.len());
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("🛑 Reminder loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ally_core::clock::ManualClock;
    use ally_core::config::{PlannerConfig, ReminderConfig};
    use ally_core::types::{ReminderKind, SessionStatus};
    use crate::replan::ReplanOutcome;
    use chrono::TimeZone;

    fn monday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    fn evening(day: i64) -> AvailabilitySlot {
        let start = monday() + Duration::days(day) + Duration::hours(10);
        AvailabilitySlot::new(start, start + Duration::hours(2))
    }

    fn quiet_config() -> AllyConfig {
        AllyConfig {
            reminders: ReminderConfig {
                daily_motivation: false,
                ..ReminderConfig::default()
            },
            ..AllyConfig::default()
        }
    }

    fn planner(clock: &ManualClock) -> StudyPlanner {
        StudyPlanner::new(quiet_config(), Arc::new(clock.clone()))
    }

    async fn with_evenings(planner: &StudyPlanner, days: i64) {
        for d in 0..days {
            planner.add_availability(evening(d)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_mark_missed_replans_once() {
        let clock = ManualClock::new(monday());
        let planner = planner(&clock);
        with_evenings(&planner, 4).await;
        let created = planner
            .create_plan(vec![Topic::new("OS", 200, 1.0, monday())], Some(7))
            .await
            .unwrap();
        assert_eq!(created.len(), 4);

        let first = created[0].clone();
        clock.set(first.end + Duration::minutes(5));
        let applied_before = planner.replan_stats().applied;

        let (missed, report) = planner.mark_missed(&first.id).await.unwrap();
        assert_eq!(missed.status, SessionStatus::Missed);
        assert_eq!(planner.replan_stats().applied, applied_before + 1);
        assert!(report.added.iter().all(|s| s.start >= clock.now()));

        let plan = planner.snapshot().await;
        let pending: i64 = plan.pending_sessions().iter().map(|s| s.minutes()).sum();
        assert_eq!(pending, 200);
    }

    #[tokio::test]
    async fn test_mark_missed_before_end_rejected() {
        let clock = ManualClock::new(monday());
        let planner = planner(&clock);
        with_evenings(&planner, 2).await;
        let created = planner
            .create_plan(vec![Topic::new("OS", 50, 1.0, monday())], None)
            .await
            .unwrap();
        let err = planner.mark_missed(&created[0].id).await.unwrap_err();
        assert!(matches!(err, AllyError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_query_today_and_current_plan() {
        let clock = ManualClock::new(monday());
        let planner = planner(&clock);
        with_evenings(&planner, 3).await;
        planner
            .create_plan(vec![Topic::new("OS", 300, 1.0, monday())], None)
            .await
            .unwrap();

        let today = planner.query_today().await;
        assert!(!today.is_empty());
        assert!(today.iter().all(|s| s.start.date_naive() == monday().date_naive()));

        let range = (monday(), monday() + Duration::days(3));
        let first = planner.current_plan(range.0, range.1).await.unwrap();
        let second = planner.current_plan(range.0, range.1).await.unwrap();
        assert_eq!(first, second);
        assert!(planner.current_plan(range.1, range.0).await.is_err());
    }

    #[tokio::test]
    async fn test_tick_emits_payload_once() {
        let clock = ManualClock::new(monday());
        let planner = planner(&clock).with_router(NotifyRouter::new(vec![]));
        with_evenings(&planner, 1).await;
        let created = planner
            .create_plan(vec![Topic::new("OS", 50, 1.0, monday())], None)
            .await
            .unwrap();
        let session = &created[0];

        assert!(planner.tick().await.is_empty());
        clock.set(session.start - Duration::minutes(10));
        let payloads = planner.tick().await;
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].kind, ReminderKind::SessionStart);
        assert_eq!(payloads[0].subject_name, "OS");
        assert_eq!(payloads[0].scheduled_time, session.start);
        assert_eq!(payloads[0].session_id.as_deref(), Some(session.id.as_str()));

        assert!(planner.tick().await.is_empty());
        assert_eq!(planner.router().history().len(), 1);
    }

    #[tokio::test]
    async fn test_replan_does_not_repeat_session_reminder() {
        let clock = ManualClock::new(monday());
        let planner = planner(&clock);
        with_evenings(&planner, 1).await;
        let created = planner
            .create_plan(vec![Topic::new("OS", 50, 1.0, monday())], None)
            .await
            .unwrap();
        let session = created[0].clone();
        assert_eq!(session.start, monday() + Duration::hours(10));

        clock.set(session.start - Duration::minutes(10));
        assert_eq!(planner.tick().await.len(), 1);

        // New capacity re-plans everything; the session lands on the same spot.
        clock.set(session.start - Duration::minutes(5));
        let (_, report) = planner.add_availability(evening(7)).await.unwrap();
        assert_eq!(report.outcome, ReplanOutcome::Applied);
        assert!(report.removed.is_empty());
        assert!(planner.snapshot().await.session(&session.id).is_some());

        assert!(planner.tick().await.is_empty());
        assert_eq!(planner.reminder_stats().await.fired, 1);
    }

    #[tokio::test]
    async fn test_failed_replan_keeps_outcome_and_flags_topic() {
        let clock = ManualClock::new(monday());
        let config = AllyConfig {
            planner: PlannerConfig {
                overflow_tolerance: 0.0,
                ..PlannerConfig::default()
            },
            ..quiet_config()
        };
        let planner = StudyPlanner::new(config, Arc::new(clock.clone()));
        with_evenings(&planner, 1).await;
        let created = planner
            .create_plan(vec![Topic::new("OS", 100, 1.0, monday())], None)
            .await
            .unwrap();
        assert!(planner.topics_at_risk().await.is_empty());

        clock.set(created[0].end + Duration::minutes(1));
        let err = planner.mark_missed(&created[0].id).await.unwrap_err();
        assert!(matches!(err, AllyError::InfeasibleConstraints { .. }));

        let plan = planner.snapshot().await;
        assert_eq!(plan.session(&created[0].id).unwrap().status, SessionStatus::Missed);
        let at_risk = planner.topics_at_risk().await;
        assert_eq!(at_risk.len(), 1);
        assert_eq!(at_risk[0].subject, "OS");
    }

    #[tokio::test]
    async fn test_snooze_uses_default_minutes() {
        let clock = ManualClock::new(monday());
        let planner = planner(&clock);
        with_evenings(&planner, 1).await;
        planner
            .create_plan(vec![Topic::new("OS", 50, 1.0, monday())], None)
            .await
            .unwrap();

        let reminder = planner.reminders().await.remove(0);
        let snoozed = planner.snooze_reminder(&reminder.id, None).await.unwrap();
        assert_eq!(snoozed.trigger_at, reminder.trigger_at + Duration::minutes(10));
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let dir = std::env::temp_dir().join("ally-engine-restore-test");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("plan.db");
        std::fs::remove_file(&path).ok();

        let clock = ManualClock::new(monday());
        let planner = planner(&clock).with_db(PlanDb::open(&path).unwrap());
        with_evenings(&planner, 2).await;
        let created = planner
            .create_plan(vec![Topic::new("OS", 100, 1.0, monday())], None)
            .await
            .unwrap();
        clock.set(created[0].start - Duration::minutes(5));
        assert_eq!(planner.tick().await.len(), 1);
        let saved = planner.snapshot().await;
        drop(planner);

        let reopened = StudyPlanner::open(AllyConfig::default(), Arc::new(clock.clone()), &path)
            .await
            .unwrap();
        let restored = reopened.snapshot().await;
        assert_eq!(restored.sessions, saved.sessions);
        assert!(restored.version > saved.version);
        // The reminder that already went out stays quiet.
        assert!(reopened.tick().await.iter().all(|p| p.kind != ReminderKind::SessionStart
            || p.session_id.as_deref() != Some(created[0].id.as_str())));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_dismissal_and_snooze_survive_restart() {
        let dir = std::env::temp_dir().join("ally-engine-overrides-test");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("plan.db");
        std::fs::remove_file(&path).ok();

        let clock = ManualClock::new(monday());
        let planner = planner(&clock).with_db(PlanDb::open(&path).unwrap());
        with_evenings(&planner, 2).await;
        let created = planner
            .create_plan(vec![Topic::new("OS", 100, 1.0, monday())], None)
            .await
            .unwrap();
        assert_eq!(created.len(), 2);
        let starts: Vec<ReminderEvent> = planner
            .reminders()
            .await
            .into_iter()
            .filter(|r| r.kind() == ReminderKind::SessionStart)
            .collect();
        assert_eq!(starts.len(), 2);
        planner.dismiss_reminder(&starts[0].id).await.unwrap();
        let snoozed = planner.snooze_reminder(&starts[1].id, Some(30)).await.unwrap();
        drop(planner);

        let reopened = StudyPlanner::open(quiet_config(), Arc::new(clock.clone()), &path)
            .await
            .unwrap();
        let session_starts = |payloads: Vec<ReminderPayload>| -> Vec<ReminderPayload> {
            payloads
                .into_iter()
                .filter(|p| p.kind == ReminderKind::SessionStart)
                .collect()
        };
        clock.set(created[0].start);
        assert!(session_starts(reopened.tick().await).is_empty());
        clock.set(starts[1].trigger_at);
        assert!(session_starts(reopened.tick().await).is_empty());
        clock.set(snoozed.trigger_at);
        let fired = session_starts(reopened.tick().await);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].session_id.as_deref(), Some(created[1].id.as_str()));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_reminder_loop_stops_on_shutdown() {
        let clock = ManualClock::new(monday());
        let planner = Arc::new(planner(&clock));
        let (tx, rx) = watch::channel(false);
        let handle = spawn_reminder_loop(planner, rx);
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
