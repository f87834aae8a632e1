//! Notification system: turns fired reminders into user-facing messages and
//! routes them to every configured channel.
//! Lightweight: no queues, no retries. Delivery failures are logged and the
//! reminder still counts as fired.

use std::collections::VecDeque;
use std::sync::Mutex;

use ally_core::types::{ReminderEvent, ReminderKind};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::{self, NotifyTarget};

/// Notifications kept in memory.
const HISTORY_LIMIT: usize = 100;
/// An exam reminder sent closer than this to the exam is urgent.
const URGENT_EXAM_HOURS: i64 = 6;

/// A notification to send to the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    /// Title/summary.
    pub title: String,
    /// Body content.
    pub body: String,
    pub priority: NotifyPriority,
    /// Reminder key that produced this.
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

/// Notification priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotifyPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Notification {
    /// Render a fired reminder.
    pub fn from_reminder(event: &ReminderEvent, now: DateTime<Utc>) -> Self {
        let at = event.scheduled_time.format("%H:%M UTC");
        let (title, body, priority) = match event.kind() {
            ReminderKind::SessionStart => (
                format!("Study session: {}", event.subject_name),
                format!("Your {} session starts at {at}.", event.subject_name),
                NotifyPriority::Normal,
            ),
            ReminderKind::BreakStart => (
                "Break time".to_string(),
                format!("Take a break. Next up: {}.", event.subject_name),
                NotifyPriority::Low,
            ),
            ReminderKind::ExamApproaching => (
                format!("Exam approaching: {}", event.subject_name),
                format!(
                    "{} is due {}.",
                    event.subject_name,
                    event.scheduled_time.format("%Y-%m-%d %H:%M UTC")
                ),
                if event.scheduled_time - now <= Duration::hours(URGENT_EXAM_HOURS) {
                    NotifyPriority::Urgent
                } else {
                    NotifyPriority::High
                },
            ),
            ReminderKind::DailyMotivation => (
                "Good morning".to_string(),
                format!(
                    "You have study sessions today, starting with {}.",
                    event.subject_name
                ),
                NotifyPriority::Low,
            ),
        };
        Self {
            title,
            body,
            priority,
            source: event.key.to_string(),
            timestamp: now,
        }
    }
}

/// Notification router: fans each notification out to all targets.
pub struct NotifyRouter {
    targets: Vec<(String, NotifyTarget)>,
    /// In-memory ring buffer.
    history: Mutex<VecDeque<Notification>>,
}

impl NotifyRouter {
    pub fn new(targets: Vec<(String, NotifyTarget)>) -> Self {
        Self {
            targets,
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn target_names(&self) -> Vec<&str> {
        self.targets.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Deliver to every target and record the notification.
    /// Returns the names of targets that failed.
    pub async fn route(&self, notification: &Notification) -> Vec<String> {
        let mut failed = Vec::new();
        for (name, result) in dispatch::dispatch_all(notification, &self.targets).await {
            if let Err(e) = result {
                tracing::warn!("⚠️ Notification to {name} failed: {e}");
                failed.push(name);
            }
        }
        self.record(notification.clone());
        failed
    }

    fn record(&self, notification: Notification) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(notification);
        if history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }

    /// Notification history, oldest first.
    pub fn history(&self) -> Vec<Notification> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for NotifyRouter {
    fn default() -> Self {
        Self::new(vec![("log".to_string(), NotifyTarget::Log)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ally_core::types::{ReminderKey, ReminderState};
    use chrono::TimeZone;

    fn exam_event() -> ReminderEvent {
        let deadline = Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap();
        ReminderEvent {
            id: "rem-1".into(),
            key: ReminderKey::ExamApproaching {
                topic_id: "topic-os".into(),
            },
            trigger_at: deadline - chrono::Duration::hours(24),
            scheduled_time: deadline,
            subject_name: "OS".into(),
            session_id: None,
            topic_id: Some("topic-os".into()),
            state: ReminderState::Fired,
        }
    }

    #[test]
    fn test_exam_notification() {
        let now = Utc.with_ymd_and_hms(2026, 3, 8, 9, 0, 0).unwrap();
        let n = Notification::from_reminder(&exam_event(), now);
        assert_eq!(n.title, "Exam approaching: OS");
        assert!(n.body.contains("2026-03-09 09:00 UTC"));
        assert_eq!(n.priority, NotifyPriority::High);
        assert_eq!(n.source, "exam_approaching:topic-os");
        assert_eq!(n.timestamp, now);
    }

    #[test]
    fn test_late_exam_notification_is_urgent() {
        let event = exam_event();
        let now = event.scheduled_time - chrono::Duration::hours(2);
        let n = Notification::from_reminder(&event, now);
        assert_eq!(n.priority, NotifyPriority::Urgent);
    }

    #[tokio::test]
    async fn test_route_records_history() {
        let router = NotifyRouter::default();
        assert_eq!(router.target_names(), vec!["log"]);
        let n = Notification::from_reminder(&exam_event(), Utc::now());
        let failed = router.route(&n).await;
        assert!(failed.is_empty());
        assert_eq!(router.history(), vec![n]);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let router = NotifyRouter::new(vec![]);
        let n = Notification::from_reminder(&exam_event(), Utc::now());
        for _ in 0..(HISTORY_LIMIT + 5) {
            router.route(&n).await;
        }
        assert_eq!(router.history().len(), HISTORY_LIMIT);
    }
}
