//! Reminder delivery
//!
//! [`NotificationDispatcher::dispatch`] runs when a precise reminder fires;
//! [`NotificationDispatcher::send_batch`] backs the twice-daily broadcasts.
//! Both re-read the user's preference at send time, and neither lets a
//! push failure escape.

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{ServiceError, ServiceResult};
use crate::models::{Schedule, User};
use crate::push::{PushTransport, reminder_body};

/// What a single dispatch did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Sent,
    AlreadySent,
    /// The schedule was deleted after the reminder was created
    Disconnected,
    /// The user has notifications turned off; the row stays unsent
    Disabled,
    /// Push delivery failed; the row stays unsent and is not retried
    TransportFailed,
}

/// Counts from one broadcast batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct NotificationDispatcher {
    db: Arc<Database>,
    push: Arc<dyn PushTransport>,
    title: String,
    prepare_message: String,
}

impl NotificationDispatcher {
    pub fn new(
        db: Arc<Database>,
        push: Arc<dyn PushTransport>,
        title: impl Into<String>,
        prepare_message: impl Into<String>,
    ) -> Self {
        Self {
            db,
            push,
            title: title.into(),
            prepare_message: prepare_message.into(),
        }
    }

    /// Deliver the "start preparing" reminder for one notification row
    pub async fn dispatch(&self, notification_id: i64) -> ServiceResult<DispatchOutcome> {
        let notification = self
            .db
            .find_notification(notification_id)?
            .ok_or_else(|| ServiceError::not_found("notification", notification_id))?;

        if notification.is_sent {
            tracing::debug!(notification_id, "Reminder already sent, skipping");
            return Ok(DispatchOutcome::AlreadySent);
        }

        let Some(schedule_id) = notification.schedule_id else {
            tracing::debug!(notification_id, "Reminder has no schedule, skipping");
            return Ok(DispatchOutcome::Disconnected);
        };
        let schedule = self
            .db
            .find_schedule(schedule_id)?
            .ok_or_else(|| ServiceError::not_found("schedule", schedule_id))?;
        let user = self.load_user(schedule.user_id)?;

        if !self.notifications_enabled(user.id)? {
            tracing::debug!(notification_id, user_id = %user.id, "Notifications disabled");
            return Ok(DispatchOutcome::Disabled);
        }

        if !self.db.claim_notification(notification_id)? {
            return Ok(DispatchOutcome::AlreadySent);
        }

        if let Err(e) = self.send(&user, &schedule, &self.prepare_message).await {
            tracing::error!(
                notification_id,
                schedule = %schedule.name,
                error = %e,
                "Failed to send reminder"
            );
            self.db.mark_unsent(notification_id)?;
            return Ok(DispatchOutcome::TransportFailed);
        }

        tracing::info!(notification_id, schedule = %schedule.name, "Reminder sent");
        Ok(DispatchOutcome::Sent)
    }

    /// Dispatch from a timer callback, where nobody can receive the error
    pub async fn dispatch_logged(&self, notification_id: i64) {
        if let Err(e) = self.dispatch(notification_id).await {
            tracing::error!(notification_id, error = %e, "Reminder dispatch failed");
        }
    }

    /// Send `message` for each schedule whose user has notifications on.
    ///
    /// Every schedule is handled on its own: a lookup or push failure is
    /// counted and logged, and the batch carries on.
    pub async fn send_batch(&self, schedules: &[Schedule], message: &str) -> BatchReport {
        let mut report = BatchReport::default();

        for schedule in schedules {
            match self.send_one(schedule, message).await {
                Ok(true) => report.sent += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        schedule_id = %schedule.id,
                        error = %e,
                        "Broadcast reminder failed"
                    );
                }
            }
        }

        report
    }

    async fn send_one(&self, schedule: &Schedule, message: &str) -> anyhow::Result<bool> {
        let user = self.load_user(schedule.user_id)?;
        if !self.notifications_enabled(user.id)? {
            return Ok(false);
        }
        self.send(&user, schedule, message).await?;
        Ok(true)
    }

    async fn send(&self, user: &User, schedule: &Schedule, message: &str) -> anyhow::Result<()> {
        let token = user
            .push_token
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("user {} has no push token", user.id))?;
        let body = reminder_body(&user.name, message, &schedule.name);
        self.push.send(token, &self.title, &body).await
    }

    fn load_user(&self, user_id: Uuid) -> ServiceResult<User> {
        self.db
            .find_user(user_id)?
            .ok_or_else(|| ServiceError::not_found("user", user_id))
    }

    fn notifications_enabled(&self, user_id: Uuid) -> ServiceResult<bool> {
        let setting = self
            .db
            .find_user_setting(user_id)?
            .ok_or_else(|| ServiceError::not_found("user setting", user_id))?;
        Ok(setting.notifications_enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{seed_schedule, seed_user};
    use crate::push::RecordingPushTransport;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 23, hour, minute, 0).unwrap()
    }

    fn setup() -> (Arc<Database>, Arc<RecordingPushTransport>, NotificationDispatcher) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let push = Arc::new(RecordingPushTransport::default());
        let dispatcher = NotificationDispatcher::new(
            Arc::clone(&db),
            push.clone(),
            "Schedule reminder",
            "time to start getting ready.",
        );
        (db, push, dispatcher)
    }

    #[tokio::test]
    async fn sends_and_marks_sent() {
        let (db, push, dispatcher) = setup();
        let user = seed_user(&db, true);
        let (_, notification) = seed_schedule(&db, &user, at(9, 0), at(8, 20));

        let outcome = dispatcher.dispatch(notification.id).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Sent);
        assert!(db.find_notification(notification.id).unwrap().unwrap().is_sent);
        let sent = push.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "device-token");
        assert_eq!(sent[0].1, "Schedule reminder");
        assert_eq!(sent[0].2, "Mina, time to start getting ready.\nSchedule: Lunch");
    }

    #[tokio::test]
    async fn second_dispatch_does_not_resend() {
        let (db, push, dispatcher) = setup();
        let user = seed_user(&db, true);
        let (_, notification) = seed_schedule(&db, &user, at(9, 0), at(8, 20));

        dispatcher.dispatch(notification.id).await.unwrap();
        let outcome = dispatcher.dispatch(notification.id).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::AlreadySent);
        assert_eq!(push.sent().len(), 1);
    }

    #[tokio::test]
    async fn disabled_user_is_skipped_and_row_stays_unsent() {
        let (db, push, dispatcher) = setup();
        let user = seed_user(&db, false);
        let (_, notification) = seed_schedule(&db, &user, at(9, 0), at(8, 20));

        let outcome = dispatcher.dispatch(notification.id).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Disabled);
        assert!(push.sent().is_empty());
        assert!(!db.find_notification(notification.id).unwrap().unwrap().is_sent);
    }

    #[tokio::test]
    async fn transport_failure_is_swallowed() {
        let (db, push, dispatcher) = setup();
        let user = seed_user(&db, true);
        let (_, notification) = seed_schedule(&db, &user, at(9, 0), at(8, 20));
        push.set_failing(true);

        let outcome = dispatcher.dispatch(notification.id).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::TransportFailed);
        assert!(!db.find_notification(notification.id).unwrap().unwrap().is_sent);
    }

    #[tokio::test]
    async fn disconnected_notification_is_skipped() {
        let (db, push, dispatcher) = setup();
        let user = seed_user(&db, true);
        let (schedule, notification) = seed_schedule(&db, &user, at(9, 0), at(8, 20));
        db.delete_schedule(schedule.id).unwrap();

        let outcome = dispatcher.dispatch(notification.id).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Disconnected);
        assert!(push.sent().is_empty());
    }

    #[tokio::test]
    async fn unknown_notification_is_not_found() {
        let (_db, _push, dispatcher) = setup();

        let err = dispatcher.dispatch(42).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn batch_isolates_failures_per_schedule() {
        let (db, push, dispatcher) = setup();
        let enabled = seed_user(&db, true);
        let disabled = seed_user(&db, false);
        let mut tokenless = User::new("Jun", 0);
        tokenless.push_token = None;
        db.insert_user(&tokenless, true).unwrap();

        let (first, _) = seed_schedule(&db, &enabled, at(9, 0), at(8, 0));
        let (second, _) = seed_schedule(&db, &tokenless, at(10, 0), at(9, 0));
        let (third, _) = seed_schedule(&db, &disabled, at(11, 0), at(10, 0));
        let (fourth, _) = seed_schedule(&db, &enabled, at(12, 0), at(11, 0));

        let report = dispatcher
            .send_batch(&[first, second, third, fourth], "you have plans today.")
            .await;

        assert_eq!(
            report,
            BatchReport {
                sent: 2,
                skipped: 1,
                failed: 1
            }
        );
        assert_eq!(push.sent().len(), 2);
    }
}
