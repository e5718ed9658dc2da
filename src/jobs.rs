//! Background reminder jobs
//!
//! Two daily broadcasts (tomorrow's schedules in the evening, today's in the
//! morning) and the startup pass that re-registers pending reminder timers.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::ReminderConfig;
use crate::db::Database;
use crate::dispatch::{BatchReport, NotificationDispatcher};
use crate::error::ServiceResult;
use crate::reminder::Reminders;

/// First and last instant of a local calendar day
pub fn day_window(date: NaiveDate, offset: FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = local_to_utc(date.and_time(NaiveTime::MIN), offset);
    let end = start + Duration::days(1) - Duration::nanoseconds(1);
    (start, end)
}

/// Next instant strictly after `after` whose local time of day is `at`
pub fn next_occurrence(after: DateTime<Utc>, at: NaiveTime, offset: FixedOffset) -> DateTime<Utc> {
    let local = after.with_timezone(&offset);
    let candidate = local_to_utc(local.date_naive().and_time(at), offset);
    if candidate > after {
        candidate
    } else {
        candidate + Duration::days(1)
    }
}

fn local_to_utc(local: chrono::NaiveDateTime, offset: FixedOffset) -> DateTime<Utc> {
    (local - Duration::seconds(i64::from(offset.local_minus_utc()))).and_utc()
}

/// A broadcast that runs once a day at a fixed local time
pub struct BroadcastJob {
    name: &'static str,
    at: NaiveTime,
    /// 0 targets the day the job runs on, 1 the day after
    days_ahead: i64,
    message: String,
    offset: FixedOffset,
    db: Arc<Database>,
    dispatcher: Arc<NotificationDispatcher>,
    clock: Arc<dyn Clock>,
}

impl BroadcastJob {
    /// Tomorrow's schedules, sent at the configured evening time
    pub fn evening(
        config: &ReminderConfig,
        db: Arc<Database>,
        dispatcher: Arc<NotificationDispatcher>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            name: "evening",
            at: config.evening_time,
            days_ahead: 1,
            message: config.evening_message.clone(),
            offset: config.utc_offset()?,
            db,
            dispatcher,
            clock,
        })
    }

    /// Today's schedules, sent at the configured morning time
    pub fn morning(
        config: &ReminderConfig,
        db: Arc<Database>,
        dispatcher: Arc<NotificationDispatcher>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            name: "morning",
            at: config.morning_time,
            days_ahead: 0,
            message: config.morning_message.clone(),
            offset: config.utc_offset()?,
            db,
            dispatcher,
            clock,
        })
    }

    /// Broadcast for a run that happened on local date `run_date`
    pub async fn broadcast_once(&self, run_date: NaiveDate) -> ServiceResult<BatchReport> {
        let target = run_date + Duration::days(self.days_ahead);
        let (start, end) = day_window(target, self.offset);
        let schedules = self.db.schedules_between(start, end)?;

        let report = self.dispatcher.send_batch(&schedules, &self.message).await;
        tracing::info!(
            job = self.name,
            %target,
            sent = report.sent,
            skipped = report.skipped,
            failed = report.failed,
            "Broadcast finished"
        );
        Ok(report)
    }

    /// Run once a day until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(job = self.name, at = %self.at, "Broadcast job started");
        let mut last_run: Option<DateTime<Utc>> = None;

        loop {
            let now = self.clock.now();
            let after = last_run.map_or(now, |last| last.max(now));
            let next = next_occurrence(after, self.at, self.offset);
            let delay = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(job = self.name, "Broadcast job stopped");
                    break;
                }
                _ = tokio::time::sleep(delay) => {
                    let run_date = next.with_timezone(&self.offset).date_naive();
                    if let Err(e) = self.broadcast_once(run_date).await {
                        tracing::error!(job = self.name, error = %e, "Broadcast failed");
                    }
                    last_run = Some(next);
                }
            }
        }
    }
}

/// Re-register timers for every unsent reminder that is still ahead.
///
/// Must run before the server accepts requests. Returns how many timers were
/// registered.
pub fn recover_notifications(
    db: &Database,
    reminders: &Reminders,
    clock: &dyn Clock,
) -> ServiceResult<usize> {
    let now = clock.now();
    let pending = db.pending_notifications_after(now)?;

    let recovered = pending
        .iter()
        .filter(|notification| reminders.arm(notification))
        .count();

    tracing::info!(recovered, %now, "Reminder timers recovered");
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::tests::{seed_schedule, seed_user};
    use crate::push::RecordingPushTransport;
    use crate::scheduler::ReminderScheduler;
    use chrono::TimeZone;
    use std::time::Duration as StdDuration;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, day, hour, minute, 0).unwrap()
    }

    fn hm(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    fn kst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn setup() -> (Arc<Database>, Arc<RecordingPushTransport>, Arc<NotificationDispatcher>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let push = Arc::new(RecordingPushTransport::default());
        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::clone(&db),
            push.clone(),
            "Schedule reminder",
            "time to get ready.",
        ));
        (db, push, dispatcher)
    }

    #[test]
    fn day_window_follows_the_local_calendar() {
        let date = NaiveDate::from_ymd_opt(2025, 2, 23).unwrap();

        let (start, end) = day_window(date, kst());

        assert_eq!(start, at(22, 15, 0));
        assert_eq!(end, at(23, 15, 0) - Duration::nanoseconds(1));
    }

    #[test]
    fn next_occurrence_rolls_over_after_the_time_passed() {
        let utc = FixedOffset::east_opt(0).unwrap();

        assert_eq!(next_occurrence(at(23, 20, 0), hm(21, 0), utc), at(23, 21, 0));
        assert_eq!(next_occurrence(at(23, 21, 0), hm(21, 0), utc), at(24, 21, 0));
        assert_eq!(next_occurrence(at(23, 22, 0), hm(21, 0), utc), at(24, 21, 0));
    }

    #[test]
    fn next_occurrence_uses_local_time() {
        // 08:00 KST is 23:00 UTC the previous day
        assert_eq!(next_occurrence(at(23, 12, 0), hm(8, 0), kst()), at(23, 23, 0));
    }

    #[tokio::test]
    async fn evening_broadcast_covers_tomorrow_only() {
        let (db, push, dispatcher) = setup();
        let user = seed_user(&db, true);
        seed_schedule(&db, &user, at(23, 18, 0), at(23, 17, 0));
        seed_schedule(&db, &user, at(24, 0, 0), at(23, 23, 0));
        seed_schedule(&db, &user, at(24, 23, 59), at(24, 23, 0));
        seed_schedule(&db, &user, at(25, 0, 0), at(24, 23, 30));

        let clock = Arc::new(FixedClock::new(at(23, 21, 0)));
        let job = BroadcastJob::evening(&ReminderConfig::default(), db, dispatcher, clock).unwrap();
        let report = job
            .broadcast_once(NaiveDate::from_ymd_opt(2025, 2, 23).unwrap())
            .await
            .unwrap();

        assert_eq!(report.sent, 2);
        assert!(push.sent().iter().all(|(_, _, body)| body.contains("tomorrow")));
    }

    #[tokio::test]
    async fn morning_broadcast_skips_disabled_users() {
        let (db, push, dispatcher) = setup();
        let enabled = seed_user(&db, true);
        let disabled = seed_user(&db, false);
        seed_schedule(&db, &enabled, at(23, 12, 0), at(23, 11, 0));
        seed_schedule(&db, &disabled, at(23, 13, 0), at(23, 12, 0));

        let clock = Arc::new(FixedClock::new(at(23, 8, 0)));
        let job = BroadcastJob::morning(&ReminderConfig::default(), db, dispatcher, clock).unwrap();
        let report = job
            .broadcast_once(NaiveDate::from_ymd_opt(2025, 2, 23).unwrap())
            .await
            .unwrap();

        assert_eq!(report, BatchReport { sent: 1, skipped: 1, failed: 0 });
        assert_eq!(push.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn job_runs_at_its_time_and_stops_on_cancel() {
        let (db, push, dispatcher) = setup();
        let user = seed_user(&db, true);
        seed_schedule(&db, &user, at(23, 12, 0), at(23, 11, 0));

        let clock = Arc::new(FixedClock::new(at(23, 7, 0)));
        let job = BroadcastJob::morning(&ReminderConfig::default(), db, dispatcher, clock).unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(job.run(cancel.clone()));

        tokio::time::sleep(StdDuration::from_secs(59 * 60)).await;
        assert!(push.sent().is_empty());

        tokio::time::sleep(StdDuration::from_secs(2 * 60)).await;
        assert_eq!(push.sent().len(), 1);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(push.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_registers_only_pending_future_reminders() {
        let (db, _push, dispatcher) = setup();
        let user = seed_user(&db, true);
        let now = at(23, 7, 0);

        let (_, future_a) = seed_schedule(&db, &user, at(23, 9, 0), at(23, 8, 20));
        let (_, future_b) = seed_schedule(&db, &user, at(23, 10, 0), at(23, 9, 30));
        let (_, future_c) = seed_schedule(&db, &user, at(24, 9, 0), at(24, 8, 0));
        let (_, sent_a) = seed_schedule(&db, &user, at(23, 11, 0), at(23, 10, 0));
        let (_, sent_b) = seed_schedule(&db, &user, at(23, 12, 0), at(23, 11, 0));
        assert!(db.claim_notification(sent_a.id).unwrap());
        assert!(db.claim_notification(sent_b.id).unwrap());

        let clock = Arc::new(FixedClock::new(now));
        let scheduler = Arc::new(ReminderScheduler::new(clock.clone()));
        let reminders = Reminders::new(Arc::clone(&scheduler), dispatcher);

        let recovered = recover_notifications(&db, &reminders, clock.as_ref()).unwrap();

        assert_eq!(recovered, 3);
        assert_eq!(scheduler.pending(), 3);
        for notification in [future_a, future_b, future_c] {
            assert!(scheduler.is_scheduled(notification.id));
        }
        assert!(!scheduler.is_scheduled(sent_a.id));
        assert!(!scheduler.is_scheduled(sent_b.id));
    }

    #[tokio::test(start_paused = true)]
    async fn recovered_reminder_is_dispatched() {
        let (db, push, dispatcher) = setup();
        let user = seed_user(&db, true);
        let (_, notification) = seed_schedule(&db, &user, at(23, 9, 0), at(23, 8, 0));

        let clock = Arc::new(FixedClock::new(at(23, 7, 0)));
        let scheduler = Arc::new(ReminderScheduler::new(clock.clone()));
        let reminders = Reminders::new(scheduler, dispatcher);
        recover_notifications(&db, &reminders, clock.as_ref()).unwrap();

        tokio::time::sleep(StdDuration::from_secs(61 * 60)).await;

        assert_eq!(push.sent().len(), 1);
        assert!(db.find_notification(notification.id).unwrap().unwrap().is_sent);
    }
}
