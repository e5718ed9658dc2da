//! Schedule operations
//!
//! Keeps each schedule's notification row and its timer in step with the
//! schedule, its preparation chain and its owner's defaults.

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{ServiceError, ServiceResult};
use crate::lateness::LatenessTracker;
use crate::models::{
    ChainOwner, DoneStatus, LATENESS_NOT_ENDED, LatenessRecord, NotificationSchedule,
    PreparationStep, PunctualitySummary, Schedule, ScheduleInput, User,
};
use crate::preparation;
use crate::reminder::{Reminders, compute_fire_time};

/// Result of finishing a schedule
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FinishOutcome {
    pub done_status: DoneStatus,
    /// New score, or `None` when the schedule did not change it
    pub score: Option<f32>,
}

pub struct ScheduleService {
    db: Arc<Database>,
    reminders: Reminders,
    tracker: LatenessTracker,
}

impl ScheduleService {
    pub fn new(db: Arc<Database>, reminders: Reminders, tracker: LatenessTracker) -> Self {
        Self {
            db,
            reminders,
            tracker,
        }
    }

    fn user(&self, user_id: Uuid) -> ServiceResult<User> {
        self.db
            .find_user(user_id)?
            .ok_or_else(|| ServiceError::not_found("user", user_id))
    }

    /// Load a schedule and check that `user_id` owns it
    fn owned_schedule(&self, user_id: Uuid, schedule_id: Uuid) -> ServiceResult<Schedule> {
        let schedule = self
            .db
            .find_schedule(schedule_id)?
            .ok_or_else(|| ServiceError::not_found("schedule", schedule_id))?;
        if schedule.user_id != user_id {
            return Err(ServiceError::Unauthorized(schedule_id));
        }
        Ok(schedule)
    }

    fn notification_for(&self, schedule_id: Uuid) -> ServiceResult<NotificationSchedule> {
        self.db
            .find_notification_by_schedule(schedule_id)?
            .ok_or_else(|| ServiceError::not_found("notification", schedule_id))
    }

    fn chain_owner(schedule: &Schedule) -> ChainOwner {
        if schedule.is_change {
            ChainOwner::Schedule(schedule.id)
        } else {
            ChainOwner::UserDefault(schedule.user_id)
        }
    }

    fn fire_time(&self, schedule: &Schedule, user: &User) -> ServiceResult<chrono::DateTime<chrono::Utc>> {
        let preparation = preparation::total_duration(&self.db, Self::chain_owner(schedule))?;
        let slack = schedule.slack_minutes.unwrap_or(user.spare_minutes);
        Ok(compute_fire_time(
            schedule.scheduled_at,
            preparation,
            schedule.move_minutes,
            slack,
        ))
    }

    /// Recompute a schedule's reminder and move its timer when the time changed
    fn refresh_notification(&self, schedule: &Schedule, user: &User) -> ServiceResult<()> {
        let notification = self.notification_for(schedule.id)?;
        let fire_at = self.fire_time(schedule, user)?;
        if fire_at == notification.fire_at {
            return Ok(());
        }

        self.reminders.disarm(notification.id);
        let updated = self.db.reschedule_notification(notification.id, fire_at)?;
        self.reminders.arm(&updated);

        tracing::info!(
            schedule = %schedule.name,
            notification_id = updated.id,
            %fire_at,
            "Reminder rescheduled"
        );
        Ok(())
    }

    pub fn add_schedule(&self, user_id: Uuid, input: ScheduleInput) -> ServiceResult<Schedule> {
        let user = self.user(user_id)?;
        let schedule = Schedule {
            id: input.id.unwrap_or_else(Uuid::new_v4),
            user_id,
            place: input.place,
            name: input.name,
            move_minutes: input.move_minutes,
            scheduled_at: input.scheduled_at,
            slack_minutes: input.slack_minutes,
            is_change: false,
            lateness_minutes: LATENESS_NOT_ENDED,
            done_status: DoneStatus::NotEnded,
            score_recorded: false,
            note: input.note,
        };

        let fire_at = self.fire_time(&schedule, &user)?;
        let notification = self.db.insert_schedule_with_notification(&schedule, fire_at)?;
        self.reminders.arm(&notification);

        tracing::info!(schedule_id = %schedule.id, %fire_at, "Schedule added");
        Ok(schedule)
    }

    pub fn modify_schedule(
        &self,
        user_id: Uuid,
        schedule_id: Uuid,
        input: ScheduleInput,
    ) -> ServiceResult<Schedule> {
        let user = self.user(user_id)?;
        let mut schedule = self.owned_schedule(user_id, schedule_id)?;

        schedule.place = input.place;
        schedule.name = input.name;
        schedule.move_minutes = input.move_minutes;
        schedule.scheduled_at = input.scheduled_at;
        schedule.slack_minutes = input.slack_minutes;
        schedule.note = input.note;
        self.db.update_schedule(&schedule)?;

        self.refresh_notification(&schedule, &user)?;
        Ok(schedule)
    }

    /// Delete a schedule; its notification row is kept, disconnected
    pub fn delete_schedule(&self, user_id: Uuid, schedule_id: Uuid) -> ServiceResult<()> {
        self.owned_schedule(user_id, schedule_id)?;
        let notification = self.notification_for(schedule_id)?;

        self.reminders.disarm(notification.id);
        self.db.delete_schedule(schedule_id)?;

        tracing::info!(%schedule_id, "Schedule deleted");
        Ok(())
    }

    /// Give a schedule its own preparation chain, replacing any previous one
    pub fn update_schedule_preparations(
        &self,
        user_id: Uuid,
        schedule_id: Uuid,
        steps: &[PreparationStep],
    ) -> ServiceResult<Vec<PreparationStep>> {
        let user = self.user(user_id)?;
        let mut schedule = self.owned_schedule(user_id, schedule_id)?;

        preparation::replace(&self.db, ChainOwner::Schedule(schedule_id), steps)?;
        schedule.is_change = true;

        self.refresh_notification(&schedule, &user)?;
        preparation::traverse(&self.db, ChainOwner::Schedule(schedule_id))
    }

    /// The chain a schedule currently follows
    pub fn preparations_for(
        &self,
        user_id: Uuid,
        schedule_id: Uuid,
    ) -> ServiceResult<Vec<PreparationStep>> {
        let schedule = self.owned_schedule(user_id, schedule_id)?;
        preparation::traverse(&self.db, Self::chain_owner(&schedule))
    }

    /// Store a user's first default chain
    pub fn set_first_user_preparations(
        &self,
        user_id: Uuid,
        steps: &[PreparationStep],
    ) -> ServiceResult<Vec<PreparationStep>> {
        self.user(user_id)?;
        let owner = ChainOwner::UserDefault(user_id);
        if self.db.has_chain(owner)? {
            return Err(ServiceError::AlreadyExists("default preparation"));
        }

        preparation::build(&self.db, owner, steps)?;
        preparation::traverse(&self.db, owner)
    }

    /// Replace a user's default chain and move the reminders of every
    /// unfinished schedule that follows it
    pub fn update_user_preparations(
        &self,
        user_id: Uuid,
        steps: &[PreparationStep],
    ) -> ServiceResult<Vec<PreparationStep>> {
        let user = self.user(user_id)?;
        let owner = ChainOwner::UserDefault(user_id);
        preparation::replace(&self.db, owner, steps)?;

        for schedule in self.db.schedules_on_default_chain(user_id)? {
            let pending = self
                .db
                .find_notification_by_schedule(schedule.id)?
                .is_some_and(|n| !n.is_sent);
            if pending {
                self.refresh_notification(&schedule, &user)?;
            }
        }

        preparation::traverse(&self.db, owner)
    }

    pub fn user_preparations(&self, user_id: Uuid) -> ServiceResult<Vec<PreparationStep>> {
        self.user(user_id)?;
        preparation::traverse(&self.db, ChainOwner::UserDefault(user_id))
    }

    /// Record how late the user was and fold it into their score
    pub fn finish_schedule(
        &self,
        user_id: Uuid,
        schedule_id: Uuid,
        lateness_minutes: i32,
    ) -> ServiceResult<FinishOutcome> {
        self.owned_schedule(user_id, schedule_id)?;

        let (done_status, score) = self.tracker.finish(user_id, schedule_id, lateness_minutes)?;

        Ok(FinishOutcome { done_status, score })
    }

    pub fn update_user_settings(
        &self,
        user_id: Uuid,
        push_token: Option<&str>,
        notifications_enabled: bool,
    ) -> ServiceResult<()> {
        self.db
            .update_user_settings(user_id, push_token, notifications_enabled)?;
        tracing::info!(%user_id, notifications_enabled, "User settings updated");
        Ok(())
    }

    pub fn punctuality(&self, user_id: Uuid) -> ServiceResult<PunctualitySummary> {
        self.tracker.punctuality(user_id)
    }

    pub fn reset_punctuality(&self, user_id: Uuid) -> ServiceResult<()> {
        self.tracker.reset_punctuality(user_id)
    }

    pub fn lateness_history(&self, user_id: Uuid) -> ServiceResult<Vec<LatenessRecord>> {
        self.user(user_id)?;
        self.tracker.lateness_history(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::tests::seed_user;
    use crate::dispatch::NotificationDispatcher;
    use crate::lateness::LatenessRatio;
    use crate::push::RecordingPushTransport;
    use crate::scheduler::ReminderScheduler;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::time::Duration as StdDuration;

    struct Fixture {
        db: Arc<Database>,
        push: Arc<RecordingPushTransport>,
        scheduler: Arc<ReminderScheduler>,
        service: ScheduleService,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 23, 7, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let push = Arc::new(RecordingPushTransport::default());
        let scheduler = Arc::new(ReminderScheduler::new(Arc::new(FixedClock::new(now()))));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::clone(&db),
            push.clone(),
            "Schedule reminder",
            "time to get ready.",
        ));
        let reminders = Reminders::new(Arc::clone(&scheduler), dispatcher);
        let tracker = LatenessTracker::new(Arc::clone(&db), Arc::new(LatenessRatio));
        let service = ScheduleService::new(Arc::clone(&db), reminders, tracker);
        Fixture {
            db,
            push,
            scheduler,
            service,
        }
    }

    fn input(scheduled_at: DateTime<Utc>) -> ScheduleInput {
        ScheduleInput {
            id: None,
            place: Some("Library".to_string()),
            name: "Study group".to_string(),
            move_minutes: 10,
            scheduled_at,
            slack_minutes: Some(5),
            note: None,
        }
    }

    fn chain(durations: &[(&str, u32)]) -> Vec<PreparationStep> {
        let mut steps: Vec<PreparationStep> = durations
            .iter()
            .map(|(name, minutes)| PreparationStep {
                id: Uuid::new_v4(),
                name: name.to_string(),
                duration_minutes: *minutes,
                next_id: None,
            })
            .collect();
        for i in 1..steps.len() {
            steps[i - 1].next_id = Some(steps[i].id);
        }
        steps
    }

    fn nine_am() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 23, 9, 0, 0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn new_schedule_uses_the_default_chain() {
        let f = fixture();
        let user = seed_user(&f.db, true);
        f.service
            .set_first_user_preparations(user.id, &chain(&[("Wash", 15), ("Dress", 10)]))
            .unwrap();

        let schedule = f.service.add_schedule(user.id, input(nine_am())).unwrap();

        let notification = f.db.find_notification_by_schedule(schedule.id).unwrap().unwrap();
        assert_eq!(notification.fire_at, nine_am() - Duration::minutes(40));
        assert!(f.scheduler.is_scheduled(notification.id));
    }

    #[tokio::test(start_paused = true)]
    async fn slack_falls_back_to_the_users_spare_time() {
        let f = fixture();
        let user = seed_user(&f.db, true);
        let mut without_slack = input(nine_am());
        without_slack.slack_minutes = None;

        let schedule = f.service.add_schedule(user.id, without_slack).unwrap();

        let notification = f.db.find_notification_by_schedule(schedule.id).unwrap().unwrap();
        // move 10 + user spare time 5
        assert_eq!(notification.fire_at, nine_am() - Duration::minutes(15));
    }

    #[tokio::test(start_paused = true)]
    async fn first_default_chain_cannot_be_set_twice() {
        let f = fixture();
        let user = seed_user(&f.db, true);
        f.service
            .set_first_user_preparations(user.id, &chain(&[("Wash", 15)]))
            .unwrap();

        let err = f
            .service
            .set_first_user_preparations(user.id, &chain(&[("Dress", 10)]))
            .unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyExists(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn custom_chain_moves_the_reminder() {
        let f = fixture();
        let user = seed_user(&f.db, true);
        let schedule = f.service.add_schedule(user.id, input(nine_am())).unwrap();

        let steps = f
            .service
            .update_schedule_preparations(user.id, schedule.id, &chain(&[("Pack", 25)]))
            .unwrap();
        assert_eq!(steps.len(), 1);

        let notification = f.db.find_notification_by_schedule(schedule.id).unwrap().unwrap();
        assert_eq!(notification.fire_at, nine_am() - Duration::minutes(40));
        assert_eq!(f.scheduler.fire_time(notification.id), Some(notification.fire_at));
        assert!(f.db.find_schedule(schedule.id).unwrap().unwrap().is_change);

        let used = f.service.preparations_for(user.id, schedule.id).unwrap();
        assert_eq!(used[0].name, "Pack");
    }

    #[tokio::test(start_paused = true)]
    async fn default_chain_update_moves_only_schedules_that_follow_it() {
        let f = fixture();
        let user = seed_user(&f.db, true);
        let follows_default = f.service.add_schedule(user.id, input(nine_am())).unwrap();
        let customized = f.service.add_schedule(user.id, input(nine_am())).unwrap();
        f.service
            .update_schedule_preparations(user.id, customized.id, &chain(&[("Pack", 5)]))
            .unwrap();

        f.service
            .update_user_preparations(user.id, &chain(&[("Wash", 20), ("Dress", 10)]))
            .unwrap();

        let moved = f.db.find_notification_by_schedule(follows_default.id).unwrap().unwrap();
        assert_eq!(moved.fire_at, nine_am() - Duration::minutes(45));
        let kept = f.db.find_notification_by_schedule(customized.id).unwrap().unwrap();
        assert_eq!(kept.fire_at, nine_am() - Duration::minutes(20));
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduled_reminder_is_dispatched_once_at_the_new_time() {
        let f = fixture();
        let user = seed_user(&f.db, true);
        // Reminder at 08:45 (move 10 + slack 5), i.e. 105 minutes from now.
        let schedule = f.service.add_schedule(user.id, input(nine_am())).unwrap();

        let later = input(nine_am() + Duration::minutes(30));
        f.service.modify_schedule(user.id, schedule.id, later).unwrap();

        tokio::time::sleep(StdDuration::from_secs(106 * 60)).await;
        assert!(f.push.sent().is_empty());

        tokio::time::sleep(StdDuration::from_secs(30 * 60)).await;
        assert_eq!(f.push.sent().len(), 1);
        let notification = f.db.find_notification_by_schedule(schedule.id).unwrap().unwrap();
        assert!(notification.is_sent);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_fire_time_keeps_the_timer() {
        let f = fixture();
        let user = seed_user(&f.db, true);
        let schedule = f.service.add_schedule(user.id, input(nine_am())).unwrap();
        let before = f.db.find_notification_by_schedule(schedule.id).unwrap().unwrap();

        let mut renamed = input(nine_am());
        renamed.name = "Renamed".to_string();
        f.service.modify_schedule(user.id, schedule.id, renamed).unwrap();

        let after = f.db.find_notification_by_schedule(schedule.id).unwrap().unwrap();
        assert_eq!(before, after);
        assert!(f.scheduler.is_scheduled(before.id));
    }

    #[tokio::test(start_paused = true)]
    async fn other_users_schedules_are_unauthorized() {
        let f = fixture();
        let owner = seed_user(&f.db, true);
        let stranger = seed_user(&f.db, true);
        let schedule = f.service.add_schedule(owner.id, input(nine_am())).unwrap();

        let err = f.service.delete_schedule(stranger.id, schedule.id).unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized(_)));
        let err = f.service.finish_schedule(stranger.id, schedule.id, 0).unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_cancels_the_timer_and_keeps_the_row() {
        let f = fixture();
        let user = seed_user(&f.db, true);
        let schedule = f.service.add_schedule(user.id, input(nine_am())).unwrap();
        let notification = f.db.find_notification_by_schedule(schedule.id).unwrap().unwrap();

        f.service.delete_schedule(user.id, schedule.id).unwrap();

        assert!(!f.scheduler.is_scheduled(notification.id));
        let orphan = f.db.find_notification(notification.id).unwrap().unwrap();
        assert_eq!(orphan.schedule_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn finishing_twice_scores_once() {
        let f = fixture();
        let user = seed_user(&f.db, true);
        let schedule = f.service.add_schedule(user.id, input(nine_am())).unwrap();

        let first = f.service.finish_schedule(user.id, schedule.id, 15).unwrap();
        assert_eq!(first.done_status, DoneStatus::Late);
        assert_eq!(first.score, Some(0.0));

        let second = f.service.finish_schedule(user.id, schedule.id, 15).unwrap();
        assert_eq!(second.score, None);
        assert_eq!(f.service.punctuality(user.id).unwrap().schedule_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_can_customize_a_copy_of_the_default_chain() {
        let f = fixture();
        let user = seed_user(&f.db, true);
        f.service
            .set_first_user_preparations(user.id, &chain(&[("Wash", 10)]))
            .unwrap();
        let schedule = f.service.add_schedule(user.id, input(nine_am())).unwrap();

        let mut steps = f.service.preparations_for(user.id, schedule.id).unwrap();
        steps[0].duration_minutes = 20;
        let customized = f
            .service
            .update_schedule_preparations(user.id, schedule.id, &steps)
            .unwrap();

        assert_eq!(customized, steps);
        let defaults = f.service.user_preparations(user.id).unwrap();
        assert_eq!(defaults[0].id, steps[0].id);
        assert_eq!(defaults[0].duration_minutes, 10);
        let notification = f.db.find_notification_by_schedule(schedule.id).unwrap().unwrap();
        assert_eq!(notification.fire_at, nine_am() - Duration::minutes(35));
    }

    #[tokio::test(start_paused = true)]
    async fn finished_schedule_cannot_be_reopened() {
        let f = fixture();
        let user = seed_user(&f.db, true);
        let schedule = f.service.add_schedule(user.id, input(nine_am())).unwrap();
        f.service.finish_schedule(user.id, schedule.id, 0).unwrap();

        let err = f
            .service
            .finish_schedule(user.id, schedule.id, LATENESS_NOT_ENDED)
            .unwrap_err();

        assert!(matches!(err, ServiceError::InvalidLateness(-1)));
        let stored = f.db.find_schedule(schedule.id).unwrap().unwrap();
        assert_eq!(stored.done_status, DoneStatus::Normal);
        assert!(stored.score_recorded);
        assert!(f.db.schedules_on_default_chain(user.id).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_user_cannot_add_schedules() {
        let f = fixture();

        let err = f.service.add_schedule(Uuid::new_v4(), input(nine_am())).unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { .. }));
    }
}
