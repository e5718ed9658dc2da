//! Reminder timing
//!
//! [`compute_fire_time`] decides when a schedule's reminder goes off;
//! [`Reminders`] ties notification rows to timers that dispatch them.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::dispatch::NotificationDispatcher;
use crate::models::NotificationSchedule;
use crate::scheduler::ReminderScheduler;

/// Instant at which the user has to start preparing:
/// `appointment - (preparation + move + slack)` minutes.
pub fn compute_fire_time(
    appointment: DateTime<Utc>,
    preparation_minutes: u32,
    move_minutes: u32,
    slack_minutes: u32,
) -> DateTime<Utc> {
    let lead = i64::from(preparation_minutes) + i64::from(move_minutes) + i64::from(slack_minutes);
    appointment - Duration::minutes(lead)
}

/// Registers notification rows with the timer registry
#[derive(Clone)]
pub struct Reminders {
    scheduler: Arc<ReminderScheduler>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl Reminders {
    pub fn new(scheduler: Arc<ReminderScheduler>, dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self {
            scheduler,
            dispatcher,
        }
    }

    /// Start a timer that dispatches `notification` at its fire time
    pub fn arm(&self, notification: &NotificationSchedule) -> bool {
        let id = notification.id;
        let dispatcher = Arc::clone(&self.dispatcher);
        self.scheduler.schedule(id, notification.fire_at, move || async move {
            dispatcher.dispatch_logged(id).await;
        })
    }

    pub fn disarm(&self, notification_id: i64) {
        self.scheduler.cancel(notification_id);
    }
}
