//! In-memory registry of pending reminder timers
//!
//! Each scheduled reminder is a tokio task sleeping until its fire instant.
//! The registry maps notification ids to the task's cancellation token. It
//! is a cache: the notification rows in the database are the source of
//! truth and [`crate::jobs::recover_notifications`] rebuilds it on startup.
//!
//! A firing task removes its own entry before running the callback. Cancel
//! and fire race on that removal, and whichever removes the entry first
//! wins.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;

struct PendingReminder {
    generation: u64,
    fire_at: DateTime<Utc>,
    cancel: CancellationToken,
}

pub struct ReminderScheduler {
    clock: Arc<dyn Clock>,
    pending: Arc<DashMap<i64, PendingReminder>>,
    next_generation: AtomicU64,
}

impl ReminderScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            pending: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Run `callback` at `fire_at`.
    ///
    /// Instants in the past are logged and skipped; the recovery and
    /// broadcast jobs cover reminders that were missed. Returns whether a
    /// timer was registered. An existing timer for the same id is replaced.
    pub fn schedule<F, Fut>(&self, notification_id: i64, fire_at: DateTime<Utc>, callback: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let now = self.clock.now();
        if fire_at < now {
            tracing::warn!(
                notification_id,
                %fire_at,
                "Reminder time is in the past, not scheduling"
            );
            return false;
        }
        let delay = (fire_at - now).to_std().unwrap_or_default();

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        // Registered before the task exists so a zero delay cannot fire unregistered.
        let replaced = self.pending.insert(
            notification_id,
            PendingReminder {
                generation,
                fire_at,
                cancel: cancel.clone(),
            },
        );
        if let Some(old) = replaced {
            old.cancel.cancel();
        }

        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let claimed = pending
                .remove_if(&notification_id, |_, entry| entry.generation == generation)
                .is_some();
            if !claimed {
                return;
            }

            tracing::debug!(notification_id, "Reminder timer fired");
            callback().await;
        });

        tracing::info!(notification_id, %fire_at, "Reminder scheduled");
        true
    }

    /// Drop the pending timer for `notification_id`, if any
    pub fn cancel(&self, notification_id: i64) {
        if let Some((_, entry)) = self.pending.remove(&notification_id) {
            entry.cancel.cancel();
            tracing::info!(notification_id, "Reminder cancelled");
        }
    }

    /// Cancel, then schedule at the new instant
    pub fn reschedule<F, Fut>(
        &self,
        notification_id: i64,
        fire_at: DateTime<Utc>,
        callback: F,
    ) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel(notification_id);
        self.schedule(notification_id, fire_at, callback)
    }

    pub fn is_scheduled(&self, notification_id: i64) -> bool {
        self.pending.contains_key(&notification_id)
    }

    pub fn fire_time(&self, notification_id: i64) -> Option<DateTime<Utc>> {
        self.pending.get(&notification_id).map(|entry| entry.fire_at)
    }

    /// Number of timers waiting to fire
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Cancel every pending timer
    pub fn shutdown(&self) {
        let ids: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in &ids {
            self.cancel(*id);
        }
        tracing::info!(cancelled = ids.len(), "Reminder scheduler stopped");
    }
}
