//! Lateness tracking and punctuality scores

use std::sync::Arc;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{ServiceError, ServiceResult};
use crate::models::{
    DoneStatus, LATENESS_NOT_ENDED, LatenessRecord, PunctualityCounts, PunctualitySummary,
};

impl DoneStatus {
    /// `>0` late, `0` on time, `-1` not ended, anything else abnormal
    pub fn from_lateness(lateness_minutes: i32) -> Self {
        match lateness_minutes {
            l if l > 0 => DoneStatus::Late,
            0 => DoneStatus::Normal,
            LATENESS_NOT_ENDED => DoneStatus::NotEnded,
            _ => DoneStatus::Abnormal,
        }
    }
}

/// How a new observation changes a user's score
pub trait ScoreStrategy: Send + Sync {
    fn update_score(
        &self,
        previous: f32,
        counts: PunctualityCounts,
        lateness_minutes: i32,
    ) -> (f32, PunctualityCounts);
}

/// Share of schedules since the last reset that ended without lateness,
/// as a percentage. Abnormal ends count as late.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatenessRatio;

impl ScoreStrategy for LatenessRatio {
    fn update_score(
        &self,
        _previous: f32,
        counts: PunctualityCounts,
        lateness_minutes: i32,
    ) -> (f32, PunctualityCounts) {
        let schedules = counts.schedules + 1;
        let lateness = match DoneStatus::from_lateness(lateness_minutes) {
            DoneStatus::Normal => counts.lateness,
            _ => counts.lateness + 1,
        };
        let score = 100.0 * (1.0 - lateness as f32 / schedules as f32);
        (score, PunctualityCounts { schedules, lateness })
    }
}

pub struct LatenessTracker {
    db: Arc<Database>,
    strategy: Arc<dyn ScoreStrategy>,
}

impl LatenessTracker {
    pub fn new(db: Arc<Database>, strategy: Arc<dyn ScoreStrategy>) -> Self {
        Self { db, strategy }
    }

    /// Store the lateness of a schedule along with its derived status
    pub fn record_completion(
        &self,
        schedule_id: Uuid,
        lateness_minutes: i32,
    ) -> ServiceResult<DoneStatus> {
        let status = DoneStatus::from_lateness(lateness_minutes);
        self.db
            .record_lateness(schedule_id, lateness_minutes, status)?;
        tracing::info!(%schedule_id, lateness_minutes, ?status, "Schedule completion recorded");
        Ok(status)
    }

    /// Fold a schedule's lateness into its user's score.
    ///
    /// Each schedule contributes at most once; repeated calls return `None`.
    /// An unfinished schedule contributes nothing.
    pub fn update_punctuality_score(
        &self,
        user_id: Uuid,
        schedule_id: Uuid,
        lateness_minutes: i32,
    ) -> ServiceResult<Option<f32>> {
        if DoneStatus::from_lateness(lateness_minutes) == DoneStatus::NotEnded {
            return Ok(None);
        }

        let strategy = Arc::clone(&self.strategy);
        let score = self
            .db
            .apply_score_update(user_id, schedule_id, |previous, counts| {
                strategy.update_score(previous, counts, lateness_minutes)
            })?;

        match score {
            Some(score) => tracing::info!(%user_id, %schedule_id, score, "Punctuality score updated"),
            None => tracing::debug!(%schedule_id, "Schedule already counted toward score"),
        }
        Ok(score)
    }

    /// Record how a schedule ended and score it, in one transaction.
    ///
    /// `-1` marks a schedule as not ended, so it cannot finish one.
    pub fn finish(
        &self,
        user_id: Uuid,
        schedule_id: Uuid,
        lateness_minutes: i32,
    ) -> ServiceResult<(DoneStatus, Option<f32>)> {
        let status = DoneStatus::from_lateness(lateness_minutes);
        if status == DoneStatus::NotEnded {
            return Err(ServiceError::InvalidLateness(lateness_minutes));
        }

        let strategy = Arc::clone(&self.strategy);
        let score = self.db.complete_schedule(
            user_id,
            schedule_id,
            lateness_minutes,
            status,
            |previous, counts| strategy.update_score(previous, counts, lateness_minutes),
        )?;

        tracing::info!(%schedule_id, lateness_minutes, ?status, ?score, "Schedule finished");
        Ok((status, score))
    }

    /// Zero both counters and return the score to "no data"
    pub fn reset_punctuality(&self, user_id: Uuid) -> ServiceResult<()> {
        self.db.reset_punctuality(user_id)?;
        tracing::info!(%user_id, "Punctuality reset");
        Ok(())
    }

    pub fn punctuality(&self, user_id: Uuid) -> ServiceResult<PunctualitySummary> {
        let user = self
            .db
            .find_user(user_id)?
            .ok_or_else(|| ServiceError::not_found("user", user_id))?;
        Ok(PunctualitySummary {
            score: user.punctuality_score,
            schedule_count: user.schedule_count_after_reset,
            lateness_count: user.lateness_count_after_reset,
        })
    }

    pub fn lateness_history(&self, user_id: Uuid) -> ServiceResult<Vec<LatenessRecord>> {
        self.db.lateness_history(user_id)
    }
}
