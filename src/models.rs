//! Data models for schedules, preparation steps, notifications and users
//!
//! Timestamps are UTC; minute quantities are plain integers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lateness sentinel for a schedule that has not ended yet
pub const LATENESS_NOT_ENDED: i32 = -1;

/// Lateness sentinel for a schedule that ended abnormally
pub const LATENESS_ABNORMAL: i32 = -2;

/// Punctuality score of a user with no finished schedules
pub const SCORE_NO_DATA: f32 = -1.0;

/// How a schedule ended, derived from its lateness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DoneStatus {
    Late,
    Normal,
    Abnormal,
    #[default]
    NotEnded,
}

impl DoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoneStatus::Late => "late",
            DoneStatus::Normal => "normal",
            DoneStatus::Abnormal => "abnormal",
            DoneStatus::NotEnded => "not_ended",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "late" => DoneStatus::Late,
            "normal" => DoneStatus::Normal,
            "abnormal" => DoneStatus::Abnormal,
            _ => DoneStatus::NotEnded,
        }
    }
}

/// Owner of a preparation chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainOwner {
    /// Steps customized for a single schedule
    Schedule(Uuid),
    /// The user's default steps, used by schedules that were not customized
    UserDefault(Uuid),
}

impl ChainOwner {
    pub fn id(&self) -> Uuid {
        match self {
            ChainOwner::Schedule(id) | ChainOwner::UserDefault(id) => *id,
        }
    }
}

/// A single preparation step.
///
/// `next_id` points at the step that follows this one within the same
/// owner's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparationStep {
    pub id: Uuid,
    pub name: String,
    pub duration_minutes: u32,
    #[serde(default)]
    pub next_id: Option<Uuid>,
}

/// An appointment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub place: Option<String>,
    pub name: String,
    pub move_minutes: u32,
    pub scheduled_at: DateTime<Utc>,
    /// Falls back to the user's spare time when absent
    #[serde(default)]
    pub slack_minutes: Option<u32>,
    /// Whether the schedule uses its own preparation chain
    pub is_change: bool,
    pub lateness_minutes: i32,
    pub done_status: DoneStatus,
    /// Set once the schedule's completion has been folded into the user's score
    pub score_recorded: bool,
    #[serde(default)]
    pub note: Option<String>,
}

/// Fields a client supplies when creating or editing a schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleInput {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub place: Option<String>,
    pub name: String,
    pub move_minutes: u32,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub slack_minutes: Option<u32>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Persisted reminder for a schedule.
///
/// `schedule_id` is cleared when the schedule is deleted so the row stays
/// around as history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSchedule {
    pub id: i64,
    pub fire_at: DateTime<Utc>,
    pub is_sent: bool,
    pub schedule_id: Option<Uuid>,
}

/// A user as seen by the reminder core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub spare_minutes: u32,
    pub punctuality_score: f32,
    pub schedule_count_after_reset: u32,
    pub lateness_count_after_reset: u32,
    #[serde(default)]
    pub push_token: Option<String>,
}

impl User {
    pub fn new(name: impl Into<String>, spare_minutes: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            spare_minutes,
            punctuality_score: SCORE_NO_DATA,
            schedule_count_after_reset: 0,
            lateness_count_after_reset: 0,
            push_token: None,
        }
    }

    pub fn counts(&self) -> PunctualityCounts {
        PunctualityCounts {
            schedules: self.schedule_count_after_reset,
            lateness: self.lateness_count_after_reset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSetting {
    pub user_id: Uuid,
    pub notifications_enabled: bool,
}

/// Counters the punctuality score is computed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PunctualityCounts {
    pub schedules: u32,
    pub lateness: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PunctualitySummary {
    pub score: f32,
    pub schedule_count: u32,
    pub lateness_count: u32,
}

/// One finished schedule in a user's lateness history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatenessRecord {
    pub schedule_id: Uuid,
    pub name: String,
    pub scheduled_at: DateTime<Utc>,
    pub lateness_minutes: i32,
}
