//! SQLite persistence for schedules, preparation chains, notifications and users

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::models::{
    ChainOwner, DoneStatus, LatenessRecord, NotificationSchedule, PreparationStep,
    PunctualityCounts, Schedule, User, UserSetting,
};

const SCHEDULE_COLUMNS: &str = "id, user_id, place, name, move_minutes, scheduled_at, \
     slack_minutes, is_change, lateness_minutes, done_status, score_recorded, note";

const USER_COLUMNS: &str = "id, name, spare_minutes, punctuality_score, \
     schedule_count_after_reset, lateness_count_after_reset, push_token";

/// Thread-safe database wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        Self::with_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> anyhow::Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init().context("Failed to initialize database schema")?;
        Ok(db)
    }

    fn conn(&self) -> ServiceResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ServiceError::Internal(anyhow!("database connection lock poisoned")))
    }

    /// Initialize the database schema
    fn init(&self) -> ServiceResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                id BLOB PRIMARY KEY,
                name TEXT NOT NULL,
                spare_minutes INTEGER NOT NULL DEFAULT 0,
                punctuality_score REAL NOT NULL DEFAULT -1,
                schedule_count_after_reset INTEGER NOT NULL DEFAULT 0,
                lateness_count_after_reset INTEGER NOT NULL DEFAULT 0,
                push_token TEXT
            );

            CREATE TABLE IF NOT EXISTS user_settings (
                user_id BLOB PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                notifications_enabled INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS schedules (
                id BLOB PRIMARY KEY,
                user_id BLOB NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                place TEXT,
                name TEXT NOT NULL,
                move_minutes INTEGER NOT NULL,
                scheduled_at TEXT NOT NULL,
                slack_minutes INTEGER,
                is_change INTEGER NOT NULL DEFAULT 0,
                lateness_minutes INTEGER NOT NULL DEFAULT -1,
                done_status TEXT NOT NULL DEFAULT 'not_ended',
                score_recorded INTEGER NOT NULL DEFAULT 0,
                note TEXT
            );

            -- Step ids are unique per owner; a schedule may reuse its user's default ids
            CREATE TABLE IF NOT EXISTS schedule_preparation_steps (
                schedule_id BLOB NOT NULL REFERENCES schedules(id) ON DELETE CASCADE,
                id BLOB NOT NULL,
                name TEXT NOT NULL,
                duration_minutes INTEGER NOT NULL,
                next_id BLOB,
                position INTEGER NOT NULL,
                PRIMARY KEY (schedule_id, id),
                FOREIGN KEY (schedule_id, next_id)
                    REFERENCES schedule_preparation_steps(schedule_id, id)
                    DEFERRABLE INITIALLY DEFERRED
            );

            CREATE TABLE IF NOT EXISTS user_preparation_steps (
                user_id BLOB NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                id BLOB NOT NULL,
                name TEXT NOT NULL,
                duration_minutes INTEGER NOT NULL,
                next_id BLOB,
                position INTEGER NOT NULL,
                PRIMARY KEY (user_id, id),
                FOREIGN KEY (user_id, next_id)
                    REFERENCES user_preparation_steps(user_id, id)
                    DEFERRABLE INITIALLY DEFERRED
            );

            -- schedule_id is cleared, not cascaded, so sent history survives deletes
            CREATE TABLE IF NOT EXISTS notification_schedules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                schedule_id BLOB UNIQUE REFERENCES schedules(id) ON DELETE SET NULL,
                fire_at TEXT NOT NULL,
                is_sent INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_schedules_user ON schedules(user_id);
            CREATE INDEX IF NOT EXISTS idx_schedules_time ON schedules(scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_notifications_pending ON notification_schedules(is_sent, fire_at);
            "#,
        )?;

        Ok(())
    }

    // ---- users ----

    /// Insert a user together with its notification setting
    pub fn insert_user(&self, user: &User, notifications_enabled: bool) -> ServiceResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"INSERT INTO users (id, name, spare_minutes, punctuality_score,
               schedule_count_after_reset, lateness_count_after_reset, push_token)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                user.id,
                &user.name,
                user.spare_minutes,
                user.punctuality_score as f64,
                user.schedule_count_after_reset,
                user.lateness_count_after_reset,
                &user.push_token,
            ],
        )?;
        tx.execute(
            "INSERT INTO user_settings (user_id, notifications_enabled) VALUES (?1, ?2)",
            params![user.id, notifications_enabled],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn find_user(&self, id: Uuid) -> ServiceResult<Option<User>> {
        let conn = self.conn()?;
        Ok(query_user(&conn, id)?)
    }

    pub fn find_user_setting(&self, user_id: Uuid) -> ServiceResult<Option<UserSetting>> {
        let conn = self.conn()?;
        let setting = conn
            .query_row(
                "SELECT user_id, notifications_enabled FROM user_settings WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(UserSetting {
                        user_id: row.get(0)?,
                        notifications_enabled: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(setting)
    }

    /// Update the push token and notification preference of a user
    pub fn update_user_settings(
        &self,
        user_id: Uuid,
        push_token: Option<&str>,
        notifications_enabled: bool,
    ) -> ServiceResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE users SET push_token = ?2 WHERE id = ?1",
            params![user_id, push_token],
        )?;
        if updated == 0 {
            return Err(ServiceError::not_found("user", user_id));
        }
        tx.execute(
            r#"INSERT INTO user_settings (user_id, notifications_enabled) VALUES (?1, ?2)
               ON CONFLICT(user_id) DO UPDATE SET notifications_enabled = excluded.notifications_enabled"#,
            params![user_id, notifications_enabled],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Fold one finished schedule into its user's punctuality score.
    ///
    /// Runs in one transaction. Returns `None` without touching the user when
    /// the schedule already contributed.
    pub fn apply_score_update<F>(
        &self,
        user_id: Uuid,
        schedule_id: Uuid,
        update: F,
    ) -> ServiceResult<Option<f32>>
    where
        F: FnOnce(f32, PunctualityCounts) -> (f32, PunctualityCounts),
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let score = score_schedule(&tx, user_id, schedule_id, update)?;
        tx.commit()?;
        Ok(score)
    }

    /// Store a schedule's lateness and status and fold it into the score,
    /// all in one transaction
    pub fn complete_schedule<F>(
        &self,
        user_id: Uuid,
        schedule_id: Uuid,
        lateness_minutes: i32,
        status: DoneStatus,
        update: F,
    ) -> ServiceResult<Option<f32>>
    where
        F: FnOnce(f32, PunctualityCounts) -> (f32, PunctualityCounts),
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE schedules SET lateness_minutes = ?2, done_status = ?3 WHERE id = ?1",
            params![schedule_id, lateness_minutes, status.as_str()],
        )?;
        if updated == 0 {
            return Err(ServiceError::not_found("schedule", schedule_id));
        }
        let score = score_schedule(&tx, user_id, schedule_id, update)?;
        tx.commit()?;
        Ok(score)
    }

    pub fn reset_punctuality(&self, user_id: Uuid) -> ServiceResult<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            r#"UPDATE users SET punctuality_score = -1, schedule_count_after_reset = 0,
               lateness_count_after_reset = 0 WHERE id = ?1"#,
            params![user_id],
        )?;
        if updated == 0 {
            return Err(ServiceError::not_found("user", user_id));
        }
        Ok(())
    }

    // ---- schedules ----

    /// Insert a schedule and its notification record atomically
    pub fn insert_schedule_with_notification(
        &self,
        schedule: &Schedule,
        fire_at: DateTime<Utc>,
    ) -> ServiceResult<NotificationSchedule> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO schedules ({SCHEDULE_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                schedule.id,
                schedule.user_id,
                &schedule.place,
                &schedule.name,
                schedule.move_minutes,
                schedule.scheduled_at,
                schedule.slack_minutes,
                schedule.is_change,
                schedule.lateness_minutes,
                schedule.done_status.as_str(),
                schedule.score_recorded,
                &schedule.note,
            ],
        )?;
        tx.execute(
            "INSERT INTO notification_schedules (schedule_id, fire_at, is_sent) VALUES (?1, ?2, 0)",
            params![schedule.id, fire_at],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(NotificationSchedule {
            id,
            fire_at,
            is_sent: false,
            schedule_id: Some(schedule.id),
        })
    }

    pub fn find_schedule(&self, id: Uuid) -> ServiceResult<Option<Schedule>> {
        let conn = self.conn()?;
        let schedule = conn
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
                params![id],
                schedule_from_row,
            )
            .optional()?;
        Ok(schedule)
    }

    /// Update the user-editable fields of a schedule
    pub fn update_schedule(&self, schedule: &Schedule) -> ServiceResult<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            r#"UPDATE schedules SET place = ?2, name = ?3, move_minutes = ?4, scheduled_at = ?5,
               slack_minutes = ?6, note = ?7 WHERE id = ?1"#,
            params![
                schedule.id,
                &schedule.place,
                &schedule.name,
                schedule.move_minutes,
                schedule.scheduled_at,
                schedule.slack_minutes,
                &schedule.note,
            ],
        )?;
        if updated == 0 {
            return Err(ServiceError::not_found("schedule", schedule.id));
        }
        Ok(())
    }

    /// Persist lateness and the status derived from it in one statement
    pub fn record_lateness(
        &self,
        schedule_id: Uuid,
        lateness_minutes: i32,
        status: DoneStatus,
    ) -> ServiceResult<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE schedules SET lateness_minutes = ?2, done_status = ?3 WHERE id = ?1",
            params![schedule_id, lateness_minutes, status.as_str()],
        )?;
        if updated == 0 {
            return Err(ServiceError::not_found("schedule", schedule_id));
        }
        Ok(())
    }

    /// Delete a schedule, keeping its notification row disconnected
    pub fn delete_schedule(&self, id: Uuid) -> ServiceResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE notification_schedules SET schedule_id = NULL WHERE schedule_id = ?1",
            params![id],
        )?;
        let deleted = tx.execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(ServiceError::not_found("schedule", id));
        }
        tx.commit()?;
        Ok(())
    }

    /// Schedules whose appointment falls within `[start, end]`
    pub fn schedules_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ServiceResult<Vec<Schedule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules \
             WHERE scheduled_at >= ?1 AND scheduled_at <= ?2 ORDER BY scheduled_at"
        ))?;
        let rows = stmt.query_map(params![start, end], schedule_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Unfinished schedules of a user that still follow the default chain
    pub fn schedules_on_default_chain(&self, user_id: Uuid) -> ServiceResult<Vec<Schedule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules \
             WHERE user_id = ?1 AND is_change = 0 AND lateness_minutes = -1"
        ))?;
        let rows = stmt.query_map(params![user_id], schedule_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Finished schedules of a user, newest first
    pub fn lateness_history(&self, user_id: Uuid) -> ServiceResult<Vec<LatenessRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, name, scheduled_at, lateness_minutes FROM schedules
               WHERE user_id = ?1 AND lateness_minutes <> -1
               ORDER BY scheduled_at DESC"#,
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(LatenessRecord {
                schedule_id: row.get(0)?,
                name: row.get(1)?,
                scheduled_at: row.get(2)?,
                lateness_minutes: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ---- preparation chains ----

    /// Store a new chain for `owner`.
    ///
    /// Rows are inserted first and linked in a second pass so `next_id` may
    /// point forward in `steps`. Storing a schedule chain also flags the
    /// schedule as customized.
    pub fn insert_chain(&self, owner: ChainOwner, steps: &[PreparationStep]) -> ServiceResult<()> {
        self.write_chain(owner, steps, false)
    }

    /// Delete every step of `owner` and store `steps`, all or nothing
    pub fn replace_chain(&self, owner: ChainOwner, steps: &[PreparationStep]) -> ServiceResult<()> {
        self.write_chain(owner, steps, true)
    }

    fn write_chain(
        &self,
        owner: ChainOwner,
        steps: &[PreparationStep],
        delete_existing: bool,
    ) -> ServiceResult<()> {
        let (table, owner_column) = step_table(owner);
        let owner_id = owner.id();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if delete_existing {
            tx.execute(
                &format!("DELETE FROM {table} WHERE {owner_column} = ?1"),
                params![owner_id],
            )?;
        }

        for (position, step) in steps.iter().enumerate() {
            tx.execute(
                &format!(
                    "INSERT INTO {table} ({owner_column}, id, name, duration_minutes, next_id, position) \
                     VALUES (?1, ?2, ?3, ?4, NULL, ?5)"
                ),
                params![
                    owner_id,
                    step.id,
                    &step.name,
                    step.duration_minutes,
                    position as i64,
                ],
            )?;
        }

        for step in steps {
            if let Some(next_id) = step.next_id {
                tx.execute(
                    &format!("UPDATE {table} SET next_id = ?3 WHERE {owner_column} = ?1 AND id = ?2"),
                    params![owner_id, step.id, next_id],
                )?;
            }
        }

        if let ChainOwner::Schedule(id) = owner {
            let updated = tx.execute(
                "UPDATE schedules SET is_change = 1 WHERE id = ?1",
                params![id],
            )?;
            if updated == 0 {
                return Err(ServiceError::not_found("schedule", id));
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Raw steps of `owner` in the order they were stored
    pub fn load_chain(&self, owner: ChainOwner) -> ServiceResult<Vec<PreparationStep>> {
        let (table, owner_column) = step_table(owner);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, name, duration_minutes, next_id FROM {table} \
             WHERE {owner_column} = ?1 ORDER BY position"
        ))?;
        let rows = stmt.query_map(params![owner.id()], |row| {
            Ok(PreparationStep {
                id: row.get(0)?,
                name: row.get(1)?,
                duration_minutes: row.get(2)?,
                next_id: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn has_chain(&self, owner: ChainOwner) -> ServiceResult<bool> {
        let (table, owner_column) = step_table(owner);
        let conn = self.conn()?;
        Ok(conn.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE {owner_column} = ?1)"),
            params![owner.id()],
            |row| row.get(0),
        )?)
    }

    // ---- notifications ----

    pub fn find_notification(&self, id: i64) -> ServiceResult<Option<NotificationSchedule>> {
        let conn = self.conn()?;
        let notification = conn
            .query_row(
                "SELECT id, fire_at, is_sent, schedule_id FROM notification_schedules WHERE id = ?1",
                params![id],
                notification_from_row,
            )
            .optional()?;
        Ok(notification)
    }

    pub fn find_notification_by_schedule(
        &self,
        schedule_id: Uuid,
    ) -> ServiceResult<Option<NotificationSchedule>> {
        let conn = self.conn()?;
        let notification = conn
            .query_row(
                "SELECT id, fire_at, is_sent, schedule_id FROM notification_schedules \
                 WHERE schedule_id = ?1",
                params![schedule_id],
                notification_from_row,
            )
            .optional()?;
        Ok(notification)
    }

    /// Move a notification to a new instant and mark it unsent
    pub fn reschedule_notification(
        &self,
        id: i64,
        fire_at: DateTime<Utc>,
    ) -> ServiceResult<NotificationSchedule> {
        let conn = self.conn()?;
        let notification = conn
            .query_row(
                r#"UPDATE notification_schedules SET fire_at = ?2, is_sent = 0 WHERE id = ?1
                   RETURNING id, fire_at, is_sent, schedule_id"#,
                params![id, fire_at],
                notification_from_row,
            )
            .optional()?;
        notification.ok_or_else(|| ServiceError::not_found("notification", id))
    }

    /// Flip `is_sent` from false to true.
    ///
    /// Returns false when the row was already sent, so only one caller can
    /// win the claim.
    pub fn claim_notification(&self, id: i64) -> ServiceResult<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE notification_schedules SET is_sent = 1 WHERE id = ?1 AND is_sent = 0",
            params![id],
        )?;
        Ok(updated == 1)
    }

    pub fn mark_unsent(&self, id: i64) -> ServiceResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE notification_schedules SET is_sent = 0 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Unsent notifications firing after `now` that still belong to a schedule
    pub fn pending_notifications_after(
        &self,
        now: DateTime<Utc>,
    ) -> ServiceResult<Vec<NotificationSchedule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT n.id, n.fire_at, n.is_sent, n.schedule_id
               FROM notification_schedules n
               JOIN schedules s ON s.id = n.schedule_id
               WHERE n.is_sent = 0 AND n.fire_at > ?1
               ORDER BY n.fire_at"#,
        )?;
        let rows = stmt.query_map(params![now], notification_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

/// Apply `update` to the user's score unless the schedule already counted
fn score_schedule<F>(
    tx: &Transaction<'_>,
    user_id: Uuid,
    schedule_id: Uuid,
    update: F,
) -> ServiceResult<Option<f32>>
where
    F: FnOnce(f32, PunctualityCounts) -> (f32, PunctualityCounts),
{
    let recorded: Option<bool> = tx
        .query_row(
            "SELECT score_recorded FROM schedules WHERE id = ?1",
            params![schedule_id],
            |row| row.get(0),
        )
        .optional()?;
    match recorded {
        None => return Err(ServiceError::not_found("schedule", schedule_id)),
        Some(true) => return Ok(None),
        Some(false) => {}
    }

    let user = query_user(tx, user_id)?.ok_or_else(|| ServiceError::not_found("user", user_id))?;
    let (score, counts) = update(user.punctuality_score, user.counts());

    tx.execute(
        r#"UPDATE users SET punctuality_score = ?2, schedule_count_after_reset = ?3,
           lateness_count_after_reset = ?4 WHERE id = ?1"#,
        params![user_id, score as f64, counts.schedules, counts.lateness],
    )?;
    tx.execute(
        "UPDATE schedules SET score_recorded = 1 WHERE id = ?1",
        params![schedule_id],
    )?;

    Ok(Some(score))
}

/// Step table and owner column for a chain owner
fn step_table(owner: ChainOwner) -> (&'static str, &'static str) {
    match owner {
        ChainOwner::Schedule(_) => ("schedule_preparation_steps", "schedule_id"),
        ChainOwner::UserDefault(_) => ("user_preparation_steps", "user_id"),
    }
}

fn query_user(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        params![id],
        |row| {
            Ok(User {
                id: row.get(0)?,
                name: row.get(1)?,
                spare_minutes: row.get(2)?,
                punctuality_score: row.get::<_, f64>(3)? as f32,
                schedule_count_after_reset: row.get(4)?,
                lateness_count_after_reset: row.get(5)?,
                push_token: row.get(6)?,
            })
        },
    )
    .optional()
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let status: String = row.get(9)?;
    Ok(Schedule {
        id: row.get(0)?,
        user_id: row.get(1)?,
        place: row.get(2)?,
        name: row.get(3)?,
        move_minutes: row.get(4)?,
        scheduled_at: row.get(5)?,
        slack_minutes: row.get(6)?,
        is_change: row.get(7)?,
        lateness_minutes: row.get(8)?,
        done_status: DoneStatus::parse(&status),
        score_recorded: row.get(10)?,
        note: row.get(11)?,
    })
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationSchedule> {
    Ok(NotificationSchedule {
        id: row.get(0)?,
        fire_at: row.get(1)?,
        is_sent: row.get(2)?,
        schedule_id: row.get(3)?,
    })
}
