//! Error type shared by the scheduling core

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by schedule, preparation and notification operations.
///
/// Push delivery failures never show up here: the dispatcher logs and
/// swallows them.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("schedule {0} belongs to another user")]
    Unauthorized(Uuid),

    #[error("invalid preparation chain: {0}")]
    InvalidChain(String),

    #[error("lateness {0} cannot finish a schedule")]
    InvalidLateness(i32),

    #[error("{0} already exists")]
    AlreadyExists(&'static str),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
