//! HTTP API for ontime-server
//!
//! Called by the gateway that authenticates users. The gateway proves itself
//! with a bearer service token and names the user in `X-User-Id`.

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, header, request::Parts},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::error::ServiceError;
use crate::models::{
    LatenessRecord, PreparationStep, PunctualitySummary, Schedule, ScheduleInput,
};
use crate::service::{FinishOutcome, ScheduleService};

const USER_ID_HEADER: &str = "x-user-id";

/// Application state shared across handlers
pub struct AppState {
    pub service: ScheduleService,
    pub config: Config,
}

impl AppState {
    pub fn new(service: ScheduleService, config: Config) -> Arc<Self> {
        Arc::new(Self { service, config })
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/schedules", post(add_schedule))
        .route(
            "/api/v1/schedules/{id}",
            put(modify_schedule).delete(delete_schedule),
        )
        .route(
            "/api/v1/schedules/{id}/preparations",
            get(schedule_preparations).put(update_schedule_preparations),
        )
        .route("/api/v1/schedules/{id}/finish", put(finish_schedule))
        .route(
            "/api/v1/users/me/preparations",
            get(user_preparations)
                .post(set_first_user_preparations)
                .put(update_user_preparations),
        )
        .route("/api/v1/users/me/settings", put(update_settings))
        .route("/api/v1/users/me/punctuality", get(punctuality))
        .route("/api/v1/users/me/punctuality/reset", put(reset_punctuality))
        .route("/api/v1/users/me/lateness-history", get(lateness_history))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint (no auth required)
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "ontime-server",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Auth middleware - validates the gateway's Bearer token
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    // Skip auth for health check
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(token) = token else {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "Missing or invalid Authorization header",
        );
    };

    if !state.config.validate_token(token) {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid API token");
    }

    next.run(request).await
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// The user the gateway is acting for
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| Uuid::parse_str(h).ok())
            .map(AuthUser)
            .ok_or_else(|| {
                error_response(StatusCode::UNAUTHORIZED, "Missing or invalid X-User-Id header")
            })
    }
}

#[derive(Debug, Deserialize)]
struct FinishRequest {
    lateness_minutes: i32,
}

#[derive(Debug, Deserialize)]
struct SettingsRequest {
    #[serde(default)]
    push_token: Option<String>,
    notifications_enabled: bool,
}

async fn add_schedule(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(input): Json<ScheduleInput>,
) -> Result<(StatusCode, Json<Schedule>), ApiError> {
    let schedule = state.service.add_schedule(user_id, input)?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

async fn modify_schedule(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
    Json(input): Json<ScheduleInput>,
) -> Result<Json<Schedule>, ApiError> {
    Ok(Json(state.service.modify_schedule(user_id, id, input)?))
}

async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_schedule(user_id, id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn schedule_preparations(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<PreparationStep>>, ApiError> {
    Ok(Json(state.service.preparations_for(user_id, id)?))
}

async fn update_schedule_preparations(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
    Json(steps): Json<Vec<PreparationStep>>,
) -> Result<Json<Vec<PreparationStep>>, ApiError> {
    Ok(Json(
        state
            .service
            .update_schedule_preparations(user_id, id, &steps)?,
    ))
}

async fn finish_schedule(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
    Json(request): Json<FinishRequest>,
) -> Result<Json<FinishOutcome>, ApiError> {
    Ok(Json(state.service.finish_schedule(
        user_id,
        id,
        request.lateness_minutes,
    )?))
}

async fn user_preparations(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<PreparationStep>>, ApiError> {
    Ok(Json(state.service.user_preparations(user_id)?))
}

async fn set_first_user_preparations(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(steps): Json<Vec<PreparationStep>>,
) -> Result<(StatusCode, Json<Vec<PreparationStep>>), ApiError> {
    let chain = state.service.set_first_user_preparations(user_id, &steps)?;
    Ok((StatusCode::CREATED, Json(chain)))
}

async fn update_user_preparations(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(steps): Json<Vec<PreparationStep>>,
) -> Result<Json<Vec<PreparationStep>>, ApiError> {
    Ok(Json(state.service.update_user_preparations(user_id, &steps)?))
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<SettingsRequest>,
) -> Result<StatusCode, ApiError> {
    state.service.update_user_settings(
        user_id,
        request.push_token.as_deref(),
        request.notifications_enabled,
    )?;
    Ok(StatusCode::NO_CONTENT)
}

async fn punctuality(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<PunctualitySummary>, ApiError> {
    Ok(Json(state.service.punctuality(user_id)?))
}

async fn reset_punctuality(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<StatusCode, ApiError> {
    state.service.reset_punctuality(user_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn lateness_history(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<LatenessRecord>>, ApiError> {
    Ok(Json(state.service.lateness_history(user_id)?))
}

/// API error type
#[derive(Debug)]
pub struct ApiError(ServiceError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::NotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::Unauthorized(_) => StatusCode::FORBIDDEN,
            ServiceError::InvalidChain(_) | ServiceError::InvalidLateness(_) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::AlreadyExists(_) => StatusCode::CONFLICT,
            ServiceError::Database(_) | ServiceError::Internal(_) => {
                tracing::error!(error = %self.0, "API error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        error_response(status, &self.0.to_string())
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}
