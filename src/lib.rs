pub mod auth;
pub mod broadcast;
pub mod config;
pub mod creds;
pub mod liveness;
pub mod outbox;
pub mod registry;
pub mod relay;
pub mod stats;
pub mod store;

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::FromRef, http::StatusCode, response::{IntoResponse, Response}};
use sqlx::SqlitePool;

use broadcast::Broadcaster;
use registry::Registry;

/// Process-wide settings fixed at startup.
#[derive(Debug)]
pub struct Settings {
    pub broadcast_secret: String,
    pub default_room: String,
    pub started: Instant,
}

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub registry: Registry,
    pub broadcaster: Broadcaster,
    pub settings: Arc<Settings>,
}

pub type AppResult<T> = Result<T, AppError>;
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Unix seconds, the timestamp unit used throughout the durable store.
pub fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
