//! # JSON/HTTP Surface
//!
//! REST API over the engine. Route map:
//!
//! | Method & path            | Semantics                              |
//! |--------------------------|----------------------------------------|
//! | `GET /`                  | landing: database listing (public)     |
//! | `GET /health`            | liveness probe (public)                |
//! | `GET /metrics`           | counters, when enabled (public)        |
//! | `POST /create`           | create database (public)               |
//! | `GET /db/:dbname`        | exists                                 |
//! | `PUT /db/:dbname`        | set                                    |
//! | `POST /db/:dbname`       | set-if-absent                          |
//! | `PATCH /db/:dbname`      | increment                              |
//! | `DELETE /db/:dbname`     | delete database                        |
//! | `POST /db/:dbname/keys`  | get value                              |
//! | `DELETE /db/:dbname/keys`| delete value                           |
//! | `POST /db/:dbname/apikey`| rotate credential                      |
//!
//! Every request passes the admission gate first; non-public routes check
//! the `X-API-Key` header when authentication is enabled.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;

use tanto_core::admission::AdmissionGate;
use tanto_core::auth::require_valid_key;
use tanto_core::error::Error;
use tanto_core::utils::valid_db_name;
use tanto_storage::Engine;

use crate::models::*;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    gate: Arc<AdmissionGate>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        let gate = Arc::new(AdmissionGate::new(engine.config().http.request_limit));
        Self { engine, gate }
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.engine.config().http.entry_size;
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/create", post(create_db))
        .route(
            "/db/:dbname",
            get(db_exists)
                .put(set_value)
                .post(set_nx_value)
                .patch(incr_value)
                .delete(delete_db),
        )
        .route("/db/:dbname/keys", post(get_value).delete(delete_value))
        .route("/db/:dbname/apikey", post(rotate_api_key))
        .layer(middleware::from_fn_with_state(state.clone(), admission))
        .layer(middleware::from_fn_with_state(state.clone(), request_deadline))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Engine error as a wire response.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidName { .. } | Error::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            Error::DatabaseNotFound { .. } => StatusCode::NOT_FOUND,
            Error::Full { .. } => StatusCode::INSUFFICIENT_STORAGE,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Error::Overload => StatusCode::TOO_MANY_REQUESTS,
            Error::Io { .. } | Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.0.error_code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Non-blocking admission check; the permit lives for the whole request.
async fn admission(State(state): State<AppState>, req: Request, next: Next) -> Response {
    match state.gate.try_enter() {
        Ok(_permit) => next.run(req).await,
        Err(e) => {
            state.engine.metrics().record_overload();
            ApiError(e).into_response()
        }
    }
}

/// Transport-level bound on request handling time.
async fn request_deadline(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let limit = Duration::from_secs(state.engine.config().http.write_timeout_secs);
    match tokio::time::timeout(limit, next.run(req)).await {
        Ok(response) => response,
        Err(_) => StatusCode::REQUEST_TIMEOUT.into_response(),
    }
}

/// Database-name validation plus the credential check on non-public routes.
fn authorize(state: &AppState, db: &str, headers: &HeaderMap) -> Result<(), ApiError> {
    if !valid_db_name(db) {
        return Err(ApiError(Error::InvalidName {
            name: db.to_string(),
        }));
    }
    if state.engine.config().auth.enabled {
        let token = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
        require_valid_key(state.engine.api_keys(), db, token).map_err(|e| {
            state.engine.metrics().record_unauthorized();
            ApiError(e)
        })?;
    }
    Ok(())
}

fn ok_response(ok: bool) -> Response {
    let status = if ok { StatusCode::OK } else { StatusCode::CONFLICT };
    (status, Json(OkResponse { ok })).into_response()
}

async fn index(State(state): State<AppState>) -> Json<LandingResponse> {
    Json(LandingResponse {
        databases: state.engine.list_dbs().into_iter().map(Into::into).collect(),
        auth_enabled: state.engine.config().auth.enabled,
    })
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AppState>) -> Response {
    if !state.engine.config().metrics.enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    state.engine.metrics().snapshot().render().into_response()
}

async fn create_db(
    State(state): State<AppState>,
    Json(req): Json<CreateDbRequest>,
) -> Result<Response, ApiError> {
    let outcome = state.engine.new_db(&req.name)?;
    let status = if outcome.existed {
        StatusCode::CONFLICT
    } else {
        StatusCode::CREATED
    };
    let body = CreateDbResponse {
        name: outcome.name,
        created: outcome.created,
        exists: outcome.existed,
        api_key: outcome.api_key.unwrap_or_default(),
    };
    Ok((status, Json(body)).into_response())
}

async fn db_exists(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ExistsResponse>, ApiError> {
    authorize(&state, &dbname, &headers)?;
    Ok(Json(ExistsResponse {
        exists: state.engine.db_exists(&dbname),
    }))
}

async fn set_value(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SetRequest>,
) -> Result<Response, ApiError> {
    authorize(&state, &dbname, &headers)?;
    req.validate()?;
    let ok = state
        .engine
        .set(&dbname, Bytes::from(req.key), Bytes::from(req.value), req.ttl)?;
    Ok(ok_response(ok))
}

async fn set_nx_value(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SetRequest>,
) -> Result<Response, ApiError> {
    authorize(&state, &dbname, &headers)?;
    req.validate()?;
    let ok = state
        .engine
        .set_nx(&dbname, Bytes::from(req.key), Bytes::from(req.value), req.ttl)?;
    Ok(ok_response(ok))
}

async fn incr_value(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SetRequest>,
) -> Result<Response, ApiError> {
    authorize(&state, &dbname, &headers)?;
    req.validate()?;
    let ok = state
        .engine
        .incr(&dbname, Bytes::from(req.key), Bytes::from(req.value))?;
    Ok(ok_response(ok))
}

async fn get_value(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
    headers: HeaderMap,
    Json(req): Json<KeyRequest>,
) -> Result<Json<ValueResponse>, ApiError> {
    authorize(&state, &dbname, &headers)?;
    req.validate()?;
    let value = state.engine.get(&dbname, req.key.as_bytes())?;
    Ok(Json(ValueResponse {
        found: value.is_some(),
        value: value
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .unwrap_or_default(),
    }))
}

async fn delete_value(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
    headers: HeaderMap,
    Json(req): Json<KeyRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    authorize(&state, &dbname, &headers)?;
    req.validate()?;
    let ok = state.engine.del(&dbname, req.key.as_bytes())?;
    Ok(Json(OkResponse { ok }))
}

async fn delete_db(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
    headers: HeaderMap,
) -> Result<Json<OkResponse>, ApiError> {
    authorize(&state, &dbname, &headers)?;
    state.engine.db_delete(&dbname)?;
    Ok(Json(OkResponse { ok: true }))
}

async fn rotate_api_key(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ApiKeyResponse>, ApiError> {
    authorize(&state, &dbname, &headers)?;
    let api_key = state.engine.create_api_key(&dbname)?;
    Ok(Json(ApiKeyResponse { api_key }))
}
