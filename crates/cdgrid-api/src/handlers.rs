//! HTTP handlers.
//!
//! Domain failures answer 200 with `{"status": "error", "error": ...}` so
//! callers branch on the body, and so does a body that does not parse.
//! Store failures answer 500 with the same shape.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

use cdgrid_coordinator::{CoordinatorError, default_windows, parse_windows};
use cdgrid_state::AppRegistration;

use crate::ApiState;

#[derive(Serialize)]
struct ErrorBody<'a> {
    status: &'static str,
    error: &'a str,
}

pub(crate) fn error_body(code: StatusCode, message: &str) -> Response {
    (
        code,
        Json(ErrorBody {
            status: "error",
            error: message,
        }),
    )
        .into_response()
}

fn error_response(err: &CoordinatorError) -> Response {
    if err.is_store_failure() {
        error!(error = %err, "request failed on store");
        error_body(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
    } else {
        error_body(StatusCode::OK, &err.to_string())
    }
}

fn malformed(rejection: &JsonRejection) -> Response {
    let message = rejection.body_text();
    warn!(error = %message, "malformed request body");
    error_body(StatusCode::OK, &message)
}

fn ok(fields: serde_json::Value) -> Response {
    let mut body = json!({ "status": "ok" });
    if let (Some(body), serde_json::Value::Object(fields)) = (body.as_object_mut(), fields) {
        body.extend(fields);
    }
    Json(body).into_response()
}

// ── Info ───────────────────────────────────────────────────────

/// GET /
pub async fn root() -> impl IntoResponse {
    Json(json!({
        "app": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Jobs ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub id: String,
    pub secret: String,
}

/// POST /deploy
pub async fn deploy(
    State(state): State<ApiState>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(req) => req,
        Err(rejection) => return malformed(&rejection),
    };
    match state.dispatcher.deploy(&req.id, &req.secret) {
        Ok(view) => Json(view).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct JobStatusRequest {
    pub id: String,
    pub secret: String,
    pub job_id: String,
}

/// POST /job-status
pub async fn job_status(
    State(state): State<ApiState>,
    payload: Result<Json<JobStatusRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(req) => req,
        Err(rejection) => return malformed(&rejection),
    };
    match state.dispatcher.job_status(&req.id, &req.secret, &req.job_id) {
        Ok(view) => Json(view).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /clear-jobs
pub async fn clear_jobs(State(state): State<ApiState>) -> Response {
    match state.store.clear_jobs() {
        Ok(cleared) => ok(json!({ "cleared": cleared })),
        Err(e) => error_response(&CoordinatorError::from(e)),
    }
}

// ── Registry ───────────────────────────────────────────────────

/// Registration as listed back to operators. Secrets never leave the store.
#[derive(Debug, Serialize)]
pub struct RegistrationSummary {
    pub id: String,
    pub target: String,
}

/// POST /register-apps
pub async fn register_apps(
    State(state): State<ApiState>,
    payload: Result<Json<Vec<AppRegistration>>, JsonRejection>,
) -> Response {
    let Json(apps) = match payload {
        Ok(apps) => apps,
        Err(rejection) => return malformed(&rejection),
    };
    match state.store.replace_apps(&apps) {
        Ok(()) => ok(json!({})),
        Err(e) => error_response(&CoordinatorError::from(e)),
    }
}

/// GET /available-apps
pub async fn available_apps(State(state): State<ApiState>) -> Response {
    match state.store.list_apps() {
        Ok(apps) => {
            let registrations: Vec<RegistrationSummary> = apps
                .into_iter()
                .map(|app| RegistrationSummary {
                    id: app.id,
                    target: app.target,
                })
                .collect();
            ok(json!({ "registrations": registrations }))
        }
        Err(e) => error_response(&CoordinatorError::from(e)),
    }
}

// ── Load ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LoadQuery {
    pub windows: Option<String>,
}

/// GET /load?windows=name:seconds,...
pub async fn load(State(state): State<ApiState>, Query(query): Query<LoadQuery>) -> Response {
    let windows = match query.windows.as_deref() {
        Some(raw) => match parse_windows(raw) {
            Ok(windows) => windows,
            Err(e) => return error_response(&e),
        },
        None => default_windows(),
    };
    match state.reporter.report(&windows) {
        Ok(load) => ok(json!({ "load": load })),
        Err(e) => error_response(&e),
    }
}
