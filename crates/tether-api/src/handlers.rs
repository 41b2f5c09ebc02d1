//! REST API handlers.
//!
//! Each handler delegates to one `Broker` operation and returns the
//! `{success, data, error}` JSON envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tether_broker::BrokerError;
use tracing::error;

use crate::ApiState;
use crate::auth::RequestUser;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// Status code for a broker failure.
pub fn status_for(err: &BrokerError) -> StatusCode {
    match err {
        BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
        BrokerError::Forbidden(_) => StatusCode::FORBIDDEN,
        BrokerError::Conflict(_) => StatusCode::CONFLICT,
        BrokerError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
        BrokerError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        BrokerError::Remote(_) | BrokerError::Machine(_) => StatusCode::BAD_GATEWAY,
        BrokerError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn broker_error(err: BrokerError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, "broker operation failed");
    }
    error_response(&err.to_string(), status).into_response()
}

fn respond<T: serde::Serialize>(result: Result<T, BrokerError>, status: StatusCode) -> Response {
    match result {
        Ok(data) => (status, ApiResponse::ok(data)).into_response(),
        Err(e) => broker_error(e),
    }
}

// ── Services ───────────────────────────────────────────────────

/// POST /services
pub async fn create_service(
    State(state): State<ApiState>,
    RequestUser(user): RequestUser,
    manifest: String,
) -> Response {
    respond(state.broker.create_service(&manifest, &user), StatusCode::CREATED)
}

/// DELETE /services/{service}
pub async fn delete_service(
    State(state): State<ApiState>,
    RequestUser(user): RequestUser,
    Path(name): Path<String>,
) -> Response {
    respond(
        state.broker.delete_service(&name, &user).map(|()| "deleted"),
        StatusCode::OK,
    )
}

/// PUT /services/{service}/{team}
pub async fn grant_service_access(
    State(state): State<ApiState>,
    RequestUser(user): RequestUser,
    Path((service, team)): Path<(String, String)>,
) -> Response {
    respond(
        state
            .broker
            .grant_access_to_team(&service, &team, &user)
            .map(|()| "granted"),
        StatusCode::OK,
    )
}

/// DELETE /services/{service}/{team}
pub async fn revoke_service_access(
    State(state): State<ApiState>,
    RequestUser(user): RequestUser,
    Path((service, team)): Path<(String, String)>,
) -> Response {
    respond(
        state
            .broker
            .revoke_access_from_team(&service, &team, &user)
            .map(|()| "revoked"),
        StatusCode::OK,
    )
}

// ── Instances ──────────────────────────────────────────────────

/// GET /services/instances
pub async fn list_services(State(state): State<ApiState>, RequestUser(user): RequestUser) -> Response {
    respond(state.broker.list_services(&user), StatusCode::OK)
}

/// Create-instance request body.
#[derive(serde::Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub service_name: String,
}

/// POST /services/instances
pub async fn create_instance(
    State(state): State<ApiState>,
    RequestUser(user): RequestUser,
    Json(req): Json<CreateInstanceRequest>,
) -> Response {
    respond(
        state
            .broker
            .create_instance(&req.name, &req.service_name, &user)
            .await,
        StatusCode::CREATED,
    )
}

/// DELETE /services/instances/{instance}
pub async fn delete_instance(
    State(state): State<ApiState>,
    RequestUser(user): RequestUser,
    Path(name): Path<String>,
) -> Response {
    respond(
        state.broker.delete_instance(&name, &user).await.map(|()| "deleted"),
        StatusCode::OK,
    )
}

// ── Binding ────────────────────────────────────────────────────

/// PUT /services/instances/{instance}/{app}
///
/// Only variable names are echoed back; values are credentials.
pub async fn bind(
    State(state): State<ApiState>,
    RequestUser(user): RequestUser,
    Path((instance, app)): Path<(String, String)>,
) -> Response {
    let result = state.broker.bind(&instance, &app, &user).await.map(|vars| {
        let names: Vec<String> = vars.into_iter().map(|var| var.name).collect();
        json!({ "instance": instance, "app": app, "env": names })
    });
    respond(result, StatusCode::OK)
}

/// DELETE /services/instances/{instance}/{app}
pub async fn unbind(
    State(state): State<ApiState>,
    RequestUser(user): RequestUser,
    Path((instance, app)): Path<(String, String)>,
) -> Response {
    let result = state
        .broker
        .unbind(&instance, &app, &user)
        .await
        .map(|removed| json!({ "instance": instance, "app": app, "removed": removed }));
    respond(result, StatusCode::OK)
}

/// PUT /services/instances/{instance}/teams/{team}
pub async fn grant_instance_access(
    State(state): State<ApiState>,
    RequestUser(user): RequestUser,
    Path((instance, team)): Path<(String, String)>,
) -> Response {
    respond(
        state
            .broker
            .grant_instance_access(&instance, &team, &user)
            .map(|()| "granted"),
        StatusCode::OK,
    )
}

/// DELETE /services/instances/{instance}/teams/{team}
pub async fn revoke_instance_access(
    State(state): State<ApiState>,
    RequestUser(user): RequestUser,
    Path((instance, team)): Path<(String, String)>,
) -> Response {
    respond(
        state
            .broker
            .revoke_instance_access(&instance, &team, &user)
            .map(|()| "revoked"),
        StatusCode::OK,
    )
}
