//! Operator HTTP API.
//!
//! JSON endpoints polled and driven by the intake station's browser client.

use crate::config::ApiConfig;
use crate::controller::{ControllerError, ScanController, SessionSnapshot};
use crate::notify::{Notification, NotificationBoard};
use crate::pipeline::SubmitError;
use crate::session::FormState;
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ScanController>,
    pub notifications: Arc<NotificationBoard>,
}

/// Draft edit request
#[derive(Debug, Deserialize)]
pub struct DraftRequest {
    pub product_name: String,
    pub price: String,
}

/// Successful submission
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub barcode: String,
    pub image_url: Option<String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(status: StatusCode, code: &str, error: String) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error,
            code: code.to_string(),
        }),
    )
}

impl From<ControllerError> for ApiError {
    fn from(e: ControllerError) -> Self {
        match &e {
            ControllerError::Session(_) => {
                error_response(StatusCode::CONFLICT, "INVALID_STATE", e.to_string())
            }
            ControllerError::Submit(submit) => {
                let (status, code) = match submit {
                    SubmitError::InvalidDraft(_) => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_DRAFT")
                    }
                    SubmitError::Insert {
                        duplicate: true, ..
                    } => (StatusCode::CONFLICT, "DUPLICATE_BARCODE"),
                    SubmitError::Abandoned => (StatusCode::CONFLICT, "ABANDONED"),
                    SubmitError::Compression(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "COMPRESSION_ERROR")
                    }
                    SubmitError::Upload(_) => (StatusCode::BAD_GATEWAY, "UPLOAD_ERROR"),
                    SubmitError::Insert { .. } => (StatusCode::BAD_GATEWAY, "INSERT_ERROR"),
                };
                error_response(status, code, submit.user_message())
            }
            ControllerError::Device(_) => {
                error_response(StatusCode::BAD_GATEWAY, "DEVICE_ERROR", e.to_string())
            }
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/session", get(get_session))
        .route("/api/draft", put(update_draft))
        .route("/api/submit", post(submit))
        .route("/api/reset", post(reset))
        .route("/api/notifications", get(list_notifications))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.controller.snapshot();
    Json(serde_json::json!({
        "status": "healthy",
        "service": "sscan-intake",
        "scanning": snapshot.scanning,
        "session": snapshot.status,
    }))
}

async fn get_session(State(state): State<AppState>) -> Json<SessionSnapshot> {
    Json(state.controller.snapshot())
}

#[instrument(skip(state, request))]
async fn update_draft(
    State(state): State<AppState>,
    Json(request): Json<DraftRequest>,
) -> Result<Json<FormState>, ApiError> {
    let form = state
        .controller
        .update_draft(request.product_name, request.price)
        .map_err(|e| -> ApiError {
            warn!(error = %e, "Draft edit rejected");
            e.into()
        })?;
    Ok(Json(form))
}

#[instrument(skip(state))]
async fn submit(State(state): State<AppState>) -> Result<Json<SubmitResponse>, ApiError> {
    let receipt = state.controller.submit().await?;
    Ok(Json(SubmitResponse {
        barcode: receipt.barcode,
        image_url: receipt.image_url,
    }))
}

#[instrument(skip(state))]
async fn reset(State(state): State<AppState>) -> Result<Json<SessionSnapshot>, ApiError> {
    state.controller.reset()?;
    Ok(Json(state.controller.snapshot()))
}

async fn list_notifications(State(state): State<AppState>) -> Json<Vec<Notification>> {
    Json(state.notifications.active())
}

/// Start the operator API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting operator API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
