// HTTP request handlers
use crate::application::orchestrator::{ViewSnapshot, ViewStatus};
use crate::domain::error::TelemetryError;
use crate::domain::export::{default_columns, records_to_csv_rows, rows_to_csv};
use crate::domain::telemetry::ViewIdentity;
use crate::infrastructure::http_response::{accepts_brotli, csv_response, json_response};
use crate::presentation::app_state::AppState;
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Response, StatusCode, header},
    response::IntoResponse,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_stream::wrappers::WatchStream;

#[derive(Serialize)]
pub struct ViewSummary {
    pub name: String,
    pub status: ViewStatus,
    pub last_updated_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct IdentityUpdate {
    pub entity_id: String,
    pub token: String,
}

#[derive(Serialize)]
pub struct IdentityChanged {
    pub changed: usize,
}

fn error_status(e: &TelemetryError) -> StatusCode {
    match e {
        TelemetryError::UnknownView(_) => StatusCode::NOT_FOUND,
        TelemetryError::InvalidRange(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn into_response(result: Result<Response<Body>, StatusCode>) -> Response<Body> {
    match result {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

/// List configured views with their current status
pub async fn list_views(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let summaries: Vec<ViewSummary> = state
        .views
        .iter()
        .map(|view| {
            let snapshot = view.snapshot();
            ViewSummary {
                name: snapshot.view,
                status: snapshot.status,
                last_updated_at: snapshot.last_updated_at,
            }
        })
        .collect();

    into_response(json_response(&summaries))
}

/// Current records and status of one view
pub async fn get_view(
    Path(name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.views.get(&name) {
        Ok(view) => into_response(json_response(&view.snapshot())),
        Err(e) => error_status(&e).into_response(),
    }
}

/// Newline-delimited JSON stream of snapshots, starting with the current one
pub async fn stream_view(
    Path(name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let view = match state.views.get(&name) {
        Ok(view) => view,
        Err(e) => return error_status(&e).into_response(),
    };

    let mut updates = WatchStream::new(view.subscribe());
    let stream = async_stream::stream! {
        while let Some(snapshot) = updates.next().await {
            match serde_json::to_vec::<ViewSnapshot>(&snapshot) {
                Ok(mut line) => {
                    line.push(b'\n');
                    yield Ok::<Bytes, std::io::Error>(Bytes::from(line));
                }
                Err(e) => {
                    tracing::error!("snapshot serialization error: {}", e);
                    break;
                }
            }
        }
    };

    into_response(
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/x-ndjson")
            .body(Body::from_stream(stream))
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR),
    )
}

/// Manual retry affordance for views in the error state
pub async fn retry_view(
    Path(name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.views.get(&name) {
        Ok(view) if view.retry() => StatusCode::ACCEPTED,
        Ok(_) => StatusCode::CONFLICT,
        Err(e) => error_status(&e),
    }
}

/// Switch entity or token for every view
pub async fn put_identity(
    State(state): State<Arc<AppState>>,
    Json(update): Json<IdentityUpdate>,
) -> impl IntoResponse {
    let identity = ViewIdentity::new(update.entity_id, update.token);
    let changed = state.views.set_identity_all(&identity);
    tracing::info!(entity = %identity.entity_id, changed, "identity updated");
    into_response(json_response(&IdentityChanged { changed }))
}

/// CSV export of a view's current records
pub async fn export_csv(
    Path(name): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let view = match state.views.get(&name) {
        Ok(view) => view,
        Err(e) => return error_status(&e).into_response(),
    };

    let records = view.snapshot().records;
    let columns = if view.settings().export_columns.is_empty() {
        default_columns(&records)
    } else {
        view.settings().export_columns.clone()
    };
    let csv = match rows_to_csv(&records_to_csv_rows(&records, &columns)) {
        Ok(csv) => csv,
        Err(e) => {
            tracing::error!(view = %name, "CSV encoding error: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    into_response(csv_response(csv, &format!("{}.csv", name), accepts_brotli(&headers)).await)
}
