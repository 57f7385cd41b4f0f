//! CareLink data endpoint handlers.
//!
//! This module provides the `/carelink` and `/carelink/nohistory` handlers
//! that return the stored snapshot as JSON with glucose values in mmol/L.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tracing::{debug, error, instrument};

use crate::state::SharedState;
use crate::transform::{essential_data, full_snapshot};

/// Content type of both data endpoints.
const JSON_CONTENT_TYPE: &str = "application/json";

/// Error type for data endpoint failures.
#[derive(Debug)]
pub enum CarelinkError {
    EncodingFailed,
}

impl IntoResponse for CarelinkError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode CareLink data",
        )
            .into_response()
    }
}

fn json_response(data: &Value) -> Result<Response, CarelinkError> {
    let body = serde_json::to_string(data).map_err(|e| {
        error!("Failed to encode CareLink data: {}", e);
        CarelinkError::EncodingFailed
    })?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, JSON_CONTENT_TYPE)],
        body,
    )
        .into_response())
}

/// Handler for `/carelink`: the full snapshot, or `null` before the first
/// successful download.
#[instrument(skip(state))]
pub async fn carelink_handler(state: SharedState) -> Result<Response, CarelinkError> {
    debug!("Processing /carelink request");

    let snapshot = state.store.get().await;
    let data = full_snapshot(snapshot.as_deref());
    json_response(&data)
}

/// Handler for `/carelink/nohistory`: the patient document without history
/// sequences, or `""` before the first successful download.
#[instrument(skip(state))]
pub async fn nohistory_handler(state: SharedState) -> Result<Response, CarelinkError> {
    debug!("Processing /carelink/nohistory request");

    let snapshot = state.store.get().await;
    let data = essential_data(snapshot.as_deref());
    json_response(&data)
}
