//! HTTP endpoint handlers for the proxy.
//!
//! This module provides handlers for all HTTP endpoints:
//! - `/carelink`: full snapshot, glucose values in mmol/L
//! - `/carelink/nohistory`: patient document without history sequences
//! - `/`: HTML status page
//!
//! Paths are matched after trimming leading and trailing slashes, so
//! `/carelink/` and `carelink` address the same endpoint. Every response
//! allows any origin.

pub mod carelink;
pub mod status;

use axum::{
    extract::State,
    http::{header, HeaderValue, Method, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    Router,
};
use tracing::debug;

use crate::state::SharedState;

// Re-export handlers
pub use carelink::{carelink_handler, nohistory_handler};
pub use status::status_handler;

/// Base path of the data endpoints.
pub const API_PATH: &str = "carelink";
/// Sub-path of the reduced data endpoint.
pub const NOHISTORY_PATH: &str = "carelink/nohistory";

/// Builds the proxy router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(middleware::map_response(allow_any_origin))
        .with_state(state)
}

/// Routes a request by its slash-trimmed target. The query string is part of
/// the target, so `/carelink?x=1` matches no endpoint.
async fn dispatch(State(state): State<SharedState>, method: Method, uri: Uri) -> Response {
    let target = uri.path_and_query().map_or("/", |pq| pq.as_str());

    if method != Method::GET {
        debug!("Rejecting {} {}", method, target);
        return empty_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    if target == "/" {
        return status_handler(state).await;
    }

    match target.trim_matches('/') {
        API_PATH => carelink_handler(state).await.into_response(),
        NOHISTORY_PATH => nohistory_handler(state).await.into_response(),
        other => {
            debug!("No endpoint for /{}", other);
            empty_response(StatusCode::NOT_FOUND)
        }
    }
}

fn empty_response(status: StatusCode) -> Response {
    (status, [(header::CONTENT_TYPE, "text/html")], "").into_response()
}

async fn allow_any_origin(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}
