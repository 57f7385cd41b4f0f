//! Status page handler.
//!
//! This module provides the `/` endpoint showing the current proxy status
//! as a small HTML page.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, instrument};

use crate::state::SharedState;
use crate::store::ProxyStatus;

/// Project link shown in the page footer.
pub const PROJECT_URL: &str = env!("CARGO_PKG_REPOSITORY");

/// Renders the status page for `status`.
pub fn render_status_page(status: ProxyStatus) -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!(
        "<!DOCTYPE html><html><head><title>Carelink Proxy</title></head><body>\
         <h2>Status: {status}</h2>\
         <footer>Version {version} | <a href=\"{PROJECT_URL}\">carelink-proxy</a></footer>\
         </body></html>"
    )
}

/// Handler for the `/` endpoint.
#[instrument(skip(state))]
pub async fn status_handler(state: SharedState) -> Response {
    debug!("Processing / request");

    let status = state.store.status().await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html")],
        render_status_page(status),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_page_contains_status_and_footer() {
        let page = render_status_page(ProxyStatus::TokenRequired);
        assert!(page.starts_with("<!DOCTYPE html>"));
        assert!(page.contains("<h2>Status: Valid token required</h2>"));
        assert!(page.contains(&format!("Version {}", env!("CARGO_PKG_VERSION"))));
        assert!(page.contains(PROJECT_URL));
    }
}
