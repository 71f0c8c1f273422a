//! HTTP handlers for the tether server.
//!
//! Every registered path is served by one upgrade handler that matches the
//! request path exactly against the server's path registry.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tether_transport::{UpgradedConnection, CLIENT_ID_HEADER};
use tracing::{debug, error, warn};

use crate::metrics;
use crate::server::Server;

/// Health endpoint path; cannot be registered as a room path.
pub const HEALTH_PATH: &str = "/health";

/// Build the router serving `server`.
pub fn router(server: Server) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health_handler))
        .fallback(upgrade_handler)
        .with_state(server)
}

/// Health check handler.
async fn health_handler(State(server): State<Server>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": if server.is_stopped() { "stopping" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "rooms": server.rooms().len(),
        "sockets": server.socket_count(),
    }))
}

/// Upgrade handler for every registered path.
async fn upgrade_handler(
    State(server): State<Server>,
    uri: Uri,
    headers: HeaderMap,
    remote: Option<ConnectInfo<SocketAddr>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let path = uri.path().to_string();

    if server.is_stopped() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    if !server.has_path(&path) {
        metrics::record_rejection("unknown_path");
        return StatusCode::NOT_FOUND.into_response();
    }

    let client_id = match headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        Some(id) => id.to_string(),
        None => {
            debug!(path = %path, "Upgrade without client id rejected");
            metrics::record_rejection("missing_client_id");
            return (StatusCode::BAD_REQUEST, "missing client id header").into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(path = %path, error = %rejection, "Invalid upgrade request");
            metrics::record_rejection("not_websocket");
            return rejection.into_response();
        }
    };

    let Some(id) = server.next_connection_id(&client_id) else {
        error!(path = %path, client = %client_id, "No free connection id");
        metrics::record_error("connection_id");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let remote_addr = remote.map(|ConnectInfo(addr)| addr.to_string());
    ws.max_message_size(server.max_message_size())
        .on_failed_upgrade(|e| {
            warn!(error = %e, "WebSocket upgrade failed");
            metrics::record_error("upgrade");
        })
        .on_upgrade(move |socket| async move {
            let conn = Arc::new(UpgradedConnection::new(socket, remote_addr));
            server.add_socket(&path, id, conn).await;
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tether_core::RoomConfig;
    use tower::ServiceExt;

    use crate::server::ServerOptions;

    async fn status(server: &Server, request: Request<Body>) -> StatusCode {
        server.router().oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_health() {
        let server = Server::new(ServerOptions::default(), None);
        let request = Request::get(HEALTH_PATH).body(Body::empty()).unwrap();
        assert_eq!(status(&server, request).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rejections_before_upgrade() {
        let server = Server::new(ServerOptions::default(), None);
        server.register_path("/chat", RoomConfig::default()).unwrap();

        let request = Request::get("/other").body(Body::empty()).unwrap();
        assert_eq!(status(&server, request).await, StatusCode::NOT_FOUND);

        let request = Request::get("/chat").body(Body::empty()).unwrap();
        assert_eq!(status(&server, request).await, StatusCode::BAD_REQUEST);

        let request = Request::get("/chat")
            .header(CLIENT_ID_HEADER, "  ")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(&server, request).await, StatusCode::BAD_REQUEST);
        assert_eq!(server.socket_count(), 0);
    }
}
