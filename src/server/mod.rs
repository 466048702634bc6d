//! HTTP front door: start instances and poll their status.
//!
//! ## Routes
//!
//! - `GET|POST /orchestrations/start` - start an instance, `202` with management links
//! - `GET /orchestrations/:id` - status and, once completed, the output
//! - `POST /orchestrations/:id/terminate` - request termination
//! - `GET /health`

mod error;
mod routes;

pub use error::{ApiError, ApiErrorBody, ApiResult};
pub use routes::{StartResponse, StatusResponse};

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::client::Client;
use crate::orchestrations::ORCHESTRATION_NAME;

/// Shared state of the HTTP handlers.
pub struct AppState {
    pub client: Client,
    /// Orchestration started by the start endpoint.
    pub orchestration: String,
}

impl AppState {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            orchestration: ORCHESTRATION_NAME.to_string(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/orchestrations/start", get(routes::start).post(routes::start))
        .route("/orchestrations/:id", get(routes::status))
        .route("/orchestrations/:id/terminate", post(routes::terminate))
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `listener` until the server fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(target: "durable_fanout::server", %addr, "Listening");
    }
    axum::serve(listener, router(state)).await
}
