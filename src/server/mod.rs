//! HTTP boundary for intake.
//!
//! ```text
//! POST /intake   submit an ingestion      201 | 400 | 422
//! GET  /intake   status of cached ingestions
//! GET  /health
//! ```

mod handlers;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::intake::Intake;

/// Shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub intake: Arc<Intake>,
}

/// Build the router (useful for testing)
pub fn router(intake: Arc<Intake>) -> Router {
    Router::new()
        .route(
            "/intake",
            get(handlers::intake_status).post(handlers::submit_intake),
        )
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { intake })
}

/// Serve until the process is stopped
pub async fn serve(intake: Arc<Intake>, bind: &str) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!(%bind, "Intake server listening");

    axum::serve(listener, router(intake))
        .await
        .context("Server error")
}
