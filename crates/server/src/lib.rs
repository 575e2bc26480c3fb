// crates/server/src/lib.rs
//! Angel HTTP server: SSE streaming dispatcher and REST surface over the
//! storage core.

pub mod error;
pub mod provider;
pub mod registry;
pub mod routes;
pub mod state;
pub mod stream;

pub use error::{ApiError, ApiResult};
pub use provider::{ModelProvider, ModelRequest, ProviderEvent};
pub use registry::{ActiveCall, StreamRegistry};
pub use state::AppState;
pub use stream::{build_initial_state, start_model_call};

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Assemble the application router with all `/api` routes and middleware.
pub fn create_app(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .merge(routes::health::router())
        .merge(routes::workspaces::router())
        .merge(routes::sessions::router())
        .merge(routes::search::router());

    Router::new()
        .nest("/api", api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
