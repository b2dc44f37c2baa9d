pub mod backend;
pub mod classify;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod gpu;
pub mod logging;
pub mod orchestrator;
pub mod proxy;
pub mod routes;
pub mod state;
pub mod ws;

pub use classify::{RequestPlan, Router};
pub use config::{CategoryBinding, ModelDescriptor, RouterSettings, Settings, CLASSIFIER_ALIAS};
pub use error::{Error, Result};
pub use events::EventBus;
pub use gpu::GpuLock;
pub use orchestrator::Orchestrator;
pub use state::AppState;

use std::sync::Arc;

/// Assemble the full HTTP surface. Shared by `main` and the integration
/// tests.
pub fn app(state: Arc<AppState>) -> axum::Router {
    use axum::routing::get;
    use tower_http::cors::{Any, CorsLayer};

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    axum::Router::new()
        .route("/", get(ws::ws_handler))
        .route("/health", get(routes::health))
        .merge(routes::chat::router())
        .merge(routes::models::router())
        .merge(routes::audio::router())
        .merge(routes::admin::router())
        .fallback(routes::passthrough::v1_catch_all)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            logging::request_logger,
        ))
        .layer(cors)
        .with_state(state)
}
