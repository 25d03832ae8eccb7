pub mod error;
pub mod iclock;
pub mod routes;
pub mod types;

use axum::{
    routing::{any, get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the router: terminal protocol endpoints plus the operator API
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check endpoint
        .route("/health", get(routes::health_check))
        // Terminal push protocol
        .route("/iclock/cdata", get(iclock::cdata).post(iclock::cdata))
        .route(
            "/iclock/getrequest",
            get(iclock::getrequest).post(iclock::getrequest),
        )
        .route(
            "/iclock/devicecmd",
            get(iclock::devicecmd).post(iclock::devicecmd),
        )
        .route("/iclock/*rest", any(iclock::fallback))
        // Devices and their command queues
        .route("/api/devices", get(routes::list_devices))
        .route("/api/devices/:serial", get(routes::get_device))
        .route(
            "/api/devices/:serial/commands",
            get(routes::list_commands).post(routes::enqueue_command),
        )
        .route("/api/devices/:serial/users", post(routes::enqueue_user))
        .route(
            "/api/devices/:serial/users/:pin",
            axum::routing::delete(routes::delete_user),
        )
        .route("/api/commands/sweep", post(routes::sweep_commands))
        // Punches and classification
        .route("/api/punches", get(routes::list_punches))
        .route(
            "/api/time-windows",
            get(routes::list_time_windows).post(routes::create_time_window),
        )
        .route(
            "/api/time-windows/:id",
            put(routes::update_time_window).delete(routes::delete_time_window),
        )
        .route("/api/punch-type", get(routes::classify_punch))
        // Attach application state
        .with_state(state)
        // Middleware
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
