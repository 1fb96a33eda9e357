use std::sync::Arc;

use axum::{routing, Router};
use tower_http::limit::RequestBodyLimitLayer;

use courier_common::queue::Queue;

use super::hooks;

pub fn add_routes(router: Router, queue: Arc<dyn Queue>, max_body_size: usize) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)) // No async loop for now, just check axum health
        .route(
            "/hooks",
            routing::post(hooks::post)
                .with_state(queue)
                .layer(RequestBodyLimitLayer::new(max_body_size)),
        )
}

pub async fn index() -> &'static str {
    "courier api"
}
