//! Accept webhook delivery requests and enqueue them for dispatch.

use std::sync::Arc;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;

use courier_common::metrics::setup_metrics_routes;
use courier_common::queue::RedisQueue;

mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let queue = RedisQueue::new(&config.redis_url, &config.queue_name)
        .expect("failed to initialize queue");

    let app = handlers::add_routes(Router::new(), Arc::new(queue), config.max_body_size);
    let app = setup_metrics_routes(app);

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start courier api http server, {}", e),
    }
}
