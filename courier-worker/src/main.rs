//! Drain the delivery queue and run outbound webhook calls.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::signal;
use tracing::error;
use tracing_subscriber::EnvFilter;

use courier_common::clock::SystemClock;
use courier_common::metrics::{serve, setup_metrics_routes};
use courier_common::queue::RedisQueue;
use courier_common::sink::{ErrorSink, HttpSink, LogSink};
use courier_worker::config::Config;
use courier_worker::supervisor::Supervisor;
use courier_worker::worker::DeliveryWorker;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_directive())),
        )
        .init();

    let queue = match RedisQueue::new(&config.redis_url(), &config.queue) {
        Ok(queue) => queue,
        Err(queue_error) => {
            error!("failed to initialize queue: {}", queue_error);
            return ExitCode::FAILURE;
        }
    };

    if let Err(ping_error) = queue.ping().await {
        error!("queue is unreachable: {}", ping_error);
        return ExitCode::FAILURE;
    }

    let sink: Arc<dyn ErrorSink> = match &config.error_sink_url {
        Some(sink_url) => match HttpSink::new(sink_url) {
            Ok(sink) => Arc::new(sink),
            Err(parse_error) => {
                error!("invalid error sink url: {}", parse_error);
                return ExitCode::FAILURE;
            }
        },
        None => Arc::new(LogSink),
    };

    let worker = Arc::new(DeliveryWorker::new(
        Arc::new(queue),
        Duration::from_secs(config.pop_timeout_secs),
        Duration::from_millis(config.request_timeout_ms),
        config.max_concurrent,
        config.retry_policy(),
        config.max_attempts,
        Arc::new(SystemClock),
        sink.clone(),
    ));

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(index));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let supervisor = Supervisor::new(worker, sink, Duration::from_millis(config.idle_sleep_ms));
    supervisor.run(shutdown()).await;

    ExitCode::SUCCESS
}

pub async fn index() -> &'static str {
    "courier worker"
}
