use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde_derive::Deserialize;
use tracing::{debug, error, warn};

use courier_common::queue::Queue;
use courier_common::record::DeliveryRecord;

/// Querystring parameters of a delivery request.
#[derive(Debug, Deserialize)]
pub struct HookParams {
    #[serde(default)]
    method: String,
    #[serde(default)]
    url: String,
}

/// Accept one webhook delivery request and enqueue it for dispatch.
/// The raw request body becomes the delivery payload as-is; producers
/// are responsible for pre-serializing structured data.
pub async fn post(
    State(queue): State<Arc<dyn Queue>>,
    Query(params): Query<HookParams>,
    body: Bytes,
) -> (StatusCode, &'static str) {
    if params.method.is_empty() || params.url.is_empty() {
        warn!(method = %params.method, url = %params.url, "request validation failed");
        return (
            StatusCode::BAD_REQUEST,
            "Both 'method' and 'url' must be provided as querystring parameters",
        );
    }

    let payload = String::from_utf8_lossy(&body);
    let record = DeliveryRecord::new(&params.method, &params.url, &payload);
    let element =
        serde_json::to_string(&record).expect("delivery record serialization is infallible");

    debug!(method = %record.method, url = %record.url, "enqueuing delivery");

    match queue.push_tail(element).await {
        Ok(()) => {
            metrics::counter!("webhook_records_accepted_total").increment(1);
            (StatusCode::OK, "OK")
        }
        Err(push_error) => {
            error!("failed to enqueue delivery: {}", push_error);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to enqueue delivery",
            )
        }
    }
}
