//! The delivery worker: pop, decide, dispatch, requeue.

use std::sync::Arc;
use std::time::Duration;

use courier_common::clock::Clock;
use courier_common::queue::Queue;
use courier_common::record::DeliveryRecord;
use courier_common::retry::RetryPolicy;
use courier_common::sink::{ErrorEvent, ErrorSink};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::WorkerError;
use crate::invoker;

/// What a single worker iteration did with the queue head.
#[derive(Debug)]
pub enum Disposition {
    /// The blocking pop timed out with nothing to do.
    Empty,
    /// The record could not be decoded or routed and was discarded.
    Discarded,
    /// The record's expiry window had passed; dropped silently.
    Expired,
    /// The record was not yet eligible and went back to the tail.
    Deferred,
    /// An outbound delivery is in flight on the returned task.
    Dispatched(JoinHandle<()>),
}

/// A worker that drains the queue and performs outbound webhook calls.
///
/// The pop loop is single-threaded; each dispatch runs on its own task
/// so a slow target does not starve the queue. The semaphore bounds the
/// number of in-flight deliveries.
pub struct DeliveryWorker {
    /// The queue records are popped from and requeued into.
    queue: Arc<dyn Queue>,
    /// How long a single blocking pop waits before coming back empty.
    pop_timeout: Duration,
    /// The client used for outbound requests.
    client: reqwest::Client,
    /// Bounds the number of concurrent in-flight deliveries.
    dispatches: Arc<Semaphore>,
    max_concurrent_dispatches: usize,
    /// Stamps the `backoff` field of requeued records.
    retry_policy: RetryPolicy,
    /// Records whose attempt count passes this cap are abandoned.
    max_attempts: u32,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ErrorSink>,
}

impl DeliveryWorker {
    pub fn new(
        queue: Arc<dyn Queue>,
        pop_timeout: Duration,
        request_timeout: Duration,
        max_concurrent_dispatches: usize,
        retry_policy: RetryPolicy,
        max_attempts: u32,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            queue,
            pop_timeout,
            client: invoker::build_client(request_timeout),
            dispatches: Arc::new(Semaphore::new(max_concurrent_dispatches)),
            max_concurrent_dispatches,
            retry_policy,
            max_attempts,
            clock,
            sink,
        }
    }

    /// Run one iteration of the worker state machine against the head
    /// of the queue. A pop timeout is a normal outcome, not an error;
    /// only queue transport failures surface as `Err`.
    pub async fn process_one(&self) -> Result<Disposition, WorkerError> {
        let Some(element) = self.queue.pop_head_blocking(self.pop_timeout).await? else {
            return Ok(Disposition::Empty);
        };

        let record: DeliveryRecord = match serde_json::from_str(&element) {
            Ok(record) => record,
            Err(decode_error) => {
                // Nothing intelligible to requeue.
                error!("discarding undecodable record: {}", decode_error);
                self.sink.capture(
                    ErrorEvent::new("record could not be decoded")
                        .tag("error", &decode_error.to_string()),
                );
                metrics::counter!("webhook_records_discarded_total").increment(1);
                return Ok(Disposition::Discarded);
            }
        };

        if !record.is_routable() {
            warn!(
                method = %record.method,
                url = %record.url,
                "discarding record without method or url"
            );
            self.sink.capture(
                ErrorEvent::new("record is missing method or url")
                    .tag("method", &record.method)
                    .tag("url", &record.url),
            );
            metrics::counter!("webhook_records_discarded_total").increment(1);
            return Ok(Disposition::Discarded);
        }

        if record.is_expired(self.clock.now_s()) {
            warn!(url = %record.url, "dropping expired record");
            metrics::counter!("webhook_records_expired_total").increment(1);
            return Ok(Disposition::Expired);
        }

        if record.is_deferred(self.clock.now_ns()) {
            // Push back exactly the bytes that were popped, so the
            // queue stays drainable without busy-waiting on one item.
            if let Err(push_error) = self.queue.push_tail(element).await {
                error!(url = %record.url, "failed to defer record: {}", push_error);
            }
            metrics::counter!("webhook_records_deferred_total").increment(1);
            return Ok(Disposition::Deferred);
        }

        Ok(Disposition::Dispatched(self.spawn_dispatch(record).await))
    }

    /// Spawn the outbound call once a dispatch permit is available. The
    /// requeue decision happens inside the task, off the pop loop.
    async fn spawn_dispatch(&self, record: DeliveryRecord) -> JoinHandle<()> {
        let permit = self
            .dispatches
            .clone()
            .acquire_owned()
            .await
            .expect("dispatch semaphore closed");

        let client = self.client.clone();
        let queue = self.queue.clone();
        let retry_policy = self.retry_policy;
        let max_attempts = self.max_attempts;
        let clock = self.clock.clone();
        let sink = self.sink.clone();

        metrics::counter!("webhook_dispatches_total").increment(1);

        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let outcome = invoker::invoke(&client, &record).await;
            metrics::histogram!("webhook_dispatch_duration_seconds")
                .record(started.elapsed().as_secs_f64());

            match outcome {
                Ok(response) => {
                    debug!(url = %record.url, status = %response.status(), "delivery succeeded");
                    metrics::counter!("webhook_dispatches_completed_total").increment(1);
                }
                Err(dispatch_error) if dispatch_error.is_retryable() => {
                    debug!(url = %record.url, "delivery failed: {}", dispatch_error);
                    requeue(
                        &*queue,
                        &record,
                        true,
                        retry_policy,
                        max_attempts,
                        &*clock,
                        &*sink,
                    )
                    .await;
                }
                Err(dispatch_error) => {
                    warn!(url = %record.url, "discarding undeliverable record: {}", dispatch_error);
                    sink.capture(
                        ErrorEvent::new("record could not be dispatched")
                            .tag("method", &record.method)
                            .tag("url", &record.url)
                            .tag("error", &dispatch_error.to_string()),
                    );
                    metrics::counter!("webhook_records_discarded_total").increment(1);
                }
            }

            drop(permit);
        })
    }

    /// Wait until every in-flight dispatch has completed.
    pub async fn drain(&self) {
        let _permits = self
            .dispatches
            .acquire_many(self.max_concurrent_dispatches as u32)
            .await
            .expect("dispatch semaphore closed");
    }
}

/// Re-enqueue a record after a failed execution, or abandon it once
/// past the attempt cap. `increment` is false only for callers that
/// have not actually executed a dispatch.
async fn requeue(
    queue: &dyn Queue,
    record: &DeliveryRecord,
    increment: bool,
    retry_policy: RetryPolicy,
    max_attempts: u32,
    clock: &dyn Clock,
    sink: &dyn ErrorSink,
) {
    let attempts = if increment {
        record.attempts + 1
    } else {
        record.attempts
    };

    if attempts > max_attempts {
        error!(
            method = %record.method,
            url = %record.url,
            "abandoning delivery after {} attempts",
            attempts
        );
        sink.capture(
            ErrorEvent::new("delivery abandoned after too many attempts")
                .tag("method", &record.method)
                .tag("url", &record.url)
                .tag("payload", &record.payload),
        );
        metrics::counter!("webhook_dispatches_failed_total").increment(1);
        return;
    }

    let retry = record.retrying(attempts, retry_policy.next_backoff_ns(attempts, clock));
    let element =
        serde_json::to_string(&retry).expect("delivery record serialization is infallible");

    if let Err(push_error) = queue.push_tail(element).await {
        // The record is lost; the queue failure itself is the problem
        // the supervisor needs surfaced.
        error!(url = %record.url, "failed to requeue record: {}", push_error);
        sink.capture(
            ErrorEvent::new("failed to requeue record after delivery failure")
                .tag("url", &record.url)
                .tag("error", &push_error.to_string()),
        );
        return;
    }

    metrics::counter!("webhook_dispatches_retried_total").increment(1);
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::routing::any;
    use axum::Router;
    use bytes::Bytes;
    use courier_common::clock::ManualClock;
    use courier_common::queue::MemoryQueue;
    use courier_common::sink::MemorySink;
    use http::{Method, StatusCode};

    use super::*;

    const NANOS_PER_MS: u64 = 1_000_000;

    #[derive(Clone, Debug)]
    struct Hit {
        method: String,
        body: String,
    }

    /// Serve a capture endpoint on an ephemeral local port, returning
    /// its URL and the requests it has seen.
    async fn spawn_target(status: StatusCode) -> (String, Arc<Mutex<Vec<Hit>>>) {
        let hits: Arc<Mutex<Vec<Hit>>> = Arc::default();
        let seen = hits.clone();

        let app = Router::new().route(
            "/sent",
            any(move |method: Method, body: Bytes| {
                let seen = seen.clone();
                async move {
                    seen.lock().expect("hits mutex poisoned").push(Hit {
                        method: method.to_string(),
                        body: String::from_utf8_lossy(&body).into_owned(),
                    });
                    status
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind target listener");
        let addr = listener.local_addr().expect("failed to read target addr");
        tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("failed to serve target");
        });

        (format!("http://{}/sent", addr), hits)
    }

    struct Fixture {
        queue: Arc<MemoryQueue>,
        clock: Arc<ManualClock>,
        sink: Arc<MemorySink>,
        worker: DeliveryWorker,
    }

    /// A worker wired to in-process fakes: 10ms base backoff, short pop
    /// timeout, manual clock starting at an arbitrary wall-clock time.
    fn fixture(max_attempts: u32) -> Fixture {
        let queue = Arc::new(MemoryQueue::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000 * 1_000_000_000));
        let sink = Arc::new(MemorySink::new());

        let worker = DeliveryWorker::new(
            queue.clone(),
            Duration::from_millis(50),
            Duration::from_millis(1000),
            10,
            RetryPolicy::new(2, Duration::from_millis(10), None),
            max_attempts,
            clock.clone(),
            sink.clone(),
        );

        Fixture {
            queue,
            clock,
            sink,
            worker,
        }
    }

    async fn push_record(queue: &MemoryQueue, record: &DeliveryRecord) {
        queue
            .push_tail(serde_json::to_string(record).expect("failed to encode record"))
            .await
            .expect("failed to push record");
    }

    /// Run one iteration and wait for its dispatch, if any, to finish.
    async fn run_iteration(worker: &DeliveryWorker) -> Disposition {
        match worker
            .process_one()
            .await
            .expect("worker iteration failed")
        {
            Disposition::Dispatched(handle) => {
                handle.await.expect("dispatch task panicked");
                Disposition::Dispatched(tokio::spawn(async {}))
            }
            other => other,
        }
    }

    fn popped_record(queue: &MemoryQueue) -> DeliveryRecord {
        let elements = queue.snapshot();
        assert_eq!(elements.len(), 1, "expected exactly one queued record");
        serde_json::from_str(&elements[0]).expect("failed to decode queued record")
    }

    #[tokio::test]
    async fn test_delivers_pending_record() {
        let f = fixture(10);
        let (url, hits) = spawn_target(StatusCode::OK).await;
        push_record(&f.queue, &DeliveryRecord::new("POST", &url, r#"{"qwe":123}"#)).await;

        run_iteration(&f.worker).await;

        let hits = hits.lock().expect("hits mutex poisoned");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].method, "POST");
        assert_eq!(hits[0].body, r#"{"qwe":123}"#);
        assert!(f.queue.snapshot().is_empty());
        assert!(f.sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_requeues_with_backoff_when_target_is_down() {
        let f = fixture(10);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind target listener");
        let addr = listener.local_addr().expect("failed to read target addr");
        drop(listener);
        let url = format!("http://{}/sent", addr);

        push_record(&f.queue, &DeliveryRecord::new("POST", &url, "body")).await;
        run_iteration(&f.worker).await;

        let retried = popped_record(&f.queue);
        assert_eq!(retried.attempts, 1);
        let backoff = retried.backoff.expect("retried record has no backoff");
        assert!(backoff >= f.clock.now_ns() + 20 * NANOS_PER_MS);

        // Bring the target up on the port that refused the connection
        // and move past the backoff window.
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .expect("failed to rebind target listener");
        let hits: Arc<Mutex<Vec<Hit>>> = Arc::default();
        let seen = hits.clone();
        let app = Router::new().route(
            "/sent",
            any(move |method: Method, body: Bytes| {
                let seen = seen.clone();
                async move {
                    seen.lock().expect("hits mutex poisoned").push(Hit {
                        method: method.to_string(),
                        body: String::from_utf8_lossy(&body).into_owned(),
                    });
                    StatusCode::OK
                }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("failed to serve target");
        });

        f.clock.advance(Duration::from_millis(50));
        run_iteration(&f.worker).await;

        let hits = hits.lock().expect("hits mutex poisoned");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].method, "POST");
        assert_eq!(hits[0].body, "body");
        assert!(f.queue.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_backoff_doubles_across_failed_iterations() {
        let f = fixture(30);
        let (url, _hits) = spawn_target(StatusCode::INTERNAL_SERVER_ERROR).await;
        push_record(&f.queue, &DeliveryRecord::new("POST", &url, "")).await;

        for round in 0..5u32 {
            // Each round the record is eligible again before the pop.
            f.clock.advance(Duration::from_millis(10 * 2u64.pow(round + 2)));
            run_iteration(&f.worker).await;

            let retried = popped_record(&f.queue);
            assert_eq!(retried.attempts, round + 1);

            let backoff = retried.backoff.expect("retried record has no backoff");
            let now = f.clock.now_ns();
            assert!(backoff >= now + 10 * NANOS_PER_MS * 2u64.pow(round + 1));
            assert!(backoff < now + 10 * NANOS_PER_MS * 2u64.pow(round + 2));
        }
    }

    #[tokio::test]
    async fn test_expired_record_is_dropped_silently() {
        let f = fixture(10);
        let (url, hits) = spawn_target(StatusCode::OK).await;

        let mut record = DeliveryRecord::new("POST", &url, "");
        record.expires = Some(f.clock.now_s() - 3600);
        push_record(&f.queue, &record).await;

        let disposition = run_iteration(&f.worker).await;

        assert!(matches!(disposition, Disposition::Expired));
        assert!(hits.lock().expect("hits mutex poisoned").is_empty());
        assert!(f.queue.snapshot().is_empty());
        assert!(f.sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_unexpired_record_is_delivered() {
        let f = fixture(10);
        let (url, hits) = spawn_target(StatusCode::OK).await;

        let mut record = DeliveryRecord::new("POST", &url, "");
        record.expires = Some(f.clock.now_s() + 3600);
        push_record(&f.queue, &record).await;

        run_iteration(&f.worker).await;

        assert_eq!(hits.lock().expect("hits mutex poisoned").len(), 1);
        assert!(f.queue.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_drop_reports_to_sink() {
        let f = fixture(10);
        let (url, _hits) = spawn_target(StatusCode::INTERNAL_SERVER_ERROR).await;

        let mut record = DeliveryRecord::new("POST", &url, "the payload");
        record.attempts = 10;
        push_record(&f.queue, &record).await;

        run_iteration(&f.worker).await;

        assert!(f.queue.snapshot().is_empty(), "record must not be requeued");

        let events = f.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tags["method"], "POST");
        assert_eq!(events[0].tags["url"], url);
        assert_eq!(events[0].tags["payload"], "the payload");
    }

    #[tokio::test]
    async fn test_deferral_requeues_the_exact_bytes() {
        let f = fixture(10);

        let mut record = DeliveryRecord::new("POST", "http://localhost/never", "");
        record.attempts = 3;
        record.backoff = Some(f.clock.now_ns() + 3600 * 1_000_000_000);
        let element = serde_json::to_string(&record).expect("failed to encode record");
        f.queue
            .push_tail(element.clone())
            .await
            .expect("failed to push record");

        let disposition = run_iteration(&f.worker).await;

        assert!(matches!(disposition, Disposition::Deferred));
        assert_eq!(f.queue.snapshot(), vec![element]);
    }

    #[tokio::test]
    async fn test_undecodable_record_is_discarded_with_report() {
        let f = fixture(10);
        f.queue
            .push_tail("not a record {{{".to_owned())
            .await
            .expect("failed to push garbage");

        let disposition = run_iteration(&f.worker).await;

        assert!(matches!(disposition, Disposition::Discarded));
        assert!(f.queue.snapshot().is_empty());
        assert_eq!(f.sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_unroutable_record_is_discarded_with_report() {
        let f = fixture(10);
        push_record(&f.queue, &DeliveryRecord::new("", "", "body")).await;

        let disposition = run_iteration(&f.worker).await;

        assert!(matches!(disposition, Disposition::Discarded));
        assert!(f.queue.snapshot().is_empty());
        assert_eq!(f.sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_method_is_discarded_not_retried() {
        let f = fixture(10);
        push_record(
            &f.queue,
            &DeliveryRecord::new("B AD", "http://localhost/sent", ""),
        )
        .await;

        run_iteration(&f.worker).await;

        assert!(f.queue.snapshot().is_empty());
        assert_eq!(f.sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_pop_is_not_an_error() {
        let f = fixture(10);

        let disposition = run_iteration(&f.worker).await;

        assert!(matches!(disposition, Disposition::Empty));
    }

    #[tokio::test]
    async fn test_requeue_without_increment_preserves_attempts() {
        let f = fixture(10);

        let mut record = DeliveryRecord::new("POST", "http://localhost/sent", "");
        record.attempts = 4;

        requeue(
            &*f.queue,
            &record,
            false,
            RetryPolicy::new(2, Duration::from_millis(10), None),
            10,
            &*f.clock,
            &*f.sink,
        )
        .await;

        assert_eq!(popped_record(&f.queue).attempts, 4);
    }
}
