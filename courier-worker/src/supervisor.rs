//! The long-running loop that owns a delivery worker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use courier_common::sink::{ErrorEvent, ErrorSink};
use tracing::{error, info};

use crate::worker::DeliveryWorker;

/// Runs worker iterations until shut down, isolating each one from
/// panics so a single poisoned record cannot take the process down.
pub struct Supervisor {
    worker: Arc<DeliveryWorker>,
    sink: Arc<dyn ErrorSink>,
    /// Pause between iterations; keeps the loop from spinning against
    /// an empty or failing queue.
    idle_sleep: Duration,
}

impl Supervisor {
    pub fn new(worker: Arc<DeliveryWorker>, sink: Arc<dyn ErrorSink>, idle_sleep: Duration) -> Self {
        Self {
            worker,
            sink,
            idle_sleep,
        }
    }

    /// Run iterations until `shutdown` resolves, then stop starting new
    /// work and let in-flight deliveries finish naturally.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = self.step() => {}
            }
        }

        info!("shutting down, waiting for in-flight deliveries");
        self.worker.drain().await;
    }

    /// One panic-isolated worker iteration followed by the pacing sleep.
    async fn step(&self) {
        let worker = self.worker.clone();
        let iteration = tokio::spawn(async move { worker.process_one().await });

        match iteration.await {
            Ok(Ok(_disposition)) => {}
            Ok(Err(worker_error)) => {
                error!("worker iteration failed: {}", worker_error);
                self.sink.capture(
                    ErrorEvent::new("worker iteration failed")
                        .tag("error", &worker_error.to_string()),
                );
            }
            Err(join_error) if join_error.is_panic() => {
                error!("worker iteration panicked: {}", join_error);
                self.sink.capture(
                    ErrorEvent::new("worker iteration panicked")
                        .tag("error", &join_error.to_string()),
                );
            }
            Err(join_error) => {
                error!("worker iteration was cancelled: {}", join_error);
            }
        }

        tokio::time::sleep(self.idle_sleep).await;
    }
}
