use std::time::Duration;

use clap::Parser;
use courier_common::retry::RetryPolicy;

/// Delivery worker for the courier webhook dispatching service.
///
/// Every flag can also be provided through its COURIER_* environment
/// variable.
#[derive(Parser, Debug, Clone)]
#[command(name = "courier-worker", version, about)]
pub struct Config {
    /// Redis host backing the delivery queue.
    #[arg(long, env = "COURIER_REDIS_HOST", default_value = "127.0.0.1")]
    pub redis_host: String,

    /// Redis port backing the delivery queue.
    #[arg(long, env = "COURIER_REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    /// Password for the queue Redis, if any.
    #[arg(long, env = "COURIER_REDIS_PASS", default_value = "")]
    pub redis_pass: String,

    /// Logical Redis database index.
    #[arg(long, env = "COURIER_REDIS_DB", default_value_t = 0)]
    pub redis_db: u8,

    /// List key holding pending delivery records.
    #[arg(long, env = "COURIER_QUEUE", default_value = "webhooks")]
    pub queue: String,

    /// Delivery attempts before a record is abandoned.
    #[arg(long, env = "COURIER_MAX_ATTEMPTS", default_value_t = 15)]
    pub max_attempts: u32,

    /// Base interval for the exponential retry backoff, in milliseconds.
    #[arg(long, env = "COURIER_BACKOFF_MS", default_value_t = 5000)]
    pub backoff_ms: u64,

    /// Ceiling on a single retry interval, in milliseconds. Unbounded
    /// when unset.
    #[arg(long, env = "COURIER_MAX_BACKOFF_MS")]
    pub max_backoff_ms: Option<u64>,

    /// How long a blocking queue pop waits before coming back empty,
    /// in seconds.
    #[arg(long, env = "COURIER_POP_TIMEOUT_SECS", default_value_t = 5)]
    pub pop_timeout_secs: u64,

    /// Timeout for a single outbound delivery, in milliseconds.
    #[arg(long, env = "COURIER_REQUEST_TIMEOUT_MS", default_value_t = 5000)]
    pub request_timeout_ms: u64,

    /// Maximum number of concurrent in-flight deliveries.
    #[arg(long, env = "COURIER_MAX_CONCURRENT", default_value_t = 1024)]
    pub max_concurrent: usize,

    /// Pause between worker iterations, in milliseconds.
    #[arg(long, env = "COURIER_IDLE_SLEEP_MS", default_value_t = 50)]
    pub idle_sleep_ms: u64,

    /// URL to POST error events to. Events are only logged when unset.
    #[arg(long, env = "COURIER_ERROR_SINK_URL")]
    pub error_sink_url: Option<String>,

    /// Log at debug level (wins over --quiet).
    #[arg(long, env = "COURIER_DEBUG")]
    pub debug: bool,

    /// Log errors only.
    #[arg(long, env = "COURIER_QUIET")]
    pub quiet: bool,

    /// Host to bind the liveness/metrics endpoint to.
    #[arg(long, env = "COURIER_BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: String,

    /// Port to bind the liveness/metrics endpoint to.
    #[arg(long, env = "COURIER_BIND_PORT", default_value_t = 3001)]
    pub bind_port: u16,
}

impl Config {
    /// Connection URL for the queue Redis.
    pub fn redis_url(&self) -> String {
        if self.redis_pass.is_empty() {
            format!(
                "redis://{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_db
            )
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.redis_pass, self.redis_host, self.redis_port, self.redis_db
            )
        }
    }

    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }

    /// The default log directive implied by the verbosity flags.
    pub fn log_directive(&self) -> &'static str {
        if self.debug {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            "info"
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            2,
            Duration::from_millis(self.backoff_ms),
            self.max_backoff_ms.map(Duration::from_millis),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["courier-worker"]);

        assert_eq!(config.max_attempts, 15);
        assert_eq!(config.backoff_ms, 5000);
        assert_eq!(config.pop_timeout_secs, 5);
        assert_eq!(config.queue, "webhooks");
        assert_eq!(config.redis_url(), "redis://127.0.0.1:6379/0");
        assert_eq!(config.log_directive(), "info");
    }

    #[test]
    fn test_redis_url_with_credentials() {
        let config = Config::parse_from([
            "courier-worker",
            "--redis-host",
            "queue.internal",
            "--redis-pass",
            "hunter2",
            "--redis-db",
            "3",
        ]);

        assert_eq!(config.redis_url(), "redis://:hunter2@queue.internal:6379/3");
    }

    #[test]
    fn test_verbosity_flags() {
        let config = Config::parse_from(["courier-worker", "--quiet"]);
        assert_eq!(config.log_directive(), "error");

        // Debug wins when both are set.
        let config = Config::parse_from(["courier-worker", "--debug", "--quiet"]);
        assert_eq!(config.log_directive(), "debug");
    }
}
