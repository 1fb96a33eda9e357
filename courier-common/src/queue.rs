//! # Queue port
//!
//! The FIFO the ingestion api produces into and delivery workers drain.
//! Elements are opaque UTF-8 strings (in practice, delivery record
//! JSON). The contract is atomicity of individual operations, delivery
//! of each element to at most one popper, and FIFO order among elements
//! visible at pop time; durability is whatever the backing transport
//! provides.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::Notify;

/// Enumeration of errors for operations on a queue.
/// Transport errors are wrapped to provide the failing command as context.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: redis::RedisError },
    #[error("{command} command failed with: {error}")]
    CommandError {
        command: String,
        error: redis::RedisError,
    },
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

#[async_trait]
pub trait Queue: Send + Sync {
    /// Atomically append an element to the tail.
    async fn push_tail(&self, element: String) -> QueueResult<()>;

    /// Pop the head element, blocking up to `timeout` for one to become
    /// available. `Ok(None)` means the timeout elapsed, not an error.
    async fn pop_head_blocking(&self, timeout: Duration) -> QueueResult<Option<String>>;

    /// Pop the head element if one is immediately available.
    async fn pop_head(&self) -> QueueResult<Option<String>>;

    /// Number of elements currently in the queue.
    async fn len(&self) -> QueueResult<usize>;
}

/// A queue implemented on top of a Redis list.
pub struct RedisQueue {
    client: redis::Client,
    /// The list key this queue pushes to and pops from.
    key: String,
}

impl RedisQueue {
    pub fn new(addr: &str, key: &str) -> QueueResult<Self> {
        let client = redis::Client::open(addr)
            .map_err(|error| QueueError::ConnectionError { error })?;

        Ok(Self {
            client,
            key: key.to_owned(),
        })
    }

    async fn connection(&self) -> QueueResult<redis::aio::Connection> {
        self.client
            .get_async_connection()
            .await
            .map_err(|error| QueueError::ConnectionError { error })
    }

    /// Round-trip a PING, to fail fast at startup when the transport is
    /// unreachable.
    pub async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|error| QueueError::CommandError {
                command: "PING".to_owned(),
                error,
            })?;

        Ok(())
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn push_tail(&self, element: String) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        conn.rpush::<_, _, ()>(&self.key, element)
            .await
            .map_err(|error| QueueError::CommandError {
                command: "RPUSH".to_owned(),
                error,
            })?;

        Ok(())
    }

    async fn pop_head_blocking(&self, timeout: Duration) -> QueueResult<Option<String>> {
        let mut conn = self.connection().await?;

        // BLPOP timeouts have whole-second granularity; zero would
        // block forever, so anything shorter rounds up to one second.
        let timeout_s = std::cmp::max(timeout.as_secs(), 1) as f64;

        let reply: Option<(String, String)> = conn
            .blpop(&self.key, timeout_s)
            .await
            .map_err(|error| QueueError::CommandError {
                command: "BLPOP".to_owned(),
                error,
            })?;

        Ok(reply.map(|(_key, element)| element))
    }

    async fn pop_head(&self) -> QueueResult<Option<String>> {
        let mut conn = self.connection().await?;

        let reply: Option<String> =
            conn.lpop(&self.key, None)
                .await
                .map_err(|error| QueueError::CommandError {
                    command: "LPOP".to_owned(),
                    error,
                })?;

        Ok(reply)
    }

    async fn len(&self) -> QueueResult<usize> {
        let mut conn = self.connection().await?;

        conn.llen(&self.key)
            .await
            .map_err(|error| QueueError::CommandError {
                command: "LLEN".to_owned(),
                error,
            })
    }
}

/// An in-process queue with the same contract, for consumers' tests.
#[derive(Default)]
pub struct MemoryQueue {
    elements: Mutex<VecDeque<String>>,
    pushed: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current contents, head first.
    pub fn snapshot(&self) -> Vec<String> {
        self.elements
            .lock()
            .expect("queue mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn push_tail(&self, element: String) -> QueueResult<()> {
        self.elements
            .lock()
            .expect("queue mutex poisoned")
            .push_back(element);
        self.pushed.notify_one();

        Ok(())
    }

    async fn pop_head_blocking(&self, timeout: Duration) -> QueueResult<Option<String>> {
        let popped = tokio::time::timeout(timeout, async {
            loop {
                if let Some(element) = self
                    .elements
                    .lock()
                    .expect("queue mutex poisoned")
                    .pop_front()
                {
                    return element;
                }

                self.pushed.notified().await;
            }
        })
        .await;

        Ok(popped.ok())
    }

    async fn pop_head(&self) -> QueueResult<Option<String>> {
        Ok(self
            .elements
            .lock()
            .expect("queue mutex poisoned")
            .pop_front())
    }

    async fn len(&self) -> QueueResult<usize> {
        Ok(self.elements.lock().expect("queue mutex poisoned").len())
    }
}
