//! Table of in-flight correlated requests.
//!
//! Each entry owns a one-shot continuation and a timer task. Whichever of
//! `resolve`, `fail` or the timer removes the entry first delivers the
//! outcome; every later attempt finds no entry and is a no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, oneshot};
use tokio::task::AbortHandle;
use tracing::debug;

use crate::error::BrokerError;

type Outcome<T> = Result<T, BrokerError>;

struct PendingEntry<T> {
    created_at: Instant,
    timer: AbortHandle,
    reply: oneshot::Sender<Outcome<T>>,
}

pub struct PendingRequests<T> {
    entries: Arc<Mutex<HashMap<String, PendingEntry<T>>>>,
}

/// Awaitable side of a registered request.
pub struct PendingReply<T> {
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T> PendingReply<T> {
    pub async fn wait(self) -> Outcome<T> {
        self.rx.await.unwrap_or(Err(BrokerError::ConnectionClosed))
    }
}

impl<T: Send + 'static> Default for PendingRequests<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> PendingRequests<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register `id` and start its timeout. Re-registering a live id drops
    /// the earlier waiter, which then observes `ConnectionClosed`.
    pub async fn register(&self, id: &str, timeout: Duration) -> PendingReply<T> {
        let (tx, rx) = oneshot::channel();

        // Held until the entry is in place so the timer can never miss it.
        let mut guard = self.entries.lock().await;

        let entries = Arc::clone(&self.entries);
        let timer_id = id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = entries.lock().await.remove(&timer_id);
            if let Some(entry) = expired {
                debug!(id = %timer_id, ?timeout, "Pending request timed out");
                let _ = entry.reply.send(Err(BrokerError::RequestTimeout {
                    id: timer_id.clone(),
                    timeout,
                }));
            }
        })
        .abort_handle();

        let previous = guard.insert(
            id.to_string(),
            PendingEntry {
                created_at: Instant::now(),
                timer,
                reply: tx,
            },
        );
        if let Some(previous) = previous {
            previous.timer.abort();
        }

        PendingReply { rx }
    }

    /// Deliver a value. Returns `true` iff an entry for `id` existed.
    pub async fn resolve(&self, id: &str, value: T) -> bool {
        self.complete(id, Ok(value)).await
    }

    /// Deliver a failure. Returns `true` iff an entry for `id` existed.
    pub async fn fail(&self, id: &str, error: BrokerError) -> bool {
        self.complete(id, Err(error)).await
    }

    pub(crate) async fn complete(&self, id: &str, outcome: Outcome<T>) -> bool {
        let Some(entry) = self.entries.lock().await.remove(id) else {
            return false;
        };
        entry.timer.abort();
        debug!(id, elapsed_ms = entry.created_at.elapsed().as_millis() as u64, "Pending request completed");
        // The waiter may have given up already; the entry is gone either way.
        let _ = entry.reply.send(outcome);
        true
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
