//! Ordered log of sync traffic for one canvas.
//!
//! The relay does not interpret frames. Everything the broker does not
//! claim is appended here, the log is replayed to each newly attached peer
//! and it is what gets persisted when the canvas is saved.

use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct SyncRelay {
    log: RwLock<Vec<String>>,
}

impl SyncRelay {
    pub fn new(seed: Vec<String>) -> Self {
        Self {
            log: RwLock::new(seed),
        }
    }

    pub async fn record(&self, frame: impl Into<String>) {
        self.log.write().await.push(frame.into());
    }

    /// Frames in arrival order.
    pub async fn frames(&self) -> Vec<String> {
        self.log.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.log.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.log.read().await.is_empty()
    }
}
