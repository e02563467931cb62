//! Failover provider: wraps several providers in priority order.
//!
//! If opening a stream fails (rate limit, auth failure, network), the next
//! provider in the list is tried. Errors after the stream has started are
//! surfaced to the caller unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{ChatRequest, EventStream, LlmProvider};

/// A failover provider that tries multiple underlying providers in order.
pub struct FailoverProvider {
    providers: Vec<Arc<dyn LlmProvider>>,
    label: String,
}

impl FailoverProvider {
    /// The first provider is primary; others are fallbacks.
    pub fn new(label: String, providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        Self { providers, label }
    }
}

#[async_trait]
impl LlmProvider for FailoverProvider {
    fn id(&self) -> &str {
        &self.label
    }

    fn model(&self) -> &str {
        self.providers.first().map(|p| p.model()).unwrap_or_default()
    }

    async fn stream(&self, request: &ChatRequest<'_>) -> anyhow::Result<EventStream> {
        let mut last_error = None;

        for (i, provider) in self.providers.iter().enumerate() {
            match provider.stream(request).await {
                Ok(stream) => {
                    if i > 0 {
                        info!(
                            provider = provider.id(),
                            attempt = i + 1,
                            "Failover succeeded"
                        );
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        provider = provider.id(),
                        attempt = i + 1,
                        %e,
                        "Provider failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("No providers configured in failover")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StopReason, StreamEvent};
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        id: &'static str,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for Flaky {
        fn id(&self) -> &str {
            self.id
        }

        fn model(&self) -> &str {
            "flaky-model"
        }

        async fn stream(&self, _request: &ChatRequest<'_>) -> anyhow::Result<EventStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("{} is down", self.id);
            }
            Ok(Box::pin(futures::stream::iter(vec![Ok(
                StreamEvent::TurnFinished {
                    reason: StopReason::EndTurn,
                },
            )])))
        }
    }

    fn flaky(id: &'static str, fail: bool) -> Arc<Flaky> {
        Arc::new(Flaky {
            id,
            fail,
            calls: AtomicUsize::new(0),
        })
    }

    fn request() -> ChatRequest<'static> {
        ChatRequest {
            system: "",
            messages: &[],
            tools: &[],
            max_tokens: 16,
            temperature: None,
        }
    }

    #[test]
    fn test_failover_provider_creation() {
        let provider = FailoverProvider::new("test-failover".into(), vec![]);
        assert_eq!(provider.id(), "test-failover");
        assert_eq!(provider.model(), "");
    }

    #[tokio::test]
    async fn test_falls_back_to_next_provider() {
        let primary = flaky("primary", true);
        let backup = flaky("backup", false);
        let provider = FailoverProvider::new(
            "chain".into(),
            vec![primary.clone() as Arc<dyn LlmProvider>, backup.clone()],
        );

        let events: Vec<_> = provider.stream(&request()).await.unwrap().collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reports_last_error() {
        let provider = FailoverProvider::new(
            "chain".into(),
            vec![flaky("a", true) as Arc<dyn LlmProvider>, flaky("b", true)],
        );
        let err = provider.stream(&request()).await.err().unwrap();
        assert!(err.to_string().contains("b is down"));
    }

    #[tokio::test]
    async fn test_empty_chain_errors() {
        let provider = FailoverProvider::new("empty".into(), vec![]);
        assert!(provider.stream(&request()).await.is_err());
    }
}
