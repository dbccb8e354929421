//! Proposal and context traits.
//!
//! The engine never decides *what* to do on its own. It asks a [`Proposer`]
//! for actions toward the current goal (or for new goals when none exist),
//! handing it a [`Context`] assembled from every registered
//! [`ContextProvider`].

use std::collections::BTreeMap;
use std::sync::Arc;

use ap_core::types::{Action, Goal};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProposalError {
    #[error("proposer unavailable: {0}")]
    Unavailable(String),
    #[error("proposal timed out")]
    Timeout,
    #[error("invalid proposal: {0}")]
    Invalid(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("context provider `{provider}` failed: {message}")]
pub struct ContextError {
    pub provider: String,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, ProposalError>;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Opaque snapshots keyed by provider name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub sources: BTreeMap<String, serde_json::Value>,
}

impl Context {
    pub fn get(&self, provider: &str) -> Option<&serde_json::Value> {
        self.sources.get(provider)
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Supplies one named slice of context (calendar, inbox, metrics, ...).
#[async_trait]
pub trait ContextProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn snapshot(&self) -> std::result::Result<serde_json::Value, ContextError>;
}

/// Providers registered at startup.
#[derive(Clone, Default)]
pub struct ContextRegistry {
    providers: Vec<Arc<dyn ContextProvider>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ContextProvider>) {
        debug!(provider = provider.name(), "context provider registered");
        self.providers.push(provider);
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Snapshot every provider. A failing provider is logged and left out.
    pub async fn snapshot_all(&self) -> Context {
        let mut ctx = Context::default();
        for provider in &self.providers {
            match provider.snapshot().await {
                Ok(value) => {
                    ctx.sources.insert(provider.name().to_string(), value);
                }
                Err(e) => warn!(provider = provider.name(), error = %e, "context snapshot failed"),
            }
        }
        ctx
    }
}

// ---------------------------------------------------------------------------
// Proposer
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Proposer: Send + Sync {
    /// Actions that advance `goal`. An empty list means nothing to do now.
    async fn propose(&self, goal: &Goal, context: &Context) -> Result<Vec<Action>>;

    /// New goals derived from context, used when the store has nothing selectable.
    async fn propose_goals(&self, context: &Context) -> Result<Vec<Goal>>;
}

/// Proposes nothing. The engine idles until goals and actions arrive
/// through the operator handle.
#[derive(Debug, Clone, Default)]
pub struct NullProposer;

#[async_trait]
impl Proposer for NullProposer {
    async fn propose(&self, _goal: &Goal, _context: &Context) -> Result<Vec<Action>> {
        Ok(Vec::new())
    }

    async fn propose_goals(&self, _context: &Context) -> Result<Vec<Goal>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(&'static str, serde_json::Value);

    #[async_trait]
    impl ContextProvider for Fixed {
        fn name(&self) -> &str {
            self.0
        }
        async fn snapshot(&self) -> std::result::Result<serde_json::Value, ContextError> {
            Ok(self.1.clone())
        }
    }

    struct Broken;

    #[async_trait]
    impl ContextProvider for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        async fn snapshot(&self) -> std::result::Result<serde_json::Value, ContextError> {
            Err(ContextError {
                provider: "broken".into(),
                message: "offline".into(),
            })
        }
    }

    #[tokio::test]
    async fn failing_provider_is_omitted() {
        let mut registry = ContextRegistry::new();
        registry.register(Arc::new(Fixed("calendar", json!({"free": true}))));
        registry.register(Arc::new(Broken));
        assert_eq!(registry.len(), 2);

        let ctx = registry.snapshot_all().await;
        assert_eq!(ctx.get("calendar"), Some(&json!({"free": true})));
        assert!(ctx.get("broken").is_none());
    }

    #[tokio::test]
    async fn null_proposer_is_empty() {
        let p = NullProposer;
        let ctx = Context::default();
        assert!(p.propose_goals(&ctx).await.unwrap().is_empty());
        assert!(p
            .propose(&Goal::new("g", "health"), &ctx)
            .await
            .unwrap()
            .is_empty());
    }
}
