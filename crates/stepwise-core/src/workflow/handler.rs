//! Deterministic step handlers and the registry that maps actions to them.
//!
//! A handler is the deterministic implementation of a `python` step's
//! action. Each handler may carry an intent description: the static "what"
//! sent to an agent when the step runs in agent mode.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use super::context::ExecutionContext;

/// Everything a handler receives for one invocation.
#[derive(Debug, Clone)]
pub struct HandlerInput {
    pub step: String,
    pub action: String,
    /// Step inputs with every template resolved.
    pub inputs: Value,
    /// Read-only view of the run at the time of the call.
    pub context: ExecutionContext,
    /// The agent's proposal when the handler validates it (collaborator).
    pub proposal: Option<Value>,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Deterministic implementation of an action.
pub trait StepHandler: Send + Sync {
    /// What the action accomplishes, for agent delegation.
    fn intent(&self) -> Option<&str> {
        None
    }

    fn run(&self, input: HandlerInput) -> BoxFuture<'_, Result<Value, HandlerError>>;
}

// ---------------------------------------------------------------------------
// Closure adapters
// ---------------------------------------------------------------------------

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
    intent: Option<String>,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(HandlerInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f, intent: None }
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }
}

impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(HandlerInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    fn intent(&self) -> Option<&str> {
        self.intent.as_deref()
    }

    fn run(&self, input: HandlerInput) -> BoxFuture<'_, Result<Value, HandlerError>> {
        Box::pin((self.f)(input))
    }
}

/// Handler backed by a synchronous closure, run on the blocking pool.
pub struct BlockingHandler<F> {
    f: Arc<F>,
    intent: Option<String>,
}

impl<F> BlockingHandler<F>
where
    F: Fn(HandlerInput) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f: Arc::new(f),
            intent: None,
        }
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }
}

impl<F> StepHandler for BlockingHandler<F>
where
    F: Fn(HandlerInput) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    fn intent(&self) -> Option<&str> {
        self.intent.as_deref()
    }

    fn run(&self, input: HandlerInput) -> BoxFuture<'_, Result<Value, HandlerError>> {
        let f = Arc::clone(&self.f);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || f(input))
                .await
                .map_err(|e| HandlerError::Panicked(e.to_string()))?
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Action name -> handler, plus intents for agent-only actions.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    intents: HashMap<String, String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        action: impl Into<String>,
        handler: impl StepHandler + 'static,
    ) -> &mut Self {
        self.handlers.insert(action.into(), Arc::new(handler));
        self
    }

    /// Register or override the intent of an action. Actions with an intent
    /// but no handler can only run in agent mode.
    pub fn describe(&mut self, action: impl Into<String>, intent: impl Into<String>) -> &mut Self {
        self.intents.insert(action.into(), intent.into());
        self
    }

    pub fn get(&self, action: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(action).cloned()
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Intent for an action: an explicit description wins over the
    /// handler's own.
    pub fn intent(&self, action: &str) -> Option<String> {
        self.intents
            .get(action)
            .cloned()
            .or_else(|| self.handlers.get(action)?.intent().map(str::to_string))
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self
            .handlers
            .keys()
            .chain(self.intents.keys())
            .map(String::as_str)
            .collect();
        actions.sort_unstable();
        actions.dedup();
        actions
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("actions", &self.actions())
            .finish()
    }
}
