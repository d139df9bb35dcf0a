//! Bot hooks.
//!
//! Hooks observe every chat message the relay core handles and may answer
//! with messages of their own. They never see sessions; replies go back to
//! the relay core, which delivers them like a local message.

mod builtin;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::chat::{Message, MessageKind};
use crate::{PeerchatError, Result};

pub use builtin::CommandBot;

/// A pluggable message observer.
#[async_trait]
pub trait BotHook: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Handle one chat message from `sender`, returning zero or more replies.
    async fn handle(&self, message: &Message, sender: &str) -> Result<Vec<Message>>;
}

/// Ordered list of hooks with a shared per-hook timeout.
#[derive(Clone)]
pub struct HookChain {
    hooks: Vec<Arc<dyn BotHook>>,
    timeout: Duration,
}

impl HookChain {
    /// Create an empty chain.
    pub fn new(timeout: Duration) -> Self {
        Self {
            hooks: Vec::new(),
            timeout,
        }
    }

    /// Append a hook. Hooks run in registration order.
    pub fn register(&mut self, hook: Arc<dyn BotHook>) {
        debug!("Registered bot hook '{}'", hook.name());
        self.hooks.push(hook);
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with_hook(mut self, hook: Arc<dyn BotHook>) -> Self {
        self.register(hook);
        self
    }

    /// Get the number of hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Check if the chain has no hooks.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Get hook names in order.
    pub fn names(&self) -> Vec<String> {
        self.hooks.iter().map(|h| h.name().to_string()).collect()
    }

    /// Get the per-hook timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run every hook on a message and collect their replies.
    ///
    /// A hook that times out, fails or panics is logged and skipped; the
    /// remaining hooks still run. Replies of kind `Command` are discarded.
    pub async fn run(&self, message: &Message) -> Vec<Message> {
        let mut replies = Vec::new();

        for hook in &self.hooks {
            match run_hook(Arc::clone(hook), message.clone(), self.timeout).await {
                Ok(out) => replies.extend(out.into_iter().filter(|reply| {
                    if reply.kind == MessageKind::Command {
                        debug!("Discarding command reply from hook '{}'", hook.name());
                        return false;
                    }
                    true
                })),
                Err(e) => warn!("Skipping bot hook: {}", e),
            }
        }

        replies
    }
}

impl std::fmt::Debug for HookChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookChain")
            .field("hooks", &self.names())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Run a single hook in its own task, bounded by `timeout`.
pub async fn run_hook(
    hook: Arc<dyn BotHook>,
    message: Message,
    timeout: Duration,
) -> Result<Vec<Message>> {
    let name = hook.name().to_string();
    let mut handle = tokio::spawn(async move {
        let sender = message.sender.clone();
        hook.handle(&message, &sender).await
    });

    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(result)) => result.map_err(|e| PeerchatError::Hook {
            name,
            reason: e.to_string(),
        }),
        Ok(Err(join_err)) => Err(PeerchatError::Hook {
            name,
            reason: if join_err.is_panic() {
                "panicked".to_string()
            } else {
                join_err.to_string()
            },
        }),
        Err(_) => {
            handle.abort();
            Err(PeerchatError::HandlerTimeout(name))
        }
    }
}
