//! [`AgentRunner`] — the long-running, cancellable conversational-agent
//! collaborator the Scheduler invokes for every dispatched run (§6.3).

use crate::context::ContextRef;
use crate::task::{CtxDeepSearch, CtxMode};
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// `{system_prompt, prompt, attachments, ctx_planning, ctx_reasoning,
/// ctx_deep_search, context_ref}` (§6.3).
#[derive(Debug, Clone)]
pub struct PromptBundle {
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub attachments: Vec<PathBuf>,
    pub ctx_planning: CtxMode,
    pub ctx_reasoning: CtxMode,
    pub ctx_deep_search: CtxDeepSearch,
    pub context_ref: ContextRef,
}

#[derive(Debug, Error, Clone)]
#[error("agent run failed: {message}")]
pub struct AgentError {
    pub message: String,
}

/// A collaborator capable of running one conversational-agent turn. The
/// Scheduler treats a run as cancellable: it is expected to race `run`
/// against `cancel_token` and return promptly once cancellation is requested,
/// rather than relying on the caller to drop the future (§4.6 step 3).
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, bundle: PromptBundle, cancel_token: CancellationToken) -> Result<String, AgentError>;
}

/// Exposed to integration tests (which compile the crate as an ordinary
/// dependency, without `--cfg test`) via the `test-support` feature in
/// addition to in-crate unit tests.
#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A scripted [`AgentRunner`] for scenario tests: returns queued results in
    /// order, racing each one against cancellation like a real runner would.
    pub struct ScriptedAgentRunner {
        outcomes: Vec<Result<String, AgentError>>,
        calls: AtomicUsize,
    }

    impl ScriptedAgentRunner {
        pub fn new(outcomes: Vec<Result<String, AgentError>>) -> Self {
            ScriptedAgentRunner { outcomes, calls: AtomicUsize::new(0) }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AgentRunner for ScriptedAgentRunner {
        async fn run(&self, _bundle: PromptBundle, cancel_token: CancellationToken) -> Result<String, AgentError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = cancel_token.cancelled() => Err(AgentError { message: "cancelled".into() }),
                outcome = async { self.outcomes.get(index).cloned().unwrap_or(Ok(String::new())) } => outcome,
            }
        }
    }
}
