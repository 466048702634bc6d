use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::providers::{Provider, ProviderError, WorkItem};
use crate::runtime::{OrchestrationInstance, OrchestrationStatus};

/// Polling interval of [`Client::wait_for_orchestration`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Why [`Client::wait_for_orchestration`] returned without a terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Provider(ProviderError),
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Timeout => f.write_str("timed out waiting for orchestration"),
            WaitError::Provider(e) => write!(f, "provider error while waiting: {e}"),
        }
    }
}

impl std::error::Error for WaitError {}

impl From<ProviderError> for WaitError {
    fn from(e: ProviderError) -> Self {
        WaitError::Provider(e)
    }
}

/// Thin client for control-plane operations.
///
/// Talks to the runtime only through the shared provider: starts and
/// termination requests are enqueued, status is read back from history.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Provider>,
}

impl Client {
    /// Create a client bound to a provider instance.
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store }
    }

    /// Start an orchestration instance under a caller-chosen id.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ProviderError> {
        let item = WorkItem::StartOrchestration {
            instance: instance.to_string(),
            orchestration: orchestration.to_string(),
            input: input.into(),
        };
        self.store.enqueue_orchestrator_work(item).await
    }

    /// Start an orchestration instance under a fresh id and return the id.
    /// Does not wait for the first turn.
    pub async fn start_new(&self, orchestration: &str, input: impl Into<String>) -> Result<String, ProviderError> {
        let instance = uuid::Uuid::new_v4().simple().to_string();
        self.start_orchestration(&instance, orchestration, input).await?;
        tracing::info!(
            target: "durable_fanout::client",
            instance_id = %instance,
            orchestration_name = %orchestration,
            "Started orchestration"
        );
        Ok(instance)
    }

    /// Request termination. Dispatch of further activities stops; calls
    /// already running finish and their results are ignored.
    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ProviderError> {
        let item = WorkItem::TerminateInstance {
            instance: instance.to_string(),
            reason: reason.into(),
        };
        self.store.enqueue_orchestrator_work(item).await
    }

    /// Current status derived from history. Unknown ids are `NotFound`.
    pub async fn get_orchestration_status(&self, instance: &str) -> Result<OrchestrationStatus, ProviderError> {
        if self.store.get_instance_info(instance).await?.is_none() {
            return Ok(OrchestrationStatus::NotFound);
        }
        let history = self.store.read(instance).await?;
        Ok(OrchestrationStatus::from_history(&history))
    }

    /// Full view of an instance including its history.
    pub async fn get_instance(&self, instance: &str) -> Result<Option<OrchestrationInstance>, ProviderError> {
        let Some(info) = self.store.get_instance_info(instance).await? else {
            return Ok(None);
        };
        let history = self.store.read(instance).await?;
        let status = OrchestrationStatus::from_history(&history);
        let output = match &status {
            OrchestrationStatus::Completed { output } => Some(output.clone()),
            _ => None,
        };
        Ok(Some(OrchestrationInstance {
            instance_id: info.instance,
            orchestration: info.orchestration,
            status,
            output,
            created_at_ms: info.created_at_ms,
            history,
        }))
    }

    pub async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        self.store.list_instances().await
    }

    /// Poll until the instance reaches a terminal status or `timeout` passes.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.get_orchestration_status(instance).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}
