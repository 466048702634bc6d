//! In-process runtime: orchestration and worker dispatchers over a `Provider`.
use crate::providers::Provider;
use crate::{OrchestrationContext, Step};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

mod dispatchers;
pub mod registry;
pub mod replay_engine;
mod status;

pub use registry::{ActivityRegistry, OrchestrationRegistry};
pub use status::{OrchestrationInstance, OrchestrationStatus};

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Polling interval in milliseconds when dispatcher queues are empty.
    /// Default: 10ms
    pub dispatcher_idle_sleep_ms: u64,
    /// Number of orchestration dispatcher tasks. Different instances replay
    /// concurrently; one instance never replays on two tasks at once.
    pub orchestration_concurrency: usize,
    /// Number of activity worker tasks.
    pub worker_concurrency: usize,
    /// Per-activity deadline. Expiry is recorded as an application failure
    /// (`AppErrorKind::ActivityTimeout`), not an engine fault.
    pub activity_timeout: Option<Duration>,
    /// How long `shutdown()` waits for dispatchers before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 10,
            orchestration_concurrency: 2,
            worker_concurrency: 8,
            activity_timeout: None,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Orchestrator code invoked on every replay pass.
///
/// Implementations must be deterministic: same input and same recorded
/// outcomes, same sequence of `schedule_activity` calls.
pub trait OrchestrationHandler: Send + Sync {
    fn invoke(&self, ctx: &mut OrchestrationContext, input: &str) -> Step<String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F>(pub F)
where
    F: Fn(&mut OrchestrationContext, &str) -> Step<String> + Send + Sync + 'static;

impl<F> OrchestrationHandler for FnOrchestration<F>
where
    F: Fn(&mut OrchestrationContext, &str) -> Step<String> + Send + Sync + 'static,
{
    fn invoke(&self, ctx: &mut OrchestrationContext, input: &str) -> Step<String> {
        (self.0)(ctx, input)
    }
}

/// A unit of side-effecting work. Runs at least once per scheduled call.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `ActivityHandler`.
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Correlation data handed to an activity execution.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    instance: String,
    sequence_id: u64,
    activity_name: String,
    worker_id: String,
}

impl ActivityContext {
    pub fn new(
        instance: impl Into<String>,
        sequence_id: u64,
        activity_name: impl Into<String>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            instance: instance.into(),
            sequence_id,
            activity_name: activity_name.into(),
            worker_id: worker_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        tracing::info!(
            target: "durable_fanout::activity",
            instance_id = %self.instance,
            sequence_id = self.sequence_id,
            activity_name = %self.activity_name,
            worker_id = %self.worker_id,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        tracing::warn!(
            target: "durable_fanout::activity",
            instance_id = %self.instance,
            sequence_id = self.sequence_id,
            activity_name = %self.activity_name,
            worker_id = %self.worker_id,
            "{}",
            message.as_ref()
        );
    }
}

/// In-process runtime that executes orchestrations and activities and
/// persists history via a `Provider`.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn Provider>,
    orchestration_registry: OrchestrationRegistry,
    activity_registry: ActivityRegistry,
    options: RuntimeOptions,
    shutdown_flag: Arc<AtomicBool>,
    runtime_id: String,
}

impl Runtime {
    /// Start a new runtime with default options.
    pub async fn start_with_store(
        history_store: Arc<dyn Provider>,
        activity_registry: ActivityRegistry,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    /// Start a new runtime with custom options.
    pub async fn start_with_options(
        history_store: Arc<dyn Provider>,
        activity_registry: ActivityRegistry,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        let runtime_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            history_store,
            orchestration_registry,
            activity_registry,
            options,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            runtime_id,
        });

        let orch_handle = runtime.clone().start_orchestration_dispatcher();
        let work_handle = runtime.clone().start_work_dispatcher();
        runtime.joins.lock().await.extend([orch_handle, work_handle]);
        debug!(
            target: "durable_fanout::runtime",
            runtime_id = %runtime.runtime_id,
            orchestrations = runtime.orchestration_registry.count(),
            activities = runtime.activity_registry.count(),
            "runtime started"
        );
        runtime
    }

    /// Stop the dispatchers. Activities still running after the grace period
    /// are aborted; their work items are redelivered by durable providers on
    /// the next start.
    pub async fn shutdown(self: Arc<Self>) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        let joins = std::mem::take(&mut *self.joins.lock().await);
        for mut handle in joins {
            if tokio::time::timeout(self.options.shutdown_grace, &mut handle).await.is_err() {
                warn!(
                    target: "durable_fanout::runtime",
                    runtime_id = %self.runtime_id,
                    "dispatcher did not stop in time, aborting"
                );
                handle.abort();
            }
        }
        debug!(target: "durable_fanout::runtime", runtime_id = %self.runtime_id, "runtime stopped");
    }

    fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.options.dispatcher_idle_sleep_ms)
    }
}
