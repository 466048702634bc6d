//! Worker (activity) dispatcher implementation for Runtime
//!
//! This module contains the worker dispatcher logic that:
//! - Spawns concurrent activity workers
//! - Fetches and executes activity work items
//! - Acks each execution together with its completion or failure

use crate::providers::WorkItem;
use crate::{ActivityContext, AppErrorKind, ConfigErrorKind, ErrorDetails, Event};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use super::super::Runtime;

/// How one activity execution ended.
enum ActivityOutcome {
    Success(String),
    AppError(ErrorDetails),
    ConfigError(ErrorDetails),
}

impl ActivityOutcome {
    fn label(&self) -> &'static str {
        match self {
            ActivityOutcome::Success(_) => "success",
            ActivityOutcome::AppError(_) => "app_error",
            ActivityOutcome::ConfigError(_) => "system_error",
        }
    }

    fn into_completion(self, instance: String, sequence_id: u64) -> WorkItem {
        match self {
            ActivityOutcome::Success(result) => WorkItem::ActivityCompleted {
                instance,
                sequence_id,
                result,
            },
            ActivityOutcome::AppError(details) | ActivityOutcome::ConfigError(details) => WorkItem::ActivityFailed {
                instance,
                sequence_id,
                details,
            },
        }
    }
}

impl Runtime {
    /// Start the worker dispatcher with N concurrent workers for executing activities
    pub(in crate::runtime) fn start_work_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.worker_concurrency.max(1);
        let shutdown = self.shutdown_flag.clone();

        tokio::spawn(async move {
            let mut worker_handles = Vec::new();

            for worker_idx in 0..concurrency {
                let rt = self.clone();
                let shutdown = shutdown.clone();
                // Generate unique worker ID: work-{index}-{runtime_id}
                let worker_id = format!("work-{}-{}", worker_idx, rt.runtime_id);
                let handle = tokio::spawn(async move {
                    loop {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        match rt.history_store.fetch_work_item().await {
                            Ok(Some((item, token))) => rt.process_work_item(item, &token, &worker_id).await,
                            Ok(None) => tokio::time::sleep(rt.idle_sleep()).await,
                            Err(e) => {
                                warn!(
                                    target: "durable_fanout::runtime",
                                    worker_id = %worker_id,
                                    error = %e,
                                    "fetch_work_item failed"
                                );
                                tokio::time::sleep(rt.idle_sleep()).await;
                            }
                        }
                    }
                });
                worker_handles.push(handle);
            }

            for handle in worker_handles {
                let _ = handle.await;
            }
        })
    }

    async fn process_work_item(&self, item: WorkItem, token: &str, worker_id: &str) {
        let kind = item.kind();
        let WorkItem::ActivityExecute {
            instance,
            sequence_id,
            name,
            input,
        } = item
        else {
            error!(target: "durable_fanout::runtime", kind, "unexpected item on worker queue");
            if let Err(e) = self.history_store.ack_work_item(token, None).await {
                warn!(target: "durable_fanout::runtime", error = %e, "failed to drop unexpected worker item");
            }
            return;
        };

        // A closed instance accepts no more work.
        match self.history_store.read(&instance).await {
            Ok(history) if history.iter().any(Event::is_terminal) => {
                tracing::debug!(
                    target: "durable_fanout::runtime",
                    instance_id = %instance,
                    sequence_id,
                    activity_name = %name,
                    "skipping activity for closed instance"
                );
                if let Err(e) = self.history_store.ack_work_item(token, None).await {
                    warn!(
                        target: "durable_fanout::runtime",
                        instance_id = %instance,
                        error = %e,
                        "failed to drop activity"
                    );
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    target: "durable_fanout::runtime",
                    instance_id = %instance,
                    error = %e,
                    "history read failed, retrying activity later"
                );
                if let Err(e) = self.history_store.abandon_work_item(token).await {
                    error!(
                        target: "durable_fanout::runtime",
                        instance_id = %instance,
                        sequence_id,
                        worker_id = %worker_id,
                        error = %e,
                        "failed to abandon activity"
                    );
                }
                tokio::time::sleep(self.idle_sleep()).await;
                return;
            }
        }

        tracing::debug!(
            target: "durable_fanout::runtime",
            instance_id = %instance,
            sequence_id,
            activity_name = %name,
            worker_id = %worker_id,
            "Activity started"
        );
        let start_time = Instant::now();
        let ctx = ActivityContext::new(instance.clone(), sequence_id, name.clone(), worker_id);
        let outcome = self.run_activity(ctx, &name, input).await;
        let duration_ms = start_time.elapsed().as_millis() as u64;

        match &outcome {
            ActivityOutcome::Success(result) => tracing::debug!(
                target: "durable_fanout::runtime",
                instance_id = %instance,
                sequence_id,
                activity_name = %name,
                worker_id = %worker_id,
                outcome = outcome.label(),
                duration_ms,
                result_size = result.len(),
                "Activity completed"
            ),
            ActivityOutcome::AppError(details) => warn!(
                target: "durable_fanout::runtime",
                instance_id = %instance,
                sequence_id,
                activity_name = %name,
                worker_id = %worker_id,
                outcome = outcome.label(),
                duration_ms,
                error = %details,
                "Activity failed (application error)"
            ),
            ActivityOutcome::ConfigError(details) => error!(
                target: "durable_fanout::runtime",
                instance_id = %instance,
                sequence_id,
                activity_name = %name,
                worker_id = %worker_id,
                outcome = outcome.label(),
                duration_ms,
                error = %details,
                "Activity failed (configuration error)"
            ),
        }

        let completion = outcome.into_completion(instance.clone(), sequence_id);
        if let Err(e) = self.history_store.ack_work_item(token, Some(completion)).await {
            // The execution stays locked in memory; durable providers redeliver it on restart.
            error!(
                target: "durable_fanout::runtime",
                instance_id = %instance,
                sequence_id,
                worker_id = %worker_id,
                error = %e,
                "failed to ack activity completion"
            );
        }
    }

    /// Run the handler on its own task so a panic or a deadline cannot take the worker down.
    async fn run_activity(&self, ctx: ActivityContext, name: &str, input: String) -> ActivityOutcome {
        let Some(handler) = self.activity_registry.get(name) else {
            return ActivityOutcome::ConfigError(ErrorDetails::Configuration {
                kind: ConfigErrorKind::UnregisteredActivity,
                resource: name.to_string(),
                message: None,
            });
        };

        let mut task = tokio::spawn(async move { handler.invoke(ctx, input).await });
        let joined = match self.options.activity_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return ActivityOutcome::AppError(ErrorDetails::Application {
                        kind: AppErrorKind::ActivityTimeout,
                        message: format!("{name} exceeded {}ms", limit.as_millis()),
                        retryable: false,
                    });
                }
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(result)) => ActivityOutcome::Success(result),
            Ok(Err(message)) => ActivityOutcome::AppError(ErrorDetails::activity_failed(message)),
            Err(join_err) => {
                ActivityOutcome::AppError(ErrorDetails::activity_failed(format!("{name} panicked: {join_err}")))
            }
        }
    }
}
