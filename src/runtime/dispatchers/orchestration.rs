//! Orchestration dispatcher implementation for Runtime
//!
//! This module contains the orchestration dispatcher logic that:
//! - Spawns concurrent orchestration workers
//! - Fetches and processes orchestration items from the queue
//! - Handles orchestration execution and atomic commits

use crate::providers::{now_ms, OrchestrationItem, WorkItem};
use crate::runtime::replay_engine::{ReplayEngine, TurnResult};
use crate::runtime::{FnOrchestration, OrchestrationHandler};
use crate::{ConfigErrorKind, ErrorDetails, Event, Interrupt};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::super::Runtime;

impl Runtime {
    /// Start the orchestration dispatcher with N concurrent workers
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        // Instance-level locking in provider prevents concurrent processing of same instance
        let concurrency = self.options.orchestration_concurrency.max(1);
        let shutdown = self.shutdown_flag.clone();

        tokio::spawn(async move {
            let mut worker_handles = Vec::new();

            for worker_idx in 0..concurrency {
                let rt = Arc::clone(&self);
                let shutdown = Arc::clone(&shutdown);
                // Generate unique worker ID: orch-{index}-{runtime_id}
                let worker_id = format!("orch-{worker_idx}-{}", rt.runtime_id);
                let handle = tokio::spawn(async move {
                    loop {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        match rt.history_store.fetch_orchestration_item().await {
                            Ok(Some(item)) => rt.process_orchestration_item(item, &worker_id).await,
                            Ok(None) => tokio::time::sleep(rt.idle_sleep()).await,
                            Err(e) => {
                                warn!(
                                    target: "durable_fanout::runtime::dispatchers::orchestration",
                                    worker_id = %worker_id,
                                    error = %e,
                                    "fetch_orchestration_item failed"
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

    fn resolve_orchestration(&self, name: &str) -> Arc<dyn OrchestrationHandler> {
        if let Some(handler) = self.orchestration_registry.get(name) {
            return handler;
        }
        let name = name.to_string();
        Arc::new(FnOrchestration(move |_ctx: &mut crate::OrchestrationContext, _input: &str| {
            Err(Interrupt::Failed(ErrorDetails::Configuration {
                kind: ConfigErrorKind::UnregisteredOrchestration,
                resource: name.clone(),
                message: None,
            }))
        }))
    }

    /// Run one replay turn for a locked instance and commit its outcome.
    async fn process_orchestration_item(&self, item: OrchestrationItem, worker_id: &str) {
        let OrchestrationItem {
            instance,
            orchestration,
            input,
            history,
            messages,
            lock_token,
        } = item;

        if history.iter().any(Event::is_terminal) {
            tracing::debug!(
                target: "durable_fanout::runtime::dispatchers::orchestration",
                instance_id = %instance,
                dropped = messages.len(),
                "instance is closed, dropping messages"
            );
            if let Err(e) = self.history_store.ack_orchestration_item(&lock_token, Vec::new(), Vec::new()).await {
                warn!(
                    target: "durable_fanout::runtime::dispatchers::orchestration",
                    instance_id = %instance,
                    error = %e,
                    "ack failed"
                );
            }
            return;
        }

        let mut engine = ReplayEngine::new(instance.clone(), history);
        engine.start(&orchestration, &input, now_ms());
        engine.prep_completions(messages);
        let handler = self.resolve_orchestration(&orchestration);
        let result = engine.execute_orchestration(handler, &input);
        engine.record_terminal(&result);

        match &result {
            TurnResult::Continue => tracing::debug!(
                target: "durable_fanout::runtime::dispatchers::orchestration",
                instance_id = %instance,
                worker_id = %worker_id,
                new_events = engine.history_delta().len(),
                dispatched = engine.pending_actions().len(),
                "Orchestration turn finished"
            ),
            TurnResult::Completed(output) => info!(
                target: "durable_fanout::runtime::dispatchers::orchestration",
                instance_id = %instance,
                orchestration_name = %orchestration,
                worker_id = %worker_id,
                output_size = output.len(),
                "Orchestration completed"
            ),
            TurnResult::Failed(details) => warn!(
                target: "durable_fanout::runtime::dispatchers::orchestration",
                instance_id = %instance,
                orchestration_name = %orchestration,
                worker_id = %worker_id,
                error_type = details.category(),
                error = %details,
                "Orchestration failed"
            ),
            TurnResult::Terminated(reason) => info!(
                target: "durable_fanout::runtime::dispatchers::orchestration",
                instance_id = %instance,
                orchestration_name = %orchestration,
                worker_id = %worker_id,
                reason = %reason,
                "Orchestration terminated"
            ),
        }

        let worker_items = engine.worker_items();
        self.commit_turn(&instance, &lock_token, engine.history_delta().to_vec(), worker_items)
            .await;
    }

    /// Persist a turn. Transient provider errors put the messages back for a
    /// later turn; a permanent one fails the instance.
    async fn commit_turn(&self, instance: &str, lock_token: &str, delta: Vec<Event>, worker_items: Vec<WorkItem>) {
        let err = match self
            .history_store
            .ack_orchestration_item(lock_token, delta, worker_items)
            .await
        {
            Ok(()) => return,
            Err(e) => e,
        };

        if err.is_retryable() {
            warn!(
                target: "durable_fanout::runtime::dispatchers::orchestration",
                instance_id = %instance,
                error = %err,
                "commit failed, abandoning turn for retry"
            );
            if let Err(e) = self.history_store.abandon_orchestration_item(lock_token).await {
                error!(
                    target: "durable_fanout::runtime::dispatchers::orchestration",
                    instance_id = %instance,
                    error = %e,
                    "abandon failed"
                );
            }
            tokio::time::sleep(self.idle_sleep()).await;
            return;
        }

        error!(
            target: "durable_fanout::runtime::dispatchers::orchestration",
            instance_id = %instance,
            error = %err,
            "commit failed permanently, failing instance"
        );
        let failure = vec![Event::OrchestrationFailed {
            details: err.to_infrastructure_error(),
        }];
        if let Err(e) = self
            .history_store
            .ack_orchestration_item(lock_token, failure, Vec::new())
            .await
        {
            error!(
                target: "durable_fanout::runtime::dispatchers::orchestration",
                instance_id = %instance,
                error = %e,
                "could not record instance failure"
            );
        }
    }
}
