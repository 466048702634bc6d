use crate::providers::WorkItem;
use crate::runtime::OrchestrationHandler;
use crate::{Action, ErrorDetails, Event, Interrupt, OrchestrationContext};
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of executing an orchestration turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnResult {
    /// Turn completed successfully, orchestration continues
    Continue,
    /// Orchestration completed with output
    Completed(String),
    /// Orchestration failed with error details
    Failed(ErrorDetails),
    /// Orchestration was terminated by request
    Terminated(String),
}

/// Replays history and executes one deterministic orchestration evaluation
pub struct ReplayEngine {
    /// Instance identifier
    pub(crate) instance: String,
    /// History events generated during this run
    pub(crate) history_delta: Vec<Event>,
    /// Actions to dispatch after persistence
    pub(crate) pending_actions: Vec<Action>,
    /// Current history at start of run
    pub(crate) baseline_history: Vec<Event>,
    /// Unified error collector for system-level errors that abort the turn
    pub(crate) abort_error: Option<ErrorDetails>,
    pub(crate) terminate_reason: Option<String>,
}

impl ReplayEngine {
    /// Create a new replay engine for an instance
    pub fn new(instance: impl Into<String>, baseline_history: Vec<Event>) -> Self {
        Self {
            instance: instance.into(),
            history_delta: Vec::new(),
            pending_actions: Vec::new(),
            baseline_history,
            abort_error: None,
            terminate_reason: None,
        }
    }

    /// Record `OrchestrationStarted` if the history does not have one yet.
    pub fn start(&mut self, name: &str, input: &str, started_at_ms: u64) {
        let started = self
            .working_history()
            .any(|e| matches!(e, Event::OrchestrationStarted { .. }));
        if !started {
            self.history_delta.push(Event::OrchestrationStarted {
                name: name.to_string(),
                input: input.to_string(),
                started_at_ms,
            });
        }
    }

    fn working_history(&self) -> impl Iterator<Item = &Event> {
        self.baseline_history.iter().chain(self.history_delta.iter())
    }

    fn is_terminal(&self) -> bool {
        self.working_history().any(Event::is_terminal)
    }

    /// Stage 1: Convert completion messages directly to events
    pub fn prep_completions(&mut self, messages: Vec<WorkItem>) {
        debug!(
            instance = %self.instance,
            message_count = messages.len(),
            "converting messages to events"
        );
        if self.is_terminal() {
            debug!(instance = %self.instance, dropped = messages.len(), "history is closed, dropping messages");
            return;
        }

        let scheduled: HashSet<u64> = self
            .working_history()
            .filter(|e| matches!(e, Event::ActivityScheduled { .. }))
            .filter_map(Event::sequence_id)
            .collect();
        let mut resolved: HashSet<u64> = self
            .working_history()
            .filter(|e| e.is_activity_resolution())
            .filter_map(Event::sequence_id)
            .collect();

        for msg in messages {
            let event = match msg {
                WorkItem::ActivityCompleted { sequence_id, result, .. } => {
                    Event::ActivityCompleted { sequence_id, result }
                }
                WorkItem::ActivityFailed { sequence_id, details, .. } => Event::ActivityFailed { sequence_id, details },
                WorkItem::TerminateInstance { reason, .. } => {
                    if self.terminate_reason.is_none() && !self.is_terminal() {
                        self.history_delta.push(Event::OrchestrationTerminated { reason: reason.clone() });
                        self.terminate_reason = Some(reason);
                    }
                    continue;
                }
                WorkItem::StartOrchestration { .. } => {
                    // Replay trigger only; the instance already exists.
                    continue;
                }
                other @ WorkItem::ActivityExecute { .. } => {
                    warn!(
                        instance = %self.instance,
                        kind = other.kind(),
                        "ignoring worker message on orchestrator queue"
                    );
                    continue;
                }
            };

            let Some(sequence_id) = event.sequence_id() else {
                continue;
            };
            if !scheduled.contains(&sequence_id) {
                warn!(instance = %self.instance, sequence_id, "completion has no matching schedule");
                if self.abort_error.is_none() {
                    self.abort_error = Some(ErrorDetails::nondeterminism(format!(
                        "completion for sequence_id={sequence_id} has no matching ActivityScheduled"
                    )));
                }
                continue;
            }
            if !resolved.insert(sequence_id) {
                warn!(instance = %self.instance, sequence_id, "ignoring duplicate completion");
                continue;
            }
            if let Event::ActivityFailed { details, .. } = &event {
                if details.is_fatal() && self.abort_error.is_none() {
                    self.abort_error = Some(details.clone());
                }
            }
            self.history_delta.push(event);
        }
    }

    /// Stage 2: Run the orchestrator over baseline plus staged events.
    ///
    /// On `Continue` the delta gains the new schedules and `pending_actions`
    /// holds their dispatch commands. Terminal outcomes leave both untouched;
    /// the caller records the terminal event.
    pub fn execute_orchestration(&mut self, handler: Arc<dyn OrchestrationHandler>, input: &str) -> TurnResult {
        debug!(
            instance = %self.instance,
            "executing orchestration turn"
        );
        if let Some(reason) = self.terminate_reason.clone() {
            return TurnResult::Terminated(reason);
        }
        // Check abort_error FIRST - before running user code
        if let Some(err) = self.abort_error.clone() {
            return TurnResult::Failed(err);
        }

        let working_history: Vec<Event> = self.working_history().cloned().collect();
        let recorded = recorded_result(&working_history);
        let mut ctx = match OrchestrationContext::from_history(self.instance.clone(), &working_history) {
            Ok(ctx) => ctx,
            Err(details) => return recorded.unwrap_or(TurnResult::Failed(details)),
        };

        let run_result = catch_unwind(AssertUnwindSafe(|| handler.invoke(&mut ctx, input)));
        let outcome = match run_result {
            Ok(outcome) => outcome,
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "orchestration panicked".to_string()
                };
                return recorded.unwrap_or(TurnResult::Failed(ErrorDetails::Application {
                    kind: crate::AppErrorKind::OrchestrationFailed,
                    message: msg,
                    retryable: false,
                }));
            }
        };

        // Replaying a closed history must reproduce it, never extend it.
        if let Some(recorded) = recorded {
            if !ctx.new_events().is_empty() || matches!(outcome, Err(Interrupt::Suspended)) {
                warn!(instance = %self.instance, "replay of completed history diverged; keeping recorded result");
            }
            return recorded;
        }

        let unclaimed = ctx.unclaimed_schedules();
        if unclaimed > 0 && !matches!(outcome, Err(Interrupt::Failed(_))) {
            return TurnResult::Failed(ErrorDetails::nondeterminism(format!(
                "orchestration stopped after {} of {} recorded schedules",
                ctx.claimed_schedules(),
                ctx.claimed_schedules() + unclaimed
            )));
        }

        match outcome {
            Ok(output) => {
                if !ctx.pending_actions().is_empty() {
                    debug!(
                        instance = %self.instance,
                        dropped = ctx.pending_actions().len(),
                        "dropping calls scheduled by a completing orchestration"
                    );
                }
                TurnResult::Completed(output)
            }
            Err(Interrupt::Failed(details)) => TurnResult::Failed(details),
            Err(Interrupt::Suspended) => {
                let (events, actions) = ctx.into_delta();
                self.history_delta.extend(events);
                self.pending_actions = actions;
                TurnResult::Continue
            }
        }
    }

    /// Dispatch commands of this turn as worker queue items.
    pub fn worker_items(&self) -> Vec<WorkItem> {
        self.pending_actions
            .iter()
            .map(|action| match action {
                Action::CallActivity {
                    sequence_id,
                    name,
                    input,
                } => WorkItem::ActivityExecute {
                    instance: self.instance.clone(),
                    sequence_id: *sequence_id,
                    name: name.clone(),
                    input: input.clone(),
                },
            })
            .collect()
    }
}

/// Terminal result already recorded in `history`, if any.
fn recorded_result(history: &[Event]) -> Option<TurnResult> {
    history.iter().find_map(|e| match e {
        Event::OrchestrationCompleted { output } => Some(TurnResult::Completed(output.clone())),
        Event::OrchestrationFailed { details } => Some(TurnResult::Failed(details.clone())),
        Event::OrchestrationTerminated { reason } => Some(TurnResult::Terminated(reason.clone())),
        _ => None,
    })
}

impl ReplayEngine {
    // Getter methods for atomic execution
    pub fn history_delta(&self) -> &[Event] {
        &self.history_delta
    }

    pub fn pending_actions(&self) -> &[Action] {
        &self.pending_actions
    }

    /// Check if this run made any progress (added history)
    pub fn made_progress(&self) -> bool {
        !self.history_delta.is_empty()
    }

    /// Append the event that closes the history for `result`.
    pub fn record_terminal(&mut self, result: &TurnResult) {
        if self.is_terminal() {
            return;
        }
        let event = match result {
            TurnResult::Continue => return,
            TurnResult::Completed(output) => Event::OrchestrationCompleted { output: output.clone() },
            TurnResult::Failed(details) => Event::OrchestrationFailed { details: details.clone() },
            TurnResult::Terminated(reason) => Event::OrchestrationTerminated { reason: reason.clone() },
        };
        self.pending_actions.clear();
        self.history_delta.push(event);
    }

    /// Get the final history after this run
    pub fn final_history(&self) -> Vec<Event> {
        self.working_history().cloned().collect()
    }
}

// Include comprehensive tests
#[cfg(test)]
#[path = "replay_engine_tests.rs"]
mod replay_engine_tests;
