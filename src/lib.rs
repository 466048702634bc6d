//! # durable-fanout
//!
//! A replay-driven durable orchestration engine with a throttled
//! fan-out/fan-in batch scheduler on top.
//!
//! Orchestrator code is an ordinary synchronous function over an
//! [`OrchestrationContext`]. Every time new history arrives the runtime runs
//! the function again from the top. Activity calls already recorded in the
//! history resolve immediately from their recorded outcome; calls that are not
//! yet resolved stop the function with [`Interrupt::Suspended`], and the
//! runtime resumes it by replaying once the next completion is appended.
//!
//! ```rust
//! use durable_fanout::{Event, Interrupt, OrchestrationContext};
//!
//! fn greet(ctx: &mut OrchestrationContext, input: &str) -> Result<String, Interrupt> {
//!     let call = ctx.schedule_activity("Greet", input)?;
//!     let outcomes = ctx.join(&[call])?;
//!     Ok(outcomes[0].clone().unwrap_or_else(|e| e.display_message()))
//! }
//!
//! // First pass: the call is scheduled and the orchestrator suspends.
//! let mut ctx = OrchestrationContext::from_history("inst-1", &[]).unwrap();
//! assert_eq!(greet(&mut ctx, "Rust"), Err(Interrupt::Suspended));
//! assert_eq!(ctx.pending_actions().len(), 1);
//!
//! // Replay with the completion recorded: no new dispatch, the output is ready.
//! let history = vec![
//!     Event::ActivityScheduled { sequence_id: 1, name: "Greet".into(), input: "Rust".into() },
//!     Event::ActivityCompleted { sequence_id: 1, result: "Hello, Rust!".into() },
//! ];
//! let mut ctx = OrchestrationContext::from_history("inst-1", &history).unwrap();
//! assert_eq!(greet(&mut ctx, "Rust").unwrap(), "Hello, Rust!");
//! assert!(ctx.pending_actions().is_empty());
//! ```
//!
//! ## Determinism
//!
//! Orchestrator code must not perform I/O, sample randomness or read the wall
//! clock. Use [`OrchestrationContext::current_time_ms`] and
//! [`OrchestrationContext::new_guid`], and log through the replay-safe
//! [`durable_info!`] family of macros. Breaking this rule is not caught at
//! runtime unless it changes the order of scheduled activities, in which case
//! the instance fails with a nondeterminism error.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub mod activities;
pub mod client;
pub mod config;
pub mod logging;
pub mod orchestrations;
pub mod providers;
pub mod runtime;
pub mod server;

pub use client::Client;
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry};
pub use runtime::{
    ActivityContext, ActivityHandler, OrchestrationHandler, OrchestrationInstance, OrchestrationStatus, Runtime,
    RuntimeOptions,
};

/// Sequence id assigned to the first activity an orchestration schedules.
pub const INITIAL_SEQUENCE_ID: u64 = 1;

/// One entry of an instance's append-only history.
///
/// Activity events are correlated by `sequence_id`, the position of the
/// scheduling call in the orchestrator's deterministic call order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// First event of every history. `started_at_ms` is the clock value the
    /// orchestrator observes through `current_time_ms()`.
    OrchestrationStarted { name: String, input: String, started_at_ms: u64 },
    ActivityScheduled { sequence_id: u64, name: String, input: String },
    ActivityCompleted { sequence_id: u64, result: String },
    ActivityFailed { sequence_id: u64, details: ErrorDetails },
    OrchestrationCompleted { output: String },
    OrchestrationFailed { details: ErrorDetails },
    OrchestrationTerminated { reason: String },
}

impl Event {
    /// Sequence id for activity events, `None` for orchestration-level events.
    pub fn sequence_id(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { sequence_id, .. }
            | Event::ActivityCompleted { sequence_id, .. }
            | Event::ActivityFailed { sequence_id, .. } => Some(*sequence_id),
            _ => None,
        }
    }

    /// True for the events that close a history.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. }
                | Event::OrchestrationFailed { .. }
                | Event::OrchestrationTerminated { .. }
        )
    }

    /// True for activity completion or failure events.
    pub fn is_activity_resolution(&self) -> bool {
        matches!(self, Event::ActivityCompleted { .. } | Event::ActivityFailed { .. })
    }
}

/// Command emitted by a replay pass for the runtime to carry out after the
/// new history has been persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity { sequence_id: u64, name: String, input: String },
}

/// Failure classification shared by activities, orchestrations and providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category")]
pub enum ErrorDetails {
    /// Recoverable, activity or orchestration level failure.
    Application {
        kind: AppErrorKind,
        message: String,
        retryable: bool,
    },
    /// Invalid configuration, invalid input or a broken replay contract. Fatal.
    Configuration {
        kind: ConfigErrorKind,
        resource: String,
        message: Option<String>,
    },
    /// Provider or runtime plumbing failure.
    Infrastructure {
        operation: String,
        message: String,
        retryable: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppErrorKind {
    ActivityFailed,
    ActivityTimeout,
    OrchestrationFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigErrorKind {
    InvalidConcurrency,
    InvalidInput,
    UnregisteredActivity,
    UnregisteredOrchestration,
    Nondeterminism,
}

impl ErrorDetails {
    pub fn configuration(kind: ConfigErrorKind, resource: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorDetails::Configuration {
            kind,
            resource: resource.into(),
            message: Some(message.into()),
        }
    }

    pub fn nondeterminism(message: impl Into<String>) -> Self {
        Self::configuration(ConfigErrorKind::Nondeterminism, "", message)
    }

    pub fn activity_failed(message: impl Into<String>) -> Self {
        ErrorDetails::Application {
            kind: AppErrorKind::ActivityFailed,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::Application { .. } => "application",
            ErrorDetails::Configuration { .. } => "configuration",
            ErrorDetails::Infrastructure { .. } => "infrastructure",
        }
    }

    /// Configuration and infrastructure errors fail the whole instance.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorDetails::Application { .. })
    }

    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Application { kind, message, .. } => match kind {
                AppErrorKind::ActivityFailed => message.clone(),
                AppErrorKind::ActivityTimeout => format!("timed out: {message}"),
                AppErrorKind::OrchestrationFailed => format!("orchestration failed: {message}"),
            },
            ErrorDetails::Configuration {
                kind,
                resource,
                message,
            } => {
                let label = match kind {
                    ConfigErrorKind::InvalidConcurrency => "invalid concurrency",
                    ConfigErrorKind::InvalidInput => "invalid input",
                    ConfigErrorKind::UnregisteredActivity => "unregistered activity",
                    ConfigErrorKind::UnregisteredOrchestration => "unregistered orchestration",
                    ConfigErrorKind::Nondeterminism => "nondeterministic",
                };
                match (resource.is_empty(), message) {
                    (true, Some(m)) => format!("{label}: {m}"),
                    (false, Some(m)) => format!("{label}: {resource}: {m}"),
                    (false, None) => format!("{label}: {resource}"),
                    (true, None) => label.to_string(),
                }
            }
            ErrorDetails::Infrastructure { operation, message, .. } => {
                format!("infrastructure: {operation}: {message}")
            }
        }
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_message())
    }
}

impl std::error::Error for ErrorDetails {}

/// Why an orchestrator stopped before producing its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interrupt {
    /// Stopped at the first unresolved activity call. The runtime replays the
    /// orchestrator again once more history is available.
    Suspended,
    /// The instance cannot make progress and must fail.
    Failed(ErrorDetails),
}

impl From<ErrorDetails> for Interrupt {
    fn from(details: ErrorDetails) -> Self {
        Interrupt::Failed(details)
    }
}

/// Result type returned by orchestrator code.
pub type Step<T> = Result<T, Interrupt>;

/// Handle to a scheduled activity call, identified by its sequence position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivityHandle {
    sequence_id: u64,
}

impl ActivityHandle {
    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }
}

#[derive(Debug, Clone)]
struct ScheduledCall {
    name: String,
    input: String,
}

/// Replay state handed to orchestrator code for one pass over the history.
#[derive(Debug)]
pub struct OrchestrationContext {
    instance: String,
    /// Calls recorded in history plus calls scheduled during this pass, indexed by `sequence_id - 1`.
    schedules: Vec<ScheduledCall>,
    historical_schedules: usize,
    outcomes: HashMap<u64, Result<String, ErrorDetails>>,
    next_sequence_id: u64,
    started_at_ms: u64,
    terminal_in_history: bool,
    guid_counter: u64,
    new_events: Vec<Event>,
    actions: Vec<Action>,
}

impl OrchestrationContext {
    /// Build the replay state for `history`.
    ///
    /// Fails with a nondeterminism error if the history itself breaks the
    /// sequencing contract: schedules out of order, or a resolution without a
    /// matching schedule.
    pub fn from_history(instance: impl Into<String>, history: &[Event]) -> Result<Self, ErrorDetails> {
        let mut schedules = Vec::new();
        let mut outcomes = HashMap::new();
        let mut started_at_ms = 0;
        let mut terminal_in_history = false;

        for event in history {
            match event {
                Event::OrchestrationStarted { started_at_ms: at, .. } => started_at_ms = *at,
                Event::ActivityScheduled { sequence_id, name, input } => {
                    let expected = schedules.len() as u64 + INITIAL_SEQUENCE_ID;
                    if *sequence_id != expected {
                        return Err(ErrorDetails::nondeterminism(format!(
                            "history corruption: ActivityScheduled sequence_id={sequence_id}, expected {expected}"
                        )));
                    }
                    schedules.push(ScheduledCall {
                        name: name.clone(),
                        input: input.clone(),
                    });
                }
                Event::ActivityCompleted { sequence_id, result } => {
                    Self::check_resolution(&schedules, *sequence_id)?;
                    outcomes.insert(*sequence_id, Ok(result.clone()));
                }
                Event::ActivityFailed { sequence_id, details } => {
                    Self::check_resolution(&schedules, *sequence_id)?;
                    outcomes.insert(*sequence_id, Err(details.clone()));
                }
                Event::OrchestrationCompleted { .. }
                | Event::OrchestrationFailed { .. }
                | Event::OrchestrationTerminated { .. } => terminal_in_history = true,
            }
        }

        Ok(Self {
            instance: instance.into(),
            historical_schedules: schedules.len(),
            schedules,
            outcomes,
            next_sequence_id: INITIAL_SEQUENCE_ID,
            started_at_ms,
            terminal_in_history,
            guid_counter: 0,
            new_events: Vec::new(),
            actions: Vec::new(),
        })
    }

    fn check_resolution(schedules: &[ScheduledCall], sequence_id: u64) -> Result<(), ErrorDetails> {
        if sequence_id < INITIAL_SEQUENCE_ID || sequence_id > schedules.len() as u64 {
            return Err(ErrorDetails::nondeterminism(format!(
                "history corruption: resolution for sequence_id={sequence_id} has no matching schedule"
            )));
        }
        Ok(())
    }

    pub fn instance_id(&self) -> &str {
        &self.instance
    }

    /// True while the pass is still re-issuing calls that history already holds.
    pub fn is_replaying(&self) -> bool {
        self.terminal_in_history || self.claimed_schedules() < self.historical_schedules
    }

    /// Deterministic clock: the start time recorded in history.
    pub fn current_time_ms(&self) -> u64 {
        self.started_at_ms
    }

    /// Deterministic identifier, stable across replays of the same instance.
    pub fn new_guid(&mut self) -> String {
        self.guid_counter += 1;
        format!("{}-{:08x}", self.instance, self.guid_counter)
    }

    /// Schedule an activity call at the next sequence position.
    ///
    /// If history already holds a schedule at this position it must match
    /// `name` and `input`; otherwise the history was produced by different
    /// orchestrator code and the instance fails.
    pub fn schedule_activity(&mut self, name: impl Into<String>, input: impl Into<String>) -> Step<ActivityHandle> {
        let name = name.into();
        let input = input.into();
        let sequence_id = self.next_sequence_id;
        let idx = (sequence_id - INITIAL_SEQUENCE_ID) as usize;

        match self.schedules.get(idx) {
            Some(recorded) => {
                if recorded.name != name || recorded.input != input {
                    return Err(Interrupt::Failed(ErrorDetails::nondeterminism(format!(
                        "schedule mismatch at sequence_id={sequence_id}: history has ActivityScheduled('{}','{}') but code scheduled ('{name}','{input}')",
                        recorded.name, recorded.input
                    ))));
                }
            }
            None => {
                if self.terminal_in_history {
                    return Err(Interrupt::Failed(ErrorDetails::nondeterminism(format!(
                        "completed history has no schedule at sequence_id={sequence_id} for '{name}'"
                    ))));
                }
                self.schedules.push(ScheduledCall {
                    name: name.clone(),
                    input: input.clone(),
                });
                self.new_events.push(Event::ActivityScheduled {
                    sequence_id,
                    name: name.clone(),
                    input: input.clone(),
                });
                self.actions.push(Action::CallActivity {
                    sequence_id,
                    name,
                    input,
                });
            }
        }

        self.next_sequence_id += 1;
        Ok(ActivityHandle { sequence_id })
    }

    /// Recorded outcome of a call, if history already resolved it.
    pub fn outcome(&self, handle: &ActivityHandle) -> Option<Result<String, ErrorDetails>> {
        self.outcomes.get(&handle.sequence_id).cloned()
    }

    /// Fan-in: outcomes of every handle in order, or `Suspended` while any is unresolved.
    pub fn join(&self, handles: &[ActivityHandle]) -> Step<Vec<Result<String, ErrorDetails>>> {
        handles
            .iter()
            .map(|h| self.outcome(h).ok_or(Interrupt::Suspended))
            .collect()
    }

    /// Number of schedules this pass has issued so far, historical or new.
    pub fn claimed_schedules(&self) -> usize {
        (self.next_sequence_id - INITIAL_SEQUENCE_ID) as usize
    }

    /// History schedules this pass never re-issued. Non-zero after the
    /// orchestrator stops means the code no longer matches the history.
    pub fn unclaimed_schedules(&self) -> usize {
        self.historical_schedules.saturating_sub(self.claimed_schedules())
    }

    /// Events appended by this pass.
    pub fn new_events(&self) -> &[Event] {
        &self.new_events
    }

    /// Dispatch commands produced by this pass.
    pub fn pending_actions(&self) -> &[Action] {
        &self.actions
    }

    pub(crate) fn into_delta(self) -> (Vec<Event>, Vec<Action>) {
        (self.new_events, self.actions)
    }
}
