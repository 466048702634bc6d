use serde::Serialize;

use crate::{ErrorDetails, Event};

/// High-level orchestration status derived from history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "runtimeStatus")]
pub enum OrchestrationStatus {
    NotFound,
    /// Created and queued, no replay turn has run yet.
    Pending,
    Running,
    Completed { output: String },
    Failed { details: ErrorDetails },
    Terminated { reason: String },
}

impl OrchestrationStatus {
    /// Status of an existing instance with this history.
    pub fn from_history(history: &[Event]) -> Self {
        // A history holds at most one terminal event; the last one wins regardless.
        for event in history.iter().rev() {
            match event {
                Event::OrchestrationCompleted { output } => {
                    return OrchestrationStatus::Completed { output: output.clone() }
                }
                Event::OrchestrationFailed { details } => {
                    return OrchestrationStatus::Failed {
                        details: details.clone(),
                    }
                }
                Event::OrchestrationTerminated { reason } => {
                    return OrchestrationStatus::Terminated { reason: reason.clone() }
                }
                _ => {}
            }
        }
        if history.is_empty() {
            OrchestrationStatus::Pending
        } else {
            OrchestrationStatus::Running
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OrchestrationStatus::NotFound => "NotFound",
            OrchestrationStatus::Pending => "Pending",
            OrchestrationStatus::Running => "Running",
            OrchestrationStatus::Completed { .. } => "Completed",
            OrchestrationStatus::Failed { .. } => "Failed",
            OrchestrationStatus::Terminated { .. } => "Terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }
}

/// Snapshot of one instance as exposed by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrchestrationInstance {
    pub instance_id: String,
    pub orchestration: String,
    pub status: OrchestrationStatus,
    pub output: Option<String>,
    pub created_at_ms: u64,
    pub history: Vec<Event>,
}
