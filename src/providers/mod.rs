//! History persistence and work queues.
//!
//! A provider stores one append-only history per instance and two peek-lock
//! queues: the orchestrator queue (start requests, activity completions,
//! termination requests) and the worker queue (activity executions).
//! Fetching from the orchestrator queue locks the whole instance, which is
//! what keeps replay single-threaded per instance.

use serde::{Deserialize, Serialize};

use crate::{ErrorDetails, Event};

mod error;
pub mod fs;
pub mod in_memory;

pub use error::ProviderError;

/// Message exchanged between the client, the orchestration dispatcher and the
/// worker dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
    },
    ActivityExecute {
        instance: String,
        sequence_id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        sequence_id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        sequence_id: u64,
        details: ErrorDetails,
    },
    TerminateInstance {
        instance: String,
        reason: String,
    },
}

impl WorkItem {
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TerminateInstance { instance, .. } => instance,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::StartOrchestration { .. } => "StartOrchestration",
            WorkItem::ActivityExecute { .. } => "ActivityExecute",
            WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
            WorkItem::ActivityFailed { .. } => "ActivityFailed",
            WorkItem::TerminateInstance { .. } => "TerminateInstance",
        }
    }
}

/// Metadata recorded when an instance is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance: String,
    pub orchestration: String,
    pub input: String,
    pub created_at_ms: u64,
}

/// A locked batch of orchestrator messages for one instance.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    pub orchestration: String,
    pub input: String,
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
    pub lock_token: String,
}

/// Storage abstraction for instance histories and the two work queues.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Enqueue a message for the orchestration dispatcher. A
    /// `StartOrchestration` for an unknown instance creates it; for an
    /// existing instance it is rejected.
    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError>;

    /// Lock the next instance with pending orchestrator messages and return
    /// all of its queued messages together with its history.
    async fn fetch_orchestration_item(&self) -> Result<Option<OrchestrationItem>, ProviderError>;

    /// Append `history_delta`, enqueue `worker_items` and release the instance
    /// lock, all at once. Completions already present in history are dropped.
    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError>;

    /// Release the instance lock and put the messages back at the queue front.
    async fn abandon_orchestration_item(&self, lock_token: &str) -> Result<(), ProviderError>;

    /// Lock the next activity execution.
    async fn fetch_work_item(&self) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Remove the locked activity and enqueue its completion (if any) for the
    /// orchestration dispatcher.
    async fn ack_work_item(&self, lock_token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError>;

    async fn abandon_work_item(&self, lock_token: &str) -> Result<(), ProviderError>;

    /// Full history of an instance, empty if unknown or not yet started.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError>;

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
