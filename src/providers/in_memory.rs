use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;
use tracing::warn;

use super::{now_ms, InstanceInfo, OrchestrationItem, Provider, ProviderError, WorkItem};
use crate::Event;

/// Default maximum number of events in one instance history.
pub const DEFAULT_HISTORY_CAP: usize = 1024;

struct InstanceState {
    info: InstanceInfo,
    history: Vec<Event>,
}

#[derive(Default)]
struct State {
    instances: HashMap<String, InstanceState>,
    orchestrator_q: VecDeque<WorkItem>,
    // Peek-lock state: token -> (instance, messages). Locked instances are skipped by fetch.
    orchestrator_locks: HashMap<String, (String, Vec<WorkItem>)>,
    worker_q: VecDeque<WorkItem>,
    worker_locks: HashMap<String, WorkItem>,
    next_token: u64,
}

impl State {
    fn token(&mut self, prefix: &str) -> String {
        self.next_token += 1;
        format!("{prefix}:{}", self.next_token)
    }

    fn is_locked(&self, instance: &str) -> bool {
        self.orchestrator_locks.values().any(|(locked, _)| locked == instance)
    }
}

/// Volatile provider for tests and single-process hosts.
pub struct InMemoryProvider {
    state: Mutex<State>,
    history_cap: usize,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::with_history_cap(DEFAULT_HISTORY_CAP)
    }

    /// Create a provider with a custom history cap (useful for tests).
    pub fn with_history_cap(history_cap: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            history_cap,
        }
    }

    /// Load an instance recovered from durable storage.
    pub(crate) async fn restore_instance(&self, info: InstanceInfo, history: Vec<Event>) {
        let mut g = self.state.lock().await;
        g.instances.insert(info.instance.clone(), InstanceState { info, history });
    }

    pub(crate) async fn requeue_orchestrator_work(&self, item: WorkItem) {
        self.state.lock().await.orchestrator_q.push_back(item);
    }

    pub(crate) async fn requeue_worker_item(&self, item: WorkItem) {
        self.state.lock().await.worker_q.push_back(item);
    }

    /// The part of `history_delta` an ack would actually append, plus the
    /// locked instance id. The instance stays locked, so the answer holds
    /// until the ack itself.
    pub(crate) async fn effective_delta(
        &self,
        lock_token: &str,
        history_delta: &[Event],
    ) -> Result<(String, Vec<Event>), ProviderError> {
        let g = self.state.lock().await;
        let (instance, _) = g
            .orchestrator_locks
            .get(lock_token)
            .ok_or_else(|| {
                ProviderError::permanent("ack_orchestration_item", format!("invalid lock token: {lock_token}"))
            })?;
        let inst = g
            .instances
            .get(instance)
            .ok_or_else(|| {
                ProviderError::permanent("ack_orchestration_item", format!("instance not found: {instance}"))
            })?;
        let delta = merge_delta(&inst.history, history_delta.to_vec());
        // Terminal events may exceed the cap so an over-full instance can still be failed.
        let growth = delta.iter().filter(|e| !e.is_terminal()).count();
        if inst.history.len() + growth > self.history_cap {
            return Err(ProviderError::permanent(
                "ack_orchestration_item",
                format!(
                    "history cap exceeded (cap={}, have={}, append={})",
                    self.history_cap,
                    inst.history.len(),
                    delta.len()
                ),
            ));
        }
        Ok((instance.clone(), delta))
    }
}

/// Drop events from `delta` that `history` (or an earlier event of `delta`)
/// already records. Redelivered completions and repeated acks collapse here.
pub(crate) fn merge_delta(history: &[Event], delta: Vec<Event>) -> Vec<Event> {
    let mut scheduled: HashSet<u64> = HashSet::new();
    let mut resolved: HashSet<u64> = HashSet::new();
    let mut started = false;
    let mut terminal = false;
    for e in history {
        match e {
            Event::OrchestrationStarted { .. } => started = true,
            Event::ActivityScheduled { sequence_id, .. } => {
                scheduled.insert(*sequence_id);
            }
            Event::ActivityCompleted { sequence_id, .. } | Event::ActivityFailed { sequence_id, .. } => {
                resolved.insert(*sequence_id);
            }
            _ if e.is_terminal() => terminal = true,
            _ => {}
        }
    }

    let mut out = Vec::with_capacity(delta.len());
    for e in delta {
        let keep = match &e {
            Event::OrchestrationStarted { .. } => !std::mem::replace(&mut started, true),
            Event::ActivityScheduled { sequence_id, .. } => scheduled.insert(*sequence_id),
            Event::ActivityCompleted { sequence_id, .. } | Event::ActivityFailed { sequence_id, .. } => {
                resolved.insert(*sequence_id)
            }
            _ => !std::mem::replace(&mut terminal, true),
        };
        if keep {
            out.push(e);
        }
    }
    out
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        match &item {
            WorkItem::StartOrchestration {
                instance,
                orchestration,
                input,
            } => {
                if g.instances.contains_key(instance) {
                    return Err(ProviderError::permanent(
                        "enqueue_orchestrator_work",
                        format!("instance already exists: {instance}"),
                    ));
                }
                let info = InstanceInfo {
                    instance: instance.clone(),
                    orchestration: orchestration.clone(),
                    input: input.clone(),
                    created_at_ms: now_ms(),
                };
                g.instances.insert(
                    instance.clone(),
                    InstanceState {
                        info,
                        history: Vec::new(),
                    },
                );
            }
            other => {
                if !g.instances.contains_key(other.instance()) {
                    return Err(ProviderError::permanent(
                        "enqueue_orchestrator_work",
                        format!("instance not found: {}", other.instance()),
                    ));
                }
            }
        }
        g.orchestrator_q.push_back(item);
        Ok(())
    }

    async fn fetch_orchestration_item(&self) -> Result<Option<OrchestrationItem>, ProviderError> {
        let mut g = self.state.lock().await;
        let Some(instance) = g
            .orchestrator_q
            .iter()
            .map(|item| item.instance().to_string())
            .find(|instance| !g.is_locked(instance))
        else {
            return Ok(None);
        };

        let mut messages = Vec::new();
        g.orchestrator_q.retain(|item| {
            if item.instance() == instance {
                messages.push(item.clone());
                false
            } else {
                true
            }
        });

        let Some(inst) = g.instances.get(&instance) else {
            warn!(instance = %instance, dropped = messages.len(), "dropping messages for unknown instance");
            return Ok(None);
        };
        let item = OrchestrationItem {
            instance: instance.clone(),
            orchestration: inst.info.orchestration.clone(),
            input: inst.info.input.clone(),
            history: inst.history.clone(),
            messages: messages.clone(),
            lock_token: String::new(),
        };
        let token = g.token("o");
        g.orchestrator_locks.insert(token.clone(), (instance, messages));
        Ok(Some(OrchestrationItem {
            lock_token: token,
            ..item
        }))
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        let (instance, delta) = self.effective_delta(lock_token, &history_delta).await?;
        let mut g = self.state.lock().await;
        g.orchestrator_locks.remove(lock_token);
        if let Some(inst) = g.instances.get_mut(&instance) {
            inst.history.extend(delta);
        }
        g.worker_q.extend(worker_items);
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        let (_, messages) = g.orchestrator_locks.remove(lock_token).ok_or_else(|| {
            ProviderError::permanent("abandon_orchestration_item", format!("invalid lock token: {lock_token}"))
        })?;
        for item in messages.into_iter().rev() {
            g.orchestrator_q.push_front(item);
        }
        Ok(())
    }

    async fn fetch_work_item(&self) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut g = self.state.lock().await;
        let Some(item) = g.worker_q.pop_front() else {
            return Ok(None);
        };
        let token = g.token("w");
        g.worker_locks.insert(token.clone(), item.clone());
        Ok(Some((item, token)))
    }

    async fn ack_work_item(&self, lock_token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        if g.worker_locks.remove(lock_token).is_none() {
            return Err(ProviderError::permanent(
                "ack_work_item",
                format!("invalid lock token: {lock_token}"),
            ));
        }
        if let Some(item) = completion {
            g.orchestrator_q.push_back(item);
        }
        Ok(())
    }

    async fn abandon_work_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        let item = g
            .worker_locks
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("abandon_work_item", format!("invalid lock token: {lock_token}")))?;
        g.worker_q.push_front(item);
        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.instances.get(instance).map(|i| i.history.clone()).unwrap_or_default())
    }

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.instances.get(instance).map(|i| i.info.clone()))
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let g = self.state.lock().await;
        let mut ids: Vec<String> = g.instances.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(instance: &str) -> WorkItem {
        WorkItem::StartOrchestration {
            instance: instance.to_string(),
            orchestration: "Orch".to_string(),
            input: "in".to_string(),
        }
    }

    fn completed(instance: &str, seq: u64) -> WorkItem {
        WorkItem::ActivityCompleted {
            instance: instance.to_string(),
            sequence_id: seq,
            result: format!("r{seq}"),
        }
    }

    #[tokio::test]
    async fn start_creates_instance_once() {
        let p = InMemoryProvider::new();
        p.enqueue_orchestrator_work(start("a")).await.unwrap();
        let err = p.enqueue_orchestrator_work(start("a")).await.unwrap_err();
        assert!(!err.is_retryable());
        let info = p.get_instance_info("a").await.unwrap().unwrap();
        assert_eq!(info.orchestration, "Orch");
        assert!(p.read("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completion_for_unknown_instance_is_rejected() {
        let p = InMemoryProvider::new();
        assert!(p.enqueue_orchestrator_work(completed("ghost", 1)).await.is_err());
    }

    #[tokio::test]
    async fn fetch_locks_instance_and_batches_messages() {
        let p = InMemoryProvider::new();
        p.enqueue_orchestrator_work(start("a")).await.unwrap();
        p.enqueue_orchestrator_work(start("b")).await.unwrap();
        p.enqueue_orchestrator_work(completed("a", 1)).await.unwrap();

        let item = p.fetch_orchestration_item().await.unwrap().unwrap();
        assert_eq!(item.instance, "a");
        assert_eq!(item.messages.len(), 2);

        // "a" is locked; a new message for it must wait while "b" is served.
        p.enqueue_orchestrator_work(completed("a", 2)).await.unwrap();
        let other = p.fetch_orchestration_item().await.unwrap().unwrap();
        assert_eq!(other.instance, "b");
        assert!(p.fetch_orchestration_item().await.unwrap().is_none());

        p.ack_orchestration_item(&item.lock_token, vec![], vec![]).await.unwrap();
        let again = p.fetch_orchestration_item().await.unwrap().unwrap();
        assert_eq!(again.instance, "a");
        assert_eq!(again.messages, vec![completed("a", 2)]);
    }

    #[tokio::test]
    async fn abandon_requeues_messages_in_order() {
        let p = InMemoryProvider::new();
        p.enqueue_orchestrator_work(start("a")).await.unwrap();
        p.enqueue_orchestrator_work(completed("a", 1)).await.unwrap();
        let item = p.fetch_orchestration_item().await.unwrap().unwrap();
        p.abandon_orchestration_item(&item.lock_token).await.unwrap();
        let again = p.fetch_orchestration_item().await.unwrap().unwrap();
        assert_eq!(again.messages, item.messages);
    }

    #[tokio::test]
    async fn ack_appends_history_and_enqueues_workers() {
        let p = InMemoryProvider::new();
        p.enqueue_orchestrator_work(start("a")).await.unwrap();
        let item = p.fetch_orchestration_item().await.unwrap().unwrap();
        let scheduled = Event::ActivityScheduled {
            sequence_id: 1,
            name: "A".to_string(),
            input: "x".to_string(),
        };
        let exec = WorkItem::ActivityExecute {
            instance: "a".to_string(),
            sequence_id: 1,
            name: "A".to_string(),
            input: "x".to_string(),
        };
        p.ack_orchestration_item(&item.lock_token, vec![scheduled.clone()], vec![exec.clone()])
            .await
            .unwrap();
        assert_eq!(p.read("a").await.unwrap(), vec![scheduled]);

        let (work, token) = p.fetch_work_item().await.unwrap().unwrap();
        assert_eq!(work, exec);
        p.ack_work_item(&token, Some(completed("a", 1))).await.unwrap();
        let next = p.fetch_orchestration_item().await.unwrap().unwrap();
        assert_eq!(next.messages, vec![completed("a", 1)]);
        assert!(p.ack_work_item(&token, None).await.is_err());
    }

    #[tokio::test]
    async fn history_cap_is_enforced() {
        let p = InMemoryProvider::with_history_cap(1);
        p.enqueue_orchestrator_work(start("a")).await.unwrap();
        let item = p.fetch_orchestration_item().await.unwrap().unwrap();
        let delta = vec![
            Event::ActivityScheduled {
                sequence_id: 1,
                name: "A".to_string(),
                input: String::new(),
            },
            Event::ActivityScheduled {
                sequence_id: 2,
                name: "A".to_string(),
                input: String::new(),
            },
        ];
        let err = p.ack_orchestration_item(&item.lock_token, delta, vec![]).await.unwrap_err();
        assert!(err.message.contains("history cap exceeded"));
    }

    #[test]
    fn merge_delta_drops_duplicates() {
        let history = vec![
            Event::ActivityScheduled {
                sequence_id: 1,
                name: "A".to_string(),
                input: String::new(),
            },
            Event::ActivityCompleted {
                sequence_id: 1,
                result: "first".to_string(),
            },
        ];
        let delta = vec![
            Event::ActivityCompleted {
                sequence_id: 1,
                result: "second".to_string(),
            },
            Event::OrchestrationCompleted { output: "x".to_string() },
            Event::OrchestrationCompleted { output: "y".to_string() },
        ];
        assert_eq!(
            merge_delta(&history, delta),
            vec![Event::OrchestrationCompleted { output: "x".to_string() }]
        );
    }
}
