use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{info, warn};

use super::in_memory::InMemoryProvider;
use super::{InstanceInfo, OrchestrationItem, Provider, ProviderError, WorkItem};
use crate::Event;

const INSTANCE_FILE: &str = "instance.json";
const HISTORY_FILE: &str = "history.jsonl";

/// Filesystem-backed provider: one directory per instance holding
/// `instance.json` and an append-only `history.jsonl`.
///
/// Queues live in memory. [`FsProvider::open`] rebuilds them from the
/// persisted histories: instances that never started get their start request
/// back, and every scheduled activity without a recorded resolution is
/// dispatched again. Activities therefore run at least once across restarts.
pub struct FsProvider {
    root: PathBuf,
    inner: InMemoryProvider,
}

impl FsProvider {
    /// Open (or create) a store rooted at `root`, recovering any persisted instances.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, ProviderError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        let store = Self {
            root,
            inner: InMemoryProvider::new(),
        };
        store.recover().await?;
        Ok(store)
    }

    fn inst_root(&self, instance: &str) -> Result<PathBuf, ProviderError> {
        let valid = !instance.is_empty()
            && instance != "."
            && instance != ".."
            && !instance.contains(['/', '\\']);
        if !valid {
            return Err(ProviderError::permanent("fs", format!("invalid instance id for file store: {instance:?}")));
        }
        Ok(self.root.join(instance))
    }

    async fn recover(&self) -> Result<(), ProviderError> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut recovered = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let dir = entry.path();
            let info_path = dir.join(INSTANCE_FILE);
            let Ok(raw) = fs::read_to_string(&info_path).await else {
                continue;
            };
            let info: InstanceInfo = serde_json::from_str(&raw).map_err(|e| {
                ProviderError::permanent("recover", format!("unreadable {}: {e}", info_path.display()))
            })?;
            let history_path = dir.join(HISTORY_FILE);
            let LoadedHistory { events: history, needs_rewrite } = read_history(&history_path).await?;
            if needs_rewrite {
                rewrite_history(&history_path, &history).await?;
                warn!(
                    target: "durable_fanout::providers::fs",
                    path = %history_path.display(),
                    events = history.len(),
                    "rewrote history after an interrupted append"
                );
            }

            for item in outstanding_work(&info, &history) {
                match item {
                    WorkItem::ActivityExecute { .. } => self.inner.requeue_worker_item(item).await,
                    _ => self.inner.requeue_orchestrator_work(item).await,
                }
            }
            self.inner.restore_instance(info, history).await;
            recovered += 1;
        }
        if recovered > 0 {
            info!(
                target: "durable_fanout::providers::fs",
                root = %self.root.display(),
                recovered,
                "recovered instances"
            );
        }
        Ok(())
    }
}

/// Work that must be re-enqueued for a persisted instance after a restart.
fn outstanding_work(info: &InstanceInfo, history: &[Event]) -> Vec<WorkItem> {
    if history.iter().any(Event::is_terminal) {
        return Vec::new();
    }
    let resolved: HashSet<u64> = history
        .iter()
        .filter(|e| e.is_activity_resolution())
        .filter_map(Event::sequence_id)
        .collect();
    let unresolved: Vec<WorkItem> = history
        .iter()
        .filter_map(|e| match e {
            Event::ActivityScheduled {
                sequence_id,
                name,
                input,
            } if !resolved.contains(sequence_id) => Some(WorkItem::ActivityExecute {
                instance: info.instance.clone(),
                sequence_id: *sequence_id,
                name: name.clone(),
                input: input.clone(),
            }),
            _ => None,
        })
        .collect();
    if !unresolved.is_empty() {
        return unresolved;
    }
    // Nothing in flight: a start message triggers a fresh replay turn.
    vec![WorkItem::StartOrchestration {
        instance: info.instance.clone(),
        orchestration: info.orchestration.clone(),
        input: info.input.clone(),
    }]
}

/// Parsed `history.jsonl`.
struct LoadedHistory {
    events: Vec<Event>,
    /// The file holds bytes past the last intact line, or that line lacks its newline.
    needs_rewrite: bool,
}

async fn read_history(path: &Path) -> Result<LoadedHistory, ProviderError> {
    let data = match fs::read_to_string(path).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(LoadedHistory {
                events: Vec::new(),
                needs_rewrite: false,
            })
        }
        Err(e) => return Err(e.into()),
    };
    let mut events = Vec::new();
    let mut needs_rewrite = !data.is_empty() && !data.ends_with('\n');
    let lines: Vec<&str> = data.lines().filter(|l| !l.trim().is_empty()).collect();
    for (idx, line) in lines.iter().enumerate() {
        match serde_json::from_str::<Event>(line) {
            Ok(ev) => events.push(ev),
            // A torn final line is an interrupted append; everything before it is intact.
            Err(e) if idx + 1 == lines.len() => {
                warn!(
                    target: "durable_fanout::providers::fs",
                    path = %path.display(),
                    error = %e,
                    "dropping torn history line"
                );
                needs_rewrite = true;
            }
            Err(e) => {
                return Err(ProviderError::permanent(
                    "read",
                    format!("corrupt history {} line {}: {e}", path.display(), idx + 1),
                ))
            }
        }
    }
    Ok(LoadedHistory { events, needs_rewrite })
}

fn encode_events(events: &[Event], operation: &str) -> Result<String, ProviderError> {
    let mut buf = String::new();
    for ev in events {
        let line = serde_json::to_string(ev).map_err(|e| ProviderError::permanent(operation, e.to_string()))?;
        buf.push_str(&line);
        buf.push('\n');
    }
    Ok(buf)
}

/// Replace `path` with exactly `events`, through a temporary file and a rename.
async fn rewrite_history(path: &Path, events: &[Event]) -> Result<(), ProviderError> {
    let buf = encode_events(events, "recover")?;
    let tmp = path.with_extension("jsonl.tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(buf.as_bytes()).await?;
    file.sync_all().await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Append `buf` to `path`. On failure the file is cut back to its previous
/// length so no partial line stays behind for the next append.
async fn append_history(path: &Path, buf: &str) -> Result<(), ProviderError> {
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path).await?;
    let before = file.metadata().await?.len();
    let written = async {
        file.write_all(buf.as_bytes()).await?;
        file.sync_data().await
    }
    .await;
    if let Err(e) = written {
        if let Err(truncate_err) = file.set_len(before).await {
            warn!(
                target: "durable_fanout::providers::fs",
                path = %path.display(),
                error = %truncate_err,
                "could not roll back failed history append"
            );
        }
        return Err(e.into());
    }
    Ok(())
}

#[async_trait::async_trait]
impl Provider for FsProvider {
    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        if let WorkItem::StartOrchestration {
            instance,
            orchestration,
            input,
        } = &item
        {
            let dir = self.inst_root(instance)?;
            if self.inner.get_instance_info(instance).await?.is_some() {
                return Err(ProviderError::permanent(
                    "enqueue_orchestrator_work",
                    format!("instance already exists: {instance}"),
                ));
            }
            self.inner.enqueue_orchestrator_work(item.clone()).await?;
            let info = self.inner.get_instance_info(instance).await?.unwrap_or(InstanceInfo {
                instance: instance.clone(),
                orchestration: orchestration.clone(),
                input: input.clone(),
                created_at_ms: super::now_ms(),
            });
            fs::create_dir_all(&dir).await?;
            let json = serde_json::to_string_pretty(&info)
                .map_err(|e| ProviderError::permanent("enqueue_orchestrator_work", e.to_string()))?;
            fs::write(dir.join(INSTANCE_FILE), json).await?;
            return Ok(());
        }
        self.inner.enqueue_orchestrator_work(item).await
    }

    async fn fetch_orchestration_item(&self) -> Result<Option<OrchestrationItem>, ProviderError> {
        self.inner.fetch_orchestration_item().await
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        // History reaches disk before the lock is released or any worker item is visible.
        let (instance, delta) = self.inner.effective_delta(lock_token, &history_delta).await?;
        if !delta.is_empty() {
            let path = self.inst_root(&instance)?.join(HISTORY_FILE);
            let buf = encode_events(&delta, "ack_orchestration_item")?;
            append_history(&path, &buf).await?;
        }
        self.inner.ack_orchestration_item(lock_token, delta, worker_items).await
    }

    async fn abandon_orchestration_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        self.inner.abandon_orchestration_item(lock_token).await
    }

    async fn fetch_work_item(&self) -> Result<Option<(WorkItem, String)>, ProviderError> {
        self.inner.fetch_work_item().await
    }

    async fn ack_work_item(&self, lock_token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError> {
        self.inner.ack_work_item(lock_token, completion).await
    }

    async fn abandon_work_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        self.inner.abandon_work_item(lock_token).await
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.inner.read(instance).await
    }

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        self.inner.get_instance_info(instance).await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.list_instances().await
    }
}
