#![allow(dead_code)]

use durable_fanout::providers::in_memory::InMemoryProvider;
use durable_fanout::providers::Provider;
use durable_fanout::{ActivityRegistry, Client, Event, OrchestrationRegistry, Runtime, RuntimeOptions};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc as StdArc;
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_idle_sleep_ms: 2,
        worker_concurrency: 8,
        ..RuntimeOptions::default()
    }
}

pub fn memory_store() -> StdArc<dyn Provider> {
    StdArc::new(InMemoryProvider::new())
}

pub async fn start_runtime(
    store: StdArc<dyn Provider>,
    activities: ActivityRegistry,
    orchestrations: OrchestrationRegistry,
    options: RuntimeOptions,
) -> (StdArc<Runtime>, Client) {
    let rt = Runtime::start_with_options(store.clone(), activities, orchestrations, options).await;
    (rt, Client::new(store))
}

/// JSON start request for the title-fetch workflow.
pub fn fetch_request(urls: &[String], max_parallelism: i64) -> String {
    serde_json::json!({ "urls": urls, "max_parallelism": max_parallelism }).to_string()
}

pub fn urls(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| format!("http://pages.test/{n}")).collect()
}

pub async fn wait_for_history<F>(store: StdArc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&Vec<Event>) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await.unwrap_or_default();
        if predicate(&hist) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn scheduled_count(history: &[Event]) -> usize {
    history
        .iter()
        .filter(|e| matches!(e, Event::ActivityScheduled { .. }))
        .count()
}

/// Counts activity executions and the peak number running at once.
#[derive(Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicUsize,
}

impl InFlight {
    pub fn enter(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

/// Serve a few HTML pages on an ephemeral local port and return the base URL.
pub async fn serve_pages() -> String {
    use axum::http::StatusCode;
    use axum::response::Html;
    use axum::routing::get;

    let app = axum::Router::new()
        .route(
            "/overview",
            get(|| async { Html("<html><title>Durable Functions overview | Microsoft Learn</title></html>") }),
        )
        .route(
            "/timers",
            get(|| async { Html("<html><title>Timers in Durable Functions | Microsoft Learn</title></html>") }),
        )
        .route("/plain", get(|| async { Html("<html><title>Plain</title></html>") }))
        .route("/broken", get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}
