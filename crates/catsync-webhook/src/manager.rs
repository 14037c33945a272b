//! Owns one FIFO queue and one worker per registered path.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use catsync_core::{
    AppConfig, AppConfigProvider, EventTimestamp, ResourceConfig, WebhookEvent, WebhookEventRawResults,
};
use catsync_mapping::{EntityMapper, MappingError};
use catsync_storage::{CatalogClient, CatalogOptions};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::handler::{run_handler, HandlerError, HandlerFactory, ProcessingOutcome};
use crate::queue::LocalQueue;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no webhook handler registered for path {0}")]
    UnknownPath(String),
}

/// Collaborators a worker needs to process an event.
#[derive(Clone)]
pub struct ProcessingContext {
    pub config: Arc<dyn AppConfigProvider>,
    pub catalog: Arc<dyn CatalogClient>,
    pub mapper: Arc<EntityMapper>,
}

#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    /// How long shutdown waits for queues to drain before cancelling workers.
    pub max_wait_before_shutdown: Duration,
    /// Scheduler lag above which a worker logs after yielding.
    pub lag_warning: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_wait_before_shutdown: Duration::from_secs(5),
            lag_warning: Duration::from_millis(100),
        }
    }
}

type Factories = Arc<RwLock<Vec<Arc<dyn HandlerFactory>>>>;

struct PathEntry {
    queue: Arc<LocalQueue<WebhookEvent>>,
    factories: Factories,
    worker: Option<JoinHandle<()>>,
}

struct WorkerParts {
    path: String,
    queue: Arc<LocalQueue<WebhookEvent>>,
    factories: Factories,
    context: ProcessingContext,
    observer: Option<mpsc::UnboundedSender<WebhookEvent>>,
    lag_warning: Duration,
}

pub struct WebhookProcessorManager {
    context: ProcessingContext,
    config: ManagerConfig,
    paths: Mutex<BTreeMap<String, PathEntry>>,
    started: Mutex<bool>,
    observer: Option<mpsc::UnboundedSender<WebhookEvent>>,
}

/// Normalizes a route path to a single leading slash and no trailing slash.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{trimmed}")
}

impl WebhookProcessorManager {
    pub fn new(context: ProcessingContext, config: ManagerConfig) -> Self {
        Self {
            context,
            config,
            paths: Mutex::new(BTreeMap::new()),
            started: Mutex::new(false),
            observer: None,
        }
    }

    /// Every finished event, with its full timestamp map, is sent to `observer`.
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<WebhookEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn context(&self) -> &ProcessingContext {
        &self.context
    }

    fn lock_paths(&self) -> MutexGuard<'_, BTreeMap<String, PathEntry>> {
        self.paths.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_started(&self) -> bool {
        *self.started.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Binds `factory` to `path`. The path's queue is created on first use; if
    /// the manager is already running its worker starts right away.
    pub fn register(&self, path: &str, factory: Arc<dyn HandlerFactory>) {
        let path = normalize_path(path);
        let started = self.is_started();
        let mut paths = self.lock_paths();
        let entry = paths.entry(path.clone()).or_insert_with(|| PathEntry {
            queue: Arc::new(LocalQueue::new()),
            factories: Arc::new(RwLock::new(Vec::new())),
            worker: None,
        });
        info!(path = %path, handler = factory.name(), "registered webhook handler");
        entry
            .factories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(factory);
        if started && entry.worker.is_none() {
            entry.worker = Some(self.spawn_worker(&path, entry));
        }
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock_paths().keys().cloned().collect()
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.lock_paths().contains_key(&normalize_path(path))
    }

    /// Starts one worker per registered path. Calling it twice is a no-op.
    pub fn start(&self) {
        {
            let mut started = self.started.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if *started {
                return;
            }
            *started = true;
        }
        let mut paths = self.lock_paths();
        for (path, entry) in paths.iter_mut() {
            if entry.worker.is_none() {
                entry.worker = Some(self.spawn_worker(path, entry));
            }
        }
        info!(paths = paths.len(), "webhook workers started");
    }

    fn spawn_worker(&self, path: &str, entry: &PathEntry) -> JoinHandle<()> {
        let parts = WorkerParts {
            path: path.to_string(),
            queue: entry.queue.clone(),
            factories: entry.factories.clone(),
            context: self.context.clone(),
            observer: self.observer.clone(),
            lag_warning: self.config.lag_warning,
        };
        tokio::spawn(run_worker(parts))
    }

    /// Stamps the event as queued and appends it to the path's queue.
    pub async fn enqueue(&self, path: &str, mut event: WebhookEvent) -> Result<(), ManagerError> {
        let path = normalize_path(path);
        let queue = self
            .lock_paths()
            .get(&path)
            .map(|entry| entry.queue.clone())
            .ok_or_else(|| ManagerError::UnknownPath(path.clone()))?;
        event.stamp(EventTimestamp::AddedToQueue);
        debug!(path = %path, trace_id = event.trace_id(), "event queued");
        queue.put(event).await;
        Ok(())
    }

    /// Waits up to `max_wait_before_shutdown` for every queue to drain, then
    /// cancels all workers and waits for them to stop.
    pub async fn shutdown(&self) {
        let (queues, workers): (Vec<_>, Vec<_>) = {
            let mut paths = self.lock_paths();
            paths
                .iter_mut()
                .map(|(path, entry)| ((path.clone(), entry.queue.clone()), entry.worker.take()))
                .unzip()
        };

        let drain = async {
            for (_, queue) in &queues {
                queue.teardown().await;
            }
        };
        if tokio::time::timeout(self.config.max_wait_before_shutdown, drain)
            .await
            .is_err()
        {
            for (path, queue) in &queues {
                let pending = queue.unfinished();
                if pending > 0 {
                    warn!(path = %path, pending, "shutdown timeout reached with events still queued");
                }
            }
        }

        let workers: Vec<JoinHandle<()>> = workers.into_iter().flatten().collect();
        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            if let Err(err) = worker.await {
                if !err.is_cancelled() {
                    error!(error = %err, "webhook worker ended abnormally");
                }
            }
        }
        *self.started.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = false;
        info!("webhook workers stopped");
    }
}

/// Aborts the wrapped task when dropped, so cancelling a worker also stops
/// the event it is processing.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_worker(parts: WorkerParts) {
    let WorkerParts {
        path,
        queue,
        factories,
        context,
        observer,
        lag_warning,
    } = parts;
    loop {
        let mut event = queue.get().await;
        event.stamp(EventTimestamp::StartedProcessing);

        let factories: Vec<Arc<dyn HandlerFactory>> = factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let span = info_span!("webhook_event", path = %path, trace_id = %event.trace_id());
        let task = {
            let context = context.clone();
            let event = event.clone();
            tokio::spawn(async move { process_event(&context, &factories, &event).await }.instrument(span))
        };
        let _guard = AbortOnDrop(task.abort_handle());

        let succeeded = match task.await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                let message = format!("{err:#}");
                error!(path = %path, trace_id = event.trace_id(), error = %message, "webhook event failed");
                false
            }
            Err(err) => {
                error!(path = %path, trace_id = event.trace_id(), error = %err, "webhook event processing panicked");
                false
            }
        };
        event.stamp(if succeeded {
            EventTimestamp::FinishedProcessingSuccessfully
        } else {
            EventTimestamp::FinishedProcessingWithError
        });
        debug!(
            path = %path,
            trace_id = event.trace_id(),
            millis = ?event.processing_millis(),
            succeeded,
            "event processed"
        );

        if let Some(observer) = &observer {
            let _ = observer.send(event);
        }
        queue.commit().await;

        let before = Instant::now();
        tokio::task::yield_now().await;
        let lag = before.elapsed();
        if lag > lag_warning {
            debug!(path = %path, lag_ms = lag.as_millis() as u64, "worker resumed late after yield");
        }
    }
}

/// Consults every handler registered on the path in order. Returns an error
/// when any handler faulted or any sync step failed.
async fn process_event(
    context: &ProcessingContext,
    factories: &[Arc<dyn HandlerFactory>],
    event: &WebhookEvent,
) -> anyhow::Result<()> {
    let config = context
        .config
        .load()
        .await
        .context("loading mapping configuration")?;
    let mut faults = Vec::new();

    for factory in factories {
        let handler = factory.create(event);
        match run_handler(handler.as_ref(), event, &config).await {
            ProcessingOutcome::Skip(reason) => {
                debug!(handler = factory.name(), %reason, "event skipped");
            }
            ProcessingOutcome::Fault(HandlerError::AuthenticationFailed) => {
                warn!(handler = factory.name(), "webhook authentication failed; event dropped");
                faults.push(format!("{}: authentication failed", factory.name()));
            }
            ProcessingOutcome::Fault(err) => {
                faults.push(format!("{}: {err}", factory.name()));
            }
            ProcessingOutcome::Process(results) => {
                for (resource, raw) in &results {
                    match sync_raw_results(context, &config, resource, raw).await {
                        Ok(counts) if counts.failed == 0 => {
                            debug!(kind = %resource.kind, upserted = counts.upserted, deleted = counts.deleted, "webhook results synced");
                        }
                        Ok(counts) => faults.push(format!(
                            "{}: {} catalog calls failed for kind {}",
                            factory.name(),
                            counts.failed,
                            resource.kind
                        )),
                        Err(err) => faults.push(format!("{}: {err}", factory.name())),
                    }
                }
            }
        }
    }

    if faults.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(faults.join("; ")))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounts {
    pub upserted: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Applies one handler result to the catalog: upsert entities that pass the
/// selector, delete those that now fail it, delete everything the deletion
/// markers resolve to. A failed catalog call is logged and counted.
pub async fn sync_raw_results(
    context: &ProcessingContext,
    config: &AppConfig,
    resource: &ResourceConfig,
    raw: &WebhookEventRawResults,
) -> Result<SyncCounts, MappingError> {
    let options = CatalogOptions::from(config);
    let mut counts = SyncCounts::default();

    let mapped = context.mapper.calculate(&raw.updated_raw_results, resource, true)?;
    let deletions = context
        .mapper
        .map_for_deletion(&raw.deleted_raw_results, resource)?;

    for entity in &mapped.selector_diff.passed {
        match context.catalog.upsert_entity(entity, options).await {
            Ok(()) => counts.upserted += 1,
            Err(err) => {
                warn!(identifier = %entity.identifier, blueprint = %entity.blueprint, error = %err, "upsert failed");
                counts.failed += 1;
            }
        }
    }
    for entity in mapped.selector_diff.failed.iter().chain(deletions.iter()) {
        match context.catalog.delete_entity(entity, options).await {
            Ok(()) => counts.deleted += 1,
            Err(err) => {
                warn!(identifier = %entity.identifier, blueprint = %entity.blueprint, error = %err, "delete failed");
                counts.failed += 1;
            }
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use catsync_core::StaticAppConfig;
    use catsync_storage::InMemoryCatalog;
    use serde_json::{json, Value as JsonValue};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::handler::WebhookHandler;

    const CONFIG: &str = r#"
resources:
  - kind: issue
    selector:
      query: .status == "open"
    port:
      entity:
        mappings:
          identifier: .id
          blueprint: '"issue"'
          properties:
            status: .status
"#;

    struct SlowHandler {
        delay: Duration,
        panic_on: Option<String>,
    }

    #[async_trait]
    impl WebhookHandler for SlowHandler {
        async fn should_process_event(&self, _event: &WebhookEvent) -> bool {
            true
        }

        async fn validate_payload(&self, payload: &JsonValue) -> bool {
            payload.get("id").is_some()
        }

        async fn get_matching_kinds(&self, _event: &WebhookEvent) -> Vec<String> {
            vec!["issue".into()]
        }

        async fn handle_event(
            &self,
            payload: &JsonValue,
            _resource: &ResourceConfig,
        ) -> Result<WebhookEventRawResults, HandlerError> {
            tokio::time::sleep(self.delay).await;
            if let Some(id) = &self.panic_on {
                if payload["id"] == json!(id) {
                    panic!("handler blew up");
                }
            }
            if payload["action"] == json!("deleted") {
                return Ok(WebhookEventRawResults::deleted(vec![payload.clone()]));
            }
            Ok(WebhookEventRawResults::updated(vec![payload.clone()]))
        }
    }

    struct SlowFactory {
        delay: Duration,
        panic_on: Option<String>,
        created: AtomicUsize,
    }

    impl SlowFactory {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                panic_on: None,
                created: AtomicUsize::new(0),
            })
        }
    }

    impl HandlerFactory for SlowFactory {
        fn name(&self) -> &str {
            "slow"
        }

        fn create(&self, _event: &WebhookEvent) -> Box<dyn WebhookHandler> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Box::new(SlowHandler {
                delay: self.delay,
                panic_on: self.panic_on.clone(),
            })
        }
    }

    fn setup(config: ManagerConfig) -> (
        WebhookProcessorManager,
        Arc<InMemoryCatalog>,
        mpsc::UnboundedReceiver<WebhookEvent>,
    ) {
        let catalog = Arc::new(InMemoryCatalog::new());
        let context = ProcessingContext {
            config: Arc::new(StaticAppConfig::new(
                AppConfig::from_yaml_str(CONFIG, "test").expect("config"),
            )),
            catalog: catalog.clone(),
            mapper: Arc::new(EntityMapper::new()),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        (WebhookProcessorManager::new(context, config).with_observer(tx), catalog, rx)
    }

    fn event(payload: JsonValue) -> WebhookEvent {
        let mut event = WebhookEvent::new(payload, BTreeMap::new());
        event.stamp(EventTimestamp::Arrived);
        event
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<WebhookEvent>) -> WebhookEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event finished in time")
            .expect("observer open")
    }

    #[tokio::test]
    async fn second_event_starts_after_first_finishes() {
        let (manager, catalog, mut rx) = setup(ManagerConfig::default());
        manager.register("/issues", SlowFactory::new(Duration::from_millis(50)));
        manager.start();

        manager.enqueue("/issues", event(json!({"id": "1", "status": "open"}))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.enqueue("issues", event(json!({"id": "2", "status": "open"}))).await.unwrap();

        let first = next(&mut rx).await;
        let second = next(&mut rx).await;
        assert_eq!(first.payload()["id"], json!("1"));
        let first_done = first.finished_at().expect("first finished");
        let second_started = second
            .timestamp(EventTimestamp::StartedProcessing)
            .expect("second started");
        assert!(second_started > first_done);
        assert!(first.timestamp(EventTimestamp::FinishedProcessingSuccessfully).is_some());
        assert_eq!(catalog.entities().await.len(), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn events_keep_fifo_order_per_path() {
        let (manager, _catalog, mut rx) = setup(ManagerConfig::default());
        manager.register("/issues", SlowFactory::new(Duration::from_millis(1)));
        manager.start();
        for i in 0..10 {
            manager
                .enqueue("/issues", event(json!({"id": i.to_string(), "status": "open"})))
                .await
                .unwrap();
        }
        let mut seen = Vec::new();
        let mut last_started = None;
        for _ in 0..10 {
            let done = next(&mut rx).await;
            let started = done.timestamp(EventTimestamp::StartedProcessing);
            assert!(started > last_started);
            last_started = started;
            seen.push(done.payload()["id"].as_str().unwrap_or_default().to_string());
        }
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(seen, expected);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn a_panicking_handler_does_not_stop_the_worker() {
        let (manager, catalog, mut rx) = setup(ManagerConfig::default());
        manager.register(
            "/issues",
            Arc::new(SlowFactory {
                delay: Duration::ZERO,
                panic_on: Some("bad".into()),
                created: AtomicUsize::new(0),
            }),
        );
        manager.start();
        manager.enqueue("/issues", event(json!({"id": "bad", "status": "open"}))).await.unwrap();
        manager.enqueue("/issues", event(json!({"id": "good", "status": "open"}))).await.unwrap();

        let failed = next(&mut rx).await;
        assert!(failed.timestamp(EventTimestamp::FinishedProcessingWithError).is_some());
        let ok = next(&mut rx).await;
        assert!(ok.timestamp(EventTimestamp::FinishedProcessingSuccessfully).is_some());
        assert!(catalog.get("good", "issue").await.is_some());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn selector_failures_and_deletions_remove_entities() {
        let (manager, catalog, mut rx) = setup(ManagerConfig::default());
        manager.register("/issues", SlowFactory::new(Duration::ZERO));
        manager.start();

        for payload in [
            json!({"id": "1", "status": "open"}),
            json!({"id": "2", "status": "open"}),
            json!({"id": "1", "status": "closed"}),
            json!({"id": "2", "action": "deleted"}),
        ] {
            manager.enqueue("/issues", event(payload)).await.unwrap();
        }
        for _ in 0..4 {
            next(&mut rx).await;
        }
        assert!(catalog.entities().await.is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn registering_after_start_spawns_a_worker() {
        let (manager, catalog, mut rx) = setup(ManagerConfig::default());
        manager.start();
        assert!(matches!(
            manager.enqueue("/late", event(json!({"id": "1"}))).await,
            Err(ManagerError::UnknownPath(_))
        ));
        manager.register("/late", SlowFactory::new(Duration::ZERO));
        manager.enqueue("/late", event(json!({"id": "1", "status": "open"}))).await.unwrap();
        next(&mut rx).await;
        assert_eq!(catalog.upsert_count(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_queued_events() {
        let (manager, catalog, _rx) = setup(ManagerConfig::default());
        let factory = SlowFactory::new(Duration::from_millis(10));
        manager.register("/issues", factory.clone());
        manager.start();
        for i in 0..3 {
            manager
                .enqueue("/issues", event(json!({"id": i.to_string(), "status": "open"})))
                .await
                .unwrap();
        }
        manager.shutdown().await;
        assert_eq!(catalog.entities().await.len(), 3);
        assert_eq!(factory.created.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn shutdown_cancels_after_the_drain_timeout() {
        let (manager, _catalog, _rx) = setup(ManagerConfig {
            max_wait_before_shutdown: Duration::from_millis(50),
            ..ManagerConfig::default()
        });
        manager.register("/issues", SlowFactory::new(Duration::from_secs(30)));
        manager.start();
        manager.enqueue("/issues", event(json!({"id": "1", "status": "open"}))).await.unwrap();

        let started = Instant::now();
        manager.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
