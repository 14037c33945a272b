//! Full resync passes and the service wiring shared by the binary and the
//! web layer.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use catsync_adapters::{fetch_all, register_routes, FixtureVendor, RestVendor, ResyncRequest, VendorClient};
use catsync_core::{AppConfig, AppConfigProvider, Blueprint, CoreError, Entity, FileAppConfig};
use catsync_mapping::EntityMapper;
use catsync_storage::{
    cache_key, cached_pages, CacheProvider, CatalogClient, CatalogError, CatalogOptions, DiskCacheProvider,
    HttpCatalogClient, HttpClientConfig, HttpFetcher, InMemoryCacheProvider, RateLimit, VENDOR_SOURCE,
};
use catsync_webhook::{ManagerConfig, ProcessingContext, WebhookProcessorManager};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod diff;

pub use diff::{diff, diff_blueprints, diff_entities, Diff, DiffCounts, PortDiff, Reconcilable};

pub const CRATE_NAME: &str = "catsync-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Disk,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub config_path: PathBuf,
    pub bind: String,
    pub catalog_url: String,
    pub catalog_token: Option<String>,
    pub vendor_url: Option<String>,
    pub vendor_token: Option<String>,
    /// Sustained vendor requests per second; unset or non-positive means no limit.
    pub vendor_rate_limit: Option<f64>,
    pub vendor_rate_burst: Option<u32>,
    pub fixtures_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub resync_cron: String,
    pub resync_on_start: bool,
    pub cache_backend: CacheBackend,
    pub cache_dir: PathBuf,
    pub max_wait_seconds_before_shutdown: u64,
}

fn flag(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            config_path: non_empty("CATSYNC_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./catsync.yaml")),
            bind: non_empty("CATSYNC_BIND").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            catalog_url: non_empty("CATSYNC_CATALOG_URL").unwrap_or_else(|| "http://localhost:3000".to_string()),
            catalog_token: non_empty("CATSYNC_CATALOG_TOKEN"),
            vendor_url: non_empty("CATSYNC_VENDOR_URL"),
            vendor_token: non_empty("CATSYNC_VENDOR_TOKEN"),
            vendor_rate_limit: non_empty("CATSYNC_VENDOR_RATE_LIMIT").and_then(|v| v.trim().parse().ok()),
            vendor_rate_burst: non_empty("CATSYNC_VENDOR_RATE_BURST").and_then(|v| v.trim().parse().ok()),
            fixtures_dir: non_empty("CATSYNC_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./fixtures")),
            user_agent: non_empty("CATSYNC_USER_AGENT").unwrap_or_else(|| "catsync/0.1".to_string()),
            http_timeout_secs: non_empty("CATSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: flag(non_empty("CATSYNC_SCHEDULER_ENABLED")),
            resync_cron: non_empty("CATSYNC_RESYNC_CRON").unwrap_or_else(|| "0 0 */6 * * *".to_string()),
            resync_on_start: flag(non_empty("CATSYNC_RESYNC_ON_START")),
            cache_backend: match non_empty("CATSYNC_CACHE_BACKEND").as_deref() {
                Some("disk") => CacheBackend::Disk,
                _ => CacheBackend::Memory,
            },
            cache_dir: non_empty("CATSYNC_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./.catsync-cache")),
            max_wait_seconds_before_shutdown: non_empty("CATSYNC_MAX_WAIT_SECONDS_BEFORE_SHUTDOWN")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let mut rate_limits = BTreeMap::new();
        if let Some(rps) = self.vendor_rate_limit.filter(|rps| rps.is_finite() && *rps > 0.0) {
            let mut limit = RateLimit::per_second(rps);
            if let Some(burst) = self.vendor_rate_burst {
                limit.burst = burst.max(1);
            }
            rate_limits.insert(VENDOR_SOURCE.to_string(), limit);
        }
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            rate_limits,
            ..Default::default()
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_wait_before_shutdown: Duration::from_secs(self.max_wait_seconds_before_shutdown),
            ..Default::default()
        }
    }

    pub fn cache_provider(&self) -> Arc<dyn CacheProvider> {
        match self.cache_backend {
            CacheBackend::Memory => Arc::new(InMemoryCacheProvider::new()),
            CacheBackend::Disk => Arc::new(DiskCacheProvider::new(self.cache_dir.clone())),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a resync pass is already running")]
    AlreadyRunning,
    #[error("loading mapping configuration: {0}")]
    Config(#[from] CoreError),
    #[error("catalog: {0}")]
    Catalog(#[from] CatalogError),
}

/// Per-kind outcome of the fetch and mapping stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KindSummary {
    pub raw_items: usize,
    pub entities: usize,
    pub excluded: usize,
    pub dropped: usize,
    pub misconfigured_fields: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResyncSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub kinds: BTreeMap<String, KindSummary>,
    pub entities: DiffCounts,
    pub blueprints: DiffCounts,
    pub upserted: usize,
    pub deleted: usize,
    pub failed_writes: usize,
    /// Nothing differed between vendor and catalog.
    pub in_sync: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_skipped: Option<String>,
}

impl ResyncSummary {
    pub fn has_errors(&self) -> bool {
        self.failed_writes > 0 || self.kinds.values().any(|k| k.error.is_some())
    }
}

/// Runs full passes: vendor pages through the mapper, diffed against the
/// catalog, applied as upserts and guarded deletions.
pub struct ResyncOrchestrator {
    config: Arc<dyn AppConfigProvider>,
    catalog: Arc<dyn CatalogClient>,
    vendor: Arc<dyn VendorClient>,
    mapper: Arc<EntityMapper>,
    cache: Arc<dyn CacheProvider>,
    running: Arc<Mutex<()>>,
}

impl ResyncOrchestrator {
    pub fn new(
        config: Arc<dyn AppConfigProvider>,
        catalog: Arc<dyn CatalogClient>,
        vendor: Arc<dyn VendorClient>,
        mapper: Arc<EntityMapper>,
        cache: Arc<dyn CacheProvider>,
    ) -> Self {
        Self {
            config,
            catalog,
            vendor,
            mapper,
            cache,
            running: Arc::new(Mutex::new(())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    pub async fn run_once(&self) -> Result<ResyncSummary, SyncError> {
        let _pass = self.running.try_lock().map_err(|_| SyncError::AlreadyRunning)?;
        self.run_claimed().await
    }

    /// Claims the single-flight slot before returning, then runs the pass on
    /// a background task. A second call made before that pass ends fails with
    /// [`SyncError::AlreadyRunning`].
    pub fn spawn_once(self: &Arc<Self>) -> Result<JoinHandle<Result<ResyncSummary, SyncError>>, SyncError> {
        let pass = self
            .running
            .clone()
            .try_lock_owned()
            .map_err(|_| SyncError::AlreadyRunning)?;
        let orchestrator = self.clone();
        Ok(tokio::spawn(async move {
            let _pass = pass;
            orchestrator.run_claimed().await
        }))
    }

    async fn run_claimed(&self) -> Result<ResyncSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("resync", run_id = %run_id);
        self.run_pass(run_id).instrument(span).await
    }

    async fn run_pass(&self, run_id: Uuid) -> Result<ResyncSummary, SyncError> {
        let started_at = Utc::now();
        let app = self.config.load().await?;
        info!(resources = app.resources.len(), "resync started");

        if let Err(err) = self.cache.clear().await {
            warn!(error = %err, "clearing cache failed; stale pages may be reused");
        }

        let existing_blueprints = self.configured_blueprints_in_catalog(&app).await?;
        let (after, kinds) = self.collect_after(&app).await;

        let scope = self.blueprint_scope(&app, &after);
        let before = self.catalog.list_entities(&scope).await?;
        let port = PortDiff::compute(&before, &after, &existing_blueprints, &app.blueprints);
        let entity_diff = &port.entities;
        debug!(
            before = before.len(),
            after = after.len(),
            created = entity_diff.created.len(),
            modified = entity_diff.modified.len(),
            deleted = entity_diff.deleted.len(),
            blueprints_changed = port.blueprints.created.len() + port.blueprints.modified.len(),
            "port diff computed"
        );
        if port.is_empty() {
            info!("catalog already matches the vendor");
        }

        self.apply_blueprints(&port.blueprints).await?;

        let options = CatalogOptions::from(&*app);
        let mut upserted = 0;
        let mut deleted = 0;
        let mut failed_writes = 0;
        for entity in entity_diff.created.iter().chain(&entity_diff.modified) {
            match self.catalog.upsert_entity(entity, options).await {
                Ok(()) => upserted += 1,
                Err(err) => {
                    warn!(identifier = %entity.identifier, blueprint = %entity.blueprint, error = %err, "upsert failed");
                    failed_writes += 1;
                }
            }
        }

        let deletion_skipped = deletion_guard(&app, &kinds, before.len(), entity_diff.deleted.len());
        match &deletion_skipped {
            Some(reason) => warn!(candidates = entity_diff.deleted.len(), reason = %reason, "skipping stale entity deletion"),
            None => {
                for entity in &entity_diff.deleted {
                    match self.catalog.delete_entity(entity, options).await {
                        Ok(()) => deleted += 1,
                        Err(err) => {
                            warn!(identifier = %entity.identifier, blueprint = %entity.blueprint, error = %err, "delete failed");
                            failed_writes += 1;
                        }
                    }
                }
            }
        }

        let summary = ResyncSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            kinds,
            entities: entity_diff.counts(),
            blueprints: port.blueprints.counts(),
            upserted,
            deleted,
            failed_writes,
            in_sync: port.is_empty(),
            deletion_skipped,
        };
        info!(upserted, deleted, failed_writes, "resync finished");
        Ok(summary)
    }

    /// Catalog blueprints that the mapping document also defines. Others are
    /// out of scope, so the blueprint diff never proposes deleting them.
    async fn configured_blueprints_in_catalog(&self, app: &AppConfig) -> Result<Vec<Blueprint>, SyncError> {
        if app.blueprints.is_empty() {
            return Ok(Vec::new());
        }
        let configured: BTreeSet<&str> = app.blueprints.iter().map(|b| b.identifier.as_str()).collect();
        Ok(self
            .catalog
            .list_blueprints()
            .await?
            .into_iter()
            .filter(|b| configured.contains(b.identifier.as_str()))
            .collect())
    }

    /// Creates or updates blueprints before any entity write that needs them.
    async fn apply_blueprints(&self, changes: &Diff<Blueprint>) -> Result<(), SyncError> {
        for blueprint in changes.created.iter().chain(&changes.modified) {
            self.catalog.upsert_blueprint(blueprint).await?;
            info!(blueprint = %blueprint.identifier, "blueprint ensured");
        }
        Ok(())
    }

    async fn collect_after(&self, app: &AppConfig) -> (Vec<Entity>, BTreeMap<String, KindSummary>) {
        let mut after = Vec::new();
        let mut kinds: BTreeMap<String, KindSummary> = BTreeMap::new();
        for resource in &app.resources {
            let summary = kinds.entry(resource.kind.clone()).or_default();
            let request = ResyncRequest::from(resource);
            let key = cache_key("vendor.fetch_all", &request);
            let pages = cached_pages(self.cache.as_ref(), &key, || async {
                fetch_all(self.vendor.as_ref(), &request)
                    .await
                    .map(|pages| pages.into_iter().map(JsonValue::Array).collect())
            })
            .await;
            let pages = match pages {
                Ok(pages) => pages,
                Err(err) => {
                    error!(kind = %resource.kind, error = %err, "vendor fetch failed");
                    summary.error = Some(err.to_string());
                    continue;
                }
            };

            for page in pages {
                let items = match page {
                    JsonValue::Array(items) => items,
                    other => vec![other],
                };
                summary.raw_items += items.len();
                match self.mapper.calculate(&items, resource, false) {
                    Ok(result) => {
                        summary.entities += result.selector_diff.passed.len();
                        summary.dropped += result.dropped;
                        summary.misconfigured_fields += result.misconfigured.len();
                        after.extend(result.selector_diff.passed);
                    }
                    Err(err) => {
                        error!(kind = %resource.kind, error = %err, "mapping failed");
                        summary.error = Some(err.to_string());
                        break;
                    }
                }
            }
            summary.excluded = summary.raw_items.saturating_sub(summary.entities + summary.dropped);
            info!(kind = %resource.kind, raw = summary.raw_items, entities = summary.entities, "kind mapped");
        }
        (after, kinds)
    }

    /// Blueprints whose catalog contents this pass owns: configured ones,
    /// constant blueprint expressions, and everything the pass produced.
    fn blueprint_scope(&self, app: &AppConfig, after: &[Entity]) -> Vec<String> {
        let mut scope: BTreeSet<String> = app.blueprints.iter().map(|b| b.identifier.clone()).collect();
        for resource in &app.resources {
            if let Ok(JsonValue::String(bp)) = self.mapper.search(&JsonValue::Null, &resource.mappings().blueprint) {
                scope.insert(bp);
            }
        }
        scope.extend(after.iter().map(|e| e.blueprint.clone()));
        scope.into_iter().collect()
    }

    /// Builds a scheduler running [`ResyncOrchestrator::run_once`] on the
    /// configured cron, or `None` when scheduling is disabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>, config: &ServiceConfig) -> Result<Option<JobScheduler>> {
        if !config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let orchestrator = self.clone();
        let cron = &config.resync_cron;
        let job = Job::new_async(cron, move |_uuid, _l| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                match orchestrator.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled resync completed"),
                    Err(SyncError::AlreadyRunning) => warn!("scheduled resync skipped; previous pass still running"),
                    Err(err) => error!(error = %err, "scheduled resync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

fn deletion_guard(
    app: &AppConfig,
    kinds: &BTreeMap<String, KindSummary>,
    before: usize,
    stale: usize,
) -> Option<String> {
    if stale == 0 {
        return None;
    }
    let failed: Vec<&str> = kinds
        .iter()
        .filter(|(_, k)| k.error.is_some())
        .map(|(kind, _)| kind.as_str())
        .collect();
    if !failed.is_empty() {
        return Some(format!("fetch or mapping failed for {}", failed.join(", ")));
    }
    let ratio = stale as f64 / before.max(1) as f64;
    if ratio > app.entity_deletion_threshold {
        return Some(format!(
            "{stale} of {before} entities would be deleted, above the {:.0}% threshold",
            app.entity_deletion_threshold * 100.0
        ));
    }
    None
}

/// Everything a running connector needs, built from [`ServiceConfig`].
pub struct Service {
    pub config: ServiceConfig,
    pub app_config: Arc<dyn AppConfigProvider>,
    pub vendor: Arc<dyn VendorClient>,
    pub manager: Arc<WebhookProcessorManager>,
    pub orchestrator: Arc<ResyncOrchestrator>,
}

impl Service {
    pub fn from_config(config: ServiceConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let catalog: Arc<dyn CatalogClient> = Arc::new(HttpCatalogClient::new(
            config.catalog_url.clone(),
            config.catalog_token.clone(),
            http.clone(),
        ));
        let vendor: Arc<dyn VendorClient> = match &config.vendor_url {
            Some(url) => Arc::new(RestVendor::new(url.clone(), config.vendor_token.clone(), http)),
            None => Arc::new(FixtureVendor::new(config.fixtures_dir.clone())),
        };
        let app_config: Arc<dyn AppConfigProvider> = Arc::new(FileAppConfig::new(config.config_path.clone()));
        Ok(Self::assemble(config, app_config, catalog, vendor))
    }

    /// Wires already-built collaborators together.
    pub fn assemble(
        config: ServiceConfig,
        app_config: Arc<dyn AppConfigProvider>,
        catalog: Arc<dyn CatalogClient>,
        vendor: Arc<dyn VendorClient>,
    ) -> Self {
        let mapper = Arc::new(EntityMapper::new());
        let manager = Arc::new(WebhookProcessorManager::new(
            ProcessingContext {
                config: app_config.clone(),
                catalog: catalog.clone(),
                mapper: mapper.clone(),
            },
            config.manager_config(),
        ));
        let orchestrator = Arc::new(ResyncOrchestrator::new(
            app_config.clone(),
            catalog,
            vendor.clone(),
            mapper,
            config.cache_provider(),
        ));
        Self {
            config,
            app_config,
            vendor,
            manager,
            orchestrator,
        }
    }

    /// Registers a handler for every webhook route in the mapping document.
    pub async fn register_webhooks(&self) -> Result<usize> {
        let app = self
            .app_config
            .load()
            .await
            .context("loading mapping configuration for webhook routes")?;
        Ok(register_routes(&self.manager, &app, self.vendor.clone()).len())
    }
}
