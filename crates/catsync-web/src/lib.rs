//! HTTP surface: webhook ingestion, health, and on-demand resync.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use catsync_core::{OriginalRequest, WebhookEvent};
use catsync_sync::{ResyncOrchestrator, Service, SyncError};
use catsync_webhook::{normalize_path, ManagerError, WebhookProcessorManager};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "catsync-web";

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<WebhookProcessorManager>,
    pub orchestrator: Arc<ResyncOrchestrator>,
}

impl AppState {
    pub fn new(manager: Arc<WebhookProcessorManager>, orchestrator: Arc<ResyncOrchestrator>) -> Self {
        Self { manager, orchestrator }
    }

    pub fn from_service(service: &Service) -> Self {
        Self::new(service.manager.clone(), service.orchestrator.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Error,
}

/// Immediate answer to an inbound call; processing happens later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            status: AckStatus::Ok,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Error,
            message: Some(message.into()),
        }
    }
}

fn reply(status: StatusCode, ack: Ack) -> Response {
    (status, Json(ack)).into_response()
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/integration/{*path}", post(webhook_handler))
        .route("/health", get(health_handler))
        .route("/resync", post(resync_handler))
        .with_state(Arc::new(state))
}

/// Binds `bind` and serves until `shutdown` resolves.
pub async fn serve<F>(state: AppState, bind: &str, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind).await?;
    info!(bind, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect()
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = normalize_path(&path);
    if !state.manager.has_path(&path) {
        warn!(path = %path, "webhook for unregistered path");
        return reply(StatusCode::NOT_FOUND, Ack::error(format!("no handler registered for {path}")));
    }

    let request = OriginalRequest::new(method.as_str(), uri.to_string(), body.to_vec());
    let event = match WebhookEvent::from_request(request, header_map(&headers)) {
        Ok(event) => event,
        Err(err) => {
            warn!(path = %path, error = %err, "rejecting unparsable webhook");
            return reply(StatusCode::BAD_REQUEST, Ack::error(err.to_string()));
        }
    };

    match state.manager.enqueue(&path, event).await {
        Ok(()) => reply(StatusCode::OK, Ack::ok()),
        Err(err @ ManagerError::UnknownPath(_)) => reply(StatusCode::NOT_FOUND, Ack::error(err.to_string())),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Health {
    pub status: AckStatus,
    pub paths: Vec<String>,
    pub resync_running: bool,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: AckStatus::Ok,
        paths: state.manager.paths(),
        resync_running: state.orchestrator.is_running(),
    })
}

async fn resync_handler(State(state): State<Arc<AppState>>) -> Response {
    let pass = match state.orchestrator.spawn_once() {
        Ok(pass) => pass,
        Err(err @ SyncError::AlreadyRunning) => return reply(StatusCode::CONFLICT, Ack::error(err.to_string())),
        Err(err) => return reply(StatusCode::INTERNAL_SERVER_ERROR, Ack::error(err.to_string())),
    };
    tokio::spawn(async move {
        match pass.await {
            Ok(Ok(summary)) => info!(run_id = %summary.run_id, upserted = summary.upserted, deleted = summary.deleted, "triggered resync completed"),
            Ok(Err(err)) => error!(error = %err, "triggered resync failed"),
            Err(err) => error!(error = %err, "triggered resync task aborted"),
        }
    });
    reply(StatusCode::ACCEPTED, Ack::ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use catsync_adapters::{register_routes, StaticVendor, VendorClient};
    use catsync_core::{AppConfig, StaticAppConfig};
    use catsync_mapping::EntityMapper;
    use catsync_storage::{InMemoryCacheProvider, InMemoryCatalog};
    use catsync_webhook::{ManagerConfig, ProcessingContext};
    use http_body_util::BodyExt;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    const CONFIG: &str = r#"
resources:
  - kind: issue
    port:
      entity:
        mappings:
          identifier: .id
          blueprint: '"issue"'
          properties:
            status: .status
webhooks:
  - path: /vendor
    kinds: [issue]
    idPointer: /issue/id
"#;

    struct Harness {
        state: AppState,
        catalog: Arc<InMemoryCatalog>,
        vendor: Arc<StaticVendor>,
        processed: mpsc::UnboundedReceiver<WebhookEvent>,
    }

    async fn harness() -> Harness {
        let config = AppConfig::from_yaml_str(CONFIG, "test").expect("config");
        let provider = Arc::new(StaticAppConfig::new(config.clone()));
        let catalog = Arc::new(InMemoryCatalog::new());
        let vendor = Arc::new(StaticVendor::new());
        vendor
            .set_pages("issue", vec![vec![json!({"id": "ISS-1", "status": "open"})]])
            .await;
        let mapper = Arc::new(EntityMapper::new());
        let (tx, processed) = mpsc::unbounded_channel();
        let manager = Arc::new(
            WebhookProcessorManager::new(
                ProcessingContext {
                    config: provider.clone(),
                    catalog: catalog.clone(),
                    mapper: mapper.clone(),
                },
                ManagerConfig::default(),
            )
            .with_observer(tx),
        );
        let static_vendor = vendor.clone();
        let vendor: Arc<dyn VendorClient> = vendor;
        register_routes(&manager, &config, vendor.clone());
        manager.start();
        let orchestrator = Arc::new(ResyncOrchestrator::new(
            provider,
            catalog.clone(),
            vendor,
            mapper,
            Arc::new(InMemoryCacheProvider::new()),
        ));
        Harness {
            state: AppState::new(manager, orchestrator),
            catalog,
            vendor: static_vendor,
            processed,
        }
    }

    fn post(uri: &str, body: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn ack(resp: Response) -> Ack {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn accepted_webhook_is_acknowledged_then_processed() {
        let mut h = harness().await;
        let resp = app(h.state.clone())
            .oneshot(post("/integration/vendor", r#"{"issue": {"id": "ISS-1"}}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(ack(resp).await, Ack::ok());

        let event = tokio::time::timeout(Duration::from_secs(5), h.processed.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.original_request().is_some());
        assert_eq!(
            h.catalog.get("ISS-1", "issue").await.map(|e| e.properties["status"].clone()),
            Some(json!("open"))
        );
    }

    #[tokio::test]
    async fn unknown_path_answers_not_found() {
        let h = harness().await;
        let resp = app(h.state)
            .oneshot(post("/integration/nobody-home", "{}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(ack(resp).await.status, AckStatus::Error);
    }

    #[tokio::test]
    async fn unparsable_body_is_rejected_and_never_queued() {
        let mut h = harness().await;
        let resp = app(h.state.clone())
            .oneshot(post("/integration/vendor", "{not json"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let ack = ack(resp).await;
        assert_eq!(ack.status, AckStatus::Error);
        assert!(ack.message.is_some());

        assert!(tokio::time::timeout(Duration::from_millis(100), h.processed.recv())
            .await
            .is_err());
        assert_eq!(h.catalog.upsert_count(), 0);
    }

    #[tokio::test]
    async fn health_lists_registered_paths() {
        let h = harness().await;
        let resp = app(h.state)
            .oneshot(axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let health: Health = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.paths, vec!["/vendor".to_string()]);
        assert!(!health.resync_running);
    }

    #[tokio::test]
    async fn resync_runs_in_the_background() {
        let h = harness().await;
        let resp = app(h.state.clone())
            .oneshot(post("/resync", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(ack(resp).await, Ack::ok());

        let catalog = h.catalog.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while catalog.get("ISS-1", "issue").await.is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn second_resync_while_one_is_in_flight_conflicts() {
        let h = harness().await;
        let held = h.vendor.hold_pages().await;

        let first = app(h.state.clone()).oneshot(post("/resync", "")).await.unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = app(h.state.clone()).oneshot(post("/resync", "")).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        let ack = ack(second).await;
        assert_eq!(ack.status, AckStatus::Error);
        assert_eq!(ack.message.as_deref(), Some("a resync pass is already running"));

        let resp = app(h.state.clone())
            .oneshot(axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let health: Health = serde_json::from_slice(&body).unwrap();
        assert!(health.resync_running);

        drop(held);
        let orchestrator = h.state.orchestrator.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while orchestrator.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(h.catalog.get("ISS-1", "issue").await.is_some());
        let third = app(h.state).oneshot(post("/resync", "")).await.unwrap();
        assert_eq!(third.status(), StatusCode::ACCEPTED);
    }
}
