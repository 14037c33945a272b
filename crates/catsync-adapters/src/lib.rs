//! Vendor-facing side of the integration: how raw items are paged out of the
//! third-party system, and the configurable webhook handler that turns vendor
//! events into raw results.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use catsync_core::ResourceConfig;
use catsync_storage::{endpoint, FetchError, HttpFetcher, VENDOR_SOURCE};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::debug;

pub mod verification;
pub mod webhook;

pub use webhook::{register_routes, ResourceHandlerFactory, ResourceWebhookHandler};

pub const CRATE_NAME: &str = "catsync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("vendor request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Fetch(err) if err.is_transient())
    }
}

/// What a resync asks the vendor for: one kind, narrowed by the selector's
/// vendor-specific filters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResyncRequest {
    pub kind: String,
    pub filters: BTreeMap<String, JsonValue>,
}

impl ResyncRequest {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            filters: BTreeMap::new(),
        }
    }
}

impl From<&ResourceConfig> for ResyncRequest {
    fn from(resource: &ResourceConfig) -> Self {
        Self {
            kind: resource.kind.clone(),
            filters: resource.selector.filters.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncPage {
    #[serde(default)]
    pub items: Vec<JsonValue>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

impl ResyncPage {
    /// Accepts either a bare array or `{"items": [...], "nextCursor": ...}`.
    fn from_json(value: JsonValue, what: &str) -> Result<Self, AdapterError> {
        match value {
            JsonValue::Array(items) => Ok(Self {
                items,
                next_cursor: None,
            }),
            other => serde_json::from_value(other).map_err(|source| AdapterError::Decode {
                what: what.to_string(),
                source,
            }),
        }
    }
}

#[async_trait]
pub trait VendorClient: Send + Sync {
    fn name(&self) -> &str;

    /// One page of raw items. `cursor` is `None` for the first page; the
    /// sequence ends when a page carries no `next_cursor`.
    async fn fetch_page(
        &self,
        request: &ResyncRequest,
        cursor: Option<&str>,
    ) -> Result<ResyncPage, AdapterError>;

    /// Current vendor state of one object, `None` once it is gone.
    async fn get_resource(&self, kind: &str, id: &str) -> Result<Option<JsonValue>, AdapterError>;
}

/// Drains every page for `request`.
pub async fn fetch_all(
    vendor: &dyn VendorClient,
    request: &ResyncRequest,
) -> Result<Vec<Vec<JsonValue>>, AdapterError> {
    let mut pages = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = vendor.fetch_page(request, cursor.as_deref()).await?;
        debug!(vendor = vendor.name(), kind = %request.kind, items = page.items.len(), "fetched page");
        pages.push(page.items);
        match page.next_cursor {
            Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
            _ => break,
        }
    }
    Ok(pages)
}

/// `id`, `key`, or `identifier` rendered as a string.
pub fn item_id(item: &JsonValue) -> Option<String> {
    ["id", "key", "identifier"]
        .iter()
        .filter_map(|field| item.get(*field))
        .find_map(|v| match v {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Reads `<root>/<kind>/page-<n>.json`, starting at 1. The cursor is the page
/// number.
#[derive(Debug, Clone)]
pub struct FixtureVendor {
    root: PathBuf,
}

impl FixtureVendor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn page_path(&self, kind: &str, page: usize) -> PathBuf {
        self.root.join(kind).join(format!("page-{page}.json"))
    }

    async fn read_page(&self, kind: &str, page: usize) -> Result<Option<ResyncPage>, AdapterError> {
        let path = self.page_path(kind, page);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(AdapterError::Fixture { path, source }),
        };
        let what = path.display().to_string();
        let value: JsonValue = serde_json::from_slice(&bytes).map_err(|source| AdapterError::Decode {
            what: what.clone(),
            source,
        })?;
        ResyncPage::from_json(value, &what).map(Some)
    }
}

#[async_trait]
impl VendorClient for FixtureVendor {
    fn name(&self) -> &str {
        "fixtures"
    }

    async fn fetch_page(
        &self,
        request: &ResyncRequest,
        cursor: Option<&str>,
    ) -> Result<ResyncPage, AdapterError> {
        let page_no = match cursor {
            None => 1,
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| AdapterError::Message(format!("invalid fixture cursor {c:?}")))?,
        };
        let Some(mut page) = self.read_page(&request.kind, page_no).await? else {
            return Ok(ResyncPage::default());
        };
        if page.next_cursor.is_none() && tokio::fs::try_exists(self.page_path(&request.kind, page_no + 1))
            .await
            .unwrap_or(false)
        {
            page.next_cursor = Some((page_no + 1).to_string());
        }
        Ok(page)
    }

    async fn get_resource(&self, kind: &str, id: &str) -> Result<Option<JsonValue>, AdapterError> {
        let mut page_no = 1;
        while let Some(page) = self.read_page(kind, page_no).await? {
            if let Some(found) = page.items.into_iter().find(|i| item_id(i).as_deref() == Some(id)) {
                return Ok(Some(found));
            }
            page_no += 1;
        }
        Ok(None)
    }
}

/// In-memory vendor. Pages and single objects can be swapped at runtime and a
/// kind can be made to fail, which is what resync and handler tests need.
#[derive(Debug, Default)]
pub struct StaticVendor {
    pages: RwLock<BTreeMap<String, Vec<Vec<JsonValue>>>>,
    failing: RwLock<BTreeMap<String, String>>,
    resource_calls: AtomicUsize,
}

impl StaticVendor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_pages(&self, kind: impl Into<String>, pages: Vec<Vec<JsonValue>>) {
        self.pages.write().await.insert(kind.into(), pages);
    }

    pub async fn fail_kind(&self, kind: impl Into<String>, message: impl Into<String>) {
        self.failing.write().await.insert(kind.into(), message.into());
    }

    pub async fn clear_failures(&self) {
        self.failing.write().await.clear();
    }

    pub fn resource_calls(&self) -> usize {
        self.resource_calls.load(Ordering::SeqCst)
    }

    /// Page fetches wait until the returned guard is dropped.
    pub async fn hold_pages(&self) -> PagesHeld<'_> {
        PagesHeld(self.pages.write().await)
    }

    async fn failure(&self, kind: &str) -> Option<AdapterError> {
        self.failing
            .read()
            .await
            .get(kind)
            .map(|m| AdapterError::Message(m.clone()))
    }
}

#[must_use = "page fetches resume as soon as this is dropped"]
pub struct PagesHeld<'a>(RwLockWriteGuard<'a, BTreeMap<String, Vec<Vec<JsonValue>>>>);

#[async_trait]
impl VendorClient for StaticVendor {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch_page(
        &self,
        request: &ResyncRequest,
        cursor: Option<&str>,
    ) -> Result<ResyncPage, AdapterError> {
        if let Some(err) = self.failure(&request.kind).await {
            return Err(err);
        }
        let index = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let pages = self.pages.read().await;
        let Some(kind_pages) = pages.get(&request.kind) else {
            return Ok(ResyncPage::default());
        };
        Ok(ResyncPage {
            items: kind_pages.get(index).cloned().unwrap_or_default(),
            next_cursor: (index + 1 < kind_pages.len()).then(|| (index + 1).to_string()),
        })
    }

    async fn get_resource(&self, kind: &str, id: &str) -> Result<Option<JsonValue>, AdapterError> {
        self.resource_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failure(kind).await {
            return Err(err);
        }
        Ok(self
            .pages
            .read()
            .await
            .get(kind)
            .into_iter()
            .flatten()
            .flatten()
            .find(|i| item_id(i).as_deref() == Some(id))
            .cloned())
    }
}

/// JSON-over-HTTP vendor: `GET {base}/{kind}?cursor=..&<filters>` for pages and
/// `GET {base}/{kind}/{id}` for single objects.
#[derive(Debug, Clone)]
pub struct RestVendor {
    base_url: String,
    token: Option<String>,
    http: Arc<HttpFetcher>,
}

impl RestVendor {
    pub fn new(base_url: impl Into<String>, token: Option<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            base_url: base_url.into(),
            token,
            http,
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

fn filter_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl VendorClient for RestVendor {
    fn name(&self) -> &str {
        "rest"
    }

    async fn fetch_page(
        &self,
        request: &ResyncRequest,
        cursor: Option<&str>,
    ) -> Result<ResyncPage, AdapterError> {
        let url = endpoint(&self.base_url, [request.kind.as_str()])?;
        let mut query: Vec<(String, String)> = request
            .filters
            .iter()
            .map(|(k, v)| (k.clone(), filter_value(v)))
            .collect();
        if let Some(cursor) = cursor {
            query.push(("cursor".to_string(), cursor.to_string()));
        }
        let response = self
            .http
            .send(VENDOR_SOURCE, url.as_str(), |client| {
                self.authorize(client.get(url.clone()).query(&query))
            })
            .await?;
        ResyncPage::from_json(response.json()?, url.as_str())
    }

    async fn get_resource(&self, kind: &str, id: &str) -> Result<Option<JsonValue>, AdapterError> {
        let url = endpoint(&self.base_url, [kind, id])?;
        match self
            .http
            .send(VENDOR_SOURCE, url.as_str(), |client| self.authorize(client.get(url.clone())))
            .await
        {
            Ok(response) => Ok(Some(response.json()?)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workspace_fixtures() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
    }

    #[tokio::test]
    async fn fixture_vendor_pages_through_workspace_fixtures() {
        let vendor = FixtureVendor::new(workspace_fixtures());
        let pages = fetch_all(&vendor, &ResyncRequest::new("issue"))
            .await
            .expect("pages");
        assert_eq!(pages.len(), 2);
        assert!(pages.iter().all(|p| !p.is_empty()));

        let found = vendor.get_resource("issue", "ISS-3").await.expect("lookup");
        assert_eq!(found.and_then(|i| item_id(&i)), Some("ISS-3".to_string()));
        assert!(vendor.get_resource("issue", "nope").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn fixture_vendor_accepts_object_pages_and_missing_kinds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kind_dir = dir.path().join("team");
        std::fs::create_dir_all(&kind_dir).expect("mkdir");
        std::fs::write(
            kind_dir.join("page-1.json"),
            r#"{"items":[{"id":1}],"nextCursor":"3"}"#,
        )
        .expect("write");
        std::fs::write(kind_dir.join("page-3.json"), r#"[{"id":2}]"#).expect("write");

        let vendor = FixtureVendor::new(dir.path());
        let pages = fetch_all(&vendor, &ResyncRequest::new("team")).await.expect("pages");
        assert_eq!(pages, vec![vec![json!({"id":1})], vec![json!({"id":2})]]);

        let empty = fetch_all(&vendor, &ResyncRequest::new("ghost")).await.expect("pages");
        assert_eq!(empty, vec![Vec::<JsonValue>::new()]);
    }

    #[tokio::test]
    async fn malformed_fixture_is_a_decode_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("issue")).expect("mkdir");
        std::fs::write(dir.path().join("issue/page-1.json"), "{not json").expect("write");
        let err = FixtureVendor::new(dir.path())
            .fetch_page(&ResyncRequest::new("issue"), None)
            .await
            .expect_err("decode failure");
        assert!(matches!(err, AdapterError::Decode { .. }));
    }

    #[tokio::test]
    async fn static_vendor_pages_and_fails_on_request() {
        let vendor = StaticVendor::new();
        vendor
            .set_pages("issue", vec![vec![json!({"id": "a"})], vec![json!({"id": 7})]])
            .await;
        let pages = fetch_all(&vendor, &ResyncRequest::new("issue")).await.expect("pages");
        assert_eq!(pages.len(), 2);
        assert_eq!(
            vendor.get_resource("issue", "7").await.expect("lookup"),
            Some(json!({"id": 7}))
        );

        vendor.fail_kind("issue", "vendor down").await;
        let err = fetch_all(&vendor, &ResyncRequest::new("issue"))
            .await
            .expect_err("failure");
        assert_eq!(err.to_string(), "vendor down");
        assert_eq!(vendor.resource_calls(), 1);
    }

    #[test]
    fn item_id_prefers_id_and_renders_numbers() {
        assert_eq!(item_id(&json!({"id": 12, "key": "k"})), Some("12".into()));
        assert_eq!(item_id(&json!({"key": "k"})), Some("k".into()));
        assert_eq!(item_id(&json!({"id": null})), None);
    }

    async fn local_vendor() -> String {
        use axum::extract::{Path as UrlPath, Query};
        use axum::http::StatusCode;
        use axum::routing::get;
        use axum::{Json, Router};

        async fn page(UrlPath(kind): UrlPath<String>, Query(q): Query<BTreeMap<String, String>>) -> Json<JsonValue> {
            Json(json!({"items": [{"id": format!("{kind}-1"), "team": q.get("team")}]}))
        }
        async fn one(UrlPath((kind, id)): UrlPath<(String, String)>) -> Result<Json<JsonValue>, StatusCode> {
            if id == "org/repo" {
                Ok(Json(json!({"id": id, "kind": kind})))
            } else {
                Err(StatusCode::NOT_FOUND)
            }
        }

        let app = Router::new()
            .route("/api/{kind}", get(page))
            .route("/api/{kind}/{id}", get(one));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{addr}/api/")
    }

    #[tokio::test]
    async fn rest_vendor_keeps_ids_as_single_path_segments() {
        let http = Arc::new(HttpFetcher::new(Default::default()).expect("client"));
        let vendor = RestVendor::new(local_vendor().await, Some("token".into()), http);

        let found = vendor.get_resource("repository", "org/repo").await.expect("lookup");
        assert_eq!(found, Some(json!({"id": "org/repo", "kind": "repository"})));
        assert_eq!(vendor.get_resource("repository", "org").await.expect("lookup"), None);

        let mut request = ResyncRequest::new("repository");
        request.filters.insert("team".into(), json!("platform"));
        let pages = fetch_all(&vendor, &request).await.expect("pages");
        assert_eq!(pages, vec![vec![json!({"id": "repository-1", "team": "platform"})]]);
    }
}
