//! A webhook handler driven by a [`WebhookRouteConfig`] entry: signature
//! checks, event filtering, and upsert-or-delete based on the event action.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use catsync_core::{
    AppConfig, ResourceConfig, SignatureMethod, WebhookEvent, WebhookEventRawResults, WebhookRouteConfig,
};
use catsync_webhook::{CircuitBreaker, HandlerError, HandlerFactory, WebhookHandler, WebhookProcessorManager};
use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::verification::{
    check_timestamp, verify_hmac_sha256, verify_shared_secret, verify_standard_webhooks,
    DEFAULT_TIMESTAMP_TOLERANCE_SECS,
};
use crate::{AdapterError, VendorClient};

const DEFAULT_HMAC_HEADER: &str = "x-hub-signature-256";
const DEFAULT_STANDARD_HEADER: &str = "webhook-signature";
const DEFAULT_SHARED_SECRET_HEADER: &str = "x-webhook-secret";

impl From<AdapterError> for HandlerError {
    fn from(err: AdapterError) -> Self {
        if err.is_transient() {
            HandlerError::Retryable(err.to_string())
        } else {
            HandlerError::Message(err.to_string())
        }
    }
}

fn pointer_string(payload: &JsonValue, pointer: &str) -> Option<String> {
    match payload.pointer(pointer)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub struct ResourceWebhookHandler {
    route: Arc<WebhookRouteConfig>,
    vendor: Arc<dyn VendorClient>,
    breaker: Option<Arc<CircuitBreaker>>,
    secret: Option<String>,
    trace_id: String,
}

impl ResourceWebhookHandler {
    fn signature_header(&self, default: &str) -> String {
        self.route
            .signature
            .header
            .as_deref()
            .unwrap_or(default)
            .to_ascii_lowercase()
    }

    fn verify_signature(&self, event: &WebhookEvent) -> bool {
        let method = self.route.signature.method;
        if matches!(method, SignatureMethod::None | SignatureMethod::SharedSecret) {
            return true;
        }
        let Some(secret) = self.secret.as_deref() else {
            warn!(path = %self.route.path, "signature required but no secret is configured");
            return false;
        };
        let re_encoded;
        let body: &[u8] = match event.original_request() {
            Some(request) => request.body(),
            None => {
                re_encoded = serde_json::to_vec(event.payload()).unwrap_or_default();
                &re_encoded
            }
        };
        match method {
            SignatureMethod::HmacSha256 => event
                .header(&self.signature_header(DEFAULT_HMAC_HEADER))
                .is_some_and(|sig| verify_hmac_sha256(secret, body, sig)),
            SignatureMethod::StandardWebhooks => {
                let (Some(id), Some(ts), Some(sig)) = (
                    event.header("webhook-id"),
                    event.header("webhook-timestamp"),
                    event.header(&self.signature_header(DEFAULT_STANDARD_HEADER)),
                ) else {
                    return false;
                };
                let tolerance = self
                    .route
                    .signature
                    .tolerance_seconds
                    .unwrap_or(DEFAULT_TIMESTAMP_TOLERANCE_SECS);
                if let Err(err) = check_timestamp(ts, Utc::now(), tolerance) {
                    warn!(trace_id = %self.trace_id, error = %err, "webhook timestamp rejected");
                    return false;
                }
                verify_standard_webhooks(secret, body, id, ts, sig)
            }
            SignatureMethod::None | SignatureMethod::SharedSecret => true,
        }
    }

    fn deletion_marker(&self, payload: &JsonValue) -> JsonValue {
        self.route
            .resource_pointer
            .as_deref()
            .and_then(|p| payload.pointer(p))
            .cloned()
            .unwrap_or_else(|| payload.clone())
    }

    async fn fetch_current(&self, kind: &str, id: &str) -> Result<Option<JsonValue>, HandlerError> {
        let vendor = self.vendor.clone();
        let fetch = || async move { vendor.get_resource(kind, id).await.map_err(HandlerError::from) };
        match &self.breaker {
            Some(breaker) => breaker.call(fetch).await,
            None => fetch().await,
        }
    }
}

#[async_trait]
impl WebhookHandler for ResourceWebhookHandler {
    async fn authenticate(&self, _payload: &JsonValue, headers: &BTreeMap<String, String>) -> bool {
        if self.route.signature.method != SignatureMethod::SharedSecret {
            return true;
        }
        let header = self.signature_header(DEFAULT_SHARED_SECRET_HEADER);
        match (self.secret.as_deref(), headers.get(&header)) {
            (Some(secret), Some(value)) => verify_shared_secret(secret, value),
            _ => false,
        }
    }

    async fn should_process_event(&self, event: &WebhookEvent) -> bool {
        if !self.route.events.is_empty() {
            if let Some(header) = &self.route.event_header {
                let event_type = event.header(&header.to_ascii_lowercase()).unwrap_or_default();
                if !self.route.events.iter().any(|e| e == event_type) {
                    debug!(trace_id = %self.trace_id, event_type, "event type not subscribed");
                    return false;
                }
            }
        }
        if !self.verify_signature(event) {
            warn!(trace_id = %self.trace_id, path = %self.route.path, "webhook signature rejected");
            return false;
        }
        true
    }

    async fn validate_payload(&self, payload: &JsonValue) -> bool {
        pointer_string(payload, &self.route.id_pointer).is_some()
            && self
                .route
                .required_fields
                .iter()
                .all(|p| payload.pointer(p).is_some_and(|v| !v.is_null()))
    }

    async fn get_matching_kinds(&self, _event: &WebhookEvent) -> Vec<String> {
        self.route.kinds.clone()
    }

    async fn handle_event(
        &self,
        payload: &JsonValue,
        resource: &ResourceConfig,
    ) -> Result<WebhookEventRawResults, HandlerError> {
        let action = self
            .route
            .action_pointer
            .as_deref()
            .and_then(|p| pointer_string(payload, p));
        if action
            .as_deref()
            .is_some_and(|a| self.route.delete_actions.iter().any(|d| d == a))
        {
            return Ok(WebhookEventRawResults::deleted(vec![self.deletion_marker(payload)]));
        }

        let id = pointer_string(payload, &self.route.id_pointer)
            .ok_or_else(|| HandlerError::Message(format!("no id at {}", self.route.id_pointer)))?;
        match self.fetch_current(&resource.kind, &id).await? {
            Some(current) => Ok(WebhookEventRawResults::updated(vec![current])),
            None => {
                info!(trace_id = %self.trace_id, kind = %resource.kind, id = %id, "vendor object gone, deleting");
                Ok(WebhookEventRawResults::deleted(vec![self.deletion_marker(payload)]))
            }
        }
    }
}

/// One per configured route. The circuit breaker lives here so every handler
/// built for the route shares it.
pub struct ResourceHandlerFactory {
    name: String,
    route: Arc<WebhookRouteConfig>,
    vendor: Arc<dyn VendorClient>,
    breaker: Option<Arc<CircuitBreaker>>,
    secret: Option<String>,
}

impl ResourceHandlerFactory {
    /// Reads the signing secret from the environment variable the route
    /// names.
    pub fn new(route: WebhookRouteConfig, vendor: Arc<dyn VendorClient>) -> Self {
        let secret = route
            .signature
            .secret_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|s| !s.is_empty());
        let name = format!("resource-webhook:{}", route.path);
        let breaker = route
            .circuit_breaker
            .map(|settings| Arc::new(CircuitBreaker::new(name.clone(), settings.into())));
        Self {
            name,
            route: Arc::new(route),
            vendor,
            breaker,
            secret,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn route(&self) -> &WebhookRouteConfig {
        &self.route
    }

    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }
}

impl HandlerFactory for ResourceHandlerFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, event: &WebhookEvent) -> Box<dyn WebhookHandler> {
        Box::new(ResourceWebhookHandler {
            route: self.route.clone(),
            vendor: self.vendor.clone(),
            breaker: self.breaker.clone(),
            secret: self.secret.clone(),
            trace_id: event.trace_id().to_string(),
        })
    }
}

/// Registers a handler factory for every route in `config.webhooks`.
pub fn register_routes(
    manager: &WebhookProcessorManager,
    config: &AppConfig,
    vendor: Arc<dyn VendorClient>,
) -> Vec<Arc<ResourceHandlerFactory>> {
    let mut factories = Vec::with_capacity(config.webhooks.len());
    for route in &config.webhooks {
        let factory = Arc::new(ResourceHandlerFactory::new(route.clone(), vendor.clone()));
        manager.register(&route.path, factory.clone());
        info!(path = %route.path, kinds = ?route.kinds, "registered webhook route");
        factories.push(factory);
    }
    factories
}
