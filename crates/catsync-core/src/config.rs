//! The mapping configuration document and the providers that load it.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Blueprint, CoreError, ResourceConfig};

fn default_true() -> bool {
    true
}

fn default_deletion_threshold() -> f64 {
    0.9
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub delete_dependent_entities: bool,
    #[serde(default = "default_true")]
    pub create_missing_related_entities: bool,
    /// Largest share of existing entities a resync may delete in one pass.
    #[serde(default = "default_deletion_threshold")]
    pub entity_deletion_threshold: f64,
    #[serde(default)]
    pub blueprints: Vec<Blueprint>,
    #[serde(default)]
    pub webhooks: Vec<WebhookRouteConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            resources: Vec::new(),
            delete_dependent_entities: false,
            create_missing_related_entities: true,
            entity_deletion_threshold: default_deletion_threshold(),
            blueprints: Vec::new(),
            webhooks: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn from_yaml_str(text: &str, origin: &str) -> Result<Self, CoreError> {
        let config: AppConfig = serde_yaml::from_str(text).map_err(|source| CoreError::ConfigParse {
            path: origin.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !(0.0..=1.0).contains(&self.entity_deletion_threshold) {
            return Err(CoreError::InvalidConfig(format!(
                "entityDeletionThreshold must be within [0, 1], got {}",
                self.entity_deletion_threshold
            )));
        }
        if let Some(resource) = self.resources.iter().find(|r| r.kind.trim().is_empty()) {
            return Err(CoreError::InvalidConfig(format!(
                "resource with identifier mapping {} has an empty kind",
                resource.mappings().identifier
            )));
        }
        let mut paths = BTreeSet::new();
        for route in &self.webhooks {
            if !paths.insert(route.path.as_str()) {
                return Err(CoreError::InvalidConfig(format!(
                    "webhook path {} is declared twice",
                    route.path
                )));
            }
        }
        Ok(())
    }

    pub fn resources_for_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a ResourceConfig> + 'a {
        self.resources.iter().filter(move |r| r.kind == kind)
    }

    /// Distinct kinds in declaration order.
    pub fn kinds(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.resources
            .iter()
            .map(|r| r.kind.as_str())
            .filter(|k| seen.insert(*k))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureMethod {
    #[default]
    None,
    HmacSha256,
    StandardWebhooks,
    SharedSecret,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureConfig {
    #[serde(default)]
    pub method: SignatureMethod,
    #[serde(default)]
    pub header: Option<String>,
    /// Name of the environment variable holding the secret.
    #[serde(default)]
    pub secret_env: Option<String>,
    /// Accepted clock skew for timestamped schemes, in seconds.
    #[serde(default)]
    pub tolerance_seconds: Option<u64>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_seconds")]
    pub reset_timeout_seconds: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_seconds: default_reset_timeout_seconds(),
        }
    }
}

/// One entry of the webhook route table: which path, which events, which
/// kinds, and how to authenticate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRouteConfig {
    pub path: String,
    #[serde(default)]
    pub kinds: Vec<String>,
    #[serde(default)]
    pub event_header: Option<String>,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub action_pointer: Option<String>,
    #[serde(default)]
    pub delete_actions: Vec<String>,
    pub id_pointer: String,
    #[serde(default)]
    pub resource_pointer: Option<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub signature: SignatureConfig,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerSettings>,
}

/// Source of the mapping document. Loaded once per resync pass or webhook
/// event and treated as read-only for that context.
#[async_trait]
pub trait AppConfigProvider: Send + Sync {
    async fn load(&self) -> Result<Arc<AppConfig>, CoreError>;
}

#[derive(Debug, Clone)]
pub struct StaticAppConfig {
    config: Arc<AppConfig>,
}

impl StaticAppConfig {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl AppConfigProvider for StaticAppConfig {
    async fn load(&self) -> Result<Arc<AppConfig>, CoreError> {
        Ok(self.config.clone())
    }
}

/// Reads the YAML document from disk on every load, so edits apply to the
/// next pass without a restart.
#[derive(Debug, Clone)]
pub struct FileAppConfig {
    path: PathBuf,
}

impl FileAppConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn load_blocking(&self) -> Result<AppConfig, CoreError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| CoreError::ConfigRead {
            path: self.path.display().to_string(),
            source,
        })?;
        AppConfig::from_yaml_str(&text, &self.path.display().to_string())
    }
}

#[async_trait]
impl AppConfigProvider for FileAppConfig {
    async fn load(&self) -> Result<Arc<AppConfig>, CoreError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| CoreError::ConfigRead {
                path: self.path.display().to_string(),
                source,
            })?;
        AppConfig::from_yaml_str(&text, &self.path.display().to_string()).map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
deleteDependentEntities: true
entityDeletionThreshold: 0.5
blueprints:
  - identifier: issue
    title: Issue
    schema:
      properties:
        status:
          type: string
resources:
  - kind: issue
    selector:
      query: .status == "open"
    port:
      entity:
        mappings:
          identifier: .id
          blueprint: '"issue"'
webhooks:
  - path: /hooks/issues
    kinds: [issue]
    eventHeader: x-event
    events: [issues]
    actionPointer: /action
    deleteActions: [deleted]
    idPointer: /issue/id
    signature:
      method: hmac-sha256
      header: x-signature
      secretEnv: ISSUES_SECRET
    circuitBreaker:
      failureThreshold: 3
"#;

    #[test]
    fn parses_full_document_with_defaults() {
        let cfg = AppConfig::from_yaml_str(DOC, "inline").expect("parse");
        assert!(cfg.delete_dependent_entities);
        assert!(cfg.create_missing_related_entities);
        assert_eq!(cfg.entity_deletion_threshold, 0.5);
        assert_eq!(cfg.blueprints[0].identifier, "issue");
        assert_eq!(cfg.kinds(), vec!["issue"]);
        let route = &cfg.webhooks[0];
        assert_eq!(route.signature.method, SignatureMethod::HmacSha256);
        let breaker = route.circuit_breaker.expect("breaker");
        assert_eq!(breaker.failure_threshold, 3);
        assert_eq!(breaker.reset_timeout_seconds, 30);
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let err = AppConfig::from_yaml_str("entityDeletionThreshold: 1.5\n", "inline").unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_duplicate_webhook_paths() {
        let doc = r#"
webhooks:
  - path: /a
    idPointer: /id
  - path: /a
    idPointer: /id
"#;
        assert!(matches!(
            AppConfig::from_yaml_str(doc, "inline"),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn file_provider_rereads_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("catsync.yaml");
        std::fs::write(&path, "resources: []\n").expect("write");
        let provider = FileAppConfig::new(&path);
        assert!(provider.load().await.expect("load").resources.is_empty());

        std::fs::write(&path, DOC).expect("rewrite");
        assert_eq!(provider.load().await.expect("reload").resources.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_reports_path() {
        let provider = FileAppConfig::new("/definitely/not/here.yaml");
        let err = provider.load().await.unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.yaml"));
    }
}
