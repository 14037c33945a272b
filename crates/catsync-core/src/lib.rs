//! Core domain model shared by every catsync crate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod config;
pub mod event;

pub use config::{
    AppConfig, AppConfigProvider, CircuitBreakerSettings, FileAppConfig, SignatureConfig,
    SignatureMethod, StaticAppConfig, WebhookRouteConfig,
};
pub use event::{EventTimestamp, OriginalRequest, WebhookEvent};

pub const CRATE_NAME: &str = "catsync-core";

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("request body is not valid JSON: {0}")]
    InvalidPayload(#[source] serde_json::Error),
    #[error("reading config {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// Catalog identity of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub identifier: String,
    pub blueprint: String,
}

/// A catalog instance record produced by the mapping engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub identifier: String,
    pub blueprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<JsonValue>,
    #[serde(default)]
    pub properties: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub relations: BTreeMap<String, JsonValue>,
}

impl Entity {
    pub fn new(identifier: impl Into<String>, blueprint: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            blueprint: blueprint.into(),
            title: None,
            team: None,
            properties: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey {
            identifier: self.identifier.clone(),
            blueprint: self.blueprint.clone(),
        }
    }

    pub fn is_same_entity(&self, other: &Entity) -> bool {
        self.identifier == other.identifier && self.blueprint == other.blueprint
    }

    /// Full equality over everything the catalog stores besides identity.
    pub fn content_equals(&self, other: &Entity) -> bool {
        self.title == other.title
            && self.team == other.team
            && self.properties == other.properties
            && self.relations == other.relations
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BlueprintSchema {
    #[serde(default)]
    pub properties: BTreeMap<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

/// A catalog type definition. Identity is the identifier alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub schema: BlueprintSchema,
    #[serde(default)]
    pub relations: BTreeMap<String, JsonValue>,
}

impl Blueprint {
    pub fn content_equals(&self, other: &Blueprint) -> bool {
        self.title == other.title && self.schema == other.schema && self.relations == other.relations
    }
}

fn default_selector_query() -> String {
    "true".to_string()
}

fn default_items_to_parse_name() -> String {
    "item".to_string()
}

/// Inclusion rule for a resource kind. Everything besides `query` is passed to
/// the vendor collaborator untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    #[serde(default = "default_selector_query")]
    pub query: String,
    #[serde(flatten)]
    pub filters: BTreeMap<String, JsonValue>,
}

impl Default for Selector {
    fn default() -> Self {
        Self {
            query: default_selector_query(),
            filters: BTreeMap::new(),
        }
    }
}

/// A mapping value: either a query expression or a nested object of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MappingExpr {
    Query(String),
    Nested(BTreeMap<String, MappingExpr>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMappings {
    pub identifier: String,
    #[serde(default)]
    pub title: Option<String>,
    pub blueprint: String,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, MappingExpr>,
    #[serde(default)]
    pub relations: BTreeMap<String, MappingExpr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    pub mappings: EntityMappings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortResourceConfig {
    pub entity: EntityConfig,
    #[serde(default)]
    pub items_to_parse: Option<String>,
    #[serde(default = "default_items_to_parse_name")]
    pub items_to_parse_name: String,
}

/// How one vendor resource kind maps into catalog entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub kind: String,
    #[serde(default)]
    pub selector: Selector,
    pub port: PortResourceConfig,
}

impl ResourceConfig {
    pub fn mappings(&self) -> &EntityMappings {
        &self.port.entity.mappings
    }
}

/// Raw objects a webhook handler wants upserted or deleted, in order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WebhookEventRawResults {
    pub updated_raw_results: Vec<JsonValue>,
    pub deleted_raw_results: Vec<JsonValue>,
}

impl WebhookEventRawResults {
    pub fn updated(items: Vec<JsonValue>) -> Self {
        Self {
            updated_raw_results: items,
            deleted_raw_results: Vec::new(),
        }
    }

    pub fn deleted(items: Vec<JsonValue>) -> Self {
        Self {
            updated_raw_results: Vec::new(),
            deleted_raw_results: items,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.updated_raw_results.is_empty() && self.deleted_raw_results.is_empty()
    }
}

/// Human-readable JSON type name, as the query language reports it.
pub fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_identity_ignores_content() {
        let mut a = Entity::new("123", "issue");
        let b = Entity::new("123", "issue");
        a.properties.insert("status".into(), json!("open"));
        assert!(a.is_same_entity(&b));
        assert!(!a.content_equals(&b));
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn resource_config_reads_camel_case_mapping_document() {
        let yaml = r#"
kind: project
selector:
  query: .archived == false
  includeArchived: false
port:
  itemsToParse: .members
  itemsToParseName: member
  entity:
    mappings:
      identifier: .member.id
      blueprint: '"member"'
      properties:
        owner: .owner
        address:
          city: .city
"#;
        let cfg: ResourceConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cfg.kind, "project");
        assert_eq!(cfg.selector.query, ".archived == false");
        assert_eq!(cfg.selector.filters.get("includeArchived"), Some(&json!(false)));
        assert_eq!(cfg.port.items_to_parse.as_deref(), Some(".members"));
        assert_eq!(cfg.port.items_to_parse_name, "member");
        assert!(matches!(
            cfg.mappings().properties.get("address"),
            Some(MappingExpr::Nested(_))
        ));
    }

    #[test]
    fn selector_defaults_to_true() {
        let yaml = r#"
kind: repo
port:
  entity:
    mappings:
      identifier: .id
      blueprint: '"repo"'
"#;
        let cfg: ResourceConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cfg.selector.query, "true");
        assert_eq!(cfg.port.items_to_parse_name, "item");
        assert!(cfg.port.items_to_parse.is_none());
    }
}
