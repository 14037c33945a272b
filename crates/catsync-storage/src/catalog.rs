//! Client for the external catalog. Writes are idempotent and keyed by
//! (identifier, blueprint), so webhook updates and resync passes may
//! interleave freely.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use catsync_core::{AppConfig, Blueprint, Entity, EntityKey};
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::http::{endpoint, FetchError, HttpFetcher, CATALOG_SOURCE};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("unexpected catalog response: {0}")]
    Response(String),
}

/// Write behavior taken from the mapping document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogOptions {
    pub create_missing_related_entities: bool,
    pub delete_dependent_entities: bool,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            create_missing_related_entities: true,
            delete_dependent_entities: false,
        }
    }
}

impl From<&AppConfig> for CatalogOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            create_missing_related_entities: config.create_missing_related_entities,
            delete_dependent_entities: config.delete_dependent_entities,
        }
    }
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn upsert_entity(&self, entity: &Entity, options: CatalogOptions) -> Result<(), CatalogError>;

    /// Deleting an entity that does not exist succeeds.
    async fn delete_entity(&self, entity: &Entity, options: CatalogOptions) -> Result<(), CatalogError>;

    async fn list_entities(&self, blueprints: &[String]) -> Result<Vec<Entity>, CatalogError>;

    async fn list_blueprints(&self) -> Result<Vec<Blueprint>, CatalogError>;

    async fn upsert_blueprint(&self, blueprint: &Blueprint) -> Result<(), CatalogError>;
}

/// Catalog kept in process memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    entities: RwLock<BTreeMap<EntityKey, Entity>>,
    blueprints: RwLock<BTreeMap<String, Blueprint>>,
    upserts: AtomicUsize,
    deletes: AtomicUsize,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let catalog = Self::new();
        {
            let mut map = catalog.entities.write().await;
            for entity in entities {
                map.insert(entity.key(), entity);
            }
        }
        catalog
    }

    pub async fn entities(&self) -> Vec<Entity> {
        self.entities.read().await.values().cloned().collect()
    }

    pub async fn get(&self, identifier: &str, blueprint: &str) -> Option<Entity> {
        let key = EntityKey {
            identifier: identifier.to_string(),
            blueprint: blueprint.to_string(),
        };
        self.entities.read().await.get(&key).cloned()
    }

    pub async fn blueprints(&self) -> Vec<Blueprint> {
        self.blueprints.read().await.values().cloned().collect()
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogClient for InMemoryCatalog {
    async fn upsert_entity(&self, entity: &Entity, _options: CatalogOptions) -> Result<(), CatalogError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.entities.write().await.insert(entity.key(), entity.clone());
        Ok(())
    }

    async fn delete_entity(&self, entity: &Entity, _options: CatalogOptions) -> Result<(), CatalogError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.entities.write().await.remove(&entity.key());
        Ok(())
    }

    async fn list_entities(&self, blueprints: &[String]) -> Result<Vec<Entity>, CatalogError> {
        Ok(self
            .entities
            .read()
            .await
            .values()
            .filter(|e| blueprints.contains(&e.blueprint))
            .cloned()
            .collect())
    }

    async fn list_blueprints(&self) -> Result<Vec<Blueprint>, CatalogError> {
        Ok(self.blueprints().await)
    }

    async fn upsert_blueprint(&self, blueprint: &Blueprint) -> Result<(), CatalogError> {
        self.blueprints
            .write()
            .await
            .insert(blueprint.identifier.clone(), blueprint.clone());
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct EntitySearchResponse {
    #[serde(default)]
    entities: Vec<Entity>,
}

#[derive(Debug, Deserialize)]
struct BlueprintListResponse {
    #[serde(default)]
    blueprints: Vec<Blueprint>,
}

/// REST client for the catalog API.
#[derive(Debug, Clone)]
pub struct HttpCatalogClient {
    base_url: String,
    token: Option<String>,
    http: Arc<HttpFetcher>,
}

impl HttpCatalogClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            base_url: base_url.into(),
            token,
            http,
        }
    }

    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url, CatalogError> {
        Ok(endpoint(&self.base_url, segments)?)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn upsert_entity(&self, entity: &Entity, options: CatalogOptions) -> Result<(), CatalogError> {
        let mut url = self.url(["v1", "blueprints", entity.blueprint.as_str(), "entities"])?;
        url.query_pairs_mut()
            .append_pair("upsert", "true")
            .append_pair("merge", "true")
            .append_pair(
                "create_missing_related_entities",
                &options.create_missing_related_entities.to_string(),
            );
        self.http
            .send(CATALOG_SOURCE, url.as_str(), |client| {
                self.authorize(client.post(url.clone())).json(entity)
            })
            .await?;
        debug!(identifier = %entity.identifier, blueprint = %entity.blueprint, "upserted entity");
        Ok(())
    }

    async fn delete_entity(&self, entity: &Entity, options: CatalogOptions) -> Result<(), CatalogError> {
        let mut url = self.url([
            "v1",
            "blueprints",
            entity.blueprint.as_str(),
            "entities",
            entity.identifier.as_str(),
        ])?;
        url.query_pairs_mut()
            .append_pair("delete_dependents", &options.delete_dependent_entities.to_string());
        match self
            .http
            .send(CATALOG_SOURCE, url.as_str(), |client| self.authorize(client.delete(url.clone())))
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                debug!(identifier = %entity.identifier, "entity already absent");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    async fn list_entities(&self, blueprints: &[String]) -> Result<Vec<Entity>, CatalogError> {
        if blueprints.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.url(["v1", "entities", "search"])?;
        let rules: Vec<_> = blueprints
            .iter()
            .map(|bp| json!({"property": "$blueprint", "operator": "=", "value": bp}))
            .collect();
        let query = json!({"combinator": "or", "rules": rules});
        let response = self
            .http
            .send(CATALOG_SOURCE, url.as_str(), |client| {
                self.authorize(client.post(url.clone())).json(&query)
            })
            .await?
            .json()?;
        let parsed: EntitySearchResponse = serde_json::from_value(response)
            .map_err(|err| CatalogError::Response(format!("entity search: {err}")))?;
        Ok(parsed.entities)
    }

    async fn list_blueprints(&self) -> Result<Vec<Blueprint>, CatalogError> {
        let url = self.url(["v1", "blueprints"])?;
        let response = self
            .http
            .send(CATALOG_SOURCE, url.as_str(), |client| self.authorize(client.get(url.clone())))
            .await?
            .json()?;
        let parsed: BlueprintListResponse = serde_json::from_value(response)
            .map_err(|err| CatalogError::Response(format!("blueprint list: {err}")))?;
        Ok(parsed.blueprints)
    }

    async fn upsert_blueprint(&self, blueprint: &Blueprint) -> Result<(), CatalogError> {
        let update_url = self.url(["v1", "blueprints", blueprint.identifier.as_str()])?;
        match self
            .http
            .send(CATALOG_SOURCE, update_url.as_str(), |client| {
                self.authorize(client.put(update_url.clone())).json(blueprint)
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => {
                let create_url = self.url(["v1", "blueprints"])?;
                self.http
                    .send(CATALOG_SOURCE, create_url.as_str(), |client| {
                        self.authorize(client.post(create_url.clone())).json(blueprint)
                    })
                    .await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}
