//! Turns raw vendor objects into catalog entities by evaluating the query
//! expressions of a [`ResourceConfig`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use catsync_core::{json_type_name, Entity, MappingExpr, ResourceConfig};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod query;

pub use query::{compare_values, Query, QueryError};

pub const CRATE_NAME: &str = "catsync-mapping";

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("query {query:?} failed: {source}")]
    Query {
        query: String,
        #[source]
        source: QueryError,
    },
    #[error("selector {query:?} returned {found}, expected a boolean")]
    NonBooleanSelector { query: String, found: &'static str },
}

/// Entities split by the selector outcome. Entities in `failed` resolved an
/// identity but were excluded, so a webhook update may need to delete them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntitySelectorDiff {
    pub passed: Vec<Entity>,
    pub failed: Vec<Entity>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingResult {
    pub selector_diff: EntitySelectorDiff,
    /// Field path to expression, for every field that errored or came out null.
    pub misconfigured: BTreeMap<String, String>,
    /// Items that produced no entity because identifier or blueprint was missing.
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectorMode {
    Apply { keep_failed: bool },
    Ignore,
}

/// Stateless apart from a cache of compiled queries keyed by source text.
#[derive(Debug, Default)]
pub struct EntityMapper {
    compiled: RwLock<HashMap<String, Arc<Query>>>,
}

impl EntityMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile(&self, source: &str) -> Result<Arc<Query>, MappingError> {
        {
            let cache = self.compiled.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(query) = cache.get(source) {
                return Ok(query.clone());
            }
        }
        let query = Arc::new(Query::compile(source).map_err(|source_err| MappingError::Query {
            query: source.to_string(),
            source: source_err,
        })?);
        self.compiled
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(source.to_string(), query.clone());
        Ok(query)
    }

    /// First output of `query` on `data`, null when the query yields nothing.
    pub fn search(&self, data: &JsonValue, query: &str) -> Result<JsonValue, MappingError> {
        let compiled = self.compile(query)?;
        compiled
            .first(data)
            .map(|v| v.unwrap_or(JsonValue::Null))
            .map_err(|source| MappingError::Query {
                query: query.to_string(),
                source,
            })
    }

    /// Strict boolean evaluation. Anything other than `true`/`false` is an error.
    pub fn search_as_bool(&self, data: &JsonValue, query: &str) -> Result<bool, MappingError> {
        match self.search(data, query)? {
            JsonValue::Bool(b) => Ok(b),
            other => Err(MappingError::NonBooleanSelector {
                query: query.to_string(),
                found: json_type_name(&other),
            }),
        }
    }

    /// Entities `data` produces under `resource`, selector applied.
    pub fn map_object(&self, data: &JsonValue, resource: &ResourceConfig) -> Result<Vec<Entity>, MappingError> {
        let result = self.calculate(std::slice::from_ref(data), resource, false)?;
        Ok(result.selector_diff.passed)
    }

    /// Maps a batch. With `keep_failed`, items the selector rejects are still
    /// mapped and returned in `failed`.
    pub fn calculate(
        &self,
        raw_items: &[JsonValue],
        resource: &ResourceConfig,
        keep_failed: bool,
    ) -> Result<MappingResult, MappingError> {
        self.map_items(raw_items, resource, SelectorMode::Apply { keep_failed })
    }

    /// Entities to delete for raw deletion markers. The selector is not
    /// consulted: a deleted resource goes regardless of whether it still matches.
    pub fn map_for_deletion(
        &self,
        raw_items: &[JsonValue],
        resource: &ResourceConfig,
    ) -> Result<Vec<Entity>, MappingError> {
        Ok(self
            .map_items(raw_items, resource, SelectorMode::Ignore)?
            .selector_diff
            .passed)
    }

    fn map_items(
        &self,
        raw_items: &[JsonValue],
        resource: &ResourceConfig,
        mode: SelectorMode,
    ) -> Result<MappingResult, MappingError> {
        let mut result = MappingResult::default();
        for raw in raw_items {
            match &resource.port.items_to_parse {
                None => self.map_one(raw, resource, mode, &mut result)?,
                Some(items_query) => {
                    for merged in self.expand_items(raw, items_query, &resource.port.items_to_parse_name)? {
                        self.map_one(&merged, resource, mode, &mut result)?;
                    }
                }
            }
        }
        if !result.misconfigured.is_empty() {
            info!(
                kind = %resource.kind,
                fields = ?result.misconfigured,
                "unable to find valid data for some mapping fields"
            );
        }
        if result.dropped > 0 {
            debug!(kind = %resource.kind, dropped = result.dropped, "items without identifier or blueprint were skipped");
        }
        Ok(result)
    }

    /// One merged object per sub-item, holding the parent's fields plus the
    /// sub-item under `name`. The reserved key wins over a parent field of the
    /// same name.
    fn expand_items(&self, raw: &JsonValue, items_query: &str, name: &str) -> Result<Vec<JsonValue>, MappingError> {
        let items = match self.search(raw, items_query)? {
            JsonValue::Array(items) => items,
            JsonValue::Null => return Ok(Vec::new()),
            other => {
                warn!(
                    query = items_query,
                    found = json_type_name(&other),
                    "itemsToParse did not produce an array; skipping item"
                );
                return Ok(Vec::new());
            }
        };
        let parent = match raw {
            JsonValue::Object(map) => map.clone(),
            _ => Map::new(),
        };
        Ok(items
            .into_iter()
            .map(|item| {
                let mut merged = parent.clone();
                merged.insert(name.to_string(), item);
                JsonValue::Object(merged)
            })
            .collect())
    }

    fn map_one(
        &self,
        item: &JsonValue,
        resource: &ResourceConfig,
        mode: SelectorMode,
        result: &mut MappingResult,
    ) -> Result<(), MappingError> {
        let passed = match mode {
            SelectorMode::Ignore => true,
            SelectorMode::Apply { keep_failed } => {
                let passed = self.search_as_bool(item, &resource.selector.query)?;
                if !passed && !keep_failed {
                    return Ok(());
                }
                passed
            }
        };

        let mappings = resource.mappings();
        let misconfigured = &mut result.misconfigured;
        let identifier = self.field(item, "identifier", &mappings.identifier, misconfigured);
        let blueprint = self.field(item, "blueprint", &mappings.blueprint, misconfigured);
        let (Some(identifier), Some(blueprint)) = (
            key_string(&identifier, "identifier", &mappings.identifier, misconfigured),
            key_string(&blueprint, "blueprint", &mappings.blueprint, misconfigured),
        ) else {
            result.dropped += 1;
            return Ok(());
        };

        let mut entity = Entity::new(identifier, blueprint);
        entity.title = mappings
            .title
            .as_ref()
            .map(|q| self.field(item, "title", q, misconfigured))
            .filter(|v| !v.is_null());
        entity.team = mappings
            .team
            .as_ref()
            .map(|q| self.field(item, "team", q, misconfigured))
            .filter(|v| !v.is_null());
        entity.properties = self.fields(item, "properties", &mappings.properties, misconfigured);
        entity.relations = self.fields(item, "relations", &mappings.relations, misconfigured);

        if passed {
            result.selector_diff.passed.push(entity);
        } else {
            result.selector_diff.failed.push(entity);
        }
        Ok(())
    }

    fn fields(
        &self,
        item: &JsonValue,
        prefix: &str,
        exprs: &BTreeMap<String, MappingExpr>,
        misconfigured: &mut BTreeMap<String, String>,
    ) -> BTreeMap<String, JsonValue> {
        exprs
            .iter()
            .map(|(name, expr)| {
                let path = format!("{prefix}.{name}");
                (name.clone(), self.mapping_expr(item, &path, expr, misconfigured))
            })
            .collect()
    }

    fn mapping_expr(
        &self,
        item: &JsonValue,
        path: &str,
        expr: &MappingExpr,
        misconfigured: &mut BTreeMap<String, String>,
    ) -> JsonValue {
        match expr {
            MappingExpr::Query(query) => self.field(item, path, query, misconfigured),
            MappingExpr::Nested(children) => JsonValue::Object(
                self.fields(item, path, children, misconfigured)
                    .into_iter()
                    .collect(),
            ),
        }
    }

    /// Evaluates a single mapping field. Errors degrade to null.
    fn field(
        &self,
        item: &JsonValue,
        path: &str,
        query: &str,
        misconfigured: &mut BTreeMap<String, String>,
    ) -> JsonValue {
        match self.search(item, query) {
            Ok(JsonValue::Null) => {
                misconfigured.insert(path.to_string(), query.to_string());
                JsonValue::Null
            }
            Ok(value) => value,
            Err(err) => {
                debug!(field = path, error = %err, "mapping field failed");
                misconfigured.insert(path.to_string(), query.to_string());
                JsonValue::Null
            }
        }
    }
}

/// Catalog keys are strings; numbers render in decimal, other types are rejected.
fn key_string(
    value: &JsonValue,
    path: &str,
    query: &str,
    misconfigured: &mut BTreeMap<String, String>,
) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => i.to_string(),
            (_, Some(u), _) => u.to_string(),
            (_, _, Some(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
            _ => n.to_string(),
        }),
        JsonValue::Null => None,
        _ => {
            misconfigured.insert(path.to_string(), query.to_string());
            None
        }
    }
}
