//! Before/after reconciliation shared by entities and blueprints.

use std::collections::BTreeMap;

use catsync_core::{Blueprint, Entity, EntityKey};
use serde::Serialize;

/// Something the catalog stores under a stable identity.
pub trait Reconcilable: Clone {
    type Key: Ord + Clone;

    fn identity(&self) -> Self::Key;

    /// Equality over everything besides identity.
    fn same_content(&self, other: &Self) -> bool;
}

impl Reconcilable for Entity {
    type Key = EntityKey;

    fn identity(&self) -> EntityKey {
        self.key()
    }

    fn same_content(&self, other: &Self) -> bool {
        self.content_equals(other)
    }
}

impl Reconcilable for Blueprint {
    type Key = String;

    fn identity(&self) -> String {
        self.identifier.clone()
    }

    fn same_content(&self, other: &Self) -> bool {
        self.content_equals(other)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diff<T> {
    pub created: Vec<T>,
    pub modified: Vec<T>,
    pub deleted: Vec<T>,
}

impl<T> Default for Diff<T> {
    fn default() -> Self {
        Self {
            created: Vec::new(),
            modified: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl<T> Diff<T> {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn counts(&self) -> DiffCounts {
        DiffCounts {
            created: self.created.len(),
            modified: self.modified.len(),
            deleted: self.deleted.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffCounts {
    pub created: usize,
    pub modified: usize,
    pub deleted: usize,
}

/// Collapses duplicate identities: the last value wins, at the position the
/// identity first appeared.
fn dedup<T: Reconcilable>(items: &[T]) -> (Vec<T::Key>, BTreeMap<T::Key, &T>) {
    let mut order = Vec::with_capacity(items.len());
    let mut latest = BTreeMap::new();
    for item in items {
        let key = item.identity();
        if latest.insert(key.clone(), item).is_none() {
            order.push(key);
        }
    }
    (order, latest)
}

/// Classifies `after` against `before`. Created and modified follow `after`
/// order, deleted follows `before` order; unchanged items are left out.
pub fn diff<T: Reconcilable>(before: &[T], after: &[T]) -> Diff<T> {
    let (before_order, before_index) = dedup(before);
    let (after_order, after_index) = dedup(after);

    let mut out = Diff::default();
    for key in &after_order {
        let current = after_index[key];
        match before_index.get(key) {
            None => out.created.push(current.clone()),
            Some(previous) if !previous.same_content(current) => out.modified.push(current.clone()),
            Some(_) => {}
        }
    }
    for key in &before_order {
        if !after_index.contains_key(key) {
            out.deleted.push(before_index[key].clone());
        }
    }
    out
}

pub fn diff_entities(before: &[Entity], after: &[Entity]) -> Diff<Entity> {
    diff(before, after)
}

pub fn diff_blueprints(before: &[Blueprint], after: &[Blueprint]) -> Diff<Blueprint> {
    diff(before, after)
}

/// Entity and blueprint changes of one resync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PortDiff {
    pub entities: Diff<Entity>,
    pub blueprints: Diff<Blueprint>,
}

impl PortDiff {
    pub fn compute(
        before_entities: &[Entity],
        after_entities: &[Entity],
        before_blueprints: &[Blueprint],
        after_blueprints: &[Blueprint],
    ) -> Self {
        Self {
            entities: diff_entities(before_entities, after_entities),
            blueprints: diff_blueprints(before_blueprints, after_blueprints),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.blueprints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(id: &str, bp: &str, status: &str) -> Entity {
        let mut e = Entity::new(id, bp);
        e.properties.insert("status".into(), json!(status));
        e
    }

    fn ids(items: &[Entity]) -> Vec<&str> {
        items.iter().map(|e| e.identifier.as_str()).collect()
    }

    #[test]
    fn classifies_created_modified_deleted_and_skips_unchanged() {
        let before = vec![entity("1", "issue", "open"), entity("2", "issue", "open"), entity("3", "issue", "open")];
        let after = vec![entity("4", "issue", "open"), entity("2", "issue", "closed"), entity("1", "issue", "open")];
        let d = diff_entities(&before, &after);
        assert_eq!(ids(&d.created), vec!["4"]);
        assert_eq!(ids(&d.modified), vec!["2"]);
        assert_eq!(ids(&d.deleted), vec!["3"]);
    }

    #[test]
    fn identity_includes_blueprint() {
        let before = vec![entity("1", "issue", "open")];
        let after = vec![entity("1", "repo", "open")];
        let d = diff_entities(&before, &after);
        assert_eq!(d.created.len(), 1);
        assert_eq!(d.deleted.len(), 1);
        assert!(d.modified.is_empty());
    }

    #[test]
    fn identical_inputs_give_an_empty_and_repeatable_diff() {
        let items = vec![entity("1", "issue", "open"), entity("2", "issue", "closed")];
        assert!(diff_entities(&items, &items).is_empty());

        let before = vec![entity("1", "issue", "open")];
        let after = vec![entity("2", "issue", "open")];
        assert_eq!(diff_entities(&before, &after), diff_entities(&before, &after));
    }

    #[test]
    fn duplicate_identities_keep_first_position_and_last_value() {
        let before = vec![entity("1", "issue", "open")];
        let after = vec![
            entity("1", "issue", "closed"),
            entity("2", "issue", "open"),
            entity("1", "issue", "open"),
        ];
        let d = diff_entities(&before, &after);
        assert!(d.modified.is_empty());
        assert_eq!(ids(&d.created), vec!["2"]);
    }

    #[test]
    fn title_and_relations_count_as_content() {
        let before = vec![entity("1", "issue", "open")];
        let mut retitled = entity("1", "issue", "open");
        retitled.title = Some(json!("New title"));
        assert_eq!(diff_entities(&before, &[retitled]).modified.len(), 1);

        let mut related = entity("1", "issue", "open");
        related.relations.insert("repo".into(), json!("r1"));
        assert_eq!(diff_entities(&before, &[related]).modified.len(), 1);
    }

    #[test]
    fn blueprints_diff_by_identifier() {
        let bp = |id: &str, title: &str| Blueprint {
            identifier: id.into(),
            title: Some(title.into()),
            schema: Default::default(),
            relations: Default::default(),
        };
        let d = diff_blueprints(&[bp("issue", "Issue"), bp("old", "Old")], &[bp("issue", "Ticket"), bp("repo", "Repo")]);
        assert_eq!(d.created.iter().map(|b| b.identifier.as_str()).collect::<Vec<_>>(), vec!["repo"]);
        assert_eq!(d.modified.len(), 1);
        assert_eq!(d.deleted[0].identifier, "old");
        assert_eq!(d.counts(), DiffCounts { created: 1, modified: 1, deleted: 1 });
    }

    #[test]
    fn port_diff_combines_both() {
        let port = PortDiff::compute(&[], &[entity("1", "issue", "open")], &[], &[]);
        assert_eq!(port.entities.created.len(), 1);
        assert!(port.blueprints.is_empty());
        assert!(!port.is_empty());
    }
}
