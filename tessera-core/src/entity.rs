//! Entity model accessor and per-entity change tracking
//!
//! The core never reflects over entity structs. A mapped type tells the
//! core, through [`MappedEntity`], how to read attributes, which key
//! templates it declares, and where its change tracker lives. Setters on
//! the concrete type record the pre-mutation value in the tracker, so the
//! reconciler can rebuild the keys an entity had when it was last persisted.

use crate::error::TesseraResult;
use crate::key::{Key, KeyTemplate, NULL_SENTINEL};
use crate::value::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// Attribute lookup by name. Object-safe, used by the predicate evaluator.
pub trait Attributes {
    /// Current value of an attribute, or `None` if the entity has no such field.
    fn attribute(&self, name: &str) -> Option<Value>;
}

/// Explicit dirty tracking owned by one entity instance.
///
/// Holds, for every field mutated since the last commit, the value it had at
/// that commit. The first recorded value wins; later writes to the same
/// field do not overwrite it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeTracker {
    persisted: bool,
    previous: BTreeMap<String, Value>,
}

impl ChangeTracker {
    /// Tracker for an entity that has never been committed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker for an entity freshly loaded from a store.
    pub fn loaded() -> Self {
        Self {
            persisted: true,
            previous: BTreeMap::new(),
        }
    }

    /// Record that `field` is about to change from `previous`.
    pub fn record(&mut self, field: &str, previous: Value) {
        self.previous.entry(field.to_string()).or_insert(previous);
    }

    pub fn is_dirty(&self, field: &str) -> bool {
        self.previous.contains_key(field)
    }

    pub fn dirty_fields(&self) -> impl Iterator<Item = &str> {
        self.previous.keys().map(String::as_str)
    }

    pub fn has_changes(&self) -> bool {
        !self.previous.is_empty()
    }

    /// The value `field` had at the last commit, if it has changed since.
    pub fn persisted_value(&self, field: &str) -> Option<&Value> {
        self.previous.get(field)
    }

    /// Whether the entity has been committed at least once.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// Forget all recorded changes; the current state is now the persisted one.
    pub fn mark_persisted(&mut self) {
        self.persisted = true;
        self.previous.clear();
    }
}

/// Capability interface between the core and a domain entity type.
///
/// # Implementation Requirements
///
/// - `primary_key_template()` must yield exactly one key for every entity
/// - setters must call `tracker_mut().record(field, old_value)` before
///   mutating a field that any key template reads
/// - the tracker field should be `#[serde(skip)]`; loaded entities get a
///   fresh tracker from the storage layer
pub trait MappedEntity:
    Attributes + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Model name, used in log fields and error messages.
    fn model() -> &'static str;

    /// Template for the entity key.
    fn primary_key_template() -> KeyTemplate;

    /// Templates for unique keys.
    fn unique_key_templates() -> Vec<KeyTemplate> {
        Vec::new()
    }

    /// Templates for membership (non-unique) keys.
    fn membership_key_templates() -> Vec<KeyTemplate> {
        Vec::new()
    }

    /// Name of the revision token field.
    fn revision_field() -> &'static str {
        "revision"
    }

    fn tracker(&self) -> &ChangeTracker;

    fn tracker_mut(&mut self) -> &mut ChangeTracker;

    /// Write a freshly minted revision token.
    fn set_revision(&mut self, token: String);

    /// A copy restricted to `fields`. Models that support partial loading
    /// override this; the default keeps every field.
    fn project(&self, _fields: &[String]) -> Self {
        self.clone()
    }

    /// Value at the last commit for dirty fields, current value otherwise.
    fn persisted_attribute(&self, name: &str) -> Option<Value> {
        match self.tracker().persisted_value(name) {
            Some(v) => Some(v.clone()),
            None => self.attribute(name),
        }
    }

    fn revision(&self) -> Option<String> {
        match self.attribute(Self::revision_field()) {
            Some(Value::Text(s)) => Some(s),
            _ => None,
        }
    }

    fn entity_key(&self, persisted: bool) -> TesseraResult<Key> {
        Self::primary_key_template().dissociate_one(self, persisted)
    }

    /// Unique keys with a null component are not indexed; nulls never collide.
    fn unique_keys(&self, persisted: bool) -> TesseraResult<Vec<Key>> {
        let mut keys = collect_keys(self, &Self::unique_key_templates(), persisted)?;
        keys.retain(|k| !k.components().iter().any(|c| c == NULL_SENTINEL));
        Ok(keys)
    }

    fn membership_keys(&self, persisted: bool) -> TesseraResult<Vec<Key>> {
        collect_keys(self, &Self::membership_key_templates(), persisted)
    }
}

fn collect_keys<E: MappedEntity + ?Sized>(
    entity: &E,
    templates: &[KeyTemplate],
    persisted: bool,
) -> TesseraResult<Vec<Key>> {
    let mut keys = Vec::new();
    for template in templates {
        keys.extend(template.dissociate(entity, persisted)?);
    }
    keys.sort();
    keys.dedup();
    Ok(keys)
}

/// Resolves foreign references while walking attribute paths.
pub trait ReferenceResolver {
    fn resolve(&self, key: &Key) -> Option<&dyn Attributes>;
}

/// Resolver for contexts where references cannot be followed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReferences;

impl ReferenceResolver for NoReferences {
    fn resolve(&self, _key: &Key) -> Option<&dyn Attributes> {
        None
    }
}

impl<A: Attributes> ReferenceResolver for BTreeMap<Key, A> {
    fn resolve(&self, key: &Key) -> Option<&dyn Attributes> {
        self.get(key).map(|a| a as &dyn Attributes)
    }
}

impl<A: Attributes> ReferenceResolver for std::collections::HashMap<Key, A> {
    fn resolve(&self, key: &Key) -> Option<&dyn Attributes> {
        self.get(key).map(|a| a as &dyn Attributes)
    }
}

#[cfg(test)]
pub(crate) mod test_entity {
    //! Minimal entity used by core unit tests.

    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Doc {
        pub id: String,
        pub name: String,
        pub tags: Vec<String>,
        pub slug: Option<String>,
        pub revision: Option<String>,
        pub owner: Option<Key>,
        #[serde(skip)]
        pub tracker: ChangeTracker,
    }

    impl Doc {
        pub fn new(id: &str, name: &str) -> Self {
            Self {
                id: id.to_string(),
                name: name.to_string(),
                tags: Vec::new(),
                slug: None,
                revision: None,
                owner: None,
                tracker: ChangeTracker::new(),
            }
        }

        pub fn with_tags(mut self, tags: &[&str]) -> Self {
            self.tags = tags.iter().map(|t| t.to_string()).collect();
            self
        }

        pub fn with_slug(mut self, slug: &str) -> Self {
            self.slug = Some(slug.to_string());
            self
        }

        pub fn set_id(&mut self, id: &str) {
            self.tracker.record("id", Value::from(&self.id));
            self.id = id.to_string();
        }

        pub fn set_tags(&mut self, tags: &[&str]) {
            self.tracker.record("tags", Value::from(self.tags.clone()));
            self.tags = tags.iter().map(|t| t.to_string()).collect();
        }

        pub fn set_slug(&mut self, slug: Option<&str>) {
            self.tracker.record("slug", Value::from(self.slug.clone()));
            self.slug = slug.map(str::to_string);
        }

        pub fn persisted(mut self) -> Self {
            self.tracker.mark_persisted();
            self
        }
    }

    impl Attributes for Doc {
        fn attribute(&self, name: &str) -> Option<Value> {
            match name {
                "id" => Some(Value::from(&self.id)),
                "name" => Some(Value::from(&self.name)),
                "tags" => Some(Value::from(self.tags.clone())),
                "slug" => Some(Value::from(self.slug.clone())),
                "revision" => Some(Value::from(self.revision.clone())),
                "owner" => Some(Value::from(self.owner.clone())),
                _ => None,
            }
        }
    }

    impl MappedEntity for Doc {
        fn model() -> &'static str {
            "doc"
        }

        fn primary_key_template() -> KeyTemplate {
            KeyTemplate::fields("doc", &["id"])
        }

        fn unique_key_templates() -> Vec<KeyTemplate> {
            vec![KeyTemplate::fields("doc_slug", &["slug"])]
        }

        fn membership_key_templates() -> Vec<KeyTemplate> {
            vec![KeyTemplate::each("doc_tag", "tags")]
        }

        fn tracker(&self) -> &ChangeTracker {
            &self.tracker
        }

        fn tracker_mut(&mut self) -> &mut ChangeTracker {
            &mut self.tracker
        }

        fn set_revision(&mut self, token: String) {
            self.revision = Some(token);
        }
    }
}
