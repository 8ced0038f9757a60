//! Query parameters, composite cache keys and in-memory finishing.
//!
//! A query's composite key grows with each parameter it carries, in fixed
//! order:
//!
//! ```text
//! base < +predicate < +retrieve < +order < +offset/limit
//! ```
//!
//! Lookups start at the most specific level and relax toward the base.
//! Whatever a hit's level did not include is applied in memory by
//! [`finish`]. The retrieve component only narrows the key; projection
//! itself is applied on every read.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use tessera_core::{Key, MappedEntity, Predicate, ReferenceResolver, TesseraResult, Value};

use crate::refs::needs_references;

/// What a query reads before any filtering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryBase {
    /// One entity by primary key.
    Entity(Key),
    /// One entity by unique key.
    Unique(Key),
    /// Every member of a membership set.
    Membership(Key),
    /// Entities with `start <= key < end`. Needs an ordered backend.
    Range { start: Key, end: Key },
}

impl QueryBase {
    fn tag(&self) -> &'static str {
        match self {
            QueryBase::Entity(_) => "entity",
            QueryBase::Unique(_) => "unique",
            QueryBase::Membership(_) => "members",
            QueryBase::Range { .. } => "range",
        }
    }

    /// Key whose change invalidates results built on this base.
    pub fn dependency(&self) -> Key {
        match self {
            QueryBase::Entity(k) | QueryBase::Unique(k) | QueryBase::Membership(k) => k.clone(),
            QueryBase::Range { start, .. } => namespace_of(start),
        }
    }
}

/// First component of `key` as a key of its own. Range results depend on
/// it, since any new entity in the namespace may fall into the range.
pub fn namespace_of(key: &Key) -> Key {
    Key::from_parts(key.components().iter().take(1).cloned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn marker(&self) -> char {
        match self {
            SortDirection::Asc => '+',
            SortDirection::Desc => '-',
        }
    }
}

/// Relaxation level of a composite key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CacheLevel {
    Base = 0,
    Predicate = 1,
    Retrieve = 2,
    Order = 3,
    Page = 4,
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheLevel::Base => "base",
            CacheLevel::Predicate => "predicate",
            CacheLevel::Retrieve => "retrieve",
            CacheLevel::Order => "order",
            CacheLevel::Page => "page",
        };
        f.write_str(name)
    }
}

/// A full query: base plus optional refinements.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParams {
    pub base: QueryBase,
    pub predicate: Option<Predicate>,
    pub retrieve: Option<Vec<String>>,
    pub order: Option<Vec<(String, SortDirection)>>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl QueryParams {
    pub fn new(base: QueryBase) -> Self {
        Self {
            base,
            predicate: None,
            retrieve: None,
            order: None,
            offset: None,
            limit: None,
        }
    }

    pub fn entity(key: Key) -> Self {
        Self::new(QueryBase::Entity(key))
    }

    pub fn unique(key: Key) -> Self {
        Self::new(QueryBase::Unique(key))
    }

    pub fn members(key: Key) -> Self {
        Self::new(QueryBase::Membership(key))
    }

    pub fn range(start: Key, end: Key) -> Self {
        Self::new(QueryBase::Range { start, end })
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_retrieve<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retrieve = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_order(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order
            .get_or_insert_with(Vec::new)
            .push((field.into(), direction));
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn has(&self, level: CacheLevel) -> bool {
        match level {
            CacheLevel::Base => true,
            CacheLevel::Predicate => self.predicate.is_some(),
            CacheLevel::Retrieve => self.retrieve.is_some(),
            CacheLevel::Order => self.order.is_some(),
            CacheLevel::Page => self.offset.is_some() || self.limit.is_some(),
        }
    }

    /// Most specific level this query reaches.
    pub fn top_level(&self) -> CacheLevel {
        self.levels()
            .first()
            .copied()
            .unwrap_or(CacheLevel::Base)
    }

    /// Levels to try, most specific first.
    ///
    /// A predicate that follows references cannot be re-applied in memory,
    /// so relaxation stops at the predicate level for such queries.
    pub fn levels(&self) -> Vec<CacheLevel> {
        let floor = match &self.predicate {
            Some(p) if needs_references(p) => CacheLevel::Predicate,
            _ => CacheLevel::Base,
        };
        [
            CacheLevel::Page,
            CacheLevel::Order,
            CacheLevel::Retrieve,
            CacheLevel::Predicate,
            CacheLevel::Base,
        ]
        .into_iter()
        .filter(|l| *l >= floor && self.has(*l))
        .collect()
    }

    /// Whether results at `level` are stored under a composite key rather
    /// than read straight from snapshots.
    pub fn is_composite(&self, level: CacheLevel) -> bool {
        level > CacheLevel::Base
            || matches!(
                self.base,
                QueryBase::Membership(_) | QueryBase::Range { .. }
            )
    }

    /// Cache key for this query at `level`.
    ///
    /// Entity and unique bases at the base level are their own keys. Every
    /// other level is a composite key in the `prefix` namespace.
    pub fn cache_key(&self, prefix: &str, level: CacheLevel) -> Key {
        if !self.is_composite(level) {
            if let QueryBase::Entity(k) | QueryBase::Unique(k) = &self.base {
                return k.clone();
            }
        }

        let mut parts = vec![prefix.to_string(), self.base.tag().to_string()];
        match &self.base {
            QueryBase::Entity(k) | QueryBase::Unique(k) | QueryBase::Membership(k) => {
                parts.push(k.encode())
            }
            QueryBase::Range { start, end } => {
                parts.push(start.encode());
                parts.push(end.encode());
            }
        }
        if level >= CacheLevel::Predicate {
            if let Some(p) = &self.predicate {
                parts.push(format!("p={}", p.fingerprint()));
            }
        }
        if level >= CacheLevel::Retrieve {
            if let Some(fields) = &self.retrieve {
                parts.push(format!("r={}", fields.join(",")));
            }
        }
        if level >= CacheLevel::Order {
            if let Some(order) = &self.order {
                let terms: Vec<String> = order
                    .iter()
                    .map(|(field, dir)| format!("{}{}", dir.marker(), field))
                    .collect();
                parts.push(format!("o={}", terms.join(",")));
            }
        }
        if level >= CacheLevel::Page && self.has(CacheLevel::Page) {
            let limit = self.limit.map(|l| l.to_string()).unwrap_or_default();
            parts.push(format!("s={},{}", self.offset.unwrap_or(0), limit));
        }
        Key::from_parts(parts)
    }
}

/// Apply every parameter above `level` to `entities`, then project.
///
/// Cached snapshots are always full entities, so projection to the
/// retrieve list happens on the way out at every level.
pub fn finish<E: MappedEntity>(
    entities: Vec<E>,
    params: &QueryParams,
    level: CacheLevel,
    resolver: &dyn ReferenceResolver,
) -> TesseraResult<Vec<E>> {
    let selected = select(entities, params, level, resolver)?;
    Ok(project(selected, params))
}

/// Filter, order and slice without projecting.
pub fn select<E: MappedEntity>(
    mut entities: Vec<E>,
    params: &QueryParams,
    level: CacheLevel,
    resolver: &dyn ReferenceResolver,
) -> TesseraResult<Vec<E>> {
    if level < CacheLevel::Predicate {
        if let Some(predicate) = &params.predicate {
            let mut kept = Vec::with_capacity(entities.len());
            for entity in entities {
                if predicate.evaluate(&entity, resolver)? {
                    kept.push(entity);
                }
            }
            entities = kept;
        }
    }
    if level < CacheLevel::Order {
        if let Some(order) = &params.order {
            entities.sort_by(|a, b| compare_by(a, b, order));
        }
    }
    if level < CacheLevel::Page && params.has(CacheLevel::Page) {
        let offset = params.offset.unwrap_or(0);
        let limit = params.limit.unwrap_or(usize::MAX);
        entities = entities.into_iter().skip(offset).take(limit).collect();
    }
    Ok(entities)
}

/// Restrict each entity to the retrieve list, if there is one.
pub fn project<E: MappedEntity>(entities: Vec<E>, params: &QueryParams) -> Vec<E> {
    match &params.retrieve {
        Some(fields) => entities.iter().map(|e| e.project(fields)).collect(),
        None => entities,
    }
}

fn compare_by<E: MappedEntity>(a: &E, b: &E, order: &[(String, SortDirection)]) -> Ordering {
    for (field, direction) in order {
        let left = a.attribute(field).unwrap_or(Value::Null);
        let right = b.attribute(field).unwrap_or(Value::Null);
        // Nulls sort first; incomparable values keep their relative order.
        let ordering = match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => left.compare(&right).unwrap_or(Ordering::Equal),
        };
        let ordering = match direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tessera_core::{Attributes, ChangeTracker, KeyTemplate, NoReferences, Operand};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Item {
        id: String,
        rank: Option<i64>,
        label: String,
        #[serde(skip)]
        tracker: ChangeTracker,
    }

    fn item(id: &str, rank: Option<i64>) -> Item {
        Item {
            id: id.to_string(),
            rank,
            label: format!("label-{}", id),
            tracker: ChangeTracker::new(),
        }
    }

    impl Attributes for Item {
        fn attribute(&self, name: &str) -> Option<Value> {
            match name {
                "id" => Some(Value::from(&self.id)),
                "rank" => Some(Value::from(self.rank)),
                "label" => Some(Value::from(&self.label)),
                _ => None,
            }
        }
    }

    impl MappedEntity for Item {
        fn model() -> &'static str {
            "item"
        }
        fn primary_key_template() -> KeyTemplate {
            KeyTemplate::fields("item", &["id"])
        }
        fn tracker(&self) -> &ChangeTracker {
            &self.tracker
        }
        fn tracker_mut(&mut self) -> &mut ChangeTracker {
            &mut self.tracker
        }
        fn set_revision(&mut self, _token: String) {}
        fn project(&self, fields: &[String]) -> Self {
            let mut out = self.clone();
            if !fields.iter().any(|f| f == "label") {
                out.label = String::new();
            }
            out
        }
    }

    fn members() -> QueryParams {
        QueryParams::members(Key::from_parts(["tag", "x"]))
    }

    #[test]
    fn test_levels_follow_present_parameters() {
        assert_eq!(members().levels(), vec![CacheLevel::Base]);

        let params = members()
            .with_predicate(Predicate::field_eq("rank", 1))
            .with_limit(5);
        assert_eq!(
            params.levels(),
            vec![CacheLevel::Page, CacheLevel::Predicate, CacheLevel::Base]
        );
        assert_eq!(params.top_level(), CacheLevel::Page);
    }

    #[test]
    fn test_reference_predicate_stops_relaxation() {
        let deep = Predicate::eq(Operand::path(&["owner", "name"]), Operand::literal("x"));
        let params = members().with_predicate(deep).with_limit(1);
        assert_eq!(
            params.levels(),
            vec![CacheLevel::Page, CacheLevel::Predicate]
        );
    }

    #[test]
    fn test_cache_keys_grow_with_level() {
        let params = members()
            .with_predicate(Predicate::field_eq("rank", 1))
            .with_retrieve(["label"])
            .with_order("rank", SortDirection::Desc)
            .with_offset(2)
            .with_limit(3);

        let base = params.cache_key("query", CacheLevel::Base);
        let page = params.cache_key("query", CacheLevel::Page);
        assert!(base.in_namespace("query"));
        assert_eq!(base.len(), 3);
        assert_eq!(page.len(), 7);
        assert_eq!(&page.components()[..3], base.components());
        assert_eq!(page.components()[5], "o=-rank");
        assert_eq!(page.components()[6], "s=2,3");
    }

    #[test]
    fn test_entity_base_is_its_own_key() {
        let key = Key::from_parts(["item", "1"]);
        let params = QueryParams::entity(key.clone());
        assert_eq!(params.cache_key("query", CacheLevel::Base), key);
        assert!(!params.is_composite(CacheLevel::Base));

        let filtered = params.with_predicate(Predicate::field_eq("rank", 1));
        assert!(filtered
            .cache_key("query", CacheLevel::Predicate)
            .in_namespace("query"));
    }

    #[test]
    fn test_same_predicate_same_key() {
        let a = members().with_predicate(Predicate::field_eq("rank", 1));
        let b = members().with_predicate(Predicate::field_eq("rank", 1));
        let c = members().with_predicate(Predicate::field_eq("rank", 2));
        assert_eq!(
            a.cache_key("query", CacheLevel::Predicate),
            b.cache_key("query", CacheLevel::Predicate)
        );
        assert_ne!(
            a.cache_key("query", CacheLevel::Predicate),
            c.cache_key("query", CacheLevel::Predicate)
        );
    }

    #[test]
    fn test_range_depends_on_namespace() {
        let base = QueryBase::Range {
            start: Key::from_parts(["item", "a"]),
            end: Key::from_parts(["item", "m"]),
        };
        assert_eq!(base.dependency(), Key::from_parts(["item"]));
    }

    #[test]
    fn test_finish_applies_stripped_parameters() {
        let items = vec![
            item("a", Some(3)),
            item("b", None),
            item("c", Some(1)),
            item("d", Some(2)),
        ];
        let params = members()
            .with_predicate(Predicate::gt(Operand::path(&["rank"]), Operand::literal(1)))
            .with_order("rank", SortDirection::Asc)
            .with_limit(1)
            .with_retrieve(["id"]);

        let out = finish(items.clone(), &params, CacheLevel::Base, &NoReferences).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "d");
        assert!(out[0].label.is_empty());

        // Everything but projection already applied.
        let untouched = finish(items, &params, CacheLevel::Page, &NoReferences).unwrap();
        assert_eq!(untouched.len(), 4);
        assert!(untouched.iter().all(|i| i.label.is_empty()));
    }

    #[test]
    fn test_sort_puts_nulls_first_and_is_stable() {
        let items = vec![item("a", Some(2)), item("b", None), item("c", Some(2))];
        let params = members().with_order("rank", SortDirection::Asc);
        let out = finish(items, &params, CacheLevel::Base, &NoReferences).unwrap();
        let ids: Vec<&str> = out.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_offset_past_end_is_empty() {
        let items = vec![item("a", Some(1))];
        let params = members().with_offset(5);
        let out = finish(items, &params, CacheLevel::Base, &NoReferences).unwrap();
        assert!(out.is_empty());
    }
}
