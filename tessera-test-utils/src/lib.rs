//! Tessera Test Utilities
//!
//! Centralized test infrastructure for the Tessera workspace:
//! - Proptest generators for keys, values, predicates and entities
//! - The `Article` fixture entity and datastore fixtures
//! - Assertion helpers for Tessera error variants and store contents

// Re-export core types for convenience
pub use tessera_core::*;
pub use tessera_storage::{
    Datastore, InMemoryKvStore, JsonSerializer, KvStore, LmdbKvStore, QueryParams, SortDirection,
};

use serde::{Deserialize, Serialize};

// ============================================================================
// ARTICLE ENTITY
// ============================================================================

/// A mapped entity exercising every kind of key template.
///
/// Keys:
/// - primary: `("article", id)`
/// - unique: `("article_slug", slug)`, unindexed while `slug` is `None`
/// - membership: `("article_tag", t)` for every `t` in `tags`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    id: String,
    title: String,
    tag: String,
    tags: Vec<String>,
    slug: Option<String>,
    rank: i64,
    author: Option<Key>,
    published_at: Option<Timestamp>,
    revision: Option<String>,
    #[serde(skip)]
    tracker: ChangeTracker,
}

impl Article {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            tag: String::new(),
            tags: Vec::new(),
            slug: None,
            rank: 0,
            author: None,
            published_at: None,
            revision: None,
            tracker: ChangeTracker::new(),
        }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_string();
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_slug(mut self, slug: &str) -> Self {
        self.slug = Some(slug.to_string());
        self
    }

    pub fn with_rank(mut self, rank: i64) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_author(mut self, author: Key) -> Self {
        self.author = Some(author);
        self
    }

    pub fn with_published_at(mut self, at: Timestamp) -> Self {
        self.published_at = Some(at);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn slug(&self) -> Option<&str> {
        self.slug.as_deref()
    }

    pub fn rank(&self) -> i64 {
        self.rank
    }

    pub fn author(&self) -> Option<&Key> {
        self.author.as_ref()
    }

    pub fn published_at(&self) -> Option<Timestamp> {
        self.published_at
    }

    pub fn revision_token(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    pub fn set_id(&mut self, id: &str) {
        self.tracker.record("id", Value::from(&self.id));
        self.id = id.to_string();
    }

    pub fn set_title(&mut self, title: &str) {
        self.tracker.record("title", Value::from(&self.title));
        self.title = title.to_string();
    }

    pub fn set_tag(&mut self, tag: &str) {
        self.tracker.record("tag", Value::from(&self.tag));
        self.tag = tag.to_string();
    }

    pub fn set_tags(&mut self, tags: &[&str]) {
        self.tracker.record("tags", Value::from(self.tags.clone()));
        self.tags = tags.iter().map(|t| t.to_string()).collect();
    }

    pub fn set_slug(&mut self, slug: Option<&str>) {
        self.tracker.record("slug", Value::from(self.slug.clone()));
        self.slug = slug.map(str::to_string);
    }

    pub fn set_rank(&mut self, rank: i64) {
        self.tracker.record("rank", Value::from(self.rank));
        self.rank = rank;
    }

    pub fn set_author(&mut self, author: Option<Key>) {
        self.tracker.record("author", Value::from(self.author.clone()));
        self.author = author;
    }

    /// Primary key of this article as it is now.
    pub fn key(&self) -> Key {
        Key::from_parts(["article", self.id.as_str()])
    }

    /// Field-for-field equality ignoring the revision token and the tracker.
    pub fn same_content(&self, other: &Article) -> bool {
        self.id == other.id
            && self.title == other.title
            && self.tag == other.tag
            && self.tags == other.tags
            && self.slug == other.slug
            && self.rank == other.rank
            && self.author == other.author
            && self.published_at == other.published_at
    }
}

impl Attributes for Article {
    fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::from(&self.id)),
            "title" => Some(Value::from(&self.title)),
            "tag" => Some(Value::from(&self.tag)),
            "tags" => Some(Value::from(self.tags.clone())),
            "slug" => Some(Value::from(self.slug.clone())),
            "rank" => Some(Value::from(self.rank)),
            "author" => Some(Value::from(self.author.clone())),
            "published_at" => Some(Value::from(self.published_at)),
            "revision" => Some(Value::from(self.revision.clone())),
            _ => None,
        }
    }
}

impl MappedEntity for Article {
    fn model() -> &'static str {
        "article"
    }

    fn primary_key_template() -> KeyTemplate {
        KeyTemplate::fields("article", &["id"])
    }

    fn unique_key_templates() -> Vec<KeyTemplate> {
        vec![KeyTemplate::fields("article_slug", &["slug"])]
    }

    fn membership_key_templates() -> Vec<KeyTemplate> {
        vec![KeyTemplate::each("article_tag", "tags")]
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

    /// Keeps `id` and `revision`; every other field not in `fields` is
    /// reset to its empty value.
    fn project(&self, fields: &[String]) -> Self {
        let keep = |name: &str| fields.iter().any(|f| f == name);
        Self {
            id: self.id.clone(),
            title: if keep("title") { self.title.clone() } else { String::new() },
            tag: if keep("tag") { self.tag.clone() } else { String::new() },
            tags: if keep("tags") { self.tags.clone() } else { Vec::new() },
            slug: if keep("slug") { self.slug.clone() } else { None },
            rank: if keep("rank") { self.rank } else { 0 },
            author: if keep("author") { self.author.clone() } else { None },
            published_at: if keep("published_at") { self.published_at } else { None },
            revision: self.revision.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Tessera types.

    use super::*;
    use chrono::DateTime;
    use proptest::prelude::*;

    /// Key components, biased toward the characters the codec escapes.
    pub fn arb_key_component() -> impl Strategy<Value = String> {
        "[a-z0-9:\\\\]{0,6}"
    }

    pub fn arb_key() -> impl Strategy<Value = Key> {
        prop::collection::vec(arb_key_component(), 1..4).prop_map(Key::from_parts)
    }

    /// Timestamps with microsecond precision between 1970 and 2100.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (0i64..4_102_444_800, 0u32..1_000_000)
            .prop_filter_map("representable", |(secs, micros)| {
                DateTime::from_timestamp(secs, micros * 1_000)
            })
    }

    /// Any value the key codec accepts.
    pub fn arb_scalar_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            (-1.0e9f64..1.0e9).prop_map(Value::Float),
            ".{0,12}".prop_map(Value::Text),
            arb_timestamp().prop_map(Value::Timestamp),
        ]
    }

    pub fn arb_compare_op() -> impl Strategy<Value = CompareOp> {
        prop::sample::select(vec![
            CompareOp::Eq,
            CompareOp::Ne,
            CompareOp::Lt,
            CompareOp::Gt,
            CompareOp::Ge,
            CompareOp::Le,
        ])
    }

    fn arb_article_literal() -> impl Strategy<Value = Value> {
        prop_oneof![
            "[a-d]{0,2}".prop_map(Value::Text),
            (-5i64..5).prop_map(Value::Int),
            Just(Value::Null),
        ]
    }

    /// Comparison leaves over the scalar fields of [`Article`], plus
    /// quantified comparisons over `tags`.
    pub fn arb_article_comparison() -> impl Strategy<Value = Predicate> {
        let field = prop::sample::select(vec!["title", "tag", "slug", "rank"]);
        let scalar = (field, arb_compare_op(), arb_article_literal()).prop_map(
            |(field, op, literal)| {
                Predicate::compare(op, vec![Operand::path(&[field]), Operand::Literal(literal)])
            },
        );
        let quantified = (
            prop::sample::select(vec![Quantifier::Any, Quantifier::All, Quantifier::None]),
            arb_compare_op(),
            "[a-d]{1,2}",
        )
            .prop_map(|(q, op, text)| {
                let path = AttributePath::new(["tags"]);
                Predicate::compare(
                    op,
                    vec![Operand::Quantified(q, path), Operand::literal(text)],
                )
            });
        prop_oneof![3 => scalar, 1 => quantified]
    }

    /// Predicate trees over [`Article`] fields, up to three levels deep.
    pub fn arb_article_predicate() -> impl Strategy<Value = Predicate> {
        arb_article_comparison().prop_recursive(3, 16, 3, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 1..3).prop_map(Predicate::And),
                prop::collection::vec(inner.clone(), 1..3).prop_map(Predicate::Or),
                prop::collection::vec(inner, 1..2).prop_map(Predicate::Not),
            ]
        })
    }

    pub fn arb_article() -> impl Strategy<Value = Article> {
        (
            "[a-z0-9]{1,8}",
            "[a-d]{0,3}",
            "[a-d]{0,2}",
            prop::collection::vec("[a-d]{1,2}", 0..4),
            prop::option::of("[a-z]{1,6}"),
            -5i64..5,
        )
            .prop_map(|(id, title, tag, tags, slug, rank)| {
                let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
                let mut article = Article::new(&id, &title)
                    .with_tag(&tag)
                    .with_tags(&tags)
                    .with_rank(rank);
                if let Some(slug) = slug {
                    article = article.with_slug(&slug);
                }
                article
            })
    }

    /// Articles with pairwise distinct ids and slugs.
    pub fn arb_distinct_articles(max: usize) -> impl Strategy<Value = Vec<Article>> {
        prop::collection::vec(arb_article(), 0..max).prop_map(|articles| {
            let mut ids = std::collections::BTreeSet::new();
            let mut slugs = std::collections::BTreeSet::new();
            articles
                .into_iter()
                .filter(|a| ids.insert(a.id().to_string()))
                .filter(|a| a.slug().map_or(true, |s| slugs.insert(s.to_string())))
                .collect()
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built datastores, configs and batches.

    use super::*;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    /// Locks that give up quickly and never force.
    pub fn strict_lock_config() -> LockConfig {
        LockConfig::new()
            .with_max_attempts(3)
            .with_backoff(Duration::from_millis(1))
            .with_force_on_exhaustion(false)
    }

    /// Default config with [`strict_lock_config`] for the commit engine.
    pub fn strict_config() -> TesseraConfig {
        TesseraConfig {
            lock: strict_lock_config(),
            ..TesseraConfig::default()
        }
    }

    pub fn memory_datastore() -> TesseraResult<Datastore<InMemoryKvStore, InMemoryKvStore>> {
        Datastore::in_memory(strict_config())
    }

    /// LMDB as the authoritative store, in-memory cache.
    pub fn lmdb_datastore(
        dir: &Path,
    ) -> TesseraResult<Datastore<LmdbKvStore, InMemoryKvStore>> {
        let store = LmdbKvStore::open(dir, 16)?;
        Datastore::new(
            Arc::new(store),
            Arc::new(InMemoryKvStore::new()),
            JsonSerializer,
            strict_config(),
        )
    }

    /// One batch adding every article.
    pub fn add_batch<I>(articles: I) -> OperationBatch<Article>
    where
        I: IntoIterator<Item = Article>,
    {
        articles
            .into_iter()
            .fold(OperationBatch::new(), |batch, a| batch.add(EntityOp::new(a)))
    }

    /// One batch removing every article.
    pub fn remove_batch<I>(articles: I) -> OperationBatch<Article>
    where
        I: IntoIterator<Item = Article>,
    {
        articles
            .into_iter()
            .fold(OperationBatch::new(), |batch, a| batch.remove(EntityOp::new(a)))
    }

    /// Three articles sharing the `rust` tag, one of them also tagged `kv`.
    pub fn sample_articles() -> Vec<Article> {
        vec![
            Article::new("a1", "Keys")
                .with_tags(&["rust", "kv"])
                .with_slug("keys")
                .with_rank(3),
            Article::new("a2", "Locks").with_tags(&["rust"]).with_rank(1),
            Article::new("a3", "Caches")
                .with_tags(&["rust"])
                .with_slug("caches")
                .with_rank(2),
        ]
    }

    pub fn tag_key(tag: &str) -> Key {
        Key::from_parts(["article_tag", tag])
    }

    pub fn slug_key(slug: &str) -> Key {
        Key::from_parts(["article_slug", slug])
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for Tessera-specific validation.

    use super::*;

    #[track_caller]
    pub fn assert_condition_failed<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(TesseraError::ConditionFailed { .. }) => {}
            other => panic!("Expected ConditionFailed, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_corruption<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(TesseraError::Corruption { .. }) => {}
            other => panic!("Expected Corruption, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_lock_contended<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(TesseraError::LockContended { .. }) => {}
            other => panic!("Expected LockContended, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(e) if e.is_not_found() => {}
            other => panic!("Expected NotFound, got: {:?}", other),
        }
    }

    /// Assert no key in `store` lives under the lock namespace `prefix`.
    #[track_caller]
    pub fn assert_no_locks(store: &InMemoryKvStore, prefix: &str) {
        let held: Vec<String> = store
            .keys()
            .into_iter()
            .filter(|k| Key::decode(k).map_or(false, |key| key.in_namespace(prefix)))
            .collect();
        assert!(held.is_empty(), "Expected no locks, found: {:?}", held);
    }
}
