//! Cache tier over a second key-value store.
//!
//! Layout in the cache store:
//!
//! - entity snapshot at its primary key
//! - unique key → primary key
//! - composite query key → ordered primary keys
//! - integrity entry (`integrity_prefix` + K) → composite keys that depend on K
//!
//! Invalidating K deletes K, its integrity entry and every composite listed
//! there, so a stale composite never outlives a change to a key it was built
//! from.

use std::collections::BTreeSet;
use std::sync::Arc;

use tessera_core::{CacheConfig, Key, MappedEntity, NoReferences, TesseraError, TesseraResult};
use tracing::debug;

use super::query::{finish, namespace_of, CacheLevel, QueryBase, QueryParams};
use super::stats::{CacheStats, StatsCounters};
use crate::codec::{
    decode_key, decode_key_list, decode_key_set, encode_key, encode_key_set, EntitySerializer,
};
use crate::kv::KvStore;
use crate::lock::LockManager;

/// What an invalidation removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Entries actually present and deleted.
    pub deleted: u64,
    /// Composite keys found through integrity entries.
    pub dependents: BTreeSet<Key>,
    /// Whether either lock round had to force.
    pub forced: bool,
}

/// Handle for one in-flight refill; see [`CacheTier::begin_fill`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillTicket {
    entries: BTreeSet<Key>,
    marker: Key,
}

/// Query cache with integrity-tracked invalidation.
pub struct CacheTier<C: KvStore + 'static, Z: EntitySerializer> {
    store: Arc<C>,
    locks: LockManager<C>,
    serializer: Z,
    config: CacheConfig,
    stats: StatsCounters,
}

impl<C: KvStore + 'static, Z: EntitySerializer> CacheTier<C, Z> {
    pub fn new(store: Arc<C>, serializer: Z, config: CacheConfig) -> TesseraResult<Self> {
        config.validate()?;
        let locks = LockManager::new(Arc::clone(&store), config.lock.clone())?;
        Ok(Self {
            store,
            locks,
            serializer,
            config,
            stats: StatsCounters::default(),
        })
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    pub fn locks(&self) -> &LockManager<C> {
        &self.locks
    }

    /// Integrity entry address for `key`.
    pub fn integrity_key(&self, key: &Key) -> Key {
        key.namespaced(&self.config.integrity_prefix)
    }

    /// Look `params` up, relaxing one level at a time. `NotFound` when every
    /// level misses.
    pub async fn query<E: MappedEntity>(&self, params: &QueryParams) -> TesseraResult<Vec<E>> {
        for level in params.levels() {
            if let Some(entities) = self.lookup::<E>(params, level).await? {
                debug!(model = E::model(), level = %level, count = entities.len(), "cache hit");
                self.stats.record_hit();
                return finish(entities, params, level, &NoReferences);
            }
            debug!(model = E::model(), level = %level, "cache miss");
        }
        self.stats.record_miss();
        Err(TesseraError::not_found(
            &params.cache_key(&self.config.query_prefix, params.top_level()),
        ))
    }

    async fn lookup<E: MappedEntity>(
        &self,
        params: &QueryParams,
        level: CacheLevel,
    ) -> TesseraResult<Option<Vec<E>>> {
        if !params.is_composite(level) {
            let primary = match &params.base {
                QueryBase::Entity(k) => k.clone(),
                QueryBase::Unique(u) => match self.store.get(&u.encode()).await? {
                    Some(bytes) => decode_key(u, &bytes)?,
                    None => return Ok(None),
                },
                QueryBase::Membership(_) | QueryBase::Range { .. } => return Ok(None),
            };
            return Ok(self.load_snapshot::<E>(&primary).await?.map(|e| vec![e]));
        }

        let key = params.cache_key(&self.config.query_prefix, level);
        let Some(bytes) = self.store.get(&key.encode()).await? else {
            return Ok(None);
        };
        let members = decode_key_list(&key, &bytes)?;
        let encoded: Vec<String> = members.iter().map(Key::encode).collect();
        let snapshots = self.store.get_many(&encoded).await?;

        let mut out = Vec::with_capacity(members.len());
        for (member, snapshot) in members.iter().zip(snapshots) {
            match snapshot {
                Some(bytes) => out.push(self.serializer.deserialize(member, &bytes)?),
                None => {
                    debug!(key = %key, member = %member, "cached result lost a member snapshot");
                    return Ok(None);
                }
            }
        }
        Ok(Some(out))
    }

    async fn load_snapshot<E: MappedEntity>(&self, key: &Key) -> TesseraResult<Option<E>> {
        match self.store.get(&key.encode()).await? {
            Some(bytes) => Ok(Some(self.serializer.deserialize(key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Mark the start of a refill for `params`.
    ///
    /// The ticket is recorded in the integrity entries of the query base and
    /// of the model namespace until [`CacheTier::complete_fill`] or
    /// [`CacheTier::cancel_fill`]. Invalidating the base or any entity of
    /// the model in between deletes one of those entries, and the ticket
    /// with it.
    pub async fn begin_fill<E: MappedEntity>(
        &self,
        params: &QueryParams,
    ) -> TesseraResult<FillTicket> {
        let model_namespace = Key::from_parts([E::primary_key_template().name()]);
        let entries: BTreeSet<Key> = [params.base.dependency(), model_namespace]
            .iter()
            .map(|k| self.integrity_key(k))
            .collect();
        let marker = Key::from_parts([
            self.config.query_prefix.clone(),
            "fill".to_string(),
            uuid::Uuid::now_v7().to_string(),
        ]);
        self.mark_entries(&entries, &marker, true).await?;
        Ok(FillTicket { entries, marker })
    }

    /// Withdraw a ticket whose refill failed.
    pub async fn cancel_fill(&self, ticket: &FillTicket) -> TesseraResult<()> {
        self.mark_entries(&ticket.entries, &ticket.marker, false).await
    }

    async fn mark_entries(
        &self,
        entries: &BTreeSet<Key>,
        marker: &Key,
        insert: bool,
    ) -> TesseraResult<()> {
        let tokens = self.locks.tokens(entries);
        self.locks
            .with_locks(&tokens, |_| async move {
                let encoded: Vec<String> = entries.iter().map(Key::encode).collect();
                let current = self.store.get_many(&encoded).await?;
                let mut writes = Vec::new();
                let mut deletes = Vec::new();
                for ((entry, address), stored) in entries.iter().zip(encoded).zip(current) {
                    let mut dependents = match stored {
                        Some(bytes) => decode_key_set(entry, &bytes)?,
                        None => BTreeSet::new(),
                    };
                    let changed = if insert {
                        dependents.insert(marker.clone())
                    } else {
                        dependents.remove(marker)
                    };
                    if !changed {
                        continue;
                    }
                    if dependents.is_empty() {
                        deletes.push(address);
                    } else {
                        writes.push((address, encode_key_set(entry, &dependents)?));
                    }
                }
                if !writes.is_empty() {
                    self.store.set_many(writes).await?;
                }
                if !deletes.is_empty() {
                    self.store.delete_many(&deletes).await?;
                }
                Ok(())
            })
            .await
    }

    /// Store the result of a refill started with [`CacheTier::begin_fill`].
    ///
    /// Returns `false`, storing nothing, when the base was invalidated
    /// since the ticket was issued.
    pub async fn complete_fill<E: MappedEntity>(
        &self,
        ticket: &FillTicket,
        entities: &[E],
        params: &QueryParams,
    ) -> TesseraResult<bool> {
        self.write_result(entities, params, Some(ticket)).await
    }

    /// Store full snapshots of `entities` and, for composite queries, the
    /// ordered result list plus its integrity links.
    pub async fn store_query_result<E: MappedEntity>(
        &self,
        entities: &[E],
        params: &QueryParams,
    ) -> TesseraResult<()> {
        self.write_result(entities, params, None).await.map(|_| ())
    }

    /// Snapshots, composite list and integrity links are written in one
    /// batch under the integrity locks, so an invalidation sees either none
    /// of them or all of them.
    async fn write_result<E: MappedEntity>(
        &self,
        entities: &[E],
        params: &QueryParams,
        ticket: Option<&FillTicket>,
    ) -> TesseraResult<bool> {
        let mut sets = Vec::new();
        let mut primaries = Vec::with_capacity(entities.len());
        let mut sources = BTreeSet::new();
        for entity in entities {
            let primary = entity.entity_key(false)?;
            sets.push((primary.encode(), self.serializer.serialize(&primary, entity)?));
            for unique in entity.unique_keys(false)? {
                sets.push((unique.encode(), encode_key(&primary)));
            }
            sources.insert(primary.clone());
            sources.extend(entity.membership_keys(false)?);
            primaries.push(primary);
        }

        let level = params.top_level();
        let composite = if params.is_composite(level) {
            sources.insert(params.base.dependency());
            Some(params.cache_key(&self.config.query_prefix, level))
        } else {
            sources.clear();
            None
        };
        let mut entries: BTreeSet<Key> = sources.iter().map(|k| self.integrity_key(k)).collect();
        if let Some(ticket) = ticket {
            entries.extend(ticket.entries.iter().cloned());
        }
        if entries.is_empty() {
            if !sets.is_empty() {
                self.store.set_many(sets).await?;
            }
            return Ok(true);
        }

        let tokens = self.locks.tokens(&entries);
        let (entries_ref, composite_ref, primaries_ref) = (&entries, &composite, &primaries);
        self.locks
            .with_locks(&tokens, |_| async move {
                let encoded: Vec<String> = entries_ref.iter().map(Key::encode).collect();
                let current = self.store.get_many(&encoded).await?;

                let mut decoded = Vec::with_capacity(encoded.len());
                for ((entry, address), stored) in entries_ref.iter().zip(encoded).zip(current) {
                    let dependents = match stored {
                        Some(bytes) => decode_key_set(entry, &bytes)?,
                        None => BTreeSet::new(),
                    };
                    decoded.push((entry, address, dependents));
                }
                let live = ticket.map_or(true, |t| {
                    decoded
                        .iter()
                        .filter(|(entry, _, _)| t.entries.contains(*entry))
                        .all(|(_, _, dependents)| dependents.contains(&t.marker))
                });
                if !live {
                    debug!(model = E::model(), "refill raced an invalidation, discarding");
                }

                // A discarded fill still withdraws its marker from the
                // entries that survived.
                let mut writes = if live { sets } else { Vec::new() };
                let mut deletes = Vec::new();
                for (entry, address, mut dependents) in decoded {
                    let mut changed = ticket.map_or(false, |t| dependents.remove(&t.marker));
                    if let (true, Some(composite)) = (live, composite_ref) {
                        changed |= dependents.insert(composite.clone());
                    }
                    if !changed {
                        continue;
                    }
                    if dependents.is_empty() {
                        deletes.push(address);
                    } else {
                        writes.push((address, encode_key_set(entry, &dependents)?));
                    }
                }

                if let (true, Some(composite)) = (live, composite_ref) {
                    writes.push((composite.encode(), encode_key_set(composite, primaries_ref)?));
                }
                if !writes.is_empty() {
                    self.store.set_many(writes).await?;
                }
                if !deletes.is_empty() {
                    self.store.delete_many(&deletes).await?;
                }
                Ok(live)
            })
            .await
    }

    /// Invalidate `keys` and every cached result that depends on them.
    pub async fn invalidate_keys<I>(&self, keys: I) -> TesseraResult<InvalidationReport>
    where
        I: IntoIterator<Item = Key>,
    {
        let direct: BTreeSet<Key> = keys.into_iter().collect();
        if direct.is_empty() {
            return Ok(InvalidationReport::default());
        }
        self.stats.record_invalidation();

        let mut entries: BTreeSet<Key> = direct.iter().map(|k| self.integrity_key(k)).collect();
        entries.extend(direct.iter().map(|k| self.integrity_key(&namespace_of(k))));

        let round_one = self.locks.tokens(direct.iter().chain(entries.iter()));
        let (direct_ref, entries_ref, round_one_ref) = (&direct, &entries, &round_one);
        let report = self
            .locks
            .with_locks(&round_one, |first| async move {
                let encoded: Vec<String> = entries_ref.iter().map(Key::encode).collect();
                let stored = self.store.get_many(&encoded).await?;
                let mut dependents = BTreeSet::new();
                for (entry, value) in entries_ref.iter().zip(stored) {
                    if let Some(bytes) = value {
                        dependents.extend(decode_key_set(entry, &bytes)?);
                    }
                }

                let round_two: BTreeSet<_> = self
                    .locks
                    .tokens(&dependents)
                    .difference(round_one_ref)
                    .cloned()
                    .collect();
                let mut doomed: Vec<String> = direct_ref
                    .iter()
                    .chain(dependents.iter())
                    .map(Key::encode)
                    .collect();
                doomed.extend(encoded);

                self.locks
                    .with_locks(&round_two, |second| async move {
                        let deleted = self.store.delete_many(&doomed).await?;
                        Ok(InvalidationReport {
                            deleted,
                            dependents,
                            forced: first.is_forced() || second.is_forced(),
                        })
                    })
                    .await
            })
            .await?;

        debug!(
            direct = direct.len(),
            dependents = report.dependents.len(),
            deleted = report.deleted,
            "cache invalidated"
        );
        Ok(report)
    }

    /// Invalidate everything cached about `entities` (current and persisted
    /// keys) plus `keys`.
    pub async fn invalidate<E: MappedEntity>(
        &self,
        entities: &[E],
        keys: impl IntoIterator<Item = Key>,
    ) -> TesseraResult<InvalidationReport> {
        let mut direct: BTreeSet<Key> = keys.into_iter().collect();
        for entity in entities {
            for persisted in [false, true] {
                direct.insert(entity.entity_key(persisted)?);
                direct.extend(entity.unique_keys(persisted)?);
                direct.extend(entity.membership_keys(persisted)?);
            }
        }
        self.invalidate_keys(direct).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::query::SortDirection;
    use crate::codec::JsonSerializer;
    use crate::memory::InMemoryKvStore;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tessera_core::{Attributes, ChangeTracker, KeyTemplate, LockConfig, Predicate, Value};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Card {
        id: String,
        tag: String,
        rank: i64,
        #[serde(skip)]
        tracker: ChangeTracker,
    }

    fn card(id: &str, tag: &str, rank: i64) -> Card {
        Card {
            id: id.to_string(),
            tag: tag.to_string(),
            rank,
            tracker: ChangeTracker::new(),
        }
    }

    impl Attributes for Card {
        fn attribute(&self, name: &str) -> Option<Value> {
            match name {
                "id" => Some(Value::from(&self.id)),
                "tag" => Some(Value::from(&self.tag)),
                "rank" => Some(Value::Int(self.rank)),
                _ => None,
            }
        }
    }

    impl MappedEntity for Card {
        fn model() -> &'static str {
            "card"
        }
        fn primary_key_template() -> KeyTemplate {
            KeyTemplate::fields("card", &["id"])
        }
        fn unique_key_templates() -> Vec<KeyTemplate> {
            vec![KeyTemplate::fields("card_rank", &["rank"])]
        }
        fn membership_key_templates() -> Vec<KeyTemplate> {
            vec![KeyTemplate::fields("card_tag", &["tag"])]
        }
        fn tracker(&self) -> &ChangeTracker {
            &self.tracker
        }
        fn tracker_mut(&mut self) -> &mut ChangeTracker {
            &mut self.tracker
        }
        fn set_revision(&mut self, _token: String) {}
    }

    fn tier(store: &InMemoryKvStore) -> CacheTier<InMemoryKvStore, JsonSerializer> {
        let lock = LockConfig::new()
            .with_max_attempts(2)
            .with_backoff(Duration::from_millis(1));
        CacheTier::new(
            Arc::new(store.clone()),
            JsonSerializer,
            CacheConfig::new().with_lock(lock),
        )
        .unwrap()
    }

    fn tag(name: &str) -> Key {
        Key::from_parts(["card_tag", name])
    }

    #[tokio::test]
    async fn test_miss_then_hit_on_entity() {
        let store = InMemoryKvStore::new();
        let cache = tier(&store);
        let params = QueryParams::entity(Key::from_parts(["card", "1"]));

        let err = cache.query::<Card>(&params).await.unwrap_err();
        assert!(err.is_not_found());

        cache
            .store_query_result(&[card("1", "x", 1)], &params)
            .await
            .unwrap();
        let found: Vec<Card> = cache.query(&params).await.unwrap();
        assert_eq!(found[0].id, "1");

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn test_unique_lookup_goes_through_primary() {
        let store = InMemoryKvStore::new();
        let cache = tier(&store);
        let by_id = QueryParams::entity(Key::from_parts(["card", "1"]));
        cache
            .store_query_result(&[card("1", "x", 7)], &by_id)
            .await
            .unwrap();

        let by_rank = QueryParams::unique(Key::from_parts(["card_rank", "7"]));
        let found: Vec<Card> = cache.query(&by_rank).await.unwrap();
        assert_eq!(found[0].id, "1");
    }

    #[tokio::test]
    async fn test_relaxed_hit_applies_stripped_parameters() {
        let store = InMemoryKvStore::new();
        let cache = tier(&store);
        let base = QueryParams::members(tag("x"));
        cache
            .store_query_result(
                &[card("1", "x", 3), card("2", "x", 1), card("3", "x", 2)],
                &base,
            )
            .await
            .unwrap();

        let refined = QueryParams::members(tag("x"))
            .with_predicate(Predicate::gt(
                tessera_core::Operand::path(&["rank"]),
                tessera_core::Operand::literal(1),
            ))
            .with_order("rank", SortDirection::Desc)
            .with_limit(1);
        let found: Vec<Card> = cache.query(&refined).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "1");
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_a_miss() {
        let store = InMemoryKvStore::new();
        let cache = tier(&store);
        let params = QueryParams::members(tag("x"));
        cache
            .store_query_result(&[card("1", "x", 1)], &params)
            .await
            .unwrap();
        store.delete("card:1").await.unwrap();

        assert!(cache.query::<Card>(&params).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_invalidate_membership_drops_dependents_only() {
        let store = InMemoryKvStore::new();
        let cache = tier(&store);
        let x = QueryParams::members(tag("x"));
        let x_sorted = QueryParams::members(tag("x")).with_order("rank", SortDirection::Asc);
        let y = QueryParams::members(tag("y"));
        cache.store_query_result(&[card("1", "x", 1)], &x).await.unwrap();
        cache
            .store_query_result(&[card("1", "x", 1)], &x_sorted)
            .await
            .unwrap();
        cache.store_query_result(&[card("2", "y", 2)], &y).await.unwrap();

        let report = cache.invalidate_keys([tag("x")]).await.unwrap();
        assert_eq!(report.dependents.len(), 2);
        assert!(!report.forced);

        assert!(cache.query::<Card>(&x).await.is_err());
        assert!(cache.query::<Card>(&x_sorted).await.is_err());
        assert_eq!(cache.query::<Card>(&y).await.unwrap().len(), 1);

        // No lock records left behind.
        assert!(store.keys().iter().all(|k| !k.starts_with("lock:")));
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[tokio::test]
    async fn test_invalidate_member_entity_drops_its_results() {
        let store = InMemoryKvStore::new();
        let cache = tier(&store);
        let x = QueryParams::members(tag("x"));
        let c = card("1", "x", 1);
        cache.store_query_result(&[c.clone()], &x).await.unwrap();

        cache.invalidate(&[c], []).await.unwrap();
        assert!(cache.query::<Card>(&x).await.is_err());
        assert!(!store.contains("card:1"));
        assert!(!store.contains("card_rank:1"));
    }

    #[tokio::test]
    async fn test_range_results_depend_on_namespace() {
        let store = InMemoryKvStore::new();
        let cache = tier(&store);
        let range = QueryParams::range(
            Key::from_parts(["card", "a"]),
            Key::from_parts(["card", "z"]),
        );
        cache
            .store_query_result(&[card("b", "x", 1)], &range)
            .await
            .unwrap();
        assert_eq!(cache.query::<Card>(&range).await.unwrap().len(), 1);

        // A brand-new entity in the namespace must drop the range result.
        cache
            .invalidate_keys([Key::from_parts(["card", "c"])])
            .await
            .unwrap();
        assert!(cache.query::<Card>(&range).await.is_err());
    }

    #[tokio::test]
    async fn test_fill_completes_and_clears_ticket() {
        let store = InMemoryKvStore::new();
        let cache = tier(&store);
        let x = QueryParams::members(tag("x"));
        let ticket = cache.begin_fill::<Card>(&x).await.unwrap();

        let stored = cache
            .complete_fill(&ticket, &[card("1", "x", 1)], &x)
            .await
            .unwrap();
        assert!(stored);
        assert_eq!(cache.query::<Card>(&x).await.unwrap().len(), 1);

        let entry = cache.integrity_key(&tag("x"));
        let bytes = store.get(&entry.encode()).await.unwrap().unwrap();
        let dependents = decode_key_set(&entry, &bytes).unwrap();
        assert_eq!(dependents.len(), 1);
        assert!(dependents.contains(&x.cache_key("query", CacheLevel::Base)));
        let model_entry = cache.integrity_key(&Key::from_parts(["card"]));
        assert!(!store.contains(&model_entry.encode()));
    }

    #[tokio::test]
    async fn test_fill_discarded_after_base_invalidation() {
        let store = InMemoryKvStore::new();
        let cache = tier(&store);
        let x = QueryParams::members(tag("x"));
        let ticket = cache.begin_fill::<Card>(&x).await.unwrap();

        // A commit lands between the authoritative read and the cache write.
        cache.invalidate_keys([tag("x")]).await.unwrap();

        let stored = cache
            .complete_fill(&ticket, &[card("1", "x", 1)], &x)
            .await
            .unwrap();
        assert!(!stored);
        assert!(cache.query::<Card>(&x).await.unwrap_err().is_not_found());
        assert!(!store.contains("card:1"));
        assert!(!store.contains(&cache.integrity_key(&tag("x")).encode()));
    }

    #[tokio::test]
    async fn test_fill_discarded_after_entity_invalidation() {
        let store = InMemoryKvStore::new();
        let cache = tier(&store);
        let one = QueryParams::entity(Key::from_parts(["card", "1"]));
        let ticket = cache.begin_fill::<Card>(&one).await.unwrap();

        // Any entity of the model may have been read by the refill.
        cache
            .invalidate_keys([Key::from_parts(["card", "2"])])
            .await
            .unwrap();

        let stored = cache
            .complete_fill(&ticket, &[card("1", "x", 1)], &one)
            .await
            .unwrap();
        assert!(!stored);
        assert!(!store.contains("card:1"));
        // The surviving entry no longer carries the ticket.
        let entry = cache.integrity_key(&Key::from_parts(["card", "1"]));
        assert!(!store.contains(&entry.encode()));
    }

    #[tokio::test]
    async fn test_cancel_fill_leaves_no_entries() {
        let store = InMemoryKvStore::new();
        let cache = tier(&store);
        let x = QueryParams::members(tag("x"));
        let ticket = cache.begin_fill::<Card>(&x).await.unwrap();
        assert!(store.contains(&cache.integrity_key(&tag("x")).encode()));

        cache.cancel_fill(&ticket).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_empty_invalidation_is_noop() {
        let store = InMemoryKvStore::new();
        let cache = tier(&store);
        let report = cache.invalidate_keys(Vec::new()).await.unwrap();
        assert_eq!(report, InvalidationReport::default());
        assert_eq!(cache.stats().invalidations, 0);
    }
}
