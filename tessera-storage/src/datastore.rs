//! The public entry point: commit, query, cache and lock primitives over an
//! authoritative store and a cache store.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use tessera_core::{
    reconcile, Key, MappedEntity, OperationBatch, TesseraConfig, TesseraError, TesseraResult,
};
use tracing::{debug, warn};

use crate::cache::{project, select, CacheLevel, CacheStats, CacheTier, InvalidationReport};
use crate::cache::{QueryBase, QueryParams};
use crate::codec::{decode_key, decode_key_set, EntitySerializer, JsonSerializer};
use crate::commit::{CommitEngine, CommitReceipt};
use crate::kv::KvStore;
use crate::lock::{LockOutcome, LockToken};
use crate::refs::{load_references, needs_references};

/// Entity mapper over an authoritative store `S` with a cache store `C`.
///
/// # Example
///
/// ```ignore
/// use tessera_storage::{Datastore, InMemoryKvStore, QueryParams};
///
/// let store = Datastore::in_memory(TesseraConfig::default())?;
/// let receipt = store.commit(OperationBatch::new().add(EntityOp::new(article))).await?;
/// let tagged: Vec<Article> = store.query(&QueryParams::members(tag_key)).await?;
/// ```
pub struct Datastore<S, C, Z = JsonSerializer>
where
    S: KvStore + 'static,
    C: KvStore + 'static,
    Z: EntitySerializer + Clone,
{
    store: Arc<S>,
    engine: CommitEngine<S, Z>,
    cache: CacheTier<C, Z>,
    serializer: Z,
}

impl Datastore<crate::memory::InMemoryKvStore, crate::memory::InMemoryKvStore> {
    /// Two fresh in-memory stores with JSON snapshots.
    pub fn in_memory(config: TesseraConfig) -> TesseraResult<Self> {
        Self::new(
            Arc::new(crate::memory::InMemoryKvStore::new()),
            Arc::new(crate::memory::InMemoryKvStore::new()),
            JsonSerializer,
            config,
        )
    }
}

impl<S, C, Z> Datastore<S, C, Z>
where
    S: KvStore + 'static,
    C: KvStore + 'static,
    Z: EntitySerializer + Clone,
{
    pub fn new(
        store: Arc<S>,
        cache_store: Arc<C>,
        serializer: Z,
        config: TesseraConfig,
    ) -> TesseraResult<Self> {
        config.validate()?;
        let engine = CommitEngine::new(
            Arc::clone(&store),
            serializer.clone(),
            config.lock.clone(),
            config.commit.clone(),
        )?;
        let cache = CacheTier::new(cache_store, serializer.clone(), config.cache.clone())?;
        Ok(Self {
            store,
            engine,
            cache,
            serializer,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cache(&self) -> &CacheTier<C, Z> {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Reconcile `batch`, apply it, then invalidate every affected key in
    /// the cache. A failed invalidation is logged; the receipt is returned
    /// regardless.
    pub async fn commit<E: MappedEntity>(
        &self,
        batch: OperationBatch<E>,
    ) -> TesseraResult<CommitReceipt> {
        let change_set = reconcile(batch)?;
        let receipt = self.engine.commit(change_set).await?;
        // The write is durable at this point; a cache failure must not
        // report it as failed. In-flight refills are fenced separately.
        if let Err(e) = self
            .cache
            .invalidate_keys(receipt.affected_keys.iter().cloned())
            .await
        {
            warn!(
                error = %e,
                affected = receipt.affected_keys.len(),
                "cache invalidation after commit failed"
            );
        }
        Ok(receipt)
    }

    /// Cache first; on a miss read the authoritative store, finish the
    /// result in memory and cache it.
    pub async fn query<E: MappedEntity>(&self, params: &QueryParams) -> TesseraResult<Vec<E>> {
        self.query_with(params, |base| self.fetch::<E>(base)).await
    }

    /// Like [`Datastore::query`] with a caller-supplied refill. `refill`
    /// returns the unfiltered entities for the query base.
    pub async fn query_with<'a, E, F, Fut>(
        &self,
        params: &'a QueryParams,
        refill: F,
    ) -> TesseraResult<Vec<E>>
    where
        E: MappedEntity,
        F: FnOnce(&'a QueryBase) -> Fut,
        Fut: Future<Output = TesseraResult<Vec<E>>>,
    {
        match self.cache.query::<E>(params).await {
            Ok(hit) => return Ok(hit),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let ticket = self.cache.begin_fill::<E>(params).await?;
        let selected = match self.refill_result(params, refill).await {
            Ok(selected) => selected,
            Err(e) => {
                if let Err(cancel) = self.cache.cancel_fill(&ticket).await {
                    warn!(error = %cancel, "failed to withdraw refill ticket");
                }
                return Err(e);
            }
        };
        if !self.cache.complete_fill(&ticket, &selected, params).await? {
            debug!(model = E::model(), "refill result not cached after concurrent change");
        }
        Ok(project(selected, params))
    }

    async fn refill_result<'a, E, F, Fut>(
        &self,
        params: &'a QueryParams,
        refill: F,
    ) -> TesseraResult<Vec<E>>
    where
        E: MappedEntity,
        F: FnOnce(&'a QueryBase) -> Fut,
        Fut: Future<Output = TesseraResult<Vec<E>>>,
    {
        let raw = refill(&params.base).await?;
        let references = match &params.predicate {
            Some(p) if needs_references(p) => {
                load_references(self.store.as_ref(), &self.serializer, &raw, p).await?
            }
            _ => HashMap::new(),
        };
        select(raw, params, CacheLevel::Base, &references)
    }

    /// Cache only; `NotFound` on a miss at every level.
    pub async fn cache_query<E: MappedEntity>(
        &self,
        params: &QueryParams,
    ) -> TesseraResult<Vec<E>> {
        self.cache.query(params).await
    }

    /// One entity by primary key.
    pub async fn get<E: MappedEntity>(&self, key: &Key) -> TesseraResult<Option<E>> {
        let found: Vec<E> = self.query(&QueryParams::entity(key.clone())).await?;
        Ok(found.into_iter().next())
    }

    pub async fn invalidate<E: MappedEntity>(
        &self,
        entities: &[E],
        keys: impl IntoIterator<Item = Key>,
    ) -> TesseraResult<InvalidationReport> {
        self.cache.invalidate(entities, keys).await
    }

    /// Take the same store-resident locks the commit engine uses.
    pub async fn acquire_locks(&self, keys: &[Key]) -> TesseraResult<LockOutcome> {
        let tokens = self.lock_tokens(keys);
        self.engine.locks().acquire(&tokens).await
    }

    pub async fn release_locks(&self, keys: &[Key]) -> TesseraResult<()> {
        let tokens = self.lock_tokens(keys);
        self.engine.locks().release(&tokens).await
    }

    fn lock_tokens(&self, keys: &[Key]) -> BTreeSet<LockToken> {
        self.engine.locks().tokens(keys)
    }

    /// Read the unfiltered entities for `base` from the authoritative store.
    pub async fn fetch<E: MappedEntity>(&self, base: &QueryBase) -> TesseraResult<Vec<E>> {
        match base {
            QueryBase::Entity(key) => Ok(self.load::<E>(key).await?.into_iter().collect()),
            QueryBase::Unique(unique) => {
                let Some(bytes) = self.store.get(&unique.encode()).await? else {
                    return Ok(Vec::new());
                };
                let primary = decode_key(unique, &bytes)?;
                match self.load::<E>(&primary).await? {
                    Some(entity) => Ok(vec![entity]),
                    None => Err(TesseraError::corruption(format!(
                        "unique key {} points at missing entity {}",
                        unique, primary
                    ))),
                }
            }
            QueryBase::Membership(collection) => {
                let Some(bytes) = self.store.get(&collection.encode()).await? else {
                    return Ok(Vec::new());
                };
                let members: Vec<Key> = decode_key_set(collection, &bytes)?.into_iter().collect();
                let encoded: Vec<String> = members.iter().map(Key::encode).collect();
                let mut out = Vec::with_capacity(members.len());
                for (member, value) in members.iter().zip(self.store.get_many(&encoded).await?) {
                    match value {
                        Some(bytes) => out.push(self.serializer.deserialize(member, &bytes)?),
                        None => warn!(
                            collection = %collection,
                            member = %member,
                            "membership set lists a missing entity"
                        ),
                    }
                }
                Ok(out)
            }
            QueryBase::Range { start, end } => {
                if !self.store.capabilities().ordered {
                    return Err(TesseraError::unsupported(self.store.name(), "range query"));
                }
                let template = E::primary_key_template();
                let mut out = Vec::new();
                for (encoded, bytes) in self.store.scan(&start.encode(), &end.encode()).await? {
                    let key = Key::decode(&encoded)?;
                    if key.in_namespace(template.name()) {
                        out.push(self.serializer.deserialize(&key, &bytes)?);
                    }
                }
                Ok(out)
            }
        }
    }

    async fn load<E: MappedEntity>(&self, key: &Key) -> TesseraResult<Option<E>> {
        match self.store.get(&key.encode()).await? {
            Some(bytes) => Ok(Some(self.serializer.deserialize(key, &bytes)?)),
            None => Ok(None),
        }
    }
}
