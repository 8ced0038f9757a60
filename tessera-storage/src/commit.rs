//! Applies reconciled change-sets to a store.
//!
//! Order of a commit:
//!
//! 1. lock every key the change-set touches
//! 2. check conditions against stored values (nothing written on failure)
//! 3. check that new unique keys are not stored for another entity
//! 4. read-modify-write membership sets, then create/drop collections
//! 5. stamp revisions, write entities and unique keys, delete removed ones
//! 6. release locks, on every path
//!
//! There is no undo log: a backend failure during step 4 or 5 can leave a
//! partial write. Locks are still released.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tessera_core::{
    new_revision_token, ChangeSet, CommitConfig, Key, LockConfig, MappedEntity,
    MissingEntityPolicy, TesseraError, TesseraResult,
};
use tracing::{debug, warn};

use crate::codec::{decode_key, decode_key_set, encode_key, encode_key_set, EntitySerializer};
use crate::kv::KvStore;
use crate::lock::{LockManager, LockOutcome};
use crate::refs::load_references;

/// What a successful commit did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Every key the change-set touched; what the cache must invalidate.
    pub affected_keys: BTreeSet<Key>,
    /// Entity key → revision token stamped by this commit.
    pub revisions: BTreeMap<Key, String>,
    /// Whether locks had to be forced.
    pub forced: bool,
}

/// Writes change-sets to the authoritative store.
pub struct CommitEngine<S: KvStore + 'static, Z: EntitySerializer> {
    store: Arc<S>,
    locks: LockManager<S>,
    serializer: Z,
    config: CommitConfig,
}

impl<S: KvStore + 'static, Z: EntitySerializer> CommitEngine<S, Z> {
    pub fn new(
        store: Arc<S>,
        serializer: Z,
        lock: LockConfig,
        config: CommitConfig,
    ) -> TesseraResult<Self> {
        let locks = LockManager::new(Arc::clone(&store), lock)?;
        Ok(Self {
            store,
            locks,
            serializer,
            config,
        })
    }

    pub fn locks(&self) -> &LockManager<S> {
        &self.locks
    }

    pub fn serializer(&self) -> &Z {
        &self.serializer
    }

    /// Apply `change_set` under locks.
    pub async fn commit<E: MappedEntity>(
        &self,
        change_set: ChangeSet<E>,
    ) -> TesseraResult<CommitReceipt> {
        if change_set.is_empty() && change_set.conditions.is_empty() {
            return Ok(CommitReceipt {
                affected_keys: change_set.affected_keys,
                ..CommitReceipt::default()
            });
        }

        let tokens = self.locks.tokens(&change_set.lock_keys());
        self.locks
            .with_locks(&tokens, |outcome| self.apply(change_set, outcome))
            .await
    }

    async fn apply<E: MappedEntity>(
        &self,
        cs: ChangeSet<E>,
        outcome: LockOutcome,
    ) -> TesseraResult<CommitReceipt> {
        self.check_conditions(&cs).await?;
        if self.config.enforce_stored_uniqueness {
            self.check_stored_uniqueness(&cs).await?;
        }

        let mut sets: Vec<(String, Vec<u8>)> = Vec::new();
        let mut deletes: Vec<String> = Vec::new();

        self.stage_memberships(&cs, &mut sets, &mut deletes).await?;

        let mut revisions = BTreeMap::new();
        let stamped = cs
            .add_entities
            .iter()
            .chain(cs.update_entities.iter().map(|(k, (_, new))| (k, new)));
        for (key, entity) in stamped {
            let mut entity = entity.clone();
            let token = new_revision_token();
            entity.set_revision(token.clone());
            sets.push((key.encode(), self.serializer.serialize(key, &entity)?));
            revisions.insert(key.clone(), token);
        }
        for (unique, target) in &cs.add_unique {
            sets.push((unique.encode(), encode_key(target)));
        }
        for (unique, (_, target)) in &cs.update_unique {
            sets.push((unique.encode(), encode_key(target)));
        }
        deletes.extend(cs.remove_entities.keys().map(Key::encode));
        deletes.extend(cs.remove_unique.keys().map(Key::encode));

        let (written, deleted) = (sets.len(), deletes.len());
        if !sets.is_empty() {
            self.store.set_many(sets).await?;
        }
        if !deletes.is_empty() {
            self.store.delete_many(&deletes).await?;
        }

        debug!(
            model = E::model(),
            written,
            deleted,
            affected = cs.affected_keys.len(),
            forced = outcome.is_forced(),
            "commit applied"
        );

        Ok(CommitReceipt {
            affected_keys: cs.affected_keys,
            revisions,
            forced: outcome.is_forced(),
        })
    }

    async fn check_conditions<E: MappedEntity>(&self, cs: &ChangeSet<E>) -> TesseraResult<()> {
        for (key, condition) in &cs.conditions {
            let Some(bytes) = self.store.get(&key.encode()).await? else {
                match self.config.missing_entity_policy {
                    MissingEntityPolicy::Fail => {
                        return Err(TesseraError::ConditionFailed {
                            key: key.to_string(),
                            reason: "entity is not stored".to_string(),
                        });
                    }
                    MissingEntityPolicy::Skip => {
                        warn!(
                            model = E::model(),
                            key = %key,
                            "skipping condition on missing entity"
                        );
                        continue;
                    }
                }
            };
            let stored: E = self.serializer.deserialize(key, &bytes)?;
            let references = load_references(
                self.store.as_ref(),
                &self.serializer,
                std::slice::from_ref(&stored),
                condition,
            )
            .await?;
            if !condition.evaluate(&stored, &references)? {
                return Err(TesseraError::ConditionFailed {
                    key: key.to_string(),
                    reason: format!("{} does not hold", condition),
                });
            }
        }
        Ok(())
    }

    async fn check_stored_uniqueness<E: MappedEntity>(
        &self,
        cs: &ChangeSet<E>,
    ) -> TesseraResult<()> {
        for (unique, target) in &cs.add_unique {
            let Some(bytes) = self.store.get(&unique.encode()).await? else {
                continue;
            };
            let owner = decode_key(unique, &bytes)?;
            if owner != *target && !cs.remove_entities.contains_key(&owner) {
                return Err(TesseraError::corruption(format!(
                    "unique key {} is held by {}, cannot assign to {}",
                    unique, owner, target
                )));
            }
        }
        Ok(())
    }

    /// Merge membership changes into the stored sets and handle collection
    /// creation and removal.
    async fn stage_memberships<E: MappedEntity>(
        &self,
        cs: &ChangeSet<E>,
        sets: &mut Vec<(String, Vec<u8>)>,
        deletes: &mut Vec<String>,
    ) -> TesseraResult<()> {
        let mut merged: BTreeMap<Key, BTreeSet<Key>> = BTreeMap::new();
        for member_key in cs.membership_keys() {
            let stored = match self.store.get(&member_key.encode()).await? {
                Some(bytes) => Some(decode_key_set(&member_key, &bytes)?),
                None => None,
            };
            let has_removals = cs.remove_membership.iter().any(|(m, _)| *m == member_key);
            if stored.is_none() && has_removals {
                warn!(key = %member_key, "removing members from an absent membership set");
            }
            merged.insert(member_key, stored.unwrap_or_default());
        }
        for (m, entity) in &cs.remove_membership {
            if let Some(members) = merged.get_mut(m) {
                members.remove(entity);
            }
        }
        for (m, entity) in &cs.add_membership {
            if let Some(members) = merged.get_mut(m) {
                members.insert(entity.clone());
            }
        }

        for (m, members) in &merged {
            if cs.collection_removals.contains(m) {
                continue;
            }
            if members.is_empty()
                && self.config.drop_empty_collections
                && !cs.collection_additions.contains(m)
            {
                deletes.push(m.encode());
            } else {
                sets.push((m.encode(), encode_key_set(m, members)?));
            }
        }

        for collection in &cs.collection_additions {
            if merged.contains_key(collection) {
                continue;
            }
            let empty = encode_key_set(collection, std::iter::empty())?;
            self.store
                .create_if_absent(&collection.encode(), empty)
                .await?;
        }
        deletes.extend(cs.collection_removals.iter().map(Key::encode));
        Ok(())
    }
}
