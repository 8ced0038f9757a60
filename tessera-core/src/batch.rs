//! Operation batches and normalized change-sets

use crate::key::Key;
use crate::predicate::Predicate;
use std::collections::{BTreeMap, BTreeSet};

/// One entity-level request inside a batch.
///
/// Explicit keys are added on top of the keys the entity's templates
/// produce; they are how callers index entities under collections the
/// model does not declare.
#[derive(Debug, Clone)]
pub struct EntityOp<E> {
    pub entity: E,
    pub add_keys: Vec<Key>,
    pub remove_keys: Vec<Key>,
    pub add_unique_keys: Vec<Key>,
    pub remove_unique_keys: Vec<Key>,
    pub condition: Option<Predicate>,
}

impl<E> EntityOp<E> {
    pub fn new(entity: E) -> Self {
        Self {
            entity,
            add_keys: Vec::new(),
            remove_keys: Vec::new(),
            add_unique_keys: Vec::new(),
            remove_unique_keys: Vec::new(),
            condition: None,
        }
    }

    pub fn with_add_keys(mut self, keys: impl IntoIterator<Item = Key>) -> Self {
        self.add_keys.extend(keys);
        self
    }

    pub fn with_remove_keys(mut self, keys: impl IntoIterator<Item = Key>) -> Self {
        self.remove_keys.extend(keys);
        self
    }

    pub fn with_add_unique_keys(mut self, keys: impl IntoIterator<Item = Key>) -> Self {
        self.add_unique_keys.extend(keys);
        self
    }

    pub fn with_remove_unique_keys(mut self, keys: impl IntoIterator<Item = Key>) -> Self {
        self.remove_unique_keys.extend(keys);
        self
    }

    /// Optimistic check against the stored entity. Only updates and
    /// removals carry one; a conditioned addition is rejected by the
    /// reconciler.
    pub fn with_condition(mut self, condition: Predicate) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// Object-level mutation request handed to the reconciler.
#[derive(Debug, Clone)]
pub struct OperationBatch<E> {
    pub additions: Vec<EntityOp<E>>,
    pub updates: Vec<EntityOp<E>>,
    pub removals: Vec<EntityOp<E>>,
    pub collection_additions: Vec<Key>,
    pub collection_removals: Vec<Key>,
}

impl<E> Default for OperationBatch<E> {
    fn default() -> Self {
        Self {
            additions: Vec::new(),
            updates: Vec::new(),
            removals: Vec::new(),
            collection_additions: Vec::new(),
            collection_removals: Vec::new(),
        }
    }
}

impl<E> OperationBatch<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, op: EntityOp<E>) -> Self {
        self.additions.push(op);
        self
    }

    pub fn update(mut self, op: EntityOp<E>) -> Self {
        self.updates.push(op);
        self
    }

    pub fn remove(mut self, op: EntityOp<E>) -> Self {
        self.removals.push(op);
        self
    }

    pub fn init_collection(mut self, key: Key) -> Self {
        self.collection_additions.push(key);
        self
    }

    pub fn drop_collection(mut self, key: Key) -> Self {
        self.collection_removals.push(key);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty()
            && self.updates.is_empty()
            && self.removals.is_empty()
            && self.collection_additions.is_empty()
            && self.collection_removals.is_empty()
    }
}

/// Normalized, conflict-checked key operations derived from a batch.
///
/// After reconciliation no entity key is in both `add_entities` and
/// `remove_entities`, and no unique key is in both `add_unique` and
/// `remove_unique`; such pairs live in the `update_*` maps instead.
#[derive(Debug, Clone)]
pub struct ChangeSet<E> {
    pub add_entities: BTreeMap<Key, E>,
    /// Entity key -> (old, new).
    pub update_entities: BTreeMap<Key, (E, E)>,
    pub remove_entities: BTreeMap<Key, E>,
    /// (membership key, entity key) pairs.
    pub add_membership: BTreeSet<(Key, Key)>,
    pub remove_membership: BTreeSet<(Key, Key)>,
    /// Unique key -> entity key.
    pub add_unique: BTreeMap<Key, Key>,
    /// Unique key -> (old entity key, new entity key).
    pub update_unique: BTreeMap<Key, (Key, Key)>,
    pub remove_unique: BTreeMap<Key, Key>,
    pub collection_additions: BTreeSet<Key>,
    pub collection_removals: BTreeSet<Key>,
    /// Entity key -> condition its stored value must satisfy.
    pub conditions: BTreeMap<Key, Predicate>,
    /// Every key the change-set touches.
    pub affected_keys: BTreeSet<Key>,
}

impl<E> Default for ChangeSet<E> {
    fn default() -> Self {
        Self {
            add_entities: BTreeMap::new(),
            update_entities: BTreeMap::new(),
            remove_entities: BTreeMap::new(),
            add_membership: BTreeSet::new(),
            remove_membership: BTreeSet::new(),
            add_unique: BTreeMap::new(),
            update_unique: BTreeMap::new(),
            remove_unique: BTreeMap::new(),
            collection_additions: BTreeSet::new(),
            collection_removals: BTreeSet::new(),
            conditions: BTreeMap::new(),
            affected_keys: BTreeSet::new(),
        }
    }
}

impl<E> ChangeSet<E> {
    pub fn is_empty(&self) -> bool {
        self.add_entities.is_empty()
            && self.update_entities.is_empty()
            && self.remove_entities.is_empty()
            && self.add_membership.is_empty()
            && self.remove_membership.is_empty()
            && self.add_unique.is_empty()
            && self.update_unique.is_empty()
            && self.remove_unique.is_empty()
            && self.collection_additions.is_empty()
            && self.collection_removals.is_empty()
    }

    /// Membership keys whose stored sets must be rewritten.
    pub fn membership_keys(&self) -> BTreeSet<Key> {
        self.add_membership
            .iter()
            .chain(self.remove_membership.iter())
            .map(|(m, _)| m.clone())
            .collect()
    }

    /// Every key that must be locked to apply this change-set.
    pub fn lock_keys(&self) -> BTreeSet<Key> {
        let mut keys = self.affected_keys.clone();
        keys.extend(self.add_entities.keys().cloned());
        keys.extend(self.update_entities.keys().cloned());
        keys.extend(self.remove_entities.keys().cloned());
        keys.extend(self.membership_keys());
        keys.extend(self.add_unique.keys().cloned());
        keys.extend(self.update_unique.keys().cloned());
        keys.extend(self.remove_unique.keys().cloned());
        keys.extend(self.collection_additions.iter().cloned());
        keys.extend(self.collection_removals.iter().cloned());
        keys.extend(self.conditions.keys().cloned());
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_builder() {
        let batch: OperationBatch<u8> = OperationBatch::new()
            .add(EntityOp::new(1))
            .remove(EntityOp::new(2))
            .init_collection(Key::from_parts(["tag", "x"]));
        assert_eq!(batch.additions.len(), 1);
        assert_eq!(batch.removals.len(), 1);
        assert_eq!(batch.collection_additions.len(), 1);
        assert!(!batch.is_empty());
        assert!(OperationBatch::<u8>::new().is_empty());
    }

    #[test]
    fn test_lock_keys_cover_every_touched_key() {
        let mut cs: ChangeSet<u8> = ChangeSet::default();
        let e = Key::from_parts(["e", "1"]);
        let m = Key::from_parts(["tag", "x"]);
        let u = Key::from_parts(["slug", "s"]);
        cs.add_entities.insert(e.clone(), 1);
        cs.add_membership.insert((m.clone(), e.clone()));
        cs.remove_unique.insert(u.clone(), e.clone());

        let keys = cs.lock_keys();
        assert!(keys.contains(&e));
        assert!(keys.contains(&m));
        assert!(keys.contains(&u));
    }
}
