//! Index reconciler
//!
//! Turns an [`OperationBatch`] into a [`ChangeSet`]:
//!
//! ```text
//! removals, updates (persisted keys)  ─┐
//!                                       ├─> stage ─> cancel/collapse ─> ChangeSet
//! additions, updates (current keys)   ─┘
//! ```
//!
//! A membership pair staged on both sides is a no-op and cancels. A unique
//! key or entity key staged on both sides collapses into an update. Two
//! different entity keys claiming one unique key is a contradiction and
//! fails the whole batch with `Corruption`.

use crate::batch::{ChangeSet, EntityOp, OperationBatch};
use crate::entity::MappedEntity;
use crate::error::{QueryError, TesseraError, TesseraResult};
use crate::key::Key;

/// Reconcile a batch into a normalized change-set.
pub fn reconcile<E: MappedEntity>(batch: OperationBatch<E>) -> TesseraResult<ChangeSet<E>> {
    let OperationBatch {
        additions,
        updates,
        removals,
        collection_additions,
        collection_removals,
    } = batch;

    let mut cs = ChangeSet::default();

    for op in &removals {
        stage_removal(&mut cs, op)?;
    }
    for op in &updates {
        stage_removal(&mut cs, op)?;
    }
    for op in &additions {
        // nothing is stored yet for a condition to be checked against
        if op.condition.is_some() {
            return Err(QueryError::MalformedPredicate {
                reason: format!(
                    "condition on addition of {}; conditions apply to updates and removals",
                    op.entity.entity_key(false)?
                ),
            }
            .into());
        }
        stage_addition(&mut cs, op)?;
    }
    for op in &updates {
        stage_addition(&mut cs, op)?;
    }

    // membership pairs on both sides cancel
    let both: Vec<(Key, Key)> = cs
        .add_membership
        .intersection(&cs.remove_membership)
        .cloned()
        .collect();
    for pair in &both {
        cs.add_membership.remove(pair);
        cs.remove_membership.remove(pair);
    }

    // unique keys on both sides collapse into updates
    let collapsed: Vec<Key> = cs
        .add_unique
        .keys()
        .filter(|k| cs.remove_unique.contains_key(*k))
        .cloned()
        .collect();
    for unique in collapsed {
        if let (Some(new), Some(old)) = (
            cs.add_unique.remove(&unique),
            cs.remove_unique.remove(&unique),
        ) {
            cs.update_unique.insert(unique, (old, new));
        }
    }

    // same for entity keys
    let collapsed: Vec<Key> = cs
        .add_entities
        .keys()
        .filter(|k| cs.remove_entities.contains_key(*k))
        .cloned()
        .collect();
    for key in collapsed {
        if let (Some(new), Some(old)) = (
            cs.add_entities.remove(&key),
            cs.remove_entities.remove(&key),
        ) {
            cs.update_entities.insert(key, (old, new));
        }
    }

    cs.collection_additions = collection_additions.into_iter().collect();
    cs.collection_removals = collection_removals
        .into_iter()
        .filter(|k| !cs.collection_additions.contains(k))
        .collect();
    cs.affected_keys
        .extend(cs.collection_additions.iter().cloned());
    cs.affected_keys
        .extend(cs.collection_removals.iter().cloned());

    tracing::debug!(
        model = E::model(),
        adds = cs.add_entities.len(),
        updates = cs.update_entities.len(),
        removes = cs.remove_entities.len(),
        membership_adds = cs.add_membership.len(),
        membership_removes = cs.remove_membership.len(),
        affected = cs.affected_keys.len(),
        "reconciled batch"
    );

    Ok(cs)
}

fn stage_removal<E: MappedEntity>(cs: &mut ChangeSet<E>, op: &EntityOp<E>) -> TesseraResult<()> {
    let old_key = op.entity.entity_key(true)?;

    let mut uniques = op.entity.unique_keys(true)?;
    uniques.extend(op.remove_unique_keys.iter().cloned());
    let mut members = op.entity.membership_keys(true)?;
    members.extend(op.remove_keys.iter().cloned());

    cs.affected_keys.insert(old_key.clone());
    for unique in uniques {
        cs.affected_keys.insert(unique.clone());
        cs.remove_unique.insert(unique, old_key.clone());
    }
    for member in members {
        cs.affected_keys.insert(member.clone());
        cs.remove_membership.insert((member, old_key.clone()));
    }
    if let Some(condition) = &op.condition {
        cs.conditions.insert(old_key.clone(), condition.clone());
    }
    cs.remove_entities.insert(old_key, op.entity.clone());
    Ok(())
}

fn stage_addition<E: MappedEntity>(cs: &mut ChangeSet<E>, op: &EntityOp<E>) -> TesseraResult<()> {
    let new_key = op.entity.entity_key(false)?;

    let mut uniques = op.entity.unique_keys(false)?;
    uniques.extend(op.add_unique_keys.iter().cloned());
    let mut members = op.entity.membership_keys(false)?;
    members.extend(op.add_keys.iter().cloned());

    cs.affected_keys.insert(new_key.clone());
    for unique in uniques {
        if let Some(staged) = cs.add_unique.get(&unique) {
            if *staged != new_key {
                return Err(TesseraError::corruption(format!(
                    "unique key {} assigned to both {} and {} in one batch",
                    unique, staged, new_key
                )));
            }
        }
        cs.affected_keys.insert(unique.clone());
        cs.add_unique.insert(unique, new_key.clone());
    }
    for member in members {
        cs.affected_keys.insert(member.clone());
        cs.add_membership.insert((member, new_key.clone()));
    }
    cs.add_entities.insert(new_key, op.entity.clone());
    Ok(())
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::entity::test_entity::Doc;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// No entity key ends up in both add_entities and remove_entities.
        #[test]
        fn prop_no_key_in_both_add_and_remove(
            adds in proptest::collection::vec(0u8..6, 0..6),
            removes in proptest::collection::vec(0u8..6, 0..6),
        ) {
            let mut batch = OperationBatch::new();
            for id in &adds {
                batch = batch.add(EntityOp::new(Doc::new(&id.to_string(), "a")));
            }
            for id in &removes {
                batch = batch.remove(EntityOp::new(Doc::new(&id.to_string(), "a").persisted()));
            }
            let cs = reconcile(batch).unwrap();

            for key in cs.add_entities.keys() {
                prop_assert!(!cs.remove_entities.contains_key(key));
            }
            for key in cs.add_unique.keys() {
                prop_assert!(!cs.remove_unique.contains_key(key));
            }
            for pair in &cs.add_membership {
                prop_assert!(!cs.remove_membership.contains(pair));
            }
            for id in adds.iter().filter(|id| removes.contains(id)) {
                let key = Key::from_parts(["doc".to_string(), id.to_string()]);
                prop_assert!(cs.update_entities.contains_key(&key));
            }
        }
    }
}
