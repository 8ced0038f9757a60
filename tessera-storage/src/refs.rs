//! Prefetching of entities reachable through predicate reference paths.
//!
//! Predicates evaluate synchronously against a `ReferenceResolver`, so every
//! entity a multi-segment path may dereference is loaded up front. Targets
//! missing from the store are left out; the evaluator then reports them as
//! `NotFound`.
//!
//! Targets are decoded as the root entity type, so a path may only cross
//! references within one model. A reference into another model's namespace
//! is reported as `Unsupported`.

use std::collections::HashMap;

use tessera_core::{Key, MappedEntity, Predicate, TesseraError, TesseraResult, Value};

use crate::codec::EntitySerializer;
use crate::kv::KvStore;

/// Load every entity `predicate` can reach from `roots`.
pub async fn load_references<S, Z, E>(
    store: &S,
    serializer: &Z,
    roots: &[E],
    predicate: &Predicate,
) -> TesseraResult<HashMap<Key, E>>
where
    S: KvStore + ?Sized,
    Z: EntitySerializer,
    E: MappedEntity,
{
    let namespace = E::primary_key_template();
    let mut resolved: HashMap<Key, E> = HashMap::new();
    for path in predicate.paths() {
        let Some((first, rest)) = path.segments().split_first() else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        let mut frontier: Vec<Value> = roots.iter().filter_map(|r| r.attribute(first)).collect();
        for segment in rest {
            let mut next = Vec::new();
            for key in referenced_keys(&frontier) {
                if !key.in_namespace(namespace.name()) {
                    return Err(TesseraError::unsupported(
                        "reference resolver",
                        format!("reference {} leaves model {}", key, E::model()),
                    ));
                }
                if !resolved.contains_key(&key) {
                    if let Some(bytes) = store.get(&key.encode()).await? {
                        let entity: E = serializer.deserialize(&key, &bytes)?;
                        resolved.insert(key.clone(), entity);
                    }
                }
                if let Some(value) = resolved.get(&key).and_then(|e| e.attribute(segment)) {
                    next.push(value);
                }
            }
            frontier = next;
        }
    }
    Ok(resolved)
}

/// Whether evaluating `predicate` may need to follow references.
pub fn needs_references(predicate: &Predicate) -> bool {
    predicate.paths().iter().any(|p| p.segments().len() > 1)
}

/// Foreign keys held by `values`, looking inside lists.
fn referenced_keys(values: &[Value]) -> Vec<Key> {
    let mut out = Vec::new();
    for value in values {
        match value {
            Value::Ref(key) => out.push(key.clone()),
            Value::List(items) => out.extend(referenced_keys(items)),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonSerializer;
    use crate::memory::InMemoryKvStore;
    use serde::{Deserialize, Serialize};
    use tessera_core::{Attributes, ChangeTracker, KeyTemplate, Operand};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Node {
        id: String,
        name: String,
        owner: Option<Key>,
        #[serde(skip)]
        tracker: ChangeTracker,
    }

    fn node(id: &str, name: &str, owner: Option<Key>) -> Node {
        Node {
            id: id.to_string(),
            name: name.to_string(),
            owner,
            tracker: ChangeTracker::new(),
        }
    }

    impl Attributes for Node {
        fn attribute(&self, name: &str) -> Option<Value> {
            match name {
                "id" => Some(Value::from(&self.id)),
                "name" => Some(Value::from(&self.name)),
                "owner" => Some(Value::from(self.owner.clone())),
                _ => None,
            }
        }
    }

    impl MappedEntity for Node {
        fn model() -> &'static str {
            "node"
        }
        fn primary_key_template() -> KeyTemplate {
            KeyTemplate::fields("node", &["id"])
        }
        fn tracker(&self) -> &ChangeTracker {
            &self.tracker
        }
        fn tracker_mut(&mut self) -> &mut ChangeTracker {
            &mut self.tracker
        }
        fn set_revision(&mut self, _token: String) {}
    }

    fn owner_named(name: &str) -> Predicate {
        Predicate::eq(Operand::path(&["owner", "name"]), Operand::literal(name))
    }

    #[tokio::test]
    async fn test_loads_targets_within_model() {
        let store = InMemoryKvStore::new();
        let parent = node("p", "root", None);
        let parent_key = Key::from_parts(["node", "p"]);
        store
            .set(
                &parent_key.encode(),
                JsonSerializer.serialize(&parent_key, &parent).unwrap(),
            )
            .await
            .unwrap();

        let roots = vec![node("c", "leaf", Some(parent_key.clone()))];
        let resolved = load_references(&store, &JsonSerializer, &roots, &owner_named("root"))
            .await
            .unwrap();
        assert_eq!(resolved[&parent_key].name, "root");
    }

    #[tokio::test]
    async fn test_reference_into_other_model_is_unsupported() {
        let store = InMemoryKvStore::new();
        let user = Key::from_parts(["user", "1"]);
        store.set(&user.encode(), b"{\"login\":\"x\"}".to_vec()).await.unwrap();

        let roots = vec![node("c", "leaf", Some(user))];
        let err = load_references(&store, &JsonSerializer, &roots, &owner_named("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::Unsupported { .. }));
    }

    #[test]
    fn test_referenced_keys_flattens_lists() {
        let a = Key::from_parts(["doc", "a"]);
        let b = Key::from_parts(["doc", "b"]);
        let values = vec![
            Value::Ref(a.clone()),
            Value::List(vec![Value::Ref(b.clone()), Value::Int(3)]),
            Value::Null,
        ];
        assert_eq!(referenced_keys(&values), vec![a, b]);
    }

    #[test]
    fn test_needs_references() {
        assert!(!needs_references(&Predicate::field_eq("name", "x")));
        let deep = Predicate::eq(Operand::path(&["owner", "name"]), Operand::literal("x"));
        assert!(needs_references(&deep));
    }
}
