//! Key codec
//!
//! Every key in the system (entity, unique, membership, lock, cache) is an
//! ordered tuple of canonical strings. Two keys are the same key iff their
//! component tuples are equal, and that is also the criterion for map and
//! set membership everywhere else in the workspace.
//!
//! # Canonical Components
//!
//! ```text
//! null       -> "\0"                      (reserved sentinel)
//! text       -> the text, with a leading "\0" doubled
//! bool       -> "true" / "false"
//! int/float  -> decimal form ("2" for both 2 and 2.0)
//! timestamp  -> RFC 3339, microseconds, "Z" suffix
//! list, ref  -> KeyError::InvalidComponent
//! ```
//!
//! # Encoded Form
//!
//! Components are joined with `:`; `:` and `\` inside a component are
//! escaped with `\`, so encoding is reversible.

use crate::entity::MappedEntity;
use crate::error::{KeyError, TesseraResult};
use crate::value::Value;
use crate::Timestamp;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between encoded components.
pub const SEPARATOR: char = ':';

/// Canonical form of an absent/null component.
pub const NULL_SENTINEL: &str = "\u{0}";

const ESCAPE: char = '\\';

/// Canonical text form of a timestamp.
pub fn canonical_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Normalize a single key component.
///
/// `field` only labels the error when the value is not key-able.
pub fn normalize(value: &Value, field: &str) -> Result<String, KeyError> {
    match value {
        Value::Null => Ok(NULL_SENTINEL.to_string()),
        Value::Text(s) => {
            if s.starts_with(NULL_SENTINEL) {
                Ok(format!("{}{}", NULL_SENTINEL, s))
            } else {
                Ok(s.clone())
            }
        }
        Value::Bool(b) => Ok(b.to_string()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Float(f) => Ok(f.to_string()),
        Value::Timestamp(ts) => Ok(canonical_timestamp(ts)),
        Value::List(_) | Value::Ref(_) => Err(KeyError::InvalidComponent {
            field: field.to_string(),
            kind: value.kind(),
        }),
    }
}

/// An ordered tuple of canonical components.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Vec<String>);

impl Key {
    /// Build a key from components that are already canonical.
    pub fn from_parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Key(parts.into_iter().map(Into::into).collect())
    }

    /// Build a key by normalizing each value.
    pub fn from_values(values: &[Value]) -> Result<Self, KeyError> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| normalize(v, &format!("#{}", i)))
            .collect::<Result<Vec<_>, _>>()
            .map(Key)
    }

    pub fn components(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Return a copy of this key with `namespace` prepended as its first component.
    pub fn namespaced(&self, namespace: &str) -> Key {
        let mut parts = Vec::with_capacity(self.0.len() + 1);
        parts.push(namespace.to_string());
        parts.extend(self.0.iter().cloned());
        Key(parts)
    }

    /// Return a copy of this key with one more component appended.
    pub fn with(&self, component: impl Into<String>) -> Key {
        let mut parts = self.0.clone();
        parts.push(component.into());
        Key(parts)
    }

    /// Whether the first component equals `namespace`.
    pub fn in_namespace(&self, namespace: &str) -> bool {
        self.0.first().map(|c| c == namespace).unwrap_or(false)
    }

    /// Encode to the flat string form used as a store address.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(SEPARATOR);
            }
            for c in part.chars() {
                if c == SEPARATOR || c == ESCAPE {
                    out.push(ESCAPE);
                }
                out.push(c);
            }
        }
        out
    }

    /// Decode the flat string form produced by [`Key::encode`].
    pub fn decode(encoded: &str) -> Result<Key, KeyError> {
        let mut parts = Vec::new();
        let mut current = String::new();
        let mut chars = encoded.chars();
        while let Some(c) = chars.next() {
            if c == ESCAPE {
                match chars.next() {
                    Some(next) => current.push(next),
                    None => {
                        return Err(KeyError::Malformed {
                            encoded: encoded.to_string(),
                        })
                    }
                }
            } else if c == SEPARATOR {
                parts.push(std::mem::take(&mut current));
            } else {
                current.push(c);
            }
        }
        parts.push(current);
        Ok(Key(parts))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl<S: Into<String>> FromIterator<S> for Key {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Key::from_parts(iter)
    }
}

// ============================================================================
// KEY TEMPLATES
// ============================================================================

/// One part of a key template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPart {
    /// A literal component, usually a model or index name.
    Const(String),
    /// A scalar field of the entity.
    Field(String),
    /// A collection field; the template fans out to one key per element.
    Each(String),
}

/// Declarative recipe for deriving keys from an entity.
///
/// A model declares one template for its primary key and any number for its
/// unique and membership keys. Templates are detached from entity state:
/// [`KeyTemplate::dissociate`] snapshots either the current or the last
/// persisted field values into plain [`Key`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyTemplate {
    name: String,
    parts: Vec<KeyPart>,
}

impl KeyTemplate {
    pub fn new(name: impl Into<String>, parts: Vec<KeyPart>) -> Self {
        Self {
            name: name.into(),
            parts,
        }
    }

    /// Template `(name, field_1, field_2, ...)`, the common shape.
    pub fn fields(name: impl Into<String>, fields: &[&str]) -> Self {
        let name = name.into();
        let mut parts = vec![KeyPart::Const(name.clone())];
        parts.extend(fields.iter().map(|f| KeyPart::Field((*f).to_string())));
        Self { name, parts }
    }

    /// Template `(name, element)` fanned out over a collection field.
    pub fn each(name: impl Into<String>, field: &str) -> Self {
        let name = name.into();
        let parts = vec![
            KeyPart::Const(name.clone()),
            KeyPart::Each(field.to_string()),
        ];
        Self { name, parts }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    /// Field names this template reads.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            KeyPart::Field(f) | KeyPart::Each(f) => Some(f.as_str()),
            KeyPart::Const(_) => None,
        })
    }

    /// Evaluate the template against an entity.
    ///
    /// With `use_persisted`, dirty fields contribute the value they had at
    /// the last successful commit. An `Each` part over an empty collection
    /// yields no keys.
    pub fn dissociate<E>(&self, entity: &E, use_persisted: bool) -> TesseraResult<Vec<Key>>
    where
        E: MappedEntity + ?Sized,
    {
        if self.parts.is_empty() {
            return Err(KeyError::EmptyTemplate {
                template: self.name.clone(),
            }
            .into());
        }

        let mut keys: Vec<Vec<String>> = vec![Vec::with_capacity(self.parts.len())];
        for part in &self.parts {
            let choices = match part {
                KeyPart::Const(c) => vec![c.clone()],
                KeyPart::Field(f) => {
                    let value = read_field(entity, f, use_persisted)?;
                    vec![normalize(&value, f)?]
                }
                KeyPart::Each(f) => match read_field(entity, f, use_persisted)? {
                    Value::List(items) => items
                        .iter()
                        .map(|item| normalize(item, f))
                        .collect::<Result<Vec<_>, _>>()?,
                    Value::Null => Vec::new(),
                    scalar => vec![normalize(&scalar, f)?],
                },
            };

            let mut next = Vec::with_capacity(keys.len() * choices.len());
            for prefix in &keys {
                for choice in &choices {
                    let mut k = prefix.clone();
                    k.push(choice.clone());
                    next.push(k);
                }
            }
            keys = next;
        }

        let mut out: Vec<Key> = keys.into_iter().map(Key).collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    /// Evaluate a template that must yield exactly one key (primary keys).
    pub fn dissociate_one<E>(&self, entity: &E, use_persisted: bool) -> TesseraResult<Key>
    where
        E: MappedEntity + ?Sized,
    {
        let mut keys = self.dissociate(entity, use_persisted)?;
        if keys.len() != 1 {
            return Err(KeyError::NotSingular {
                template: self.name.clone(),
                count: keys.len(),
            }
            .into());
        }
        Ok(keys.remove(0))
    }
}

fn read_field<E>(entity: &E, field: &str, use_persisted: bool) -> Result<Value, KeyError>
where
    E: MappedEntity + ?Sized,
{
    let value = if use_persisted {
        entity.persisted_attribute(field)
    } else {
        entity.attribute(field)
    };
    value.ok_or_else(|| KeyError::MissingField {
        field: field.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_null_sentinel_is_distinct_from_text() {
        let null = normalize(&Value::Null, "f").unwrap();
        let text = normalize(&Value::Text(NULL_SENTINEL.to_string()), "f").unwrap();
        let empty = normalize(&Value::Text(String::new()), "f").unwrap();
        assert_ne!(null, text);
        assert_ne!(null, empty);
    }

    #[test]
    fn test_timestamp_normalizes_to_micros_utc() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        assert_eq!(
            normalize(&Value::Timestamp(ts), "at").unwrap(),
            "2024-05-06T07:08:09.000000Z"
        );
    }

    #[test]
    fn test_non_scalar_component_is_rejected() {
        let err = normalize(&Value::List(vec![]), "tags").unwrap_err();
        assert!(matches!(err, KeyError::InvalidComponent { kind: "list", .. }));
        let err = normalize(&Value::Ref(Key::from_parts(["a"])), "owner").unwrap_err();
        assert!(matches!(err, KeyError::InvalidComponent { kind: "reference", .. }));
    }

    #[test]
    fn test_keys_from_equal_values_are_equal() {
        let a = Key::from_values(&[Value::from("tag"), Value::Int(2)]).unwrap();
        let b = Key::from_values(&[Value::from("tag"), Value::Float(2.0)]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_encode_escapes_separator() {
        let key = Key::from_parts(["a:b", "c\\d", ""]);
        let encoded = key.encode();
        assert_eq!(encoded, "a\\:b:c\\\\d:");
        assert_eq!(Key::decode(&encoded).unwrap(), key);
    }

    #[test]
    fn test_decode_rejects_dangling_escape() {
        assert!(Key::decode("abc\\").is_err());
    }

    #[test]
    fn test_namespaced_prepends() {
        let key = Key::from_parts(["tag", "x"]).namespaced("integrity");
        assert_eq!(key.components(), &["integrity", "tag", "x"]);
        assert!(key.in_namespace("integrity"));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Distinct texts never normalize to the same component.
        #[test]
        fn prop_text_normalization_is_injective(a in ".*", b in ".*") {
            let na = normalize(&Value::Text(a.clone()), "f").unwrap();
            let nb = normalize(&Value::Text(b.clone()), "f").unwrap();
            prop_assert_eq!(a == b, na == nb);
        }

        /// Null never collides with any text.
        #[test]
        fn prop_null_never_collides(s in ".*") {
            let null = normalize(&Value::Null, "f").unwrap();
            let text = normalize(&Value::Text(s), "f").unwrap();
            prop_assert_ne!(null, text);
        }

        /// Encoding is reversible for arbitrary component text.
        #[test]
        fn prop_encode_decode(parts in proptest::collection::vec(".*", 1..5)) {
            let key = Key::from_parts(parts);
            prop_assert_eq!(Key::decode(&key.encode()).unwrap(), key);
        }
    }
}
