//! Predicate trees and their evaluation against entities
//!
//! A predicate is a closed tree of comparison and boolean nodes. Comparison
//! operands are literals, attribute paths, or quantified attribute paths.
//! Paths are walked through the [`Attributes`] interface, following foreign
//! references through a [`ReferenceResolver`].
//!
//! # JSON Form
//!
//! ```text
//! {"eq": [["name"], "x"]}                   name == "x"
//! {"eq": [{"any": ["tags"]}, "x"]}          some tag == "x"
//! {"lt": [1, ["rank"], 10]}                 1 < rank < 10
//! {"and": [p1, p2]}  {"or": [...]}  {"not": [...]}  {"nor": [...]}
//! {"literal": ["a", "b"]}                   an array literal, not a path
//! ```

use crate::entity::{Attributes, NoReferences, ReferenceResolver};
use crate::error::{QueryError, TesseraError, TesseraResult};
use crate::value::Value;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Ge,
    Le,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Lt => "lt",
            CompareOp::Gt => "gt",
            CompareOp::Ge => "ge",
            CompareOp::Le => "le",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(CompareOp::Eq),
            "ne" => Some(CompareOp::Ne),
            "lt" => Some(CompareOp::Lt),
            "gt" => Some(CompareOp::Gt),
            "ge" => Some(CompareOp::Ge),
            "le" => Some(CompareOp::Le),
            _ => None,
        }
    }

    /// Apply to a pair of plain values. Incomparable pairs only satisfy `ne`.
    pub fn apply(&self, left: &Value, right: &Value) -> bool {
        let ord = left.compare(right);
        match self {
            CompareOp::Eq => ord == Some(Ordering::Equal),
            CompareOp::Ne => ord != Some(Ordering::Equal),
            CompareOp::Lt => ord == Some(Ordering::Less),
            CompareOp::Gt => ord == Some(Ordering::Greater),
            CompareOp::Ge => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
            CompareOp::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
        }
    }
}

/// Quantifier over the elements of a collection attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantifier {
    Any,
    All,
    None,
}

impl Quantifier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quantifier::Any => "any",
            Quantifier::All => "all",
            Quantifier::None => "none",
        }
    }
}

/// Ordered sequence of field names, walked from the root entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributePath(Vec<String>);

impl AttributePath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AttributePath(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

/// One side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Path(AttributePath),
    Quantified(Quantifier, AttributePath),
}

impl Operand {
    pub fn literal(value: impl Into<Value>) -> Self {
        Operand::Literal(value.into())
    }

    pub fn path(segments: &[&str]) -> Self {
        Operand::Path(AttributePath::new(segments.iter().copied()))
    }

    pub fn any(segments: &[&str]) -> Self {
        Operand::Quantified(Quantifier::Any, AttributePath::new(segments.iter().copied()))
    }

    pub fn all(segments: &[&str]) -> Self {
        Operand::Quantified(Quantifier::All, AttributePath::new(segments.iter().copied()))
    }

    pub fn none(segments: &[&str]) -> Self {
        Operand::Quantified(Quantifier::None, AttributePath::new(segments.iter().copied()))
    }

    fn attribute_path(&self) -> Option<&AttributePath> {
        match self {
            Operand::Literal(_) => None,
            Operand::Path(p) | Operand::Quantified(_, p) => Some(p),
        }
    }
}

/// A predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare { op: CompareOp, operands: Vec<Operand> },
    /// All sub-predicates hold.
    And(Vec<Predicate>),
    /// At least one sub-predicate holds.
    Or(Vec<Predicate>),
    /// No sub-predicate holds.
    Not(Vec<Predicate>),
    /// No sub-predicate holds; spelled separately to keep the JSON form.
    Nor(Vec<Predicate>),
}

/// An operand after path resolution.
enum Resolved {
    Single(Value),
    Quantified(Quantifier, Vec<Value>),
}

impl Predicate {
    pub fn compare(op: CompareOp, operands: Vec<Operand>) -> Self {
        Predicate::Compare { op, operands }
    }

    pub fn eq(left: Operand, right: Operand) -> Self {
        Self::compare(CompareOp::Eq, vec![left, right])
    }

    pub fn ne(left: Operand, right: Operand) -> Self {
        Self::compare(CompareOp::Ne, vec![left, right])
    }

    pub fn lt(left: Operand, right: Operand) -> Self {
        Self::compare(CompareOp::Lt, vec![left, right])
    }

    pub fn gt(left: Operand, right: Operand) -> Self {
        Self::compare(CompareOp::Gt, vec![left, right])
    }

    /// Shorthand for `field == value`.
    pub fn field_eq(field: &str, value: impl Into<Value>) -> Self {
        Self::eq(Operand::path(&[field]), Operand::literal(value))
    }

    /// Evaluate without following references.
    pub fn matches(&self, entity: &dyn Attributes) -> TesseraResult<bool> {
        self.evaluate(entity, &NoReferences)
    }

    /// Evaluate against `entity`, dereferencing foreign keys through `resolver`.
    pub fn evaluate(
        &self,
        entity: &dyn Attributes,
        resolver: &dyn ReferenceResolver,
    ) -> TesseraResult<bool> {
        match self {
            Predicate::Compare { op, operands } => {
                evaluate_comparison(*op, operands, entity, resolver)
            }
            Predicate::And(children) => {
                for child in children {
                    if !child.evaluate(entity, resolver)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Or(children) => {
                for child in children {
                    if child.evaluate(entity, resolver)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not(children) | Predicate::Nor(children) => {
                for child in children {
                    if child.evaluate(entity, resolver)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Every attribute path referenced anywhere in the tree.
    pub fn paths(&self) -> Vec<&AttributePath> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a AttributePath>) {
        match self {
            Predicate::Compare { operands, .. } => {
                out.extend(operands.iter().filter_map(Operand::attribute_path));
            }
            Predicate::And(c) | Predicate::Or(c) | Predicate::Not(c) | Predicate::Nor(c) => {
                for child in c {
                    child.collect_paths(out);
                }
            }
        }
    }

    /// Parse the JSON form.
    pub fn from_json(json: &serde_json::Value) -> TesseraResult<Predicate> {
        let obj = json.as_object().ok_or_else(|| QueryError::MalformedPredicate {
            reason: format!("expected an object, got {}", json),
        })?;
        if obj.len() != 1 {
            return Err(QueryError::MalformedPredicate {
                reason: format!(
                    "expected exactly one operator, got {:?}",
                    obj.keys().collect::<Vec<_>>()
                ),
            }
            .into());
        }
        let (name, body) = obj.iter().next().ok_or_else(|| QueryError::MalformedPredicate {
            reason: "empty predicate".to_string(),
        })?;

        if let Some(op) = CompareOp::from_str_opt(name) {
            let items = body.as_array().ok_or_else(|| QueryError::MalformedPredicate {
                reason: format!("'{}' expects an operand list", name),
            })?;
            if items.len() < 2 {
                return Err(QueryError::OperandArity {
                    op: name.clone(),
                    got: items.len(),
                }
                .into());
            }
            let operands = items
                .iter()
                .map(parse_operand)
                .collect::<TesseraResult<Vec<_>>>()?;
            return Ok(Predicate::Compare { op, operands });
        }

        let children = match body {
            serde_json::Value::Array(items) => items
                .iter()
                .map(Predicate::from_json)
                .collect::<TesseraResult<Vec<_>>>()?,
            serde_json::Value::Object(_) => vec![Predicate::from_json(body)?],
            _ => {
                return Err(QueryError::MalformedPredicate {
                    reason: format!("'{}' expects a predicate list", name),
                }
                .into())
            }
        };
        match name.as_str() {
            "and" => Ok(Predicate::And(children)),
            "or" => Ok(Predicate::Or(children)),
            "not" => Ok(Predicate::Not(children)),
            "nor" => Ok(Predicate::Nor(children)),
            other => Err(QueryError::MalformedPredicate {
                reason: format!("unknown operator '{}'", other),
            }
            .into()),
        }
    }

    /// Canonical JSON form.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Predicate::Compare { op, operands } => {
                let items: Vec<_> = operands.iter().map(operand_to_json).collect();
                json!({ op.as_str(): items })
            }
            Predicate::And(c) => json!({ "and": children_to_json(c) }),
            Predicate::Or(c) => json!({ "or": children_to_json(c) }),
            Predicate::Not(c) => json!({ "not": children_to_json(c) }),
            Predicate::Nor(c) => json!({ "nor": children_to_json(c) }),
        }
    }

    /// Stable short digest of the canonical form, used in cache keys.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_json().to_string().as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

fn evaluate_comparison(
    op: CompareOp,
    operands: &[Operand],
    entity: &dyn Attributes,
    resolver: &dyn ReferenceResolver,
) -> TesseraResult<bool> {
    if operands.len() < 2 {
        return Err(QueryError::OperandArity {
            op: op.as_str().to_string(),
            got: operands.len(),
        }
        .into());
    }

    let mut left = resolve_operand(&operands[0], entity, resolver)?;
    for operand in &operands[1..] {
        let right = resolve_operand(operand, entity, resolver)?;
        if !compare_resolved(op, &left, &right) {
            return Ok(false);
        }
        left = right;
    }
    Ok(true)
}

fn compare_resolved(op: CompareOp, left: &Resolved, right: &Resolved) -> bool {
    match (left, right) {
        (Resolved::Quantified(q, items), _) => quantify(*q, items, |item| {
            compare_resolved(op, &Resolved::Single(item.clone()), right)
        }),
        (Resolved::Single(_), Resolved::Quantified(q, items)) => quantify(*q, items, |item| {
            compare_resolved(op, left, &Resolved::Single(item.clone()))
        }),
        (Resolved::Single(l), Resolved::Single(r)) => op.apply(l, r),
    }
}

fn quantify<F>(q: Quantifier, items: &[Value], mut test: F) -> bool
where
    F: FnMut(&Value) -> bool,
{
    match q {
        Quantifier::Any => items.iter().any(&mut test),
        Quantifier::All => items.iter().all(&mut test),
        Quantifier::None => !items.iter().any(&mut test),
    }
}

fn resolve_operand(
    operand: &Operand,
    entity: &dyn Attributes,
    resolver: &dyn ReferenceResolver,
) -> TesseraResult<Resolved> {
    match operand {
        Operand::Literal(v) => Ok(Resolved::Single(v.clone())),
        Operand::Path(path) => Ok(Resolved::Single(resolve_path(path, entity, resolver)?)),
        Operand::Quantified(q, path) => {
            let items = match resolve_path(path, entity, resolver)? {
                Value::List(items) => items,
                Value::Null => Vec::new(),
                scalar => vec![scalar],
            };
            Ok(Resolved::Quantified(*q, items))
        }
    }
}

/// Walk `path` from `root`.
///
/// Intermediate references are dereferenced; an intermediate collection maps
/// the rest of the path over its elements and flattens the result. A null
/// along the way resolves to null.
pub fn resolve_path(
    path: &AttributePath,
    root: &dyn Attributes,
    resolver: &dyn ReferenceResolver,
) -> TesseraResult<Value> {
    let segments = path.segments();
    let first = segments.first().ok_or_else(|| QueryError::UnresolvablePath {
        path: path.to_string(),
        reason: "empty path".to_string(),
    })?;
    let current = root
        .attribute(first)
        .ok_or_else(|| unresolvable(path, format!("no attribute '{}'", first)))?;
    walk(path, current, &segments[1..], resolver)
}

fn walk(
    path: &AttributePath,
    current: Value,
    rest: &[String],
    resolver: &dyn ReferenceResolver,
) -> TesseraResult<Value> {
    let Some((segment, tail)) = rest.split_first() else {
        return Ok(current);
    };
    match current {
        Value::Null => Ok(Value::Null),
        Value::Ref(key) => {
            let target = resolver
                .resolve(&key)
                .ok_or_else(|| TesseraError::not_found(&key))?;
            let next = target
                .attribute(segment)
                .ok_or_else(|| unresolvable(path, format!("no attribute '{}'", segment)))?;
            walk(path, next, tail, resolver)
        }
        Value::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match walk(path, item, rest, resolver)? {
                    Value::List(inner) => out.extend(inner),
                    v => out.push(v),
                }
            }
            Ok(Value::List(out))
        }
        other => Err(unresolvable(
            path,
            format!("cannot read '{}' from a {} value", segment, other.kind()),
        )),
    }
}

fn unresolvable(path: &AttributePath, reason: String) -> TesseraError {
    QueryError::UnresolvablePath {
        path: path.to_string(),
        reason,
    }
    .into()
}

fn parse_path(json: &serde_json::Value) -> TesseraResult<AttributePath> {
    match json {
        serde_json::Value::String(s) => Ok(AttributePath::new([s.clone()])),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|i| {
                i.as_str().map(str::to_string).ok_or_else(|| {
                    TesseraError::from(QueryError::MalformedPredicate {
                        reason: format!("path segments must be strings, got {}", i),
                    })
                })
            })
            .collect::<TesseraResult<Vec<_>>>()
            .map(AttributePath),
        other => Err(QueryError::MalformedPredicate {
            reason: format!("expected a path, got {}", other),
        }
        .into()),
    }
}

fn children_to_json(children: &[Predicate]) -> Vec<serde_json::Value> {
    children.iter().map(Predicate::to_json).collect()
}

fn parse_operand(json: &serde_json::Value) -> TesseraResult<Operand> {
    match json {
        serde_json::Value::Array(items)
            if !items.is_empty() && items.iter().all(|i| i.is_string()) =>
        {
            Ok(Operand::Path(parse_path(json)?))
        }
        serde_json::Value::Object(obj) => {
            if obj.len() != 1 {
                return Err(QueryError::MalformedQuantifier {
                    keys: obj.keys().cloned().collect(),
                }
                .into());
            }
            let (name, body) = obj.iter().next().ok_or_else(|| QueryError::MalformedQuantifier {
                keys: Vec::new(),
            })?;
            let quantifier = match name.as_str() {
                "any" => Quantifier::Any,
                "all" => Quantifier::All,
                "none" => Quantifier::None,
                "literal" => return Ok(Operand::Literal(Value::from_json(body)?)),
                _ => {
                    return Err(QueryError::MalformedQuantifier {
                        keys: vec![name.clone()],
                    }
                    .into())
                }
            };
            Ok(Operand::Quantified(quantifier, parse_path(body)?))
        }
        other => Ok(Operand::Literal(Value::from_json(other)?)),
    }
}

fn operand_to_json(operand: &Operand) -> serde_json::Value {
    match operand {
        Operand::Path(p) => json!(p.segments()),
        Operand::Quantified(q, p) => json!({ q.as_str(): p.segments() }),
        Operand::Literal(v @ (Value::List(_) | Value::Ref(_))) => json!({ "literal": v.to_json() }),
        Operand::Literal(v) => v.to_json(),
    }
}
