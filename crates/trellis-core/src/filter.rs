//! Predicate AST for the query DSL.
//!
//! The same expression tree feeds two consumers: the SQL compiler of the
//! transactional backend and the in-process evaluator used by the
//! object-store backend and handler utilities. Both implement identical
//! semantics: missing keys resolve to null, null/non-list values fail
//! existential predicates, and ordering comparisons on mixed types are
//! false.
//!
//! Null and boolean equality are unrepresentable by construction: `eq`/`ne`
//! accept only non-null scalars, so `is_null`/`is_not_null`/`is_true`/
//! `is_false` are the only spellings.

use std::ops::{BitAnd, BitOr, Not};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::JsonMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    In,
    IsNull,
    IsNotNull,
}

/// Which row a field path addresses: the queried row itself, or the
/// left/right endpoint entity of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldScope {
    Row,
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub scope: FieldScope,
    /// Dotted path below the payload root, e.g. `"profile.city"`.
    pub path: String,
    pub op: CompareOp,
    pub value: Value,
}

/// Existential predicate over a list-of-typed-dict field: true when any
/// list element matches `item_path OP value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExistsComparison {
    pub scope: FieldScope,
    pub list_path: String,
    pub item_path: String,
    pub op: CompareOp,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterExpr {
    Compare(Comparison),
    Exists(ExistsComparison),
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    pub fn and(self, other: FilterExpr) -> FilterExpr {
        FilterExpr::And(vec![self, other])
    }

    pub fn or(self, other: FilterExpr) -> FilterExpr {
        FilterExpr::Or(vec![self, other])
    }
}

impl BitAnd for FilterExpr {
    type Output = FilterExpr;
    fn bitand(self, rhs: FilterExpr) -> FilterExpr {
        self.and(rhs)
    }
}

impl BitOr for FilterExpr {
    type Output = FilterExpr;
    fn bitor(self, rhs: FilterExpr) -> FilterExpr {
        self.or(rhs)
    }
}

impl Not for FilterExpr {
    type Output = FilterExpr;
    fn not(self) -> FilterExpr {
        FilterExpr::Not(Box::new(self))
    }
}

/// A non-null scalar comparison operand. The absence of `From<bool>` and a
/// null constructor is deliberate.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarValue(pub(crate) Value);

impl ScalarValue {
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue(Value::from(v))
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        ScalarValue(Value::from(v))
    }
}

impl From<u64> for ScalarValue {
    fn from(v: u64) -> Self {
        ScalarValue(Value::from(v))
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue(Value::from(v))
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue(Value::from(v))
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        ScalarValue(Value::from(v))
    }
}

fn validate_segment(segment: &str) {
    let mut chars = segment.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    assert!(
        valid,
        "invalid path segment '{segment}': must match [A-Za-z_][A-Za-z0-9_]*"
    );
}

fn validate_path(path: &str) {
    assert!(!path.is_empty(), "path must not be empty");
    for segment in path.split('.') {
        validate_segment(segment);
    }
}

/// Reference to a field on the queried row.
///
/// # Panics
///
/// Construction panics when a path segment violates the grammar
/// `[A-Za-z_][A-Za-z0-9_]*`.
#[derive(Debug, Clone)]
pub struct FieldRef {
    scope: FieldScope,
    path: String,
}

/// Row-scoped field reference.
pub fn field(name: &str) -> FieldRef {
    validate_path(name);
    FieldRef {
        scope: FieldScope::Row,
        path: name.to_string(),
    }
}

/// Left-endpoint field reference for relation queries.
pub fn left(name: &str) -> EndpointField {
    validate_path(name);
    EndpointField(FieldRef {
        scope: FieldScope::Left,
        path: name.to_string(),
    })
}

/// Right-endpoint field reference for relation queries.
pub fn right(name: &str) -> EndpointField {
    validate_path(name);
    EndpointField(FieldRef {
        scope: FieldScope::Right,
        path: name.to_string(),
    })
}

impl FieldRef {
    /// Navigate into a nested typed-dict field via dotted sub-path.
    pub fn path(mut self, sub_path: &str) -> FieldRef {
        validate_path(sub_path);
        self.path = format!("{}.{}", self.path, sub_path);
        self
    }

    /// Navigate into a nested typed-dict field via single segment.
    pub fn child(self, segment: &str) -> FieldRef {
        validate_segment(segment);
        self.path(segment)
    }

    /// Existential predicate proxy over a list-of-typed-dict field.
    pub fn any_path(self, item_path: &str) -> AnyPathRef {
        validate_path(item_path);
        AnyPathRef {
            scope: self.scope,
            list_path: self.path,
            item_path: item_path.to_string(),
        }
    }

    fn cmp(self, op: CompareOp, value: Value) -> FilterExpr {
        FilterExpr::Compare(Comparison {
            scope: self.scope,
            path: self.path,
            op,
            value,
        })
    }

    pub fn eq(self, value: impl Into<ScalarValue>) -> FilterExpr {
        self.cmp(CompareOp::Eq, value.into().0)
    }

    pub fn ne(self, value: impl Into<ScalarValue>) -> FilterExpr {
        self.cmp(CompareOp::Ne, value.into().0)
    }

    pub fn gt(self, value: impl Into<ScalarValue>) -> FilterExpr {
        self.cmp(CompareOp::Gt, value.into().0)
    }

    pub fn ge(self, value: impl Into<ScalarValue>) -> FilterExpr {
        self.cmp(CompareOp::Ge, value.into().0)
    }

    pub fn lt(self, value: impl Into<ScalarValue>) -> FilterExpr {
        self.cmp(CompareOp::Lt, value.into().0)
    }

    pub fn le(self, value: impl Into<ScalarValue>) -> FilterExpr {
        self.cmp(CompareOp::Le, value.into().0)
    }

    pub fn starts_with(self, prefix: &str) -> FilterExpr {
        self.cmp(CompareOp::Like, Value::from(format!("{prefix}%")))
    }

    pub fn ends_with(self, suffix: &str) -> FilterExpr {
        self.cmp(CompareOp::Like, Value::from(format!("%{suffix}")))
    }

    pub fn contains(self, substring: &str) -> FilterExpr {
        self.cmp(CompareOp::Like, Value::from(format!("%{substring}%")))
    }

    pub fn is_in<V: Into<ScalarValue>>(self, values: Vec<V>) -> FilterExpr {
        let values: Vec<Value> = values.into_iter().map(|v| v.into().0).collect();
        self.cmp(CompareOp::In, Value::Array(values))
    }

    pub fn is_null(self) -> FilterExpr {
        self.cmp(CompareOp::IsNull, Value::Null)
    }

    pub fn is_not_null(self) -> FilterExpr {
        self.cmp(CompareOp::IsNotNull, Value::Null)
    }

    pub fn is_true(self) -> FilterExpr {
        self.cmp(CompareOp::Eq, Value::Bool(true))
    }

    pub fn is_false(self) -> FilterExpr {
        self.cmp(CompareOp::Eq, Value::Bool(false))
    }

    pub fn field_path(&self) -> &str {
        &self.path
    }

    pub fn scope(&self) -> FieldScope {
        self.scope
    }
}

/// Endpoint-scoped field reference. Exposes the comparison surface of
/// [`FieldRef`] but not `any_path`: existential predicates on endpoint
/// proxies are unsupported and therefore unrepresentable.
#[derive(Debug, Clone)]
pub struct EndpointField(FieldRef);

impl EndpointField {
    pub fn path(self, sub_path: &str) -> EndpointField {
        EndpointField(self.0.path(sub_path))
    }

    pub fn eq(self, value: impl Into<ScalarValue>) -> FilterExpr {
        self.0.eq(value)
    }

    pub fn ne(self, value: impl Into<ScalarValue>) -> FilterExpr {
        self.0.ne(value)
    }

    pub fn gt(self, value: impl Into<ScalarValue>) -> FilterExpr {
        self.0.gt(value)
    }

    pub fn ge(self, value: impl Into<ScalarValue>) -> FilterExpr {
        self.0.ge(value)
    }

    pub fn lt(self, value: impl Into<ScalarValue>) -> FilterExpr {
        self.0.lt(value)
    }

    pub fn le(self, value: impl Into<ScalarValue>) -> FilterExpr {
        self.0.le(value)
    }

    pub fn starts_with(self, prefix: &str) -> FilterExpr {
        self.0.starts_with(prefix)
    }

    pub fn ends_with(self, suffix: &str) -> FilterExpr {
        self.0.ends_with(suffix)
    }

    pub fn contains(self, substring: &str) -> FilterExpr {
        self.0.contains(substring)
    }

    pub fn is_in<V: Into<ScalarValue>>(self, values: Vec<V>) -> FilterExpr {
        self.0.is_in(values)
    }

    pub fn is_null(self) -> FilterExpr {
        self.0.is_null()
    }

    pub fn is_not_null(self) -> FilterExpr {
        self.0.is_not_null()
    }

    pub fn is_true(self) -> FilterExpr {
        self.0.is_true()
    }

    pub fn is_false(self) -> FilterExpr {
        self.0.is_false()
    }
}

/// Existential predicate builder returned by [`FieldRef::any_path`].
#[derive(Debug, Clone)]
pub struct AnyPathRef {
    scope: FieldScope,
    list_path: String,
    item_path: String,
}

impl AnyPathRef {
    fn cmp(self, op: CompareOp, value: Value) -> FilterExpr {
        FilterExpr::Exists(ExistsComparison {
            scope: self.scope,
            list_path: self.list_path,
            item_path: self.item_path,
            op,
            value,
        })
    }

    pub fn eq(self, value: impl Into<ScalarValue>) -> FilterExpr {
        self.cmp(CompareOp::Eq, value.into().0)
    }

    pub fn ne(self, value: impl Into<ScalarValue>) -> FilterExpr {
        self.cmp(CompareOp::Ne, value.into().0)
    }

    pub fn gt(self, value: impl Into<ScalarValue>) -> FilterExpr {
        self.cmp(CompareOp::Gt, value.into().0)
    }

    pub fn ge(self, value: impl Into<ScalarValue>) -> FilterExpr {
        self.cmp(CompareOp::Ge, value.into().0)
    }

    pub fn lt(self, value: impl Into<ScalarValue>) -> FilterExpr {
        self.cmp(CompareOp::Lt, value.into().0)
    }

    pub fn le(self, value: impl Into<ScalarValue>) -> FilterExpr {
        self.cmp(CompareOp::Le, value.into().0)
    }

    pub fn is_in<V: Into<ScalarValue>>(self, values: Vec<V>) -> FilterExpr {
        let values: Vec<Value> = values.into_iter().map(|v| v.into().0).collect();
        self.cmp(CompareOp::In, Value::Array(values))
    }

    pub fn is_null(self) -> FilterExpr {
        self.cmp(CompareOp::IsNull, Value::Null)
    }

    pub fn is_not_null(self) -> FilterExpr {
        self.cmp(CompareOp::IsNotNull, Value::Null)
    }
}

// --- In-process evaluation ---

/// Resolve a dotted path against a payload object. Missing keys and
/// explicit nulls both resolve to `None`, matching `json_extract`.
pub fn resolve_path<'a>(data: &'a JsonMap, path: &str) -> Option<&'a Value> {
    let mut current: Option<&Value> = None;
    for (i, segment) in path.split('.').enumerate() {
        let obj = if i == 0 {
            data.get(segment)
        } else {
            current?.as_object()?.get(segment)
        };
        current = obj;
        current?;
    }
    match current {
        Some(Value::Null) | None => None,
        other => other,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        if a.is_number() && b.is_number() {
            return x == y;
        }
    }
    a == b
}

fn like_matches(value: &Value, pattern: &str) -> bool {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let starts = pattern.starts_with('%');
    let ends = pattern.ends_with('%');
    if starts && ends && pattern.len() >= 2 {
        text.contains(&pattern[1..pattern.len() - 1])
    } else if starts {
        text.ends_with(&pattern[1..])
    } else if ends {
        text.starts_with(&pattern[..pattern.len() - 1])
    } else {
        text == pattern
    }
}

/// Compare a resolved value against an operator and right-hand side with
/// SQL semantics: null operands fail every comparison except `IS NULL`.
pub fn compare_value(value: Option<&Value>, op: CompareOp, rhs: &Value) -> bool {
    match op {
        CompareOp::IsNull => value.is_none(),
        CompareOp::IsNotNull => value.is_some(),
        _ => {
            let Some(value) = value else { return false };
            match op {
                CompareOp::Eq => values_equal(value, rhs),
                CompareOp::Ne => !values_equal(value, rhs),
                CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => {
                    let ord = if value.is_number() && rhs.is_number() {
                        as_f64(value).partial_cmp(&as_f64(rhs))
                    } else if let (Value::String(a), Value::String(b)) = (value, rhs) {
                        Some(a.cmp(b))
                    } else {
                        None
                    };
                    match (op, ord) {
                        (CompareOp::Gt, Some(o)) => o.is_gt(),
                        (CompareOp::Ge, Some(o)) => o.is_ge(),
                        (CompareOp::Lt, Some(o)) => o.is_lt(),
                        (CompareOp::Le, Some(o)) => o.is_le(),
                        _ => false,
                    }
                }
                CompareOp::Like => match rhs.as_str() {
                    Some(pattern) => like_matches(value, pattern),
                    None => false,
                },
                CompareOp::In => match rhs.as_array() {
                    Some(values) => values.iter().any(|v| values_equal(value, v)),
                    None => false,
                },
                CompareOp::IsNull | CompareOp::IsNotNull => unreachable!(),
            }
        }
    }
}

/// Evaluate a filter against a row payload, with optional endpoint
/// payloads for left/right scoped predicates.
pub fn matches(
    expr: &FilterExpr,
    row: &JsonMap,
    left_fields: Option<&JsonMap>,
    right_fields: Option<&JsonMap>,
) -> bool {
    let empty = JsonMap::new();
    let left_map = left_fields.unwrap_or(&empty);
    let right_map = right_fields.unwrap_or(&empty);
    let scoped = |scope: FieldScope| match scope {
        FieldScope::Row => row,
        FieldScope::Left => left_map,
        FieldScope::Right => right_map,
    };

    match expr {
        FilterExpr::Compare(cmp) => {
            let value = resolve_path(scoped(cmp.scope), &cmp.path);
            compare_value(value, cmp.op, &cmp.value)
        }
        FilterExpr::Exists(exists) => {
            let list = resolve_path(scoped(exists.scope), &exists.list_path);
            let Some(Value::Array(items)) = list else {
                return false;
            };
            items.iter().any(|item| {
                // json_extract on a non-object element yields null; the
                // evaluator mirrors that for parity with the SQL path.
                let item_value = match item {
                    Value::Object(map) => resolve_path(map, &exists.item_path),
                    _ => None,
                };
                compare_value(item_value, exists.op, &exists.value)
            })
        }
        FilterExpr::And(children) => children
            .iter()
            .all(|c| matches(c, row, left_fields, right_fields)),
        FilterExpr::Or(children) => children
            .iter()
            .any(|c| matches(c, row, left_fields, right_fields)),
        FilterExpr::Not(child) => !matches(child, row, left_fields, right_fields),
    }
}

// --- Scope splitting for SQL compilation ---

fn expr_scope(expr: &FilterExpr) -> Option<FieldScope> {
    match expr {
        FilterExpr::Compare(c) => Some(c.scope),
        FilterExpr::Exists(e) => Some(e.scope),
        _ => None,
    }
}

/// Whether any leaf of the expression addresses the given scope.
pub fn references_scope(expr: &FilterExpr, scope: FieldScope) -> bool {
    match expr {
        FilterExpr::And(children) | FilterExpr::Or(children) => {
            children.iter().any(|c| references_scope(c, scope))
        }
        FilterExpr::Not(child) => references_scope(child, scope),
        leaf => expr_scope(leaf) == Some(scope),
    }
}

/// Extract the sub-expression that addresses a single scope, dropping
/// leaves of other scopes. Used by SQL compilation to push endpoint
/// predicates into their EXISTS subqueries.
pub fn extract_scope(expr: &FilterExpr, scope: FieldScope) -> Option<FilterExpr> {
    match expr {
        FilterExpr::And(children) | FilterExpr::Or(children) => {
            let kept: Vec<FilterExpr> = children
                .iter()
                .filter_map(|c| extract_scope(c, scope))
                .collect();
            match kept.len() {
                0 => None,
                1 => Some(kept.into_iter().next().unwrap()),
                _ => Some(match expr {
                    FilterExpr::And(_) => FilterExpr::And(kept),
                    _ => FilterExpr::Or(kept),
                }),
            }
        }
        FilterExpr::Not(child) => {
            extract_scope(child, scope).map(|c| FilterExpr::Not(Box::new(c)))
        }
        leaf => {
            if expr_scope(leaf) == Some(scope) {
                Some(leaf.clone())
            } else {
                None
            }
        }
    }
}
