//! Canonical type-spec trees for schema drift detection.
//!
//! A type spec is the authoritative structured description of a field's
//! type. Object keys serialise sorted, union members are ordered by their
//! canonical JSON, and recursive typed-dict references become named `ref`
//! back-edges, so two specs are comparable by hash as well as structurally.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hash::canonical_json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeSpec {
    Primitive {
        name: String,
    },
    List {
        item: Box<TypeSpec>,
    },
    Dict {
        key: Box<TypeSpec>,
        value: Box<TypeSpec>,
    },
    Union {
        members: Vec<TypeSpec>,
    },
    TypedDict {
        name: String,
        total: bool,
        fields: BTreeMap<String, TypeSpec>,
    },
    Ref {
        name: String,
    },
}

impl TypeSpec {
    pub fn primitive(name: &str) -> TypeSpec {
        TypeSpec::Primitive {
            name: name.to_string(),
        }
    }

    pub fn str() -> TypeSpec {
        Self::primitive("str")
    }

    pub fn int() -> TypeSpec {
        Self::primitive("int")
    }

    pub fn float() -> TypeSpec {
        Self::primitive("float")
    }

    pub fn bool() -> TypeSpec {
        Self::primitive("bool")
    }

    pub fn null() -> TypeSpec {
        Self::primitive("null")
    }

    pub fn any() -> TypeSpec {
        Self::primitive("any")
    }

    pub fn list(item: TypeSpec) -> TypeSpec {
        TypeSpec::List {
            item: Box::new(item),
        }
    }

    pub fn dict(key: TypeSpec, value: TypeSpec) -> TypeSpec {
        TypeSpec::Dict {
            key: Box::new(key),
            value: Box::new(value),
        }
    }

    /// Union with members sorted by canonical JSON for determinism.
    pub fn union(mut members: Vec<TypeSpec>) -> TypeSpec {
        members.sort_by_key(|m| m.canonical_json());
        TypeSpec::Union { members }
    }

    /// `optional[T]` sugar: `union(T, null)`.
    pub fn optional(inner: TypeSpec) -> TypeSpec {
        Self::union(vec![inner, Self::null()])
    }

    pub fn typed_dict(name: &str, fields: Vec<(&str, TypeSpec)>) -> TypeSpec {
        TypeSpec::TypedDict {
            name: name.to_string(),
            total: true,
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    pub fn reference(name: &str) -> TypeSpec {
        TypeSpec::Ref {
            name: name.to_string(),
        }
    }

    pub fn canonical_json(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        canonical_json(&value)
    }

    fn collect_defs<'a>(&'a self, defs: &mut BTreeMap<&'a str, &'a TypeSpec>) {
        match self {
            TypeSpec::TypedDict { name, fields, .. } => {
                if defs.insert(name.as_str(), self).is_none() {
                    for field in fields.values() {
                        field.collect_defs(defs);
                    }
                }
            }
            TypeSpec::List { item } => item.collect_defs(defs),
            TypeSpec::Dict { key, value } => {
                key.collect_defs(defs);
                value.collect_defs(defs);
            }
            TypeSpec::Union { members } => {
                for m in members {
                    m.collect_defs(defs);
                }
            }
            TypeSpec::Primitive { .. } | TypeSpec::Ref { .. } => {}
        }
    }

    /// Structural equality with `ref` nodes resolved against the named
    /// typed-dict trees of each side. Back-edges compare equal iff they
    /// point to equal named trees; re-entered pairs are assumed equal.
    pub fn structurally_equal(&self, other: &TypeSpec) -> bool {
        let mut defs_a = BTreeMap::new();
        let mut defs_b = BTreeMap::new();
        self.collect_defs(&mut defs_a);
        other.collect_defs(&mut defs_b);
        let mut visited = HashSet::new();
        eq_inner(self, other, &defs_a, &defs_b, &mut visited)
    }

    /// Whether a JSON value conforms to this spec. Unknown primitive names
    /// and `any` accept everything; typed dicts require declared fields
    /// when total and check declared fields that are present.
    pub fn conforms(&self, value: &Value) -> bool {
        let mut defs = BTreeMap::new();
        self.collect_defs(&mut defs);
        conforms_inner(self, value, &defs)
    }
}

fn resolve<'a>(
    spec: &'a TypeSpec,
    defs: &BTreeMap<&'a str, &'a TypeSpec>,
) -> &'a TypeSpec {
    match spec {
        TypeSpec::Ref { name } => defs.get(name.as_str()).copied().unwrap_or(spec),
        _ => spec,
    }
}

fn eq_inner(
    a: &TypeSpec,
    b: &TypeSpec,
    defs_a: &BTreeMap<&str, &TypeSpec>,
    defs_b: &BTreeMap<&str, &TypeSpec>,
    visited: &mut HashSet<(String, String)>,
) -> bool {
    let a = resolve(a, defs_a);
    let b = resolve(b, defs_b);

    match (a, b) {
        (TypeSpec::Primitive { name: x }, TypeSpec::Primitive { name: y }) => x == y,
        (TypeSpec::List { item: x }, TypeSpec::List { item: y }) => {
            eq_inner(x, y, defs_a, defs_b, visited)
        }
        (
            TypeSpec::Dict { key: ka, value: va },
            TypeSpec::Dict { key: kb, value: vb },
        ) => {
            eq_inner(ka, kb, defs_a, defs_b, visited)
                && eq_inner(va, vb, defs_a, defs_b, visited)
        }
        (TypeSpec::Union { members: xs }, TypeSpec::Union { members: ys }) => {
            if xs.len() != ys.len() {
                return false;
            }
            let mut xs: Vec<&TypeSpec> = xs.iter().collect();
            let mut ys: Vec<&TypeSpec> = ys.iter().collect();
            xs.sort_by_key(|m| m.canonical_json());
            ys.sort_by_key(|m| m.canonical_json());
            xs.iter()
                .zip(ys.iter())
                .all(|(x, y)| eq_inner(x, y, defs_a, defs_b, visited))
        }
        (
            TypeSpec::TypedDict {
                name: na,
                total: ta,
                fields: fa,
            },
            TypeSpec::TypedDict {
                name: nb,
                total: tb,
                fields: fb,
            },
        ) => {
            let pair = (na.clone(), nb.clone());
            if visited.contains(&pair) {
                return true;
            }
            visited.insert(pair);
            ta == tb
                && fa.len() == fb.len()
                && fa.iter().zip(fb.iter()).all(|((ka, va), (kb, vb))| {
                    ka == kb && eq_inner(va, vb, defs_a, defs_b, visited)
                })
        }
        // Dangling refs: compare by name.
        (TypeSpec::Ref { name: x }, TypeSpec::Ref { name: y }) => x == y,
        (TypeSpec::Ref { name: x }, TypeSpec::TypedDict { name: y, .. }) => x == y,
        (TypeSpec::TypedDict { name: x, .. }, TypeSpec::Ref { name: y }) => x == y,
        _ => false,
    }
}

fn conforms_inner(
    spec: &TypeSpec,
    value: &Value,
    defs: &BTreeMap<&str, &TypeSpec>,
) -> bool {
    match resolve(spec, defs) {
        TypeSpec::Primitive { name } => match name.as_str() {
            "str" => value.is_string(),
            "int" => value.is_i64() || value.is_u64(),
            "float" => value.is_number(),
            "bool" => value.is_boolean(),
            "null" => value.is_null(),
            _ => true,
        },
        TypeSpec::List { item } => match value.as_array() {
            Some(items) => items.iter().all(|v| conforms_inner(item, v, defs)),
            None => false,
        },
        TypeSpec::Dict { value: val_spec, .. } => match value.as_object() {
            Some(map) => map.values().all(|v| conforms_inner(val_spec, v, defs)),
            None => false,
        },
        TypeSpec::Union { members } => {
            members.iter().any(|m| conforms_inner(m, value, defs))
        }
        TypeSpec::TypedDict { total, fields, .. } => match value.as_object() {
            Some(map) => {
                if *total && fields.keys().any(|k| !map.contains_key(k)) {
                    return false;
                }
                fields.iter().all(|(k, f)| match map.get(k) {
                    Some(v) => conforms_inner(f, v, defs),
                    None => true,
                })
            }
            None => false,
        },
        // Unresolvable back-edge: nothing to check against.
        TypeSpec::Ref { .. } => true,
    }
}

/// Attempt to parse a legacy stored type string into a type spec.
///
/// The bounded grammar covers primitives, `list[T]`, `dict[K, V]` and
/// `optional[T]`. Returns `None` when the string cannot be parsed, which
/// callers treat as real drift.
pub fn synthesize_from_legacy(type_str: &str) -> Option<TypeSpec> {
    let s = type_str.trim();
    match s {
        "str" | "int" | "float" | "bool" | "null" | "any" => {
            return Some(TypeSpec::primitive(s));
        }
        _ => {}
    }

    if let Some(inner) = bracketed(s, "optional[") {
        let inner_spec =
            synthesize_from_legacy(inner).unwrap_or_else(|| TypeSpec::primitive(inner.trim()));
        return Some(TypeSpec::union(vec![inner_spec, TypeSpec::null()]));
    }
    if let Some(inner) = bracketed(s, "list[") {
        let inner_spec =
            synthesize_from_legacy(inner).unwrap_or_else(|| TypeSpec::primitive(inner.trim()));
        return Some(TypeSpec::list(inner_spec));
    }
    if let Some(inner) = bracketed(s, "dict[") {
        let (key, value) = split_top_level(inner)?;
        let key_spec =
            synthesize_from_legacy(key).unwrap_or_else(|| TypeSpec::primitive(key.trim()));
        let value_spec =
            synthesize_from_legacy(value).unwrap_or_else(|| TypeSpec::primitive(value.trim()));
        return Some(TypeSpec::dict(key_spec, value_spec));
    }

    None
}

fn bracketed<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.starts_with(prefix) && s.ends_with(']') {
        Some(&s[prefix.len()..s.len() - 1])
    } else {
        None
    }
}

/// Split `K, V` at the first comma not nested inside brackets.
fn split_top_level(s: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    for (i, ch) in s.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => return Some((&s[..i], &s[i + 1..])),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_shape() {
        let spec = TypeSpec::str();
        assert_eq!(spec.canonical_json(), r#"{"kind":"primitive","name":"str"}"#);
    }

    #[test]
    fn test_union_members_sorted() {
        let a = TypeSpec::union(vec![TypeSpec::str(), TypeSpec::int()]);
        let b = TypeSpec::union(vec![TypeSpec::int(), TypeSpec::str()]);
        assert_eq!(a.canonical_json(), b.canonical_json());
    }

    #[test]
    fn test_structural_equality_basic() {
        let a = TypeSpec::list(TypeSpec::optional(TypeSpec::int()));
        let b = TypeSpec::list(TypeSpec::union(vec![TypeSpec::null(), TypeSpec::int()]));
        assert!(a.structurally_equal(&b));
        assert!(!a.structurally_equal(&TypeSpec::list(TypeSpec::int())));
    }

    #[test]
    fn test_recursive_ref_equality() {
        // Node { next: Node (back-edge) } on both sides.
        let a = TypeSpec::typed_dict(
            "Node",
            vec![(
                "next",
                TypeSpec::optional(TypeSpec::reference("Node")),
            )],
        );
        let b = a.clone();
        assert!(a.structurally_equal(&b));

        let c = TypeSpec::typed_dict(
            "Node",
            vec![("next", TypeSpec::optional(TypeSpec::reference("Other")))],
        );
        assert!(!a.structurally_equal(&c));
    }

    #[test]
    fn test_conforms_primitives() {
        assert!(TypeSpec::str().conforms(&json!("hi")));
        assert!(!TypeSpec::str().conforms(&json!(1)));
        assert!(TypeSpec::int().conforms(&json!(3)));
        assert!(!TypeSpec::int().conforms(&json!(3.5)));
        assert!(TypeSpec::float().conforms(&json!(3)));
        assert!(TypeSpec::optional(TypeSpec::str()).conforms(&json!(null)));
    }

    #[test]
    fn test_conforms_typed_dict() {
        let spec = TypeSpec::typed_dict(
            "Profile",
            vec![("city", TypeSpec::str()), ("zip", TypeSpec::str())],
        );
        assert!(spec.conforms(&json!({"city": "Oslo", "zip": "0150"})));
        assert!(!spec.conforms(&json!({"city": "Oslo"})));
        assert!(!spec.conforms(&json!({"city": 7, "zip": "0150"})));
    }

    #[test]
    fn test_conforms_list_of_dicts() {
        let spec = TypeSpec::list(TypeSpec::typed_dict(
            "Ev",
            vec![("kind", TypeSpec::str())],
        ));
        assert!(spec.conforms(&json!([{"kind": "click"}, {"kind": "view"}])));
        assert!(!spec.conforms(&json!([{"kind": 1}])));
        assert!(spec.conforms(&json!([])));
    }

    #[test]
    fn test_legacy_synthesis() {
        assert_eq!(
            synthesize_from_legacy("str"),
            Some(TypeSpec::str())
        );
        assert!(synthesize_from_legacy("optional[str]")
            .unwrap()
            .structurally_equal(&TypeSpec::optional(TypeSpec::str())));
        assert_eq!(
            synthesize_from_legacy("list[int]"),
            Some(TypeSpec::list(TypeSpec::int()))
        );
        assert_eq!(
            synthesize_from_legacy("dict[str, list[int]]"),
            Some(TypeSpec::dict(
                TypeSpec::str(),
                TypeSpec::list(TypeSpec::int())
            ))
        );
        assert_eq!(synthesize_from_legacy("SomethingWeird<T>"), None);
    }
}
