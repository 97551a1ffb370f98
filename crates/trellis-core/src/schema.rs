//! Typed schema registry entries, canonical schema JSON, and drift diffs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Result, TrellisError};
use crate::hash::{canonical_json, sha256_hex};
use crate::type_spec::{synthesize_from_legacy, TypeSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeKind {
    Entity,
    Relation,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeKind::Entity => write!(f, "entity"),
            TypeKind::Relation => write!(f, "relation"),
        }
    }
}

impl TypeKind {
    pub fn parse(s: &str) -> Result<TypeKind> {
        match s {
            "entity" => Ok(TypeKind::Entity),
            "relation" => Ok(TypeKind::Relation),
            other => Err(TrellisError::Validation(format!(
                "unknown type kind '{other}'"
            ))),
        }
    }
}

/// A single field of an entity or relation schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Human-readable type string, e.g. `"str"` or `"list[ItemEvent]"`.
    pub type_name: String,
    pub type_spec: TypeSpec,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub instance_key: bool,
    #[serde(default)]
    pub index: bool,
    /// Optional fields (union with null) may be absent from payloads.
    #[serde(default)]
    pub required: bool,
}

/// Explicit schema declaration for one entity or relation type.
///
/// This is the registry-entry rendering of a typed model: field names map
/// to canonical type specs, identity fields are flagged, and the whole
/// structure serialises to the canonical JSON that schema hashing and drift
/// detection operate on.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeSchema {
    pub kind: TypeKind,
    pub name: String,
    pub left_type: Option<String>,
    pub right_type: Option<String>,
    pub primary_key_field: Option<String>,
    pub instance_key_field: Option<String>,
    pub fields: BTreeMap<String, FieldDef>,
}

impl TypeSchema {
    pub fn entity(name: &str) -> TypeSchema {
        TypeSchema {
            kind: TypeKind::Entity,
            name: name.to_string(),
            left_type: None,
            right_type: None,
            primary_key_field: None,
            instance_key_field: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn relation(name: &str, left_type: &str, right_type: &str) -> TypeSchema {
        TypeSchema {
            kind: TypeKind::Relation,
            name: name.to_string(),
            left_type: Some(left_type.to_string()),
            right_type: Some(right_type.to_string()),
            primary_key_field: None,
            instance_key_field: None,
            fields: BTreeMap::new(),
        }
    }

    /// Declare the primary key field (entities only, typed `str`).
    pub fn primary_key(mut self, name: &str) -> TypeSchema {
        self.fields.insert(
            name.to_string(),
            FieldDef {
                type_name: "str".to_string(),
                type_spec: TypeSpec::str(),
                primary_key: true,
                instance_key: false,
                index: false,
                required: true,
            },
        );
        self.primary_key_field = Some(name.to_string());
        self
    }

    /// Declare the instance key field (relations only, required `str`).
    pub fn instance_key(mut self, name: &str) -> TypeSchema {
        self.fields.insert(
            name.to_string(),
            FieldDef {
                type_name: "str".to_string(),
                type_spec: TypeSpec::str(),
                primary_key: false,
                instance_key: true,
                index: false,
                required: true,
            },
        );
        self.instance_key_field = Some(name.to_string());
        self
    }

    pub fn field(mut self, name: &str, spec: TypeSpec) -> TypeSchema {
        let required = !matches!(&spec, TypeSpec::Union { members }
            if members.iter().any(|m| matches!(m, TypeSpec::Primitive { name } if name == "null")));
        self.fields.insert(
            name.to_string(),
            FieldDef {
                type_name: display_name(&spec),
                type_spec: spec,
                primary_key: false,
                instance_key: false,
                index: false,
                required,
            },
        );
        self
    }

    pub fn indexed_field(self, name: &str, spec: TypeSpec) -> TypeSchema {
        let mut s = self.field(name, spec);
        if let Some(def) = s.fields.get_mut(name) {
            def.index = true;
        }
        s
    }

    /// Structural sanity checks: entities carry exactly one primary key and
    /// no instance key; relations carry no primary key and at most one
    /// instance key typed `str`.
    pub fn validate(&self) -> Result<()> {
        let pk: Vec<&String> = self
            .fields
            .iter()
            .filter(|(_, f)| f.primary_key)
            .map(|(n, _)| n)
            .collect();
        let ik: Vec<&String> = self
            .fields
            .iter()
            .filter(|(_, f)| f.instance_key)
            .map(|(n, _)| n)
            .collect();

        match self.kind {
            TypeKind::Entity => {
                if !ik.is_empty() {
                    return Err(TrellisError::Validation(format!(
                        "entity '{}' cannot declare an instance key",
                        self.name
                    )));
                }
                if pk.len() != 1 {
                    return Err(TrellisError::Validation(format!(
                        "entity '{}' must declare exactly one primary key, found {}",
                        self.name,
                        pk.len()
                    )));
                }
            }
            TypeKind::Relation => {
                if !pk.is_empty() {
                    return Err(TrellisError::Validation(format!(
                        "relation '{}' cannot declare a primary key",
                        self.name
                    )));
                }
                if ik.len() > 1 {
                    return Err(TrellisError::Validation(format!(
                        "relation '{}' declares multiple instance keys: {:?}",
                        self.name, ik
                    )));
                }
                if let Some(name) = ik.first() {
                    let def = &self.fields[*name];
                    if def.type_spec != TypeSpec::str() {
                        return Err(TrellisError::Validation(format!(
                            "relation '{}' instance key '{}' must be typed str",
                            self.name, name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Field names that belong to the payload (identity fields excluded).
    pub fn payload_fields(&self) -> impl Iterator<Item = (&String, &FieldDef)> {
        self.fields
            .iter()
            .filter(|(_, f)| !f.primary_key && !f.instance_key)
    }

    pub fn field_spec(&self, name: &str) -> Option<&TypeSpec> {
        self.fields.get(name).map(|f| &f.type_spec)
    }

    /// Canonical JSON value in the persisted registry shape.
    pub fn to_canonical_value(&self) -> Value {
        let mut fields = Map::new();
        for (name, def) in &self.fields {
            let mut f = Map::new();
            match self.kind {
                TypeKind::Entity => {
                    f.insert("primary_key".into(), json!(def.primary_key));
                    f.insert("index".into(), json!(def.index));
                }
                TypeKind::Relation => {
                    f.insert("index".into(), json!(def.index));
                }
            }
            f.insert("type".into(), json!(def.type_name));
            f.insert(
                "type_spec".into(),
                serde_json::to_value(&def.type_spec).unwrap_or(Value::Null),
            );
            fields.insert(name.clone(), Value::Object(f));
        }

        match self.kind {
            TypeKind::Entity => json!({
                "entity_name": self.name,
                "fields": fields,
            }),
            TypeKind::Relation => json!({
                "relation_name": self.name,
                "left_type": self.left_type,
                "right_type": self.right_type,
                "instance_key_field": self.instance_key_field,
                "fields": fields,
            }),
        }
    }

    pub fn canonical_json(&self) -> String {
        canonical_json(&self.to_canonical_value())
    }

    /// Deterministic fingerprint of the canonical schema JSON.
    pub fn hash(&self) -> String {
        sha256_hex(self.canonical_json().as_bytes())
    }

    /// Validate a payload against field specs: required payload fields must
    /// be present and every present declared field must conform.
    pub fn validate_payload(&self, fields: &Map<String, Value>) -> Result<()> {
        for (name, def) in self.payload_fields() {
            match fields.get(name) {
                Some(value) => {
                    if !def.type_spec.conforms(value) {
                        return Err(TrellisError::Validation(format!(
                            "field '{}' of '{}' does not conform to its type spec",
                            name, self.name
                        )));
                    }
                }
                None => {
                    if def.required {
                        return Err(TrellisError::Validation(format!(
                            "required field '{}' missing from '{}' payload",
                            name, self.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn display_name(spec: &TypeSpec) -> String {
    match spec {
        TypeSpec::Primitive { name } => name.clone(),
        TypeSpec::List { item } => format!("list[{}]", display_name(item)),
        TypeSpec::Dict { key, value } => {
            format!("dict[{}, {}]", display_name(key), display_name(value))
        }
        TypeSpec::Union { members } => {
            let is_null =
                |m: &TypeSpec| matches!(m, TypeSpec::Primitive { name } if name == "null");
            if members.len() == 2 && members.iter().any(is_null) {
                let inner = members.iter().find(|m| !is_null(m));
                if let Some(inner) = inner {
                    return format!("optional[{}]", display_name(inner));
                }
            }
            let names: Vec<String> = members.iter().map(display_name).collect();
            names.join(" | ")
        }
        TypeSpec::TypedDict { name, .. } => name.clone(),
        TypeSpec::Ref { name } => name.clone(),
    }
}

/// Per-field change between a stored and a code schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub stored: Value,
    pub code: Value,
}

/// Describes the difference between stored and code schema for one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeSchemaDiff {
    pub type_kind: TypeKind,
    pub type_name: String,
    pub stored_version: i64,
    pub added_fields: Vec<String>,
    pub removed_fields: Vec<String>,
    pub changed_fields: BTreeMap<String, FieldChange>,
}

/// Compare stored and code canonical schema values field by field.
pub fn build_schema_diff(
    type_kind: TypeKind,
    type_name: &str,
    stored_version: i64,
    stored_schema: &Value,
    code_schema: &Value,
) -> TypeSchemaDiff {
    let empty = Map::new();
    let stored_fields = stored_schema
        .get("fields")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let code_fields = code_schema
        .get("fields")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let mut added: Vec<String> = code_fields
        .keys()
        .filter(|k| !stored_fields.contains_key(*k))
        .cloned()
        .collect();
    added.sort();
    let mut removed: Vec<String> = stored_fields
        .keys()
        .filter(|k| !code_fields.contains_key(*k))
        .cloned()
        .collect();
    removed.sort();

    let mut changed = BTreeMap::new();
    for (name, stored_def) in stored_fields {
        if let Some(code_def) = code_fields.get(name) {
            if stored_def != code_def {
                changed.insert(
                    name.clone(),
                    FieldChange {
                        stored: stored_def.clone(),
                        code: code_def.clone(),
                    },
                );
            }
        }
    }

    let stored_ik = stored_schema.get("instance_key_field").cloned();
    let code_ik = code_schema.get("instance_key_field").cloned();
    if stored_ik != code_ik {
        changed.insert(
            "__instance_key_field__".to_string(),
            FieldChange {
                stored: stored_ik.unwrap_or(Value::Null),
                code: code_ik.unwrap_or(Value::Null),
            },
        );
    }

    TypeSchemaDiff {
        type_kind,
        type_name: type_name.to_string(),
        stored_version,
        added_fields: added,
        removed_fields: removed,
        changed_fields: changed,
    }
}

/// Check whether a stored schema only differs from the code schema by
/// missing `type_spec` entries, and the specs synthesised from the legacy
/// type strings match the code schema. When true the stored schema can be
/// upgraded in place instead of reporting drift.
pub fn legacy_type_spec_upgrade_matches(stored_schema: &Value, code_schema: &Value) -> bool {
    let (Some(stored_fields), Some(code_fields)) = (
        stored_schema.get("fields").and_then(Value::as_object),
        code_schema.get("fields").and_then(Value::as_object),
    ) else {
        return false;
    };

    if stored_fields.len() != code_fields.len()
        || stored_fields.keys().any(|k| !code_fields.contains_key(k))
    {
        return false;
    }

    // Non-field keys must match exactly.
    let non_field_mismatch = |a: &Value, b: &Value| {
        let Some(a) = a.as_object() else { return true };
        let Some(b) = b.as_object() else { return true };
        for (k, v) in a {
            if k == "fields" {
                continue;
            }
            if b.get(k) != Some(v) {
                return true;
            }
        }
        b.keys().any(|k| k != "fields" && !a.contains_key(k))
    };
    if non_field_mismatch(stored_schema, code_schema) {
        return false;
    }

    for (name, stored_def) in stored_fields {
        let code_def = &code_fields[name];
        if stored_def == code_def {
            continue;
        }

        let strip = |v: &Value| -> Value {
            let mut m = v.as_object().cloned().unwrap_or_default();
            m.remove("type_spec");
            Value::Object(m)
        };
        if strip(stored_def) != strip(code_def) {
            return false;
        }
        if stored_def.get("type_spec").is_some() {
            // Stored already carries a spec and it differs: real drift.
            return false;
        }

        let Some(type_str) = stored_def.get("type").and_then(Value::as_str) else {
            return false;
        };
        let Some(synthesized) = synthesize_from_legacy(type_str) else {
            return false;
        };
        let Some(code_spec) = code_def
            .get("type_spec")
            .and_then(|v| serde_json::from_value::<TypeSpec>(v.clone()).ok())
        else {
            return false;
        };
        if !synthesized.structurally_equal(&code_spec) {
            return false;
        }
    }

    true
}
