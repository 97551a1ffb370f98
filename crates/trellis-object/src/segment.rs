//! JSON-lines row segments: the columnar data files of commit and
//! snapshot objects. One JSON object per line carrying the row columns.

use serde::{Deserialize, Serialize};

use trellis_core::error::{Result, TrellisError};
use trellis_core::hash::sha256_hex;
use trellis_core::repo::{EntityRow, RelationRow};
use trellis_core::JsonMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntityLine {
    commit_id: i64,
    entity_type: String,
    entity_key: String,
    schema_version_id: Option<i64>,
    fields: JsonMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RelationLine {
    commit_id: i64,
    relation_type: String,
    left_key: String,
    right_key: String,
    instance_key: String,
    schema_version_id: Option<i64>,
    fields: JsonMap,
}

/// Encode entity rows; returns `(bytes, row_count, content_sha256)`.
pub fn encode_entity_rows(
    type_name: &str,
    rows: &[EntityRow],
) -> Result<(Vec<u8>, usize, String)> {
    let mut out = Vec::new();
    for row in rows {
        let line = EntityLine {
            commit_id: row.commit_id,
            entity_type: type_name.to_string(),
            entity_key: row.key.clone(),
            schema_version_id: row.schema_version_id,
            fields: row.fields.clone(),
        };
        let encoded = serde_json::to_string(&line)
            .map_err(|e| TrellisError::Serialization(e.to_string()))?;
        out.extend_from_slice(encoded.as_bytes());
        out.push(b'\n');
    }
    let sha = sha256_hex(&out);
    Ok((out, rows.len(), sha))
}

pub fn decode_entity_rows(bytes: &[u8]) -> Result<Vec<EntityRow>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| TrellisError::Serialization(e.to_string()))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            let line: EntityLine = serde_json::from_str(l)
                .map_err(|e| TrellisError::Serialization(e.to_string()))?;
            Ok(EntityRow {
                key: line.entity_key,
                fields: line.fields,
                commit_id: line.commit_id,
                schema_version_id: line.schema_version_id,
            })
        })
        .collect()
}

/// Encode relation rows; returns `(bytes, row_count, content_sha256)`.
pub fn encode_relation_rows(
    type_name: &str,
    rows: &[RelationRow],
) -> Result<(Vec<u8>, usize, String)> {
    let mut out = Vec::new();
    for row in rows {
        let line = RelationLine {
            commit_id: row.commit_id,
            relation_type: type_name.to_string(),
            left_key: row.left_key.clone(),
            right_key: row.right_key.clone(),
            instance_key: row.instance_key.clone(),
            schema_version_id: row.schema_version_id,
            fields: row.fields.clone(),
        };
        let encoded = serde_json::to_string(&line)
            .map_err(|e| TrellisError::Serialization(e.to_string()))?;
        out.extend_from_slice(encoded.as_bytes());
        out.push(b'\n');
    }
    let sha = sha256_hex(&out);
    Ok((out, rows.len(), sha))
}

pub fn decode_relation_rows(bytes: &[u8]) -> Result<Vec<RelationRow>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| TrellisError::Serialization(e.to_string()))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            let line: RelationLine = serde_json::from_str(l)
                .map_err(|e| TrellisError::Serialization(e.to_string()))?;
            Ok(RelationRow {
                left_key: line.left_key,
                right_key: line.right_key,
                instance_key: line.instance_key,
                fields: line.fields,
                commit_id: line.commit_id,
                schema_version_id: line.schema_version_id,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_round_trip() {
        let rows = vec![
            EntityRow {
                key: "a".into(),
                fields: json!({"name": "Alice"}).as_object().unwrap().clone(),
                commit_id: 1,
                schema_version_id: Some(1),
            },
            EntityRow {
                key: "b".into(),
                fields: json!({"name": "Bob"}).as_object().unwrap().clone(),
                commit_id: 1,
                schema_version_id: Some(1),
            },
        ];
        let (bytes, count, sha) = encode_entity_rows("Customer", &rows).unwrap();
        assert_eq!(count, 2);
        assert_eq!(sha, trellis_core::hash::sha256_hex(&bytes));
        let decoded = decode_entity_rows(&bytes).unwrap();
        assert_eq!(decoded, rows);
    }

    #[test]
    fn test_relation_round_trip() {
        let rows = vec![RelationRow {
            left_key: "p1".into(),
            right_key: "c1".into(),
            instance_key: "a".into(),
            fields: json!({"role": "Eng"}).as_object().unwrap().clone(),
            commit_id: 3,
            schema_version_id: None,
        }];
        let (bytes, count, _) = encode_relation_rows("Employment", &rows).unwrap();
        assert_eq!(count, 1);
        assert_eq!(decode_relation_rows(&bytes).unwrap(), rows);
    }

    #[test]
    fn test_decode_empty() {
        assert!(decode_entity_rows(b"").unwrap().is_empty());
    }
}
