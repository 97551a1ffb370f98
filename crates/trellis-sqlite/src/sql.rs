//! Predicate AST to SQL compilation over `fields_json` columns.

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use trellis_core::error::{Result, TrellisError};
use trellis_core::filter::{CompareOp, Comparison, ExistsComparison, FieldScope, FilterExpr};
use trellis_core::hash::canonical_json;

/// Convert a JSON value to a SQLite parameter. Booleans become integers
/// to match `json_extract`'s rendering of JSON booleans.
pub fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(canonical_json(other)),
    }
}

fn scope_alias<'a>(scope: FieldScope, row_alias: &'a str) -> &'a str {
    match scope {
        FieldScope::Row => row_alias,
        FieldScope::Left => "le",
        FieldScope::Right => "re",
    }
}

fn json_col(scope: FieldScope, path: &str, row_alias: &str) -> String {
    let alias = scope_alias(scope, row_alias);
    if alias.is_empty() {
        format!("json_extract(fields_json, '$.{path}')")
    } else {
        format!("json_extract({alias}.fields_json, '$.{path}')")
    }
}

fn sql_op(op: CompareOp) -> Result<&'static str> {
    Ok(match op {
        CompareOp::Eq => "=",
        CompareOp::Ne => "!=",
        CompareOp::Gt => ">",
        CompareOp::Ge => ">=",
        CompareOp::Lt => "<",
        CompareOp::Le => "<=",
        CompareOp::Like => "LIKE",
        other => {
            return Err(TrellisError::Validation(format!(
                "operator {other:?} has no direct SQL rendering"
            )))
        }
    })
}

fn compile_condition(
    column: &str,
    op: CompareOp,
    value: &Value,
    params: &mut Vec<SqlValue>,
) -> Result<String> {
    match op {
        CompareOp::IsNull => Ok(format!("{column} IS NULL")),
        CompareOp::IsNotNull => Ok(format!("{column} IS NOT NULL")),
        CompareOp::In => {
            let values = value.as_array().cloned().unwrap_or_default();
            if values.is_empty() {
                // IN () is a syntax error; an empty list matches nothing.
                return Ok("0".to_string());
            }
            let placeholders = vec!["?"; values.len()].join(", ");
            for v in &values {
                params.push(json_to_sql(v));
            }
            Ok(format!("{column} IN ({placeholders})"))
        }
        other => {
            params.push(json_to_sql(value));
            Ok(format!("{column} {} ?", sql_op(other)?))
        }
    }
}

fn compile_comparison(
    cmp: &Comparison,
    params: &mut Vec<SqlValue>,
    row_alias: &str,
) -> Result<String> {
    let column = json_col(cmp.scope, &cmp.path, row_alias);
    compile_condition(&column, cmp.op, &cmp.value, params)
}

fn compile_exists(
    exists: &ExistsComparison,
    params: &mut Vec<SqlValue>,
    row_alias: &str,
) -> Result<String> {
    let alias = scope_alias(exists.scope, row_alias);
    let source = if alias.is_empty() {
        "fields_json".to_string()
    } else {
        format!("{alias}.fields_json")
    };
    let item_col = format!("json_extract(je.value, '$.{}')", exists.item_path);
    let condition = compile_condition(&item_col, exists.op, &exists.value, params)?;
    Ok(format!(
        "EXISTS (SELECT 1 FROM json_each(json_extract({source}, '$.{}')) AS je WHERE {condition})",
        exists.list_path
    ))
}

/// Compile a filter tree into a SQL boolean expression, appending bound
/// parameters. `row_alias` names the history-table alias for row-scoped
/// paths; endpoint-scoped paths compile against the `le`/`re` aliases.
pub fn compile_filter(
    expr: &FilterExpr,
    params: &mut Vec<SqlValue>,
    row_alias: &str,
) -> Result<String> {
    match expr {
        FilterExpr::Compare(cmp) => compile_comparison(cmp, params, row_alias),
        FilterExpr::Exists(exists) => compile_exists(exists, params, row_alias),
        FilterExpr::And(children) | FilterExpr::Or(children) => {
            let joiner = if matches!(expr, FilterExpr::And(_)) {
                " AND "
            } else {
                " OR "
            };
            let parts: Result<Vec<String>> = children
                .iter()
                .map(|c| compile_filter(c, params, row_alias))
                .collect();
            Ok(format!("({})", parts?.join(joiner)))
        }
        FilterExpr::Not(child) => {
            let inner = compile_filter(child, params, row_alias)?;
            Ok(format!("NOT ({inner})"))
        }
    }
}

/// SQL operator for a HAVING comparison.
pub fn having_op(op: CompareOp) -> Result<&'static str> {
    match op {
        CompareOp::Eq => Ok("="),
        CompareOp::Ne => Ok("!="),
        CompareOp::Gt => Ok(">"),
        CompareOp::Ge => Ok(">="),
        CompareOp::Lt => Ok("<"),
        CompareOp::Le => Ok("<="),
        other => Err(TrellisError::Validation(format!(
            "operator {other:?} is not valid in HAVING"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::filter::{field, left};

    #[test]
    fn test_compile_simple_comparison() {
        let mut params = Vec::new();
        let sql = compile_filter(&field("age").gt(30), &mut params, "eh").unwrap();
        assert_eq!(sql, "json_extract(eh.fields_json, '$.age') > ?");
        assert_eq!(params, vec![SqlValue::Integer(30)]);
    }

    #[test]
    fn test_compile_nested_path() {
        let mut params = Vec::new();
        let sql =
            compile_filter(&field("profile").path("city").eq("Oslo"), &mut params, "eh").unwrap();
        assert_eq!(sql, "json_extract(eh.fields_json, '$.profile.city') = ?");
    }

    #[test]
    fn test_compile_logical_tree() {
        let mut params = Vec::new();
        let expr = field("a").eq(1) & !field("b").is_null();
        let sql = compile_filter(&expr, &mut params, "eh").unwrap();
        assert_eq!(
            sql,
            "(json_extract(eh.fields_json, '$.a') = ? AND NOT (json_extract(eh.fields_json, '$.b') IS NULL))"
        );
    }

    #[test]
    fn test_compile_empty_in_is_false() {
        let mut params = Vec::new();
        let empty: Vec<i64> = vec![];
        let sql = compile_filter(&field("a").is_in(empty), &mut params, "eh").unwrap();
        assert_eq!(sql, "0");
        assert!(params.is_empty());
    }

    #[test]
    fn test_compile_exists() {
        let mut params = Vec::new();
        let expr = field("events").any_path("kind").eq("click");
        let sql = compile_filter(&expr, &mut params, "eh").unwrap();
        assert_eq!(
            sql,
            "EXISTS (SELECT 1 FROM json_each(json_extract(eh.fields_json, '$.events')) AS je \
             WHERE json_extract(je.value, '$.kind') = ?)"
        );
    }

    #[test]
    fn test_compile_endpoint_alias() {
        let mut params = Vec::new();
        let sql = compile_filter(&left("tier").eq("Gold"), &mut params, "rh").unwrap();
        assert_eq!(sql, "json_extract(le.fields_json, '$.tier') = ?");
    }

    #[test]
    fn test_bool_param_renders_as_integer() {
        let mut params = Vec::new();
        compile_filter(&field("active").is_true(), &mut params, "eh").unwrap();
        assert_eq!(params, vec![SqlValue::Integer(1)]);
    }
}
