//! Typed query DSL over the repository protocol.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde_json::Value;

use trellis_core::error::{Result, TrellisError};
use trellis_core::filter::{CompareOp, FieldRef, FilterExpr, ScalarValue};
use trellis_core::model::{Entity, Hydrated, Meta, Relation};
use trellis_core::repo::{
    AggSpec, Aggregate, Direction, EndpointTypes, EntityRow, GroupBySpec, HavingSpec, QuerySpec,
    RelationRow, Repository, TemporalMode,
};
use trellis_core::JsonMap;

/// Entry point for building queries, bound to a repository snapshot and
/// the session's validated schema version map.
pub struct QueryBuilder<'a> {
    repo: &'a dyn Repository,
    schema_version_ids: BTreeMap<String, i64>,
}

impl<'a> QueryBuilder<'a> {
    pub(crate) fn new(
        repo: &'a dyn Repository,
        schema_version_ids: BTreeMap<String, i64>,
    ) -> QueryBuilder<'a> {
        QueryBuilder {
            repo,
            schema_version_ids,
        }
    }

    pub fn entities<E: Entity>(&self) -> EntityQuery<'a, E> {
        EntityQuery {
            repo: self.repo,
            spec: QuerySpec {
                schema_version_id: self.schema_version_ids.get(E::type_name()).copied(),
                ..Default::default()
            },
            _marker: PhantomData,
        }
    }

    pub fn relations<R: Relation>(&self) -> RelationQuery<'a, R> {
        RelationQuery {
            repo: self.repo,
            spec: QuerySpec {
                schema_version_id: self.schema_version_ids.get(R::type_name()).copied(),
                ..Default::default()
            },
            _marker: PhantomData,
        }
    }
}

fn hydrate_entity<E: Entity>(row: EntityRow) -> Result<Hydrated<E>> {
    let schema = E::schema();
    let mut fields = row.fields;
    if let Some(pk) = &schema.primary_key_field {
        fields.insert(pk.clone(), Value::from(row.key.clone()));
    }
    let value: E = serde_json::from_value(Value::Object(fields))
        .map_err(|e| TrellisError::Serialization(e.to_string()))?;
    Ok(Hydrated {
        value,
        meta: Meta {
            commit_id: row.commit_id,
            type_name: E::type_name().to_string(),
            key: Some(row.key),
            left_key: None,
            right_key: None,
            instance_key: None,
        },
    })
}

/// A relation result with its metadata and hydrated endpoint entities.
#[derive(Clone)]
pub struct RelationHit<R: Relation> {
    pub value: R,
    pub meta: Meta,
    pub left: Option<Hydrated<R::Left>>,
    pub right: Option<Hydrated<R::Right>>,
}

impl<R: Relation> std::ops::Deref for RelationHit<R> {
    type Target = R;
    fn deref(&self) -> &R {
        &self.value
    }
}

fn hydrate_relation<R: Relation>(
    repo: &dyn Repository,
    row: RelationRow,
) -> Result<RelationHit<R>> {
    let schema = R::schema();
    let mut fields = row.fields;
    fields.insert("left_key".to_string(), Value::from(row.left_key.clone()));
    fields.insert("right_key".to_string(), Value::from(row.right_key.clone()));
    if let Some(ik_field) = &schema.instance_key_field {
        fields.insert(ik_field.clone(), Value::from(row.instance_key.clone()));
    }
    let value: R = serde_json::from_value(Value::Object(fields))
        .map_err(|e| TrellisError::Serialization(e.to_string()))?;

    let left = repo
        .latest_entity(R::Left::type_name(), &row.left_key)?
        .map(hydrate_entity::<R::Left>)
        .transpose()?;
    let right = repo
        .latest_entity(R::Right::type_name(), &row.right_key)?
        .map(hydrate_entity::<R::Right>)
        .transpose()?;

    Ok(RelationHit {
        value,
        meta: Meta {
            commit_id: row.commit_id,
            type_name: R::type_name().to_string(),
            key: None,
            left_key: Some(row.left_key),
            right_key: Some(row.right_key),
            instance_key: if row.instance_key.is_empty() {
                None
            } else {
                Some(row.instance_key)
            },
        },
        left,
        right,
    })
}

/// Type-safe query builder for entities.
pub struct EntityQuery<'a, E: Entity> {
    repo: &'a dyn Repository,
    spec: QuerySpec,
    _marker: PhantomData<E>,
}

impl<'a, E: Entity> EntityQuery<'a, E> {
    pub fn where_(mut self, expr: FilterExpr) -> Self {
        self.spec.filter = Some(match self.spec.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn order_by(mut self, field: FieldRef) -> Self {
        self.spec.order_by = Some(field.field_path().to_string());
        self.spec.order_desc = false;
        self
    }

    pub fn order_by_desc(mut self, field: FieldRef) -> Self {
        self.spec.order_by = Some(field.field_path().to_string());
        self.spec.order_desc = true;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.spec.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.spec.offset = Some(n);
        self
    }

    pub fn as_of(mut self, commit_id: i64) -> Self {
        self.spec.temporal = TemporalMode::AsOf(commit_id);
        self
    }

    pub fn with_history(mut self) -> Self {
        self.spec.temporal = TemporalMode::WithHistory;
        self
    }

    pub fn history_since(mut self, commit_id: i64) -> Self {
        self.spec.temporal = TemporalMode::HistorySince(commit_id);
        self
    }

    pub fn collect(self) -> Result<Vec<Hydrated<E>>> {
        let rows = self.repo.query_entities(E::type_name(), &self.spec)?;
        rows.into_iter().map(hydrate_entity).collect()
    }

    pub fn first(mut self) -> Result<Option<Hydrated<E>>> {
        self.spec.limit = Some(1);
        Ok(self.collect()?.into_iter().next())
    }

    /// Traverse outgoing relations of type `R`, producing root-tagged
    /// paths. Traversals are lookup-only; no aggregation.
    pub fn via<R: Relation>(self) -> TraversalQuery<'a, E> {
        TraversalQuery {
            repo: self.repo,
            source_filter: self.spec.filter,
            hops: vec![Hop {
                relation_type: R::type_name().to_string(),
                left_type: R::Left::type_name().to_string(),
                right_type: R::Right::type_name().to_string(),
            }],
            _marker: PhantomData,
        }
    }

    pub fn count(self) -> Result<u64> {
        self.repo
            .count_entities(E::type_name(), self.spec.filter.as_ref())
    }

    /// Count rows matching the current filter AND an extra predicate,
    /// typically an existential one.
    pub fn count_where(self, predicate: FilterExpr) -> Result<u64> {
        let combined = match self.spec.filter {
            Some(existing) => existing.and(predicate),
            None => predicate,
        };
        self.repo.count_entities(E::type_name(), Some(&combined))
    }

    fn aggregate(self, func: Aggregate, field: FieldRef) -> Result<Value> {
        self.repo.aggregate_entities(
            E::type_name(),
            &AggSpec {
                func,
                field: Some(field.field_path().to_string()),
            },
            self.spec.filter.as_ref(),
        )
    }

    pub fn sum(self, field: FieldRef) -> Result<Value> {
        self.aggregate(Aggregate::Sum, field)
    }

    pub fn avg(self, field: FieldRef) -> Result<Value> {
        self.aggregate(Aggregate::Avg, field)
    }

    pub fn min_(self, field: FieldRef) -> Result<Value> {
        self.aggregate(Aggregate::Min, field)
    }

    pub fn max_(self, field: FieldRef) -> Result<Value> {
        self.aggregate(Aggregate::Max, field)
    }

    /// Average list length of a list field: null lists excluded, empty
    /// lists contribute zero; all-null yields `None`.
    pub fn avg_len(self, field: FieldRef) -> Result<Option<f64>> {
        Ok(self
            .aggregate(Aggregate::AvgLen, field)?
            .as_f64())
    }

    pub fn group_by(self, field: FieldRef) -> GroupedQuery<'a> {
        GroupedQuery {
            repo: self.repo,
            type_name: E::type_name().to_string(),
            kind: GroupKind::Entity,
            endpoints: EndpointTypes::default(),
            group_field: field.field_path().to_string(),
            filter: self.spec.filter,
            having: None,
        }
    }
}

/// Type-safe query builder for relations.
pub struct RelationQuery<'a, R: Relation> {
    repo: &'a dyn Repository,
    spec: QuerySpec,
    _marker: PhantomData<R>,
}

impl<'a, R: Relation> RelationQuery<'a, R> {
    fn endpoints() -> EndpointTypes {
        EndpointTypes {
            left: Some(R::Left::type_name().to_string()),
            right: Some(R::Right::type_name().to_string()),
        }
    }

    pub fn where_(mut self, expr: FilterExpr) -> Self {
        self.spec.filter = Some(match self.spec.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn order_by(mut self, field: FieldRef) -> Self {
        self.spec.order_by = Some(field.field_path().to_string());
        self.spec.order_desc = false;
        self
    }

    pub fn order_by_desc(mut self, field: FieldRef) -> Self {
        self.spec.order_by = Some(field.field_path().to_string());
        self.spec.order_desc = true;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.spec.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.spec.offset = Some(n);
        self
    }

    pub fn as_of(mut self, commit_id: i64) -> Self {
        self.spec.temporal = TemporalMode::AsOf(commit_id);
        self
    }

    pub fn with_history(mut self) -> Self {
        self.spec.temporal = TemporalMode::WithHistory;
        self
    }

    pub fn history_since(mut self, commit_id: i64) -> Self {
        self.spec.temporal = TemporalMode::HistorySince(commit_id);
        self
    }

    pub fn collect(self) -> Result<Vec<RelationHit<R>>> {
        let rows =
            self.repo
                .query_relations(R::type_name(), &Self::endpoints(), &self.spec)?;
        rows.into_iter()
            .map(|row| hydrate_relation(self.repo, row))
            .collect()
    }

    pub fn first(mut self) -> Result<Option<RelationHit<R>>> {
        self.spec.limit = Some(1);
        Ok(self.collect()?.into_iter().next())
    }

    pub fn count(self) -> Result<u64> {
        self.repo.count_relations(
            R::type_name(),
            &Self::endpoints(),
            self.spec.filter.as_ref(),
        )
    }

    pub fn count_where(self, predicate: FilterExpr) -> Result<u64> {
        let combined = match self.spec.filter {
            Some(existing) => existing.and(predicate),
            None => predicate,
        };
        self.repo
            .count_relations(R::type_name(), &Self::endpoints(), Some(&combined))
    }

    fn aggregate(self, func: Aggregate, field: FieldRef) -> Result<Value> {
        self.repo.aggregate_relations(
            R::type_name(),
            &AggSpec {
                func,
                field: Some(field.field_path().to_string()),
            },
            self.spec.filter.as_ref(),
        )
    }

    pub fn sum(self, field: FieldRef) -> Result<Value> {
        self.aggregate(Aggregate::Sum, field)
    }

    pub fn avg(self, field: FieldRef) -> Result<Value> {
        self.aggregate(Aggregate::Avg, field)
    }

    pub fn min_(self, field: FieldRef) -> Result<Value> {
        self.aggregate(Aggregate::Min, field)
    }

    pub fn max_(self, field: FieldRef) -> Result<Value> {
        self.aggregate(Aggregate::Max, field)
    }

    pub fn avg_len(self, field: FieldRef) -> Result<Option<f64>> {
        Ok(self
            .aggregate(Aggregate::AvgLen, field)?
            .as_f64())
    }

    pub fn group_by(self, field: FieldRef) -> GroupedQuery<'a> {
        GroupedQuery {
            repo: self.repo,
            type_name: R::type_name().to_string(),
            kind: GroupKind::Relation,
            endpoints: Self::endpoints(),
            group_field: field.field_path().to_string(),
            filter: self.spec.filter,
            having: None,
        }
    }
}

// --- Grouped aggregation ---

enum GroupKind {
    Entity,
    Relation,
}

/// Aggregation builder for `group_by(...).agg(...)`.
#[derive(Debug, Clone)]
pub struct AggBuilder {
    spec: AggSpec,
}

pub fn count() -> AggBuilder {
    AggBuilder {
        spec: AggSpec {
            func: Aggregate::Count,
            field: None,
        },
    }
}

fn field_agg(func: Aggregate, field: FieldRef) -> AggBuilder {
    AggBuilder {
        spec: AggSpec {
            func,
            field: Some(field.field_path().to_string()),
        },
    }
}

pub fn sum(field: FieldRef) -> AggBuilder {
    field_agg(Aggregate::Sum, field)
}

pub fn avg(field: FieldRef) -> AggBuilder {
    field_agg(Aggregate::Avg, field)
}

pub fn min(field: FieldRef) -> AggBuilder {
    field_agg(Aggregate::Min, field)
}

pub fn max(field: FieldRef) -> AggBuilder {
    field_agg(Aggregate::Max, field)
}

impl AggBuilder {
    fn having(self, op: CompareOp, value: ScalarValue) -> HavingExpr {
        HavingExpr {
            spec: HavingSpec {
                agg: self.spec,
                op,
                value: value.into_value(),
            },
        }
    }

    pub fn gt(self, value: impl Into<ScalarValue>) -> HavingExpr {
        self.having(CompareOp::Gt, value.into())
    }

    pub fn ge(self, value: impl Into<ScalarValue>) -> HavingExpr {
        self.having(CompareOp::Ge, value.into())
    }

    pub fn lt(self, value: impl Into<ScalarValue>) -> HavingExpr {
        self.having(CompareOp::Lt, value.into())
    }

    pub fn le(self, value: impl Into<ScalarValue>) -> HavingExpr {
        self.having(CompareOp::Le, value.into())
    }

    pub fn eq(self, value: impl Into<ScalarValue>) -> HavingExpr {
        self.having(CompareOp::Eq, value.into())
    }

    pub fn ne(self, value: impl Into<ScalarValue>) -> HavingExpr {
        self.having(CompareOp::Ne, value.into())
    }
}

/// A HAVING clause built from an aggregation comparison.
#[derive(Debug, Clone)]
pub struct HavingExpr {
    spec: HavingSpec,
}

/// Grouped aggregation terminal: `.group_by(f).having(...).agg(...)`.
pub struct GroupedQuery<'a> {
    repo: &'a dyn Repository,
    type_name: String,
    kind: GroupKind,
    endpoints: EndpointTypes,
    group_field: String,
    filter: Option<FilterExpr>,
    having: Option<HavingSpec>,
}

impl GroupedQuery<'_> {
    pub fn having(mut self, expr: HavingExpr) -> Self {
        self.having = Some(expr.spec);
        self
    }

    /// Execute the grouped aggregation, returning one row per group with
    /// the group key plus the named aggregates.
    pub fn agg(self, aggs: Vec<(&str, AggBuilder)>) -> Result<Vec<JsonMap>> {
        let spec = GroupBySpec {
            group_field: self.group_field,
            aggs: aggs
                .into_iter()
                .map(|(alias, builder)| (alias.to_string(), builder.spec))
                .collect(),
            having: self.having,
        };
        match self.kind {
            GroupKind::Entity => {
                self.repo
                    .group_by_entities(&self.type_name, &spec, self.filter.as_ref())
            }
            GroupKind::Relation => self.repo.group_by_relations(
                &self.type_name,
                &self.endpoints,
                &spec,
                self.filter.as_ref(),
            ),
        }
    }
}

// --- Traversal ---

struct Hop {
    relation_type: String,
    left_type: String,
    right_type: String,
}

/// A traversal result rooted at a source entity. Hop rows are dynamic;
/// destination entities of the final hop are deduplicated per source.
#[derive(Debug, Clone)]
pub struct Path<E> {
    pub source: Hydrated<E>,
    pub relations: Vec<RelationRow>,
    pub destinations: Vec<EntityRow>,
}

/// Iteratively-evaluated traversal from typed sources through one or
/// more relation types.
pub struct TraversalQuery<'a, E: Entity> {
    repo: &'a dyn Repository,
    source_filter: Option<FilterExpr>,
    hops: Vec<Hop>,
    _marker: PhantomData<E>,
}

impl<'a, E: Entity> TraversalQuery<'a, E> {
    pub fn via<R: Relation>(mut self) -> TraversalQuery<'a, E> {
        self.hops.push(Hop {
            relation_type: R::type_name().to_string(),
            left_type: R::Left::type_name().to_string(),
            right_type: R::Right::type_name().to_string(),
        });
        self
    }

    pub fn where_(mut self, expr: FilterExpr) -> Self {
        self.source_filter = Some(match self.source_filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn collect(self) -> Result<Vec<Path<E>>> {
        let source_spec = QuerySpec {
            filter: self.source_filter.clone(),
            ..Default::default()
        };
        let source_rows = self.repo.query_entities(E::type_name(), &source_spec)?;

        let mut paths = Vec::new();
        for source_row in source_rows {
            let source_key = source_row.key.clone();
            let source = hydrate_entity::<E>(source_row)?;

            let mut relations: Vec<RelationRow> = Vec::new();
            let mut current_keys = vec![source_key];
            let mut current_type = E::type_name().to_string();
            let mut destination_type = current_type.clone();

            for hop in &self.hops {
                // Orient the hop from whichever endpoint matches the
                // current frontier type.
                let (direction, far_type) = if hop.left_type == current_type {
                    (Direction::Left, hop.right_type.clone())
                } else {
                    (Direction::Right, hop.left_type.clone())
                };

                let mut next_keys = Vec::new();
                for key in &current_keys {
                    let hop_rows =
                        self.repo
                            .relations_for_entity(&hop.relation_type, key, direction)?;
                    for row in hop_rows {
                        let far_key = match direction {
                            Direction::Left => row.right_key.clone(),
                            Direction::Right => row.left_key.clone(),
                        };
                        next_keys.push(far_key);
                        relations.push(row);
                    }
                }
                current_keys = next_keys;
                current_type = far_type.clone();
                destination_type = far_type;
            }

            // A destination appears once per source path regardless of
            // how many relations connect it.
            let mut seen = std::collections::BTreeSet::new();
            let mut destinations = Vec::new();
            for key in &current_keys {
                if !seen.insert(key.clone()) {
                    continue;
                }
                if let Some(row) = self.repo.latest_entity(&destination_type, key)? {
                    destinations.push(row);
                }
            }

            paths.push(Path {
                source,
                relations,
                destinations,
            });
        }
        Ok(paths)
    }
}
