// crates/db/src/choices.rs
//! Criteria choice resolution.
//!
//! A bound criteria resolves to an ordered list of [`Choice`]s: each one a
//! display label plus the row filter selecting its slice of the host
//! table. Sources, in precedence order: a static mapping on the criteria,
//! an `__isnull` path suffix, a boolean field, the field's registered
//! choice set, and finally a `SELECT DISTINCT` over live data.
//!
//! Resolved lists are memoized per binding. The memo key carries the
//! `updated_at` stamps of the chart, criteria and binding, so any
//! configuration save invalidates dependent entries without explicit
//! bookkeeping, and entries are never shared across bindings.

use std::sync::Arc;

use chrono::DateTime;
use chrono_tz::Tz;
use dashstats_core::Operation;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::registry::PathTarget;
use crate::sql::{merge_joins, render_joins, temporal_literal, SqlParams};
use crate::{
    Chart, Criteria, CriteriaBinding, Database, DbError, DbResult, FieldKind,
};

/// Who is looking at the chart. Non-elevated viewers only see rows they
/// own, via the chart's user field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: Option<i64>,
    pub can_view_all: bool,
}

impl Viewer {
    pub fn superuser() -> Self {
        Self {
            user_id: None,
            can_view_all: true,
        }
    }

    pub fn user(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            can_view_all: false,
        }
    }
}

/// A literal headed for a SQL bind parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlLiteral {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

/// The row constraint one choice contributes.
#[derive(Debug, Clone, PartialEq)]
pub enum ChoiceFilter {
    /// No constraint (the "All" choice).
    None,
    IsNull(bool),
    Eq(SqlLiteral),
    In(Vec<SqlLiteral>),
}

impl ChoiceFilter {
    /// Render as a WHERE fragment against `col`, or None for no
    /// constraint.
    pub(crate) fn condition(&self, col: &str, params: &mut SqlParams) -> Option<String> {
        match self {
            ChoiceFilter::None => None,
            ChoiceFilter::IsNull(true) | ChoiceFilter::Eq(SqlLiteral::Null) => {
                Some(format!("{col} IS NULL"))
            }
            ChoiceFilter::IsNull(false) => Some(format!("{col} IS NOT NULL")),
            ChoiceFilter::Eq(lit) => Some(format!("{col} = {}", params.push(lit.clone()))),
            ChoiceFilter::In(values) => {
                if values.is_empty() {
                    return Some("0".to_string());
                }
                let placeholders: Vec<String> =
                    values.iter().map(|v| params.push(v.clone())).collect();
                Some(format!("{col} IN ({})", placeholders.join(", ")))
            }
        }
    }
}

/// One resolved criteria option.
#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    /// Stable key used in request parameters and cache signatures.
    pub key: String,
    pub label: String,
    pub filter: ChoiceFilter,
}

impl Choice {
    fn new(key: impl Into<String>, label: impl Into<String>, filter: ChoiceFilter) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            filter,
        }
    }
}

/// Hard cap on memoized choice lists. Time-scoped windows mint a new
/// key per request window, so the memo needs a bound independent of
/// version-based eviction.
const CHOICES_CACHE_MAX: usize = 256;

/// Memo key: binding identity, config version stamps, and every input
/// that changes the resolved list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ChoicesKey {
    binding_id: i64,
    versions: (i64, i64, i64),
    window: Option<(i64, i64)>,
    count_limit: Option<i64>,
    operation: Option<Operation>,
    operation_field: Option<String>,
    viewer_scope: Option<i64>,
}

/// Interpret a fixed-choice string with the field's storage type, so
/// `"5"` compares as an integer against integer columns.
fn literal_for_kind(kind: FieldKind, raw: &str) -> SqlLiteral {
    match kind {
        FieldKind::Integer | FieldKind::DateTime => raw
            .parse::<i64>()
            .map(SqlLiteral::Int)
            .unwrap_or_else(|_| SqlLiteral::Text(raw.to_string())),
        FieldKind::Float => raw
            .parse::<f64>()
            .map(SqlLiteral::Float)
            .unwrap_or_else(|_| SqlLiteral::Text(raw.to_string())),
        FieldKind::Bool => match raw {
            "true" | "True" | "1" => SqlLiteral::Bool(true),
            "false" | "False" | "0" => SqlLiteral::Bool(false),
            _ => SqlLiteral::Text(raw.to_string()),
        },
        FieldKind::Text | FieldKind::Date => SqlLiteral::Text(raw.to_string()),
    }
}

fn json_filter(value: &serde_json::Value) -> DbResult<ChoiceFilter> {
    Ok(match value {
        serde_json::Value::Null => ChoiceFilter::IsNull(true),
        serde_json::Value::Bool(b) => ChoiceFilter::Eq(SqlLiteral::Bool(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ChoiceFilter::Eq(SqlLiteral::Int(i))
            } else {
                ChoiceFilter::Eq(SqlLiteral::Float(n.as_f64().unwrap_or_default()))
            }
        }
        serde_json::Value::String(s) => ChoiceFilter::Eq(SqlLiteral::Text(s.clone())),
        other => {
            return Err(DbError::BadConfiguration(format!(
                "unsupported mapping value {other}"
            )))
        }
    })
}

/// Parse a criteria's static `dynamic_mapping` JSON. Two historical
/// formats coexist: `{"key": "label"}` where the key doubles as the
/// stored value, and `{"key": [value, label]}` with an explicit value.
pub(crate) fn mapping_choices(mapping: &str, kind: FieldKind) -> DbResult<Vec<Choice>> {
    let parsed: serde_json::Map<String, serde_json::Value> = serde_json::from_str(mapping)?;
    let mut choices = Vec::with_capacity(parsed.len());
    for (key, value) in &parsed {
        let choice = match value {
            serde_json::Value::String(label) => {
                // An empty key is the unconstrained "All" entry.
                let filter = if key.is_empty() {
                    ChoiceFilter::None
                } else {
                    ChoiceFilter::Eq(literal_for_kind(kind, key))
                };
                Choice::new(key.clone(), label.clone(), filter)
            }
            serde_json::Value::Array(pair) if pair.len() == 2 => {
                let label = match &pair[1] {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Choice::new(key.clone(), label, json_filter(&pair[0])?)
            }
            other => {
                return Err(DbError::BadConfiguration(format!(
                    "mapping entry '{key}' must be a label or a [value, label] pair, got {other}"
                )))
            }
        };
        choices.push(choice);
    }
    Ok(choices)
}

fn isnull_choices() -> Vec<Choice> {
    vec![
        Choice::new("", "All", ChoiceFilter::None),
        Choice::new("True", "Blank", ChoiceFilter::IsNull(true)),
        Choice::new("False", "Non blank", ChoiceFilter::IsNull(false)),
    ]
}

fn bool_choices() -> Vec<Choice> {
    vec![
        Choice::new("", "All", ChoiceFilter::None),
        Choice::new("True", "True", ChoiceFilter::Eq(SqlLiteral::Bool(true))),
        Choice::new("False", "False", ChoiceFilter::Eq(SqlLiteral::Bool(false))),
    ]
}

fn decode_value(kind: FieldKind, row: &SqliteRow) -> Result<(String, SqlLiteral), sqlx::Error> {
    Ok(match kind {
        FieldKind::Integer | FieldKind::DateTime => {
            let v: i64 = row.try_get(0)?;
            (v.to_string(), SqlLiteral::Int(v))
        }
        FieldKind::Float => {
            let v: f64 = row.try_get(0)?;
            (v.to_string(), SqlLiteral::Float(v))
        }
        FieldKind::Bool => {
            let v: bool = row.try_get(0)?;
            (v.to_string(), SqlLiteral::Bool(v))
        }
        FieldKind::Text | FieldKind::Date => {
            let v: String = row.try_get(0)?;
            (v.clone(), SqlLiteral::Text(v))
        }
    })
}

/// The ranking aggregate used for `count_limit`. Derived aggregates rank
/// by sample count.
fn ranking_aggregate(operation: Operation, distinct: bool, col: &str) -> String {
    let distinct = if distinct && operation.supports_distinct() {
        "DISTINCT "
    } else {
        ""
    };
    match operation {
        Operation::Sum => format!("TOTAL({distinct}{col})"),
        Operation::Avg => format!("AVG({distinct}{col})"),
        Operation::Min => format!("MIN({col})"),
        Operation::Max => format!("MAX({col})"),
        _ => format!("COUNT({distinct}{col})"),
    }
}

impl Database {
    /// Resolve the choices of one criteria binding.
    ///
    /// `window` only applies when the binding opts into time-scoped
    /// choices; `operation`/`operation_field` drive the `count_limit`
    /// ranking. Results are memoized on this handle.
    #[allow(clippy::too_many_arguments)]
    pub async fn binding_choices(
        &self,
        chart: &Chart,
        binding: &CriteriaBinding,
        criteria: &Criteria,
        window: Option<(DateTime<Tz>, DateTime<Tz>)>,
        operation: Option<Operation>,
        operation_field: Option<&str>,
        viewer: &Viewer,
    ) -> DbResult<Arc<Vec<Choice>>> {
        let window = if binding.choices_based_on_time_range {
            window
        } else {
            None
        };
        let key = ChoicesKey {
            binding_id: binding.id,
            versions: (chart.updated_at, criteria.updated_at, binding.updated_at),
            window: window.map(|(s, u)| (s.timestamp(), u.timestamp())),
            count_limit: binding.count_limit,
            operation,
            operation_field: operation_field.map(str::to_string),
            viewer_scope: if viewer.can_view_all {
                None
            } else {
                viewer.user_id
            },
        };

        {
            let cache = self
                .choices_cache
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(&key) {
                return Ok(Arc::clone(hit));
            }
        }

        let choices = Arc::new(
            self.resolve_choices(chart, binding, criteria, window, operation, operation_field, viewer)
                .await?,
        );
        let mut cache = self
            .choices_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        // Entries for this binding under other config stamps can never
        // hit again; drop them so config saves don't grow the memo.
        cache.retain(|k, _| k.binding_id != key.binding_id || k.versions == key.versions);
        if cache.len() >= CHOICES_CACHE_MAX {
            cache.clear();
        }
        cache.insert(key, Arc::clone(&choices));
        Ok(choices)
    }

    /// Number of memoized choice lists currently held.
    pub fn memoized_choice_count(&self) -> usize {
        self.choices_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve_choices(
        &self,
        chart: &Chart,
        binding: &CriteriaBinding,
        criteria: &Criteria,
        window: Option<(DateTime<Tz>, DateTime<Tz>)>,
        operation: Option<Operation>,
        operation_field: Option<&str>,
        viewer: &Viewer,
    ) -> DbResult<Vec<Choice>> {
        let Some(dynamic_field) = criteria
            .dynamic_field_name
            .as_deref()
            .filter(|s| !s.is_empty())
        else {
            return Ok(Vec::new());
        };
        let path = format!("{}{}", binding.prefix, dynamic_field);
        let model = self
            .registry()
            .get(&chart.model_app_name, &chart.model_name)?;

        if let Some(base) = path.strip_suffix("__isnull") {
            // Validate the base path; the choices themselves are fixed.
            self.registry().resolve_path(model, base, "t")?;
            return Ok(isnull_choices());
        }

        let resolved = self.registry().resolve_path(model, &path, "t")?;
        let kind = resolved.kind();

        if let Some(mapping) = criteria
            .dynamic_mapping
            .as_deref()
            .filter(|s| !s.is_empty())
        {
            return mapping_choices(mapping, kind);
        }

        if kind == FieldKind::Bool {
            return Ok(bool_choices());
        }

        if let PathTarget::Field(field) = &resolved.target {
            if !field.choices.is_empty() {
                return Ok(field
                    .choices
                    .iter()
                    .map(|(value, label)| {
                        Choice::new(
                            value.clone(),
                            label.clone(),
                            ChoiceFilter::Eq(literal_for_kind(kind, value)),
                        )
                    })
                    .collect());
            }
        }

        // Live data: distinct values, optionally scoped and ranked.
        let col = resolved.column_ref();
        let mut joins = Vec::new();
        merge_joins(&mut joins, resolved.joins.clone());

        let mut params = SqlParams::new();
        let mut conds = vec![format!("{col} IS NOT NULL")];
        if kind == FieldKind::Text {
            conds.push(format!("{col} != ''"));
        }

        if let Some((since, until)) = window {
            let date_path = self
                .registry()
                .resolve_path(model, &chart.date_field_name, "t")?;
            merge_joins(&mut joins, date_path.joins.clone());
            let date_col = date_path.column_ref();
            let date_kind = date_path.kind();
            conds.push(format!(
                "{date_col} >= {}",
                params.push(temporal_literal(date_kind, since))
            ));
            conds.push(format!(
                "{date_col} <= {}",
                params.push(temporal_literal(date_kind, until))
            ));
        }

        if !viewer.can_view_all {
            let user_field = chart
                .user_field_name
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or(DbError::UserFieldRequired)?;
            let user_path = self.registry().resolve_path(model, user_field, "t")?;
            merge_joins(&mut joins, user_path.joins.clone());
            let user_lit = viewer
                .user_id
                .map(SqlLiteral::Int)
                .unwrap_or(SqlLiteral::Null);
            conds.push(format!(
                "{} = {}",
                user_path.column_ref(),
                params.push(user_lit)
            ));
        }

        let join_sql = render_joins(&joins);
        let where_sql = conds.join(" AND ");

        if let Some(limit) = binding.count_limit {
            let op = operation.unwrap_or(Operation::Count);
            let op_col = match operation_field.filter(|s| !s.is_empty()) {
                Some(field) => {
                    let op_path = self.registry().resolve_path(model, field, "t")?;
                    // Ranking only reads the column; extra joins from the
                    // operation field still have to be present.
                    let mut ranked_joins = joins.clone();
                    merge_joins(&mut ranked_joins, op_path.joins.clone());
                    return self
                        .ranked_choices(
                            model.table.as_str(),
                            &col,
                            kind,
                            &render_joins(&ranked_joins),
                            &where_sql,
                            params,
                            ranking_aggregate(op, chart.distinct, &op_path.column_ref()),
                            limit,
                        )
                        .await;
                }
                None => format!("t.{}", model.pk),
            };
            return self
                .ranked_choices(
                    model.table.as_str(),
                    &col,
                    kind,
                    &join_sql,
                    &where_sql,
                    params,
                    ranking_aggregate(op, chart.distinct, &op_col),
                    limit,
                )
                .await;
        }

        let sql = format!(
            "SELECT DISTINCT {col} FROM {} t{join_sql} WHERE {where_sql} ORDER BY {col}",
            model.table
        );
        let rows = params
            .bind_all(sqlx::query(&sql))
            .fetch_all(self.pool())
            .await?;
        rows.iter()
            .map(|row| {
                let (key, lit) = decode_value(kind, row)?;
                Ok(Choice::new(key.clone(), key, ChoiceFilter::Eq(lit)))
            })
            .collect()
    }

    /// Top-N choices by aggregate, remainder folded into `other`.
    #[allow(clippy::too_many_arguments)]
    async fn ranked_choices(
        &self,
        table: &str,
        col: &str,
        kind: FieldKind,
        join_sql: &str,
        where_sql: &str,
        params: SqlParams,
        aggregate: String,
        limit: i64,
    ) -> DbResult<Vec<Choice>> {
        let sql = format!(
            "SELECT {col}, {aggregate} AS score FROM {table} t{join_sql}
             WHERE {where_sql} GROUP BY {col} ORDER BY score DESC, {col}"
        );
        let rows = params
            .bind_all(sqlx::query(&sql))
            .fetch_all(self.pool())
            .await?;

        let mut choices = Vec::new();
        let mut excluded = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            let (key, lit) = decode_value(kind, row)?;
            if (i as i64) < limit {
                choices.push(Choice::new(key.clone(), key, ChoiceFilter::Eq(lit)));
            } else {
                excluded.push(lit);
            }
        }
        if !excluded.is_empty() {
            choices.push(Choice::new("other", "other", ChoiceFilter::In(excluded)));
        }
        Ok(choices)
    }
}
