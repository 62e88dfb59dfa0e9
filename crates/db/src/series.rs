// crates/db/src/series.rs
//! Multi-series time-series assembly.
//!
//! Bucket boundaries are computed in Rust (SQLite has no timezone
//! tables) and shipped to the query as an inline `buckets(idx, lo, hi)`
//! CTE; each series becomes one `FILTER (WHERE ...)`-qualified aggregate
//! column, so a whole chart is a single query. Buckets with no rows
//! produce no group and are zero-filled afterwards; buckets whose
//! aggregate is SQL NULL (e.g. SUM over no matching rows) stay `None`.
//!
//! StdDev/Variance ship as (count, sum, sum-of-squares) column triples
//! finished here, because SQLite has no stddev built-in.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dashstats_core::{enumerate_buckets, truncate_ceiling, Interval, Operation};
use sqlx::Row;

use crate::choices::{ChoiceFilter, SqlLiteral, Viewer};
use crate::registry::JoinStep;
use crate::sql::{merge_joins, render_joins, temporal_literal, SqlParams};
use crate::{Chart, Database, DbError, DbResult, FieldKind};

/// bucket start → series label → value. `None` means the bucket had rows
/// but the aggregate itself was NULL.
pub type SeriesMap = BTreeMap<DateTime<Tz>, BTreeMap<String, Option<f64>>>;

/// One chart rendering request.
#[derive(Debug, Clone)]
pub struct SeriesRequest {
    pub time_since: DateTime<Utc>,
    pub time_until: DateTime<Utc>,
    pub interval: Interval,
    /// Override of the chart's configured operation.
    pub operation: Option<Operation>,
    /// Chosen operation field. `None` falls back to the chart's first
    /// configured field; `Some("")` with several configured fields turns
    /// every field into its own series.
    pub operation_field: Option<String>,
    /// Binding whose resolved choices each become one series.
    pub series_binding: Option<i64>,
    /// Per-binding chosen filter choice (binding id → choice key).
    pub dynamic_filters: BTreeMap<i64, String>,
    pub viewer: Viewer,
}

impl SeriesRequest {
    pub fn new(time_since: DateTime<Utc>, time_until: DateTime<Utc>, interval: Interval) -> Self {
        Self {
            time_since,
            time_until,
            interval,
            operation: None,
            operation_field: None,
            series_binding: None,
            dynamic_filters: BTreeMap::new(),
            viewer: Viewer::superuser(),
        }
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn with_operation_field(mut self, field: impl Into<String>) -> Self {
        self.operation_field = Some(field.into());
        self
    }

    pub fn with_series_binding(mut self, binding_id: i64) -> Self {
        self.series_binding = Some(binding_id);
        self
    }

    pub fn with_dynamic_filter(mut self, binding_id: i64, choice_key: impl Into<String>) -> Self {
        self.dynamic_filters.insert(binding_id, choice_key.into());
        self
    }

    pub fn with_viewer(mut self, viewer: Viewer) -> Self {
        self.viewer = viewer;
        self
    }
}

/// How a series' result columns decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeriesShape {
    /// One column, already the value.
    Plain,
    /// (count, sum, sum of squares) finished as variance.
    Variance,
    /// Like `Variance`, then square-rooted.
    StdDev,
    /// (matching rows, distinct owning rows) finished as a ratio.
    PerInstance,
}

impl SeriesShape {
    fn width(self) -> usize {
        match self {
            SeriesShape::Plain => 1,
            SeriesShape::PerInstance => 2,
            SeriesShape::Variance | SeriesShape::StdDev => 3,
        }
    }

    fn for_operation(op: Operation) -> Self {
        match op {
            Operation::Variance => SeriesShape::Variance,
            Operation::StdDev => SeriesShape::StdDev,
            Operation::AvgCountPerInstance => SeriesShape::PerInstance,
            _ => SeriesShape::Plain,
        }
    }
}

struct SeriesSpec {
    label: String,
    /// Aggregated column reference.
    col: String,
    shape: SeriesShape,
    /// Rendered FILTER condition, placeholders already registered.
    filter_cond: Option<String>,
}

/// Population variance from (n, Σx, Σx²); NULL components mean the
/// filter matched no rows.
fn finish_variance(n: Option<f64>, sum: Option<f64>, sumsq: Option<f64>) -> Option<f64> {
    match (n, sum, sumsq) {
        (Some(n), Some(sum), Some(sumsq)) if n > 0.0 => {
            let mean = sum / n;
            Some(sumsq / n - mean * mean)
        }
        _ => None,
    }
}

fn aggregate_columns(
    op: Operation,
    distinct: bool,
    col: &str,
    pk_col: &str,
    filter: &Option<String>,
) -> Vec<String> {
    let suffix = match filter {
        Some(cond) => format!(" FILTER (WHERE {cond})"),
        None => String::new(),
    };
    let d = if distinct && op.supports_distinct() {
        "DISTINCT "
    } else {
        ""
    };
    let real = format!("CAST({col} AS REAL)");
    match op {
        Operation::Count => vec![format!("CAST(COUNT({d}{col}){suffix} AS REAL)")],
        Operation::DistinctCount => vec![format!("CAST(COUNT(DISTINCT {col}){suffix} AS REAL)")],
        Operation::Sum => vec![format!("CAST(SUM({d}{real}){suffix} AS REAL)")],
        Operation::Avg => vec![format!("CAST(AVG({d}{real}){suffix} AS REAL)")],
        Operation::Min => vec![format!("CAST(MIN({real}){suffix} AS REAL)")],
        Operation::Max => vec![format!("CAST(MAX({real}){suffix} AS REAL)")],
        Operation::StdDev | Operation::Variance => vec![
            format!("CAST(COUNT({col}){suffix} AS REAL)"),
            format!("CAST(SUM({real}){suffix} AS REAL)"),
            format!("CAST(SUM({real} * {real}){suffix} AS REAL)"),
        ],
        Operation::AvgCountPerInstance => vec![
            format!("CAST(COUNT({d}{col}){suffix} AS REAL)"),
            format!(
                "CAST(COUNT(DISTINCT CASE WHEN {col} IS NOT NULL THEN {pk_col} END){suffix} AS REAL)"
            ),
        ],
    }
}

impl Database {
    /// Compute a chart's multi-series map directly from host data.
    pub async fn compute_series(
        &self,
        chart: &Chart,
        request: &SeriesRequest,
    ) -> DbResult<SeriesMap> {
        if request.time_since > request.time_until {
            return Err(DbError::TimeRange);
        }
        let tz = self.charts_timezone();
        let since = request.time_since.with_timezone(&tz);
        let until = request.time_until.with_timezone(&tz);
        let buckets = enumerate_buckets(request.interval, since, until);
        if buckets.is_empty() {
            return Ok(SeriesMap::new());
        }

        let model = self
            .registry()
            .get(&chart.model_app_name, &chart.model_name)?;
        let date_path = self
            .registry()
            .resolve_path(model, &chart.date_field_name, "t")?;
        let date_kind = date_path.kind();
        // Date columns carry no time of day; every hour bucket of a day
        // would share the same calendar-date bounds and recount its rows.
        if date_kind == FieldKind::Date && request.interval == Interval::Hours {
            return Err(DbError::BadConfiguration(format!(
                "'{}' stores calendar dates and cannot be bucketed by hours",
                chart.date_field_name
            )));
        }
        let date_col = date_path.column_ref();
        let pk_col = format!("t.{}", model.pk);

        let mut joins: Vec<JoinStep> = Vec::new();
        merge_joins(&mut joins, date_path.joins.clone());
        let mut params = SqlParams::new();
        let mut conds: Vec<String> = Vec::new();

        let operation = request
            .operation
            .or(chart.operation)
            .unwrap_or(Operation::Count);

        // Pick the aggregated column(s).
        let candidates = chart.operation_fields();
        let nonempty: Vec<&String> = candidates.iter().filter(|f| !f.is_empty()).collect();
        let chosen = request.operation_field.as_deref();
        let multi_field_mode = matches!(chosen, None | Some("")) && nonempty.len() > 1;

        let mut specs: Vec<SeriesSpec> = Vec::new();
        let shape = SeriesShape::for_operation(operation);

        if multi_field_mode {
            for field in &nonempty {
                let path = self.registry().resolve_path(model, field, "t")?;
                merge_joins(&mut joins, path.joins.clone());
                specs.push(SeriesSpec {
                    label: (*field).clone(),
                    col: path.column_ref(),
                    shape,
                    filter_cond: None,
                });
            }
        } else {
            let single_field = match chosen {
                Some(f) if !f.is_empty() => {
                    if !candidates.iter().any(|c| c == f) {
                        return Err(DbError::BadConfiguration(format!(
                            "'{f}' is not one of the chart's operation fields"
                        )));
                    }
                    Some(f.to_string())
                }
                _ => nonempty.first().map(|f| (*f).clone()),
            };
            let col = match &single_field {
                Some(field) => {
                    let path = self.registry().resolve_path(model, field, "t")?;
                    merge_joins(&mut joins, path.joins.clone());
                    path.column_ref()
                }
                None => pk_col.clone(),
            };

            match request.series_binding {
                Some(binding_id) => {
                    let binding = self.get_binding(binding_id).await?;
                    let criteria = self.get_criteria(binding.criteria_id).await?;
                    let dynamic_field = criteria
                        .dynamic_field_name
                        .clone()
                        .filter(|s| !s.is_empty())
                        .ok_or_else(|| {
                            DbError::BadConfiguration(format!(
                                "criteria '{}' has no dynamic field to split series on",
                                criteria.name
                            ))
                        })?;
                    let series_path = format!("{}{}", binding.prefix, dynamic_field);
                    let series_resolved = if series_path.ends_with("__isnull") {
                        self.registry().resolve_path(
                            model,
                            series_path.trim_end_matches("__isnull"),
                            "t",
                        )?
                    } else {
                        self.registry().resolve_path(model, &series_path, "t")?
                    };
                    merge_joins(&mut joins, series_resolved.joins.clone());
                    let series_col = series_resolved.column_ref();

                    let choices = self
                        .binding_choices(
                            chart,
                            &binding,
                            &criteria,
                            Some((since, until)),
                            Some(operation),
                            single_field.as_deref(),
                            &request.viewer,
                        )
                        .await?;
                    for choice in choices.iter() {
                        // The unconstrained "All" choice never becomes a
                        // series of its own.
                        if choice.filter == ChoiceFilter::None {
                            continue;
                        }
                        let cond = choice.filter.condition(&series_col, &mut params);
                        specs.push(SeriesSpec {
                            label: choice.label.clone(),
                            col: col.clone(),
                            shape,
                            filter_cond: cond,
                        });
                    }
                }
                None => {
                    specs.push(SeriesSpec {
                        label: String::new(),
                        col,
                        shape,
                        filter_cond: None,
                    });
                }
            }
        }

        // Always-on criteria filters: fixed mappings and chosen dynamic
        // filter options.
        let bindings = self.bindings_for_chart(chart.id).await?;
        for binding in &bindings {
            if Some(binding.id) == request.series_binding {
                continue;
            }
            let criteria = self.get_criteria(binding.criteria_id).await?;
            if let Some(mapping) = criteria.fix_mapping.as_deref().filter(|s| !s.is_empty()) {
                let parsed: serde_json::Map<String, serde_json::Value> =
                    serde_json::from_str(mapping)?;
                for (field_path, value) in &parsed {
                    let path = self.registry().resolve_path(model, field_path, "t")?;
                    merge_joins(&mut joins, path.joins.clone());
                    let cond = match value {
                        serde_json::Value::Null => {
                            format!("{} IS NULL", path.column_ref())
                        }
                        serde_json::Value::Bool(b) => format!(
                            "{} = {}",
                            path.column_ref(),
                            params.push(SqlLiteral::Bool(*b))
                        ),
                        serde_json::Value::Number(n) => {
                            let lit = n
                                .as_i64()
                                .map(SqlLiteral::Int)
                                .unwrap_or(SqlLiteral::Float(n.as_f64().unwrap_or_default()));
                            format!("{} = {}", path.column_ref(), params.push(lit))
                        }
                        serde_json::Value::String(s) => format!(
                            "{} = {}",
                            path.column_ref(),
                            params.push(SqlLiteral::Text(s.clone()))
                        ),
                        other => {
                            return Err(DbError::BadConfiguration(format!(
                                "unsupported fix mapping value {other}"
                            )))
                        }
                    };
                    conds.push(cond);
                }
            }

            let Some(chosen_key) = request
                .dynamic_filters
                .get(&binding.id)
                .filter(|k| !k.is_empty())
            else {
                continue;
            };
            let dynamic_field = criteria
                .dynamic_field_name
                .clone()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    DbError::BadConfiguration(format!(
                        "criteria '{}' has no dynamic field to filter on",
                        criteria.name
                    ))
                })?;
            let filter_path = format!("{}{}", binding.prefix, dynamic_field);
            let filter_resolved = if filter_path.ends_with("__isnull") {
                self.registry()
                    .resolve_path(model, filter_path.trim_end_matches("__isnull"), "t")?
            } else {
                self.registry().resolve_path(model, &filter_path, "t")?
            };
            merge_joins(&mut joins, filter_resolved.joins.clone());

            let choices = self
                .binding_choices(
                    chart,
                    binding,
                    &criteria,
                    Some((since, until)),
                    Some(operation),
                    None,
                    &request.viewer,
                )
                .await?;
            let choice = choices
                .iter()
                .find(|c| c.key == *chosen_key)
                .ok_or_else(|| {
                    DbError::BadConfiguration(format!(
                        "'{chosen_key}' is not a choice of criteria '{}'",
                        criteria.name
                    ))
                })?;
            if let Some(cond) = choice
                .filter
                .condition(&filter_resolved.column_ref(), &mut params)
            {
                conds.push(cond);
            }
        }

        if !request.viewer.can_view_all {
            let user_field = chart
                .user_field_name
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or(DbError::UserFieldRequired)?;
            let user_path = self.registry().resolve_path(model, user_field, "t")?;
            merge_joins(&mut joins, user_path.joins.clone());
            let lit = request
                .viewer
                .user_id
                .map(SqlLiteral::Int)
                .unwrap_or(SqlLiteral::Null);
            conds.push(format!("{} = {}", user_path.column_ref(), params.push(lit)));
        }

        // Window bounds on top of the per-bucket join, so rows outside
        // [since, until] never count even inside the edge buckets' span.
        conds.push(format!(
            "{date_col} >= {}",
            params.push(temporal_literal(date_kind, since))
        ));
        conds.push(format!(
            "{date_col} <= {}",
            params.push(temporal_literal(date_kind, until))
        ));

        // Bucket bounds are trusted computed values; inlining them keeps
        // the bind count flat for long hour-scale windows.
        let values: Vec<String> = buckets
            .iter()
            .enumerate()
            .map(|(i, start)| {
                let lo = inline_literal(temporal_literal(date_kind, *start));
                let hi = inline_literal(temporal_literal(
                    date_kind,
                    truncate_ceiling(*start, request.interval),
                ));
                format!("({i}, {lo}, {hi})")
            })
            .collect();

        let mut select_cols = vec!["b.idx".to_string()];
        for spec in &specs {
            select_cols.extend(aggregate_columns(
                operation,
                chart.distinct,
                &spec.col,
                &pk_col,
                &spec.filter_cond,
            ));
        }

        let where_sql = if conds.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conds.join(" AND "))
        };
        // Relation joins come before the buckets join so its ON clause
        // can reference a related date column.
        let sql = format!(
            "WITH buckets(idx, lo, hi) AS (VALUES {values}) \
             SELECT {select} FROM {table} t{joins} \
             JOIN buckets b ON {date_col} >= b.lo AND {date_col} <= b.hi{where_sql} \
             GROUP BY b.idx",
            values = values.join(", "),
            select = select_cols.join(", "),
            table = model.table,
            joins = render_joins(&joins),
        );

        let rows = params
            .bind_all(sqlx::query(&sql))
            .fetch_all(self.pool())
            .await?;

        // Zero-fill every bucket for every series, then overwrite from
        // the returned groups.
        let mut result = SeriesMap::new();
        for start in &buckets {
            let series: BTreeMap<String, Option<f64>> = specs
                .iter()
                .map(|s| (s.label.clone(), Some(0.0)))
                .collect();
            result.insert(*start, series);
        }

        for row in &rows {
            let idx: i64 = row.try_get(0).map_err(DbError::Sqlx)?;
            let Some(start) = buckets.get(idx as usize) else {
                continue;
            };
            let mut col = 1usize;
            for spec in &specs {
                let value = match spec.shape {
                    SeriesShape::Plain => row.try_get::<Option<f64>, _>(col)?,
                    SeriesShape::PerInstance => {
                        let count: Option<f64> = row.try_get(col)?;
                        let instances: Option<f64> = row.try_get(col + 1)?;
                        match (count, instances) {
                            (Some(c), Some(n)) if n > 0.0 => Some(c / n),
                            _ => None,
                        }
                    }
                    SeriesShape::Variance | SeriesShape::StdDev => {
                        let n: Option<f64> = row.try_get(col)?;
                        let sum: Option<f64> = row.try_get(col + 1)?;
                        let sumsq: Option<f64> = row.try_get(col + 2)?;
                        let variance = finish_variance(n, sum, sumsq);
                        if spec.shape == SeriesShape::StdDev {
                            variance.map(f64::sqrt)
                        } else {
                            variance
                        }
                    }
                };
                col += spec.shape.width();
                if let Some(series) = result.get_mut(start) {
                    series.insert(spec.label.clone(), value);
                }
            }
        }

        Ok(result)
    }
}

fn inline_literal(lit: SqlLiteral) -> String {
    match lit {
        SqlLiteral::Int(i) => i.to_string(),
        // ISO dates only; no quoting hazards.
        SqlLiteral::Text(s) => format!("'{s}'"),
        SqlLiteral::Float(f) => f.to_string(),
        SqlLiteral::Bool(b) => if b { "1" } else { "0" }.to_string(),
        SqlLiteral::Null => "NULL".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn variance_is_population_variant() {
        // Samples 12, 1, 2.
        let v = finish_variance(Some(3.0), Some(15.0), Some(149.0)).unwrap();
        assert!((v - 24.666_666_666_666_668).abs() < 1e-9);
        assert!((v.sqrt() - 4.966_554_808_583_776).abs() < 1e-9);
    }

    #[test]
    fn variance_of_no_rows_is_none() {
        assert_eq!(finish_variance(None, None, None), None);
        assert_eq!(finish_variance(Some(0.0), None, None), None);
    }

    #[test]
    fn aggregate_columns_shapes() {
        let none = None;
        let filt = Some("t.active = ?1".to_string());
        assert_eq!(
            aggregate_columns(Operation::Count, false, "t.id", "t.id", &none),
            vec!["CAST(COUNT(t.id) AS REAL)"]
        );
        assert_eq!(
            aggregate_columns(Operation::Count, true, "t.id", "t.id", &filt),
            vec!["CAST(COUNT(DISTINCT t.id) FILTER (WHERE t.active = ?1) AS REAL)"]
        );
        assert_eq!(
            aggregate_columns(Operation::Variance, false, "t.age", "t.id", &none).len(),
            3
        );
        assert_eq!(
            aggregate_columns(Operation::AvgCountPerInstance, false, "t.age", "t.id", &none).len(),
            2
        );
    }
}
