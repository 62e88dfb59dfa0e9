// crates/db/src/models.rs
//! Chart/criteria configuration rows and their CRUD.
//!
//! Every update bumps `updated_at` (milliseconds); the choice resolver
//! keys its memo on those stamps, so a write anywhere in the
//! chart/criteria/binding triple invalidates dependent cached choices.

use chrono::Utc;
use dashstats_core::{Interval, Operation};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::{Database, DbError, DbResult, FieldKind, ValidationErrors};

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A configured chart: what to aggregate, from which model, over which
/// date field.
#[derive(Debug, Clone, PartialEq)]
pub struct Chart {
    pub id: i64,
    /// Unique identifier, `^[a-z0-9_]+$`.
    pub graph_key: String,
    pub graph_title: String,
    pub model_app_name: String,
    pub model_name: String,
    pub date_field_name: String,
    /// Comma-separated candidate fields to aggregate; empty/None means
    /// the model's primary key.
    pub operation_field_name: Option<String>,
    /// Default aggregation; None means Count.
    pub operation: Option<Operation>,
    pub distinct: bool,
    /// Ownership path used to scope rows for non-elevated viewers.
    pub user_field_name: Option<String>,
    pub default_interval: Interval,
    pub allowed_intervals: Vec<Interval>,
    pub default_chart_type: String,
    pub allowed_chart_types: Vec<String>,
    /// Default window length in days.
    pub default_time_period: i64,
    pub is_visible: bool,
    pub cache_values: bool,
    pub show_to_users: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Chart {
    pub fn new(
        graph_key: impl Into<String>,
        graph_title: impl Into<String>,
        model_app_name: impl Into<String>,
        model_name: impl Into<String>,
        date_field_name: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            graph_key: graph_key.into(),
            graph_title: graph_title.into(),
            model_app_name: model_app_name.into(),
            model_name: model_name.into(),
            date_field_name: date_field_name.into(),
            operation_field_name: None,
            operation: None,
            distinct: false,
            user_field_name: None,
            default_interval: Interval::Days,
            allowed_intervals: Interval::ALL.to_vec(),
            default_chart_type: "discreteBarChart".to_string(),
            allowed_chart_types: Vec::new(),
            default_time_period: 31,
            is_visible: true,
            cache_values: false,
            show_to_users: false,
            created_at: 0,
            updated_at: 0,
        }
    }

    pub fn model_key(&self) -> String {
        format!("{}.{}", self.model_app_name, self.model_name)
    }

    /// Candidate operation fields, trimmed, in configured order. Empty
    /// entries are kept: an empty candidate means "aggregate the pk".
    pub fn operation_fields(&self) -> Vec<String> {
        self.operation_field_name
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(|s| s.trim().to_string())
            .collect()
    }

    fn graph_key_is_valid(&self) -> bool {
        !self.graph_key.is_empty()
            && self
                .graph_key
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }
}

/// A reusable, chart-independent filter/grouping rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Criteria {
    pub id: i64,
    pub name: String,
    /// JSON object of field path → required value (fixed row filter).
    pub fix_mapping: Option<String>,
    /// Field path whose values group or filter rows.
    pub dynamic_field_name: Option<String>,
    /// JSON mapping of choice key → label (old format) or
    /// key → [value, label] (new format).
    pub dynamic_mapping: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Criteria {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            fix_mapping: None,
            dynamic_field_name: None,
            dynamic_mapping: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    pub fn with_dynamic_field(mut self, field: impl Into<String>) -> Self {
        self.dynamic_field_name = Some(field.into());
        self
    }

    pub fn with_dynamic_mapping(mut self, mapping: impl Into<String>) -> Self {
        self.dynamic_mapping = Some(mapping.into());
        self
    }

    pub fn with_fix_mapping(mut self, mapping: impl Into<String>) -> Self {
        self.fix_mapping = Some(mapping.into());
        self
    }

    /// First ~100 chars of the dynamic mapping, for admin list pages.
    pub fn dynamic_mapping_preview(&self) -> String {
        match &self.dynamic_mapping {
            None => String::new(),
            Some(m) if m.chars().count() <= 100 => m.clone(),
            Some(m) => {
                let head: String = m.chars().take(100).collect();
                format!("{head}...")
            }
        }
    }
}

/// How a bound criteria participates in a chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingRole {
    /// Resolved choices render as a filter select box.
    ChartFilter,
    /// Resolved choices each become one series of the chart.
    MultipleSeries,
    /// Like ChartFilter, but the choice list is recomputed per request.
    DynamicChoices,
}

impl BindingRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingRole::ChartFilter => "chart_filter",
            BindingRole::MultipleSeries => "multiple_series",
            BindingRole::DynamicChoices => "dynamic_choices",
        }
    }

    fn parse(s: &str) -> Result<Self, sqlx::Error> {
        match s {
            "chart_filter" => Ok(BindingRole::ChartFilter),
            "multiple_series" => Ok(BindingRole::MultipleSeries),
            "dynamic_choices" => Ok(BindingRole::DynamicChoices),
            other => Err(sqlx::Error::Decode(
                format!("unknown binding role '{other}'").into(),
            )),
        }
    }
}

/// The binding of one criteria to one chart in a specific role.
#[derive(Debug, Clone, PartialEq)]
pub struct CriteriaBinding {
    pub id: i64,
    pub chart_id: i64,
    pub criteria_id: i64,
    pub role: BindingRole,
    /// Relation prefix prepended to the criteria's dynamic field path,
    /// e.g. `author__`.
    pub prefix: String,
    pub default_option: String,
    pub choices_based_on_time_range: bool,
    /// Keep only the top-N choices by aggregate value; the rest are
    /// bucketed under a synthetic `other` choice.
    pub count_limit: Option<i64>,
    pub display_order: Option<i64>,
    /// Whether the cache-warm batch recomputes this binding's series.
    pub recalculate: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CriteriaBinding {
    pub fn new(chart_id: i64, criteria_id: i64, role: BindingRole) -> Self {
        Self {
            id: 0,
            chart_id,
            criteria_id,
            role,
            prefix: String::new(),
            default_option: String::new(),
            choices_based_on_time_range: false,
            count_limit: None,
            display_order: None,
            recalculate: false,
            created_at: 0,
            updated_at: 0,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_count_limit(mut self, limit: i64) -> Self {
        self.count_limit = Some(limit);
        self
    }

    pub fn with_time_range_choices(mut self) -> Self {
        self.choices_based_on_time_range = true;
        self
    }

    pub fn with_recalculate(mut self) -> Self {
        self.recalculate = true;
        self
    }
}

/// One persisted pre-computed bucket value.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub id: i64,
    pub chart_id: i64,
    pub time_scale: Interval,
    pub operation: Option<Operation>,
    pub operation_field: Option<String>,
    pub filters_sig: String,
    pub series_label: String,
    /// Bucket start, unix epoch seconds.
    pub date: i64,
    pub value: Option<f64>,
    /// True once the bucket's span has fully elapsed.
    pub is_final: bool,
}

// ============================================================================
// Row decoding
// ============================================================================

fn decode_parse<T, E>(result: Result<T, E>) -> Result<T, sqlx::Error>
where
    E: std::error::Error + Send + Sync + 'static,
{
    result.map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn chart_from_row(row: &SqliteRow) -> Result<Chart, sqlx::Error> {
    let operation: Option<String> = row.try_get("operation")?;
    let default_interval: String = row.try_get("default_interval")?;
    let allowed_intervals: String = row.try_get("allowed_intervals")?;
    let allowed_chart_types: String = row.try_get("allowed_chart_types")?;
    Ok(Chart {
        id: row.try_get("id")?,
        graph_key: row.try_get("graph_key")?,
        graph_title: row.try_get("graph_title")?,
        model_app_name: row.try_get("model_app_name")?,
        model_name: row.try_get("model_name")?,
        date_field_name: row.try_get("date_field_name")?,
        operation_field_name: row.try_get("operation_field_name")?,
        operation: operation.map(|s| decode_parse(s.parse())).transpose()?,
        distinct: row.try_get("is_distinct")?,
        user_field_name: row.try_get("user_field_name")?,
        default_interval: decode_parse(default_interval.parse())?,
        allowed_intervals: decode_parse(serde_json::from_str(&allowed_intervals))?,
        default_chart_type: row.try_get("default_chart_type")?,
        allowed_chart_types: decode_parse(serde_json::from_str(&allowed_chart_types))?,
        default_time_period: row.try_get("default_time_period")?,
        is_visible: row.try_get("is_visible")?,
        cache_values: row.try_get("cache_values")?,
        show_to_users: row.try_get("show_to_users")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn criteria_from_row(row: &SqliteRow) -> Result<Criteria, sqlx::Error> {
    Ok(Criteria {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        fix_mapping: row.try_get("fix_mapping")?,
        dynamic_field_name: row.try_get("dynamic_field_name")?,
        dynamic_mapping: row.try_get("dynamic_mapping")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn binding_from_row(row: &SqliteRow) -> Result<CriteriaBinding, sqlx::Error> {
    let role: String = row.try_get("role")?;
    Ok(CriteriaBinding {
        id: row.try_get("id")?,
        chart_id: row.try_get("chart_id")?,
        criteria_id: row.try_get("criteria_id")?,
        role: BindingRole::parse(&role)?,
        prefix: row.try_get("prefix")?,
        default_option: row.try_get("default_option")?,
        choices_based_on_time_range: row.try_get("choices_based_on_time_range")?,
        count_limit: row.try_get("count_limit")?,
        display_order: row.try_get("display_order")?,
        recalculate: row.try_get("recalculate")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ============================================================================
// CRUD
// ============================================================================

impl Database {
    pub async fn create_chart(&self, chart: &Chart) -> DbResult<Chart> {
        if !chart.graph_key_is_valid() {
            let mut errors = ValidationErrors::default();
            errors.push(
                "graph_key",
                "must be lowercase letters, digits and underscores",
            );
            return Err(DbError::Validation(errors));
        }
        let now = now_ms();
        let row = sqlx::query(
            r#"
            INSERT INTO charts (
                graph_key, graph_title, model_app_name, model_name,
                date_field_name, operation_field_name, operation, is_distinct,
                user_field_name, default_interval, allowed_intervals,
                default_chart_type, allowed_chart_types, default_time_period,
                is_visible, cache_values, show_to_users, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?18)
            RETURNING *
            "#,
        )
        .bind(&chart.graph_key)
        .bind(&chart.graph_title)
        .bind(&chart.model_app_name)
        .bind(&chart.model_name)
        .bind(&chart.date_field_name)
        .bind(&chart.operation_field_name)
        .bind(chart.operation.map(|o| o.as_str()))
        .bind(chart.distinct)
        .bind(&chart.user_field_name)
        .bind(chart.default_interval.as_str())
        .bind(serde_json::to_string(&chart.allowed_intervals)?)
        .bind(&chart.default_chart_type)
        .bind(serde_json::to_string(&chart.allowed_chart_types)?)
        .bind(chart.default_time_period)
        .bind(chart.is_visible)
        .bind(chart.cache_values)
        .bind(chart.show_to_users)
        .bind(now)
        .fetch_one(self.pool())
        .await?;
        Ok(chart_from_row(&row)?)
    }

    /// Persist edits to an existing chart and bump its version stamp.
    pub async fn update_chart(&self, chart: &Chart) -> DbResult<Chart> {
        let row = sqlx::query(
            r#"
            UPDATE charts SET
                graph_key = ?2, graph_title = ?3, model_app_name = ?4,
                model_name = ?5, date_field_name = ?6,
                operation_field_name = ?7, operation = ?8, is_distinct = ?9,
                user_field_name = ?10, default_interval = ?11,
                allowed_intervals = ?12, default_chart_type = ?13,
                allowed_chart_types = ?14, default_time_period = ?15,
                is_visible = ?16, cache_values = ?17, show_to_users = ?18,
                updated_at = MAX(?19, updated_at + 1)
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(chart.id)
        .bind(&chart.graph_key)
        .bind(&chart.graph_title)
        .bind(&chart.model_app_name)
        .bind(&chart.model_name)
        .bind(&chart.date_field_name)
        .bind(&chart.operation_field_name)
        .bind(chart.operation.map(|o| o.as_str()))
        .bind(chart.distinct)
        .bind(&chart.user_field_name)
        .bind(chart.default_interval.as_str())
        .bind(serde_json::to_string(&chart.allowed_intervals)?)
        .bind(&chart.default_chart_type)
        .bind(serde_json::to_string(&chart.allowed_chart_types)?)
        .bind(chart.default_time_period)
        .bind(chart.is_visible)
        .bind(chart.cache_values)
        .bind(chart.show_to_users)
        .bind(now_ms())
        .fetch_optional(self.pool())
        .await?
        .ok_or(DbError::NotFound {
            what: "chart",
            id: chart.id,
        })?;
        Ok(chart_from_row(&row)?)
    }

    pub async fn get_chart(&self, id: i64) -> DbResult<Chart> {
        let row = sqlx::query("SELECT * FROM charts WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or(DbError::NotFound { what: "chart", id })?;
        Ok(chart_from_row(&row)?)
    }

    pub async fn get_chart_by_key(&self, graph_key: &str) -> DbResult<Option<Chart>> {
        let row = sqlx::query("SELECT * FROM charts WHERE graph_key = ?1")
            .bind(graph_key)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(chart_from_row).transpose().map_err(Into::into)
    }

    pub async fn list_charts(&self) -> DbResult<Vec<Chart>> {
        let rows = sqlx::query("SELECT * FROM charts ORDER BY graph_key")
            .fetch_all(self.pool())
            .await?;
        rows.iter()
            .map(|r| chart_from_row(r).map_err(Into::into))
            .collect()
    }

    pub async fn create_criteria(&self, criteria: &Criteria) -> DbResult<Criteria> {
        let row = sqlx::query(
            r#"
            INSERT INTO criteria (name, fix_mapping, dynamic_field_name,
                                  dynamic_mapping, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            RETURNING *
            "#,
        )
        .bind(&criteria.name)
        .bind(&criteria.fix_mapping)
        .bind(&criteria.dynamic_field_name)
        .bind(&criteria.dynamic_mapping)
        .bind(now_ms())
        .fetch_one(self.pool())
        .await?;
        Ok(criteria_from_row(&row)?)
    }

    pub async fn update_criteria(&self, criteria: &Criteria) -> DbResult<Criteria> {
        let row = sqlx::query(
            r#"
            UPDATE criteria SET name = ?2, fix_mapping = ?3,
                dynamic_field_name = ?4, dynamic_mapping = ?5,
                updated_at = MAX(?6, updated_at + 1)
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(criteria.id)
        .bind(&criteria.name)
        .bind(&criteria.fix_mapping)
        .bind(&criteria.dynamic_field_name)
        .bind(&criteria.dynamic_mapping)
        .bind(now_ms())
        .fetch_optional(self.pool())
        .await?
        .ok_or(DbError::NotFound {
            what: "criteria",
            id: criteria.id,
        })?;
        Ok(criteria_from_row(&row)?)
    }

    pub async fn get_criteria(&self, id: i64) -> DbResult<Criteria> {
        let row = sqlx::query("SELECT * FROM criteria WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or(DbError::NotFound {
                what: "criteria",
                id,
            })?;
        Ok(criteria_from_row(&row)?)
    }

    pub async fn create_binding(&self, binding: &CriteriaBinding) -> DbResult<CriteriaBinding> {
        let row = sqlx::query(
            r#"
            INSERT INTO criteria_bindings (
                chart_id, criteria_id, role, prefix, default_option,
                choices_based_on_time_range, count_limit, display_order,
                recalculate, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
            RETURNING *
            "#,
        )
        .bind(binding.chart_id)
        .bind(binding.criteria_id)
        .bind(binding.role.as_str())
        .bind(&binding.prefix)
        .bind(&binding.default_option)
        .bind(binding.choices_based_on_time_range)
        .bind(binding.count_limit)
        .bind(binding.display_order)
        .bind(binding.recalculate)
        .bind(now_ms())
        .fetch_one(self.pool())
        .await?;
        Ok(binding_from_row(&row)?)
    }

    pub async fn update_binding(&self, binding: &CriteriaBinding) -> DbResult<CriteriaBinding> {
        let row = sqlx::query(
            r#"
            UPDATE criteria_bindings SET
                chart_id = ?2, criteria_id = ?3, role = ?4, prefix = ?5,
                default_option = ?6, choices_based_on_time_range = ?7,
                count_limit = ?8, display_order = ?9, recalculate = ?10,
                updated_at = MAX(?11, updated_at + 1)
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(binding.id)
        .bind(binding.chart_id)
        .bind(binding.criteria_id)
        .bind(binding.role.as_str())
        .bind(&binding.prefix)
        .bind(&binding.default_option)
        .bind(binding.choices_based_on_time_range)
        .bind(binding.count_limit)
        .bind(binding.display_order)
        .bind(binding.recalculate)
        .bind(now_ms())
        .fetch_optional(self.pool())
        .await?
        .ok_or(DbError::NotFound {
            what: "binding",
            id: binding.id,
        })?;
        Ok(binding_from_row(&row)?)
    }

    pub async fn get_binding(&self, id: i64) -> DbResult<CriteriaBinding> {
        let row = sqlx::query("SELECT * FROM criteria_bindings WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or(DbError::NotFound { what: "binding", id })?;
        Ok(binding_from_row(&row)?)
    }

    pub async fn bindings_for_chart(&self, chart_id: i64) -> DbResult<Vec<CriteriaBinding>> {
        let rows = sqlx::query(
            "SELECT * FROM criteria_bindings WHERE chart_id = ?1
             ORDER BY display_order IS NULL, display_order, id",
        )
        .bind(chart_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|r| binding_from_row(r).map_err(Into::into))
            .collect()
    }

    /// Definition-time validation: every unresolvable name is reported
    /// against the chart field that carries it.
    pub fn validate_chart(&self, chart: &Chart) -> DbResult<()> {
        let mut errors = ValidationErrors::default();
        if !chart.graph_key_is_valid() {
            errors.push(
                "graph_key",
                "must be lowercase letters, digits and underscores",
            );
        }

        match self
            .registry()
            .get(&chart.model_app_name, &chart.model_name)
        {
            Err(e) => {
                errors.push("model_name", e.to_string());
            }
            Ok(model) => {
                match self
                    .registry()
                    .resolve_path(model, &chart.date_field_name, "t")
                {
                    Err(e) => errors.push("date_field_name", e.to_string()),
                    Ok(path)
                        if !matches!(path.kind(), FieldKind::Date | FieldKind::DateTime) =>
                    {
                        errors.push(
                            "date_field_name",
                            format!("'{}' is not a date field", chart.date_field_name),
                        );
                    }
                    Ok(_) => {}
                }

                for field in chart.operation_fields() {
                    if field.is_empty() {
                        continue;
                    }
                    if let Err(e) = self.registry().resolve_path(model, &field, "t") {
                        errors.push("operation_field_name", e.to_string());
                    }
                }

                if let Some(user_field) = &chart.user_field_name {
                    if let Err(e) = self.registry().resolve_path(model, user_field, "t") {
                        errors.push("user_field_name", e.to_string());
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DbError::Validation(errors))
        }
    }
}
