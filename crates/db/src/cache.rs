// crates/db/src/cache.rs
//! Cached bucket values and gap-driven recomputation.
//!
//! Cache rows are keyed by chart, time scale, operation override,
//! operation field and a filter signature, one row per (bucket, series
//! label). A bucket is `final` once its whole span lies in the past;
//! non-final buckets are recomputed on every reload. Reads without a
//! reload return exactly what is stored — no zero-fill, no
//! recomputation — so a cold cache yields an empty map rather than a
//! silently expensive live query.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dashstats_core::{enumerate_buckets, truncate, truncate_ceiling, Interval};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::series::{SeriesMap, SeriesRequest};
use crate::{chart_error_message, Chart, Database, DbError, DbResult};
use crate::{BindingRole, CachedValue, Viewer};

/// Canonical signature of a request's filter inputs, stored on every
/// cache row so differently-filtered renderings never collide.
pub fn filters_signature(request: &SeriesRequest) -> String {
    let filters: BTreeMap<String, &String> = request
        .dynamic_filters
        .iter()
        .map(|(id, key)| (id.to_string(), key))
        .collect();
    serde_json::json!({
        "series_binding": request.series_binding,
        "filters": filters,
    })
    .to_string()
}

fn cached_value_from_row(row: &SqliteRow) -> Result<CachedValue, sqlx::Error> {
    let time_scale: String = row.try_get("time_scale")?;
    let operation: Option<String> = row.try_get("operation")?;
    Ok(CachedValue {
        id: row.try_get("id")?,
        chart_id: row.try_get("chart_id")?,
        time_scale: time_scale
            .parse()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        operation: operation
            .map(|s| s.parse().map_err(|e| sqlx::Error::Decode(Box::new(e))))
            .transpose()?,
        operation_field: row.try_get("operation_field")?,
        filters_sig: row.try_get("filters_sig")?,
        series_label: row.try_get("series_label")?,
        date: row.try_get("date")?,
        value: row.try_get("value")?,
        is_final: row.try_get("is_final")?,
    })
}

/// Inclusive bucket-aligned spans that need recomputation.
pub type Gaps = Vec<(DateTime<Tz>, DateTime<Tz>)>;

/// Find the spans of a window whose cached buckets are missing (or,
/// with `reload`, not yet final). Consecutive stale buckets merge into
/// one span; a final cached bucket in between splits them.
pub fn get_gaps(
    reload: bool,
    reload_all: bool,
    time_since: DateTime<Tz>,
    time_until: DateTime<Tz>,
    interval: Interval,
    cached_final: &BTreeMap<i64, bool>,
) -> Gaps {
    if reload_all {
        return vec![(truncate(time_since, interval), time_until)];
    }
    let mut gaps = Gaps::new();
    let mut open: Option<(DateTime<Tz>, DateTime<Tz>)> = None;
    for bucket in enumerate_buckets(interval, time_since, time_until) {
        let stale = match cached_final.get(&bucket.timestamp()) {
            None => true,
            Some(all_final) => reload && !all_final,
        };
        if stale {
            let end = truncate_ceiling(bucket, interval);
            open = match open.take() {
                Some((start, _)) => Some((start, end)),
                None => Some((bucket, end)),
            };
        } else if let Some(gap) = open.take() {
            gaps.push(gap);
        }
    }
    if let Some(gap) = open {
        gaps.push(gap);
    }
    gaps
}

impl Database {
    /// Stored cache rows for one request's key, ordered by bucket.
    pub async fn cached_values(
        &self,
        chart: &Chart,
        request: &SeriesRequest,
        since: DateTime<Tz>,
        until: DateTime<Tz>,
    ) -> DbResult<Vec<CachedValue>> {
        // Rows store bucket starts; a mid-bucket `since` must still
        // match its own bucket's row.
        let since = truncate(since, request.interval);
        let rows = sqlx::query(
            "SELECT * FROM cached_values
             WHERE chart_id = ?1 AND time_scale = ?2
               AND operation IS ?3 AND operation_field IS ?4
               AND filters_sig = ?5 AND date >= ?6 AND date <= ?7
             ORDER BY date, series_label",
        )
        .bind(chart.id)
        .bind(request.interval.as_str())
        .bind(request.operation.map(|o| o.as_str()))
        .bind(&request.operation_field)
        .bind(filters_signature(request))
        .bind(since.timestamp())
        .bind(until.timestamp())
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|r| cached_value_from_row(r).map_err(Into::into))
            .collect()
    }

    /// Cached variant of [`Database::compute_series`].
    ///
    /// With `reload` false this is a pure read of whatever buckets are
    /// stored. With `reload` true, missing and non-final buckets are
    /// recomputed from host data and persisted first; `reload_all`
    /// recomputes the whole window as one span.
    pub async fn compute_series_cached(
        &self,
        chart: &Chart,
        request: &SeriesRequest,
        reload: bool,
        reload_all: bool,
    ) -> DbResult<SeriesMap> {
        if request.time_since > request.time_until {
            return Err(DbError::TimeRange);
        }
        let tz = self.charts_timezone();
        let since = truncate(request.time_since.with_timezone(&tz), request.interval);
        let until = request.time_until.with_timezone(&tz);

        if reload || reload_all {
            let existing = self.cached_values(chart, request, since, until).await?;
            let cached_final = finality_by_bucket(&existing);
            let gaps = get_gaps(reload, reload_all, since, until, request.interval, &cached_final);
            for (gap_since, gap_until) in gaps {
                self.recompute_span(chart, request, gap_since, gap_until)
                    .await?;
            }
        }

        let rows = self.cached_values(chart, request, since, until).await?;
        let mut result = SeriesMap::new();
        for row in rows {
            let Some(instant) = DateTime::from_timestamp(row.date, 0) else {
                continue;
            };
            result
                .entry(instant.with_timezone(&tz))
                .or_default()
                .insert(row.series_label, row.value);
        }
        Ok(result)
    }

    /// Recompute one span from host data and replace its cache rows.
    async fn recompute_span(
        &self,
        chart: &Chart,
        request: &SeriesRequest,
        span_since: DateTime<Tz>,
        span_until: DateTime<Tz>,
    ) -> DbResult<()> {
        let mut span_request = request.clone();
        span_request.time_since = span_since.with_timezone(&Utc);
        span_request.time_until = span_until.with_timezone(&Utc);
        let fresh = self.compute_series(chart, &span_request).await?;

        let now = Utc::now().with_timezone(&self.charts_timezone());
        let sig = filters_signature(request);

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "DELETE FROM cached_values
             WHERE chart_id = ?1 AND time_scale = ?2
               AND operation IS ?3 AND operation_field IS ?4
               AND filters_sig = ?5 AND date >= ?6 AND date <= ?7",
        )
        .bind(chart.id)
        .bind(request.interval.as_str())
        .bind(request.operation.map(|o| o.as_str()))
        .bind(&request.operation_field)
        .bind(&sig)
        .bind(span_since.timestamp())
        .bind(span_until.timestamp())
        .execute(&mut *tx)
        .await?;

        for (bucket, series) in &fresh {
            let is_final = truncate_ceiling(*bucket, request.interval) < now;
            for (label, value) in series {
                sqlx::query(
                    "INSERT INTO cached_values
                     (chart_id, time_scale, operation, operation_field,
                      filters_sig, series_label, date, value, is_final)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )
                .bind(chart.id)
                .bind(request.interval.as_str())
                .bind(request.operation.map(|o| o.as_str()))
                .bind(&request.operation_field)
                .bind(&sig)
                .bind(label)
                .bind(bucket.timestamp())
                .bind(value)
                .bind(is_final)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;

        tracing::debug!(
            chart = %chart.graph_key,
            scale = %request.interval,
            since = %span_since,
            until = %span_until,
            buckets = fresh.len(),
            "cache span recomputed"
        );
        Ok(())
    }
}

/// Collapse cache rows to bucket → "every series row is final".
fn finality_by_bucket(rows: &[CachedValue]) -> BTreeMap<i64, bool> {
    let mut map: BTreeMap<i64, bool> = BTreeMap::new();
    for row in rows {
        map.entry(row.date)
            .and_modify(|f| *f &= row.is_final)
            .or_insert(row.is_final);
    }
    map
}

// ============================================================================
// Batch recalculation
// ============================================================================

/// Options for the cache-warm batch, mirrored by the CLI flags.
#[derive(Debug, Clone)]
pub struct RecalculateOptions {
    /// Only these graph keys; empty means every cached chart.
    pub graph_keys: Vec<String>,
    pub exclude: Vec<String>,
    /// Also recompute series bindings not flagged `recalculate`.
    pub all_bindings: bool,
    pub reload_all: bool,
    /// Report what would be recomputed without writing.
    pub dry_run: bool,
    /// Time scales to warm; empty means each chart's allowed intervals.
    pub time_scales: Vec<Interval>,
    /// Window length = `default_time_period * periods_count` days back
    /// from now.
    pub periods_count: i64,
    pub viewer: Viewer,
}

impl Default for RecalculateOptions {
    fn default() -> Self {
        Self {
            graph_keys: Vec::new(),
            exclude: Vec::new(),
            all_bindings: false,
            reload_all: false,
            dry_run: false,
            time_scales: Vec::new(),
            periods_count: 1,
            viewer: Viewer::superuser(),
        }
    }
}

/// What one batch run did.
#[derive(Debug, Default)]
pub struct RecalculateReport {
    pub charts: usize,
    pub series_recomputed: usize,
    /// Spans that would be recomputed (dry runs only).
    pub gaps_found: usize,
    /// Human-readable per-chart failures; the batch keeps going.
    pub errors: Vec<String>,
}

impl Database {
    /// Charts that participate in cache warming: cached, not delegated
    /// to end users.
    pub async fn cached_charts(&self) -> DbResult<Vec<Chart>> {
        Ok(self
            .list_charts()
            .await?
            .into_iter()
            .filter(|c| c.cache_values && !c.show_to_users)
            .collect())
    }

    /// Warm the cache for every selected chart. Failures are collected
    /// per chart instead of aborting the batch.
    pub async fn recalculate_charts(
        &self,
        options: &RecalculateOptions,
    ) -> DbResult<RecalculateReport> {
        let mut report = RecalculateReport::default();
        for chart in self.cached_charts().await? {
            if !options.graph_keys.is_empty() && !options.graph_keys.contains(&chart.graph_key) {
                continue;
            }
            if options.exclude.contains(&chart.graph_key) {
                continue;
            }
            report.charts += 1;
            if let Err(err) = self.recalculate_chart(&chart, options, &mut report).await {
                report.errors.push(chart_error_message(&chart, &err));
            }
        }
        Ok(report)
    }

    /// Warm one chart across its scales, operation fields and flagged
    /// series bindings.
    pub async fn recalculate_chart(
        &self,
        chart: &Chart,
        options: &RecalculateOptions,
        report: &mut RecalculateReport,
    ) -> DbResult<()> {
        let tz = self.charts_timezone();
        let now = Utc::now().with_timezone(&tz);

        let mut series_bindings = vec![None];
        for binding in self.bindings_for_chart(chart.id).await? {
            if binding.role == BindingRole::MultipleSeries
                && (binding.recalculate || options.all_bindings)
            {
                series_bindings.push(Some(binding.id));
            }
        }

        let mut field_choices: Vec<Option<String>> = vec![None];
        for field in chart.operation_fields() {
            if !field.is_empty() {
                field_choices.push(Some(field));
            }
        }

        let scales = if options.time_scales.is_empty() {
            chart.allowed_intervals.clone()
        } else {
            options.time_scales.clone()
        };

        for interval in scales {
            let window_days = chart.default_time_period * options.periods_count.max(1);
            let since = truncate(now - chrono::Duration::days(window_days), interval);
            let until = truncate_ceiling(now, interval);

            for binding_id in &series_bindings {
                for field in &field_choices {
                    let mut request = SeriesRequest::new(
                        since.with_timezone(&Utc),
                        until.with_timezone(&Utc),
                        interval,
                    );
                    request.series_binding = *binding_id;
                    request.operation_field = field.clone();
                    request.viewer = options.viewer;

                    if options.dry_run {
                        let existing = self.cached_values(chart, &request, since, until).await?;
                        let gaps = get_gaps(
                            true,
                            options.reload_all,
                            since,
                            until,
                            interval,
                            &finality_by_bucket(&existing),
                        );
                        report.gaps_found += gaps.len();
                        continue;
                    }

                    self.compute_series_cached(chart, &request, true, options.reload_all)
                        .await?;
                    report.series_recomputed += 1;
                }
            }
        }
        Ok(())
    }
}
