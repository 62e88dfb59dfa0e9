// crates/db/src/migrations.rs
//! Inline schema migrations for the engine's own tables.
//!
//! Host application data tables are NOT managed here — the registry only
//! points at them. These tables hold chart/criteria configuration and the
//! cached bucket values.

pub const MIGRATIONS: &[&str] = &[
    // 1: chart definitions
    r#"
    CREATE TABLE IF NOT EXISTS charts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        graph_key TEXT NOT NULL UNIQUE,
        graph_title TEXT NOT NULL,
        model_app_name TEXT NOT NULL,
        model_name TEXT NOT NULL,
        date_field_name TEXT NOT NULL,
        operation_field_name TEXT,
        operation TEXT,
        is_distinct INTEGER NOT NULL DEFAULT 0,
        user_field_name TEXT,
        default_interval TEXT NOT NULL DEFAULT 'days',
        allowed_intervals TEXT NOT NULL DEFAULT '["hours","days","weeks","months","quarters","years"]',
        default_chart_type TEXT NOT NULL DEFAULT 'discreteBarChart',
        allowed_chart_types TEXT NOT NULL DEFAULT '[]',
        default_time_period INTEGER NOT NULL DEFAULT 31,
        is_visible INTEGER NOT NULL DEFAULT 1,
        cache_values INTEGER NOT NULL DEFAULT 0,
        show_to_users INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    // 2: reusable filter/grouping criteria
    r#"
    CREATE TABLE IF NOT EXISTS criteria (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        fix_mapping TEXT,
        dynamic_field_name TEXT,
        dynamic_mapping TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    // 3: criteria-to-chart bindings (one row per role-specific use)
    r#"
    CREATE TABLE IF NOT EXISTS criteria_bindings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        chart_id INTEGER NOT NULL REFERENCES charts(id) ON DELETE CASCADE,
        criteria_id INTEGER NOT NULL REFERENCES criteria(id) ON DELETE CASCADE,
        role TEXT NOT NULL DEFAULT 'chart_filter',
        prefix TEXT NOT NULL DEFAULT '',
        default_option TEXT NOT NULL DEFAULT '',
        choices_based_on_time_range INTEGER NOT NULL DEFAULT 0,
        count_limit INTEGER,
        display_order INTEGER,
        recalculate INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE (chart_id, display_order)
    )
    "#,
    // 4: cached bucket values
    r#"
    CREATE TABLE IF NOT EXISTS cached_values (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        chart_id INTEGER NOT NULL REFERENCES charts(id) ON DELETE CASCADE,
        time_scale TEXT NOT NULL,
        operation TEXT,
        operation_field TEXT,
        filters_sig TEXT NOT NULL DEFAULT '',
        series_label TEXT NOT NULL DEFAULT '',
        date INTEGER NOT NULL,
        value REAL,
        is_final INTEGER NOT NULL DEFAULT 0
    )
    "#,
    // 5: cache lookups are always per chart + scale + window
    r#"
    CREATE INDEX IF NOT EXISTS idx_cached_values_lookup
        ON cached_values (chart_id, time_scale, date)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_bindings_chart
        ON criteria_bindings (chart_id, role)
    "#,
];
