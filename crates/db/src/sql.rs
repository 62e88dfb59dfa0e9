// crates/db/src/sql.rs
//! Small helpers for assembling dynamic SQL with numbered placeholders.
//!
//! Conditions are built in arbitrary order, so positional `?` binds are
//! fragile; every parameter instead gets an explicit `?N` placeholder and
//! all values are bound in one pass at the end.

use chrono::DateTime;
use chrono_tz::Tz;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::Sqlite;

use crate::choices::SqlLiteral;
use crate::registry::{FieldKind, JoinStep};

#[derive(Debug, Default)]
pub(crate) struct SqlParams {
    values: Vec<SqlLiteral>,
}

impl SqlParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value and return its `?N` placeholder.
    pub fn push(&mut self, value: SqlLiteral) -> String {
        self.values.push(value);
        format!("?{}", self.values.len())
    }

    pub fn bind_all<'q>(
        self,
        mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        for value in self.values {
            query = match value {
                SqlLiteral::Text(s) => query.bind(s),
                SqlLiteral::Int(i) => query.bind(i),
                SqlLiteral::Float(f) => query.bind(f),
                SqlLiteral::Bool(b) => query.bind(b),
                SqlLiteral::Null => query.bind(Option::<i64>::None),
            };
        }
        query
    }
}

/// Encode an instant the way the target column stores time: epoch seconds
/// for `datetime` columns, ISO-8601 local date text for `date` columns.
pub(crate) fn temporal_literal(kind: FieldKind, at: DateTime<Tz>) -> SqlLiteral {
    match kind {
        FieldKind::Date => SqlLiteral::Text(at.date_naive().to_string()),
        _ => SqlLiteral::Int(at.timestamp()),
    }
}

/// Append join steps, skipping aliases already present (two field paths
/// sharing a prefix resolve to the same alias chain).
pub(crate) fn merge_joins(joins: &mut Vec<JoinStep>, new: Vec<JoinStep>) {
    for step in new {
        if !joins.iter().any(|j| j.alias == step.alias) {
            joins.push(step);
        }
    }
}

pub(crate) fn render_joins(joins: &[JoinStep]) -> String {
    joins
        .iter()
        .map(|j| format!(" JOIN {} {} ON {}", j.table, j.alias, j.on))
        .collect()
}
