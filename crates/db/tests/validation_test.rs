// crates/db/tests/validation_test.rs
//! Chart definition validation and error surfaces.

mod common;

use common::test_db;
use dashstats_db::{chart_error_message, Chart, Database, DbError};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn graph_key_must_be_lowercase_identifier() {
    let db = test_db().await;
    for bad in ["", "Kid Graph", "kid-graph", "KIDS"] {
        let err = db
            .create_chart(&Chart::new(bad, "Kids", "demo", "Kid", "appeared"))
            .await
            .unwrap_err();
        match err {
            DbError::Validation(errors) => {
                assert_eq!(errors.0[0].field, "graph_key", "key {bad:?}");
            }
            other => panic!("expected validation error for {bad:?}, got {other}"),
        }
    }

    assert!(db
        .create_chart(&Chart::new("kid_graph_2", "Kids", "demo", "Kid", "appeared"))
        .await
        .is_ok());
}

#[tokio::test]
async fn validation_reports_each_bad_field() {
    let db = test_db().await;
    let mut chart = Chart::new("kid_graph", "Kids", "demo", "Kid", "nonexistent");
    chart.operation_field_name = Some("age, nope".to_string());
    chart.user_field_name = Some("ghost".to_string());

    let err = db.validate_chart(&chart).unwrap_err();
    let DbError::Validation(errors) = err else {
        panic!("expected validation error");
    };
    let fields: Vec<&str> = errors.0.iter().map(|e| e.field).collect();
    assert_eq!(
        fields,
        ["date_field_name", "operation_field_name", "user_field_name"]
    );
}

#[tokio::test]
async fn unknown_model_is_reported_against_model_name() {
    let db = test_db().await;
    let chart = Chart::new("kid_graph", "Kids", "demo", "Ghost", "appeared");
    let DbError::Validation(errors) = db.validate_chart(&chart).unwrap_err() else {
        panic!("expected validation error");
    };
    assert_eq!(errors.0[0].field, "model_name");
    assert!(errors.0[0].message.contains("demo.Ghost"));
}

#[tokio::test]
async fn non_temporal_date_field_is_rejected() {
    let db = test_db().await;
    let chart = Chart::new("kid_graph", "Kids", "demo", "Kid", "name");
    let DbError::Validation(errors) = db.validate_chart(&chart).unwrap_err() else {
        panic!("expected validation error");
    };
    assert_eq!(errors.0[0].field, "date_field_name");
    assert!(errors.0[0].message.contains("not a date field"));
}

#[tokio::test]
async fn related_paths_validate_through_the_registry() {
    let db = test_db().await;
    let mut chart = Chart::new("kid_graph", "Kids", "demo", "Kid", "appeared");
    chart.operation_field_name = Some("author__first_name".to_string());
    chart.user_field_name = Some("author".to_string());
    assert!(db.validate_chart(&chart).is_ok());
}

#[tokio::test]
async fn chart_errors_render_with_the_chart_title() {
    let chart = Chart::new("kid_graph", "Kid chart", "demo", "Kid", "appeared");
    let message = chart_error_message(&chart, &DbError::TimeRange);
    assert_eq!(message, "Kid chart: time_since is greater than time_until");
}

#[tokio::test]
async fn duplicate_graph_keys_are_rejected() {
    let db = test_db().await;
    let chart = Chart::new("kid_graph", "Kids", "demo", "Kid", "appeared");
    db.create_chart(&chart).await.unwrap();
    assert!(matches!(
        db.create_chart(&chart).await.unwrap_err(),
        DbError::Sqlx(_)
    ));
}

#[tokio::test]
async fn file_backed_database_survives_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stats.db");
    {
        let db = Database::new(&path, common::registry(), chrono_tz::UTC)
            .await
            .unwrap();
        db.create_chart(&Chart::new("kid_graph", "Kids", "demo", "Kid", "appeared"))
            .await
            .unwrap();
    }
    // Reopen: migrations are version-tracked, data persists.
    let db = Database::new(&path, common::registry(), chrono_tz::UTC)
        .await
        .unwrap();
    assert!(db.get_chart_by_key("kid_graph").await.unwrap().is_some());
}

#[tokio::test]
async fn chart_round_trips_through_storage() {
    let db = test_db().await;
    let mut def = Chart::new("kid_graph", "Kid chart", "demo", "Kid", "appeared");
    def.operation = Some(dashstats_core::Operation::Sum);
    def.operation_field_name = Some("age".to_string());
    def.default_interval = dashstats_core::Interval::Months;
    def.cache_values = true;

    let created = db.create_chart(&def).await.unwrap();
    assert!(created.id > 0);
    let fetched = db.get_chart(created.id).await.unwrap();
    assert_eq!(fetched, created);
    let by_key = db.get_chart_by_key("kid_graph").await.unwrap().unwrap();
    assert_eq!(by_key, created);
    assert!(db.get_chart_by_key("missing").await.unwrap().is_none());
}
