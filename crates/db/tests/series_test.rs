// crates/db/tests/series_test.rs
//! Direct (uncached) series computation against host data.

mod common;

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone};
use chrono_tz::America::Chicago;
use chrono_tz::Europe::Prague;
use chrono_tz::Tz;
use common::{chicago, test_db, test_db_in, KidRow};
use dashstats_core::{Interval, Operation};
use dashstats_db::series::SeriesMap;
use dashstats_db::{Chart, DbError, SeriesRequest};
use pretty_assertions::assert_eq;

fn kid_chart() -> Chart {
    Chart::new("kid_graph", "Kid chart", "demo", "Kid", "appeared")
}

fn day(d: u32) -> DateTime<Tz> {
    Chicago.with_ymd_and_hms(2010, 10, d, 0, 0, 0).unwrap()
}

fn single_series(values: &[(DateTime<Tz>, Option<f64>)]) -> SeriesMap {
    values
        .iter()
        .map(|(t, v)| (*t, BTreeMap::from([(String::new(), *v)])))
        .collect()
}

#[tokio::test]
async fn counts_per_day_with_zero_fill() {
    let db = test_db().await;
    KidRow::at(chicago(2010, 10, 10, 12, 30)).insert(&db).await;

    let request = SeriesRequest::new(
        chicago(2010, 10, 8, 0, 0),
        chicago(2010, 10, 12, 23, 0),
        Interval::Days,
    );
    let result = db.compute_series(&kid_chart(), &request).await.unwrap();

    assert_eq!(
        result,
        single_series(&[
            (day(8), Some(0.0)),
            (day(9), Some(0.0)),
            (day(10), Some(1.0)),
            (day(11), Some(0.0)),
            (day(12), Some(0.0)),
        ])
    );
}

#[tokio::test]
async fn buckets_follow_charts_timezone_not_utc() {
    let db = test_db().await;
    // 23:30 Chicago is already the next day in UTC.
    KidRow::at(chicago(2010, 10, 10, 23, 30)).insert(&db).await;

    let request = SeriesRequest::new(
        chicago(2010, 10, 10, 0, 0),
        chicago(2010, 10, 11, 23, 0),
        Interval::Days,
    );
    let result = db.compute_series(&kid_chart(), &request).await.unwrap();

    assert_eq!(
        result,
        single_series(&[(day(10), Some(1.0)), (day(11), Some(0.0))])
    );
}

async fn seed_ages(db: &dashstats_db::Database, ages: &[i64]) {
    for age in ages {
        KidRow::at(chicago(2010, 10, 10, 12, 0))
            .age(*age)
            .insert(db)
            .await;
    }
}

async fn one_bucket_value(db: &dashstats_db::Database, chart: &Chart, op: Operation) -> Option<f64> {
    let request = SeriesRequest::new(
        chicago(2010, 10, 10, 0, 0),
        chicago(2010, 10, 10, 23, 0),
        Interval::Days,
    )
    .with_operation(op);
    let result = db.compute_series(chart, &request).await.unwrap();
    result[&day(10)][""]
}

#[tokio::test]
async fn aggregation_operations_over_age() {
    let db = test_db().await;
    seed_ages(&db, &[12, 1, 2]).await;
    let mut chart = kid_chart();
    chart.operation_field_name = Some("age".to_string());

    let cases = [
        (Operation::Count, 3.0),
        (Operation::DistinctCount, 3.0),
        (Operation::Sum, 15.0),
        (Operation::Avg, 5.0),
        (Operation::Min, 1.0),
        (Operation::Max, 12.0),
        (Operation::Variance, 24.666_666_666_666_668),
        (Operation::StdDev, 4.966_554_808_583_776),
        (Operation::AvgCountPerInstance, 1.0),
    ];
    for (op, expected) in cases {
        let value = one_bucket_value(&db, &chart, op).await.unwrap();
        assert!(
            (value - expected).abs() < 1e-9,
            "{op}: got {value}, expected {expected}"
        );
    }
}

#[tokio::test]
async fn distinct_count_collapses_duplicates() {
    let db = test_db().await;
    seed_ages(&db, &[2, 2, 12]).await;
    let mut chart = kid_chart();
    chart.operation_field_name = Some("age".to_string());

    assert_eq!(
        one_bucket_value(&db, &chart, Operation::Count).await,
        Some(3.0)
    );
    assert_eq!(
        one_bucket_value(&db, &chart, Operation::DistinctCount).await,
        Some(2.0)
    );
}

#[tokio::test]
async fn null_aggregate_stays_none_while_empty_bucket_is_zero() {
    let db = test_db().await;
    // The bucket has a row, but its age is NULL: SUM is NULL, not 0.
    KidRow::at(chicago(2010, 10, 10, 12, 0)).insert(&db).await;
    let mut chart = kid_chart();
    chart.operation_field_name = Some("age".to_string());

    let request = SeriesRequest::new(
        chicago(2010, 10, 9, 0, 0),
        chicago(2010, 10, 10, 23, 0),
        Interval::Days,
    )
    .with_operation(Operation::Sum);
    let result = db.compute_series(&chart, &request).await.unwrap();

    assert_eq!(result, single_series(&[(day(9), Some(0.0)), (day(10), None)]));
}

#[tokio::test]
async fn blank_field_choice_splits_series_per_operation_field() {
    let db = test_db().await;
    KidRow::at(chicago(2010, 10, 10, 12, 0))
        .age(10)
        .height(100)
        .insert(&db)
        .await;
    let mut chart = kid_chart();
    chart.operation_field_name = Some("age, height".to_string());

    let request = SeriesRequest::new(
        chicago(2010, 10, 10, 0, 0),
        chicago(2010, 10, 10, 23, 0),
        Interval::Days,
    )
    .with_operation(Operation::Sum)
    .with_operation_field("");
    let result = db.compute_series(&chart, &request).await.unwrap();

    assert_eq!(
        result[&day(10)],
        BTreeMap::from([
            ("age".to_string(), Some(10.0)),
            ("height".to_string(), Some(100.0)),
        ])
    );
}

#[tokio::test]
async fn explicit_field_choice_wins_over_multi_field_mode() {
    let db = test_db().await;
    KidRow::at(chicago(2010, 10, 10, 12, 0))
        .age(10)
        .height(100)
        .insert(&db)
        .await;
    let mut chart = kid_chart();
    chart.operation_field_name = Some("age, height".to_string());

    let request = SeriesRequest::new(
        chicago(2010, 10, 10, 0, 0),
        chicago(2010, 10, 10, 23, 0),
        Interval::Days,
    )
    .with_operation(Operation::Sum)
    .with_operation_field("height");
    let result = db.compute_series(&chart, &request).await.unwrap();
    assert_eq!(result[&day(10)][""], Some(100.0));
}

#[tokio::test]
async fn unknown_field_choice_is_rejected() {
    let db = test_db().await;
    let mut chart = kid_chart();
    chart.operation_field_name = Some("age".to_string());

    let request = SeriesRequest::new(
        chicago(2010, 10, 10, 0, 0),
        chicago(2010, 10, 10, 23, 0),
        Interval::Days,
    )
    .with_operation_field("name");
    let err = db.compute_series(&chart, &request).await.unwrap_err();
    assert!(matches!(err, DbError::BadConfiguration(_)));
}

#[tokio::test]
async fn weekly_buckets_start_on_monday() {
    let db = test_db().await;
    // 2010-10-08 is a Friday.
    KidRow::at(chicago(2010, 10, 8, 12, 0)).insert(&db).await;

    let request = SeriesRequest::new(
        chicago(2010, 10, 4, 0, 0),
        chicago(2010, 10, 17, 23, 0),
        Interval::Weeks,
    );
    let result = db.compute_series(&kid_chart(), &request).await.unwrap();

    assert_eq!(
        result,
        single_series(&[(day(4), Some(1.0)), (day(11), Some(0.0))])
    );
}

#[tokio::test]
async fn quarterly_buckets_start_on_quarter_months() {
    let db = test_db().await;
    KidRow::at(chicago(2010, 11, 20, 12, 0)).insert(&db).await;

    let request = SeriesRequest::new(
        chicago(2010, 10, 1, 0, 0),
        chicago(2011, 1, 2, 0, 0),
        Interval::Quarters,
    );
    let result = db.compute_series(&kid_chart(), &request).await.unwrap();

    let q4 = Chicago.with_ymd_and_hms(2010, 10, 1, 0, 0, 0).unwrap();
    let q1 = Chicago.with_ymd_and_hms(2011, 1, 1, 0, 0, 0).unwrap();
    assert_eq!(result, single_series(&[(q4, Some(1.0)), (q1, Some(0.0))]));
}

#[tokio::test]
async fn reversed_window_is_an_error() {
    let db = test_db().await;
    let request = SeriesRequest::new(
        chicago(2010, 10, 12, 0, 0),
        chicago(2010, 10, 8, 0, 0),
        Interval::Days,
    );
    let err = db.compute_series(&kid_chart(), &request).await.unwrap_err();
    assert_eq!(err.to_string(), "time_since is greater than time_until");
}

#[tokio::test]
async fn dst_fall_back_day_is_a_single_bucket() {
    let db = test_db_in(Prague).await;
    // 02:30 occurs twice on 2019-10-27; the row lands in the first one.
    let ambiguous = Prague
        .with_ymd_and_hms(2019, 10, 27, 2, 30, 0)
        .earliest()
        .unwrap()
        .to_utc();
    KidRow::at(ambiguous).insert(&db).await;

    let since = Prague
        .with_ymd_and_hms(2019, 10, 26, 0, 0, 0)
        .unwrap()
        .to_utc();
    let until = Prague
        .with_ymd_and_hms(2019, 10, 28, 12, 0, 0)
        .unwrap()
        .to_utc();
    let request = SeriesRequest::new(since, until, Interval::Days);
    let result = db.compute_series(&kid_chart(), &request).await.unwrap();

    let days: Vec<(u32, Option<f64>)> = result
        .iter()
        .map(|(t, series)| (chrono::Datelike::day(t), series[""]))
        .collect();
    assert_eq!(
        days,
        vec![(26, Some(0.0)), (27, Some(1.0)), (28, Some(0.0))]
    );
}

#[tokio::test]
async fn hourly_scale_rejects_calendar_date_fields() {
    let db = test_db().await;
    let mut chart = kid_chart();
    chart.date_field_name = "birthday".to_string();

    let request = SeriesRequest::new(
        chicago(2010, 10, 10, 0, 0),
        chicago(2010, 10, 10, 6, 0),
        Interval::Hours,
    );
    let err = db.compute_series(&chart, &request).await.unwrap_err();
    assert!(matches!(err, DbError::BadConfiguration(_)));
}

#[tokio::test]
async fn date_column_buckets_on_calendar_dates() {
    let db = test_db().await;
    KidRow::at(chicago(2010, 10, 10, 12, 0))
        .birthday("2010-10-09")
        .insert(&db)
        .await;
    let mut chart = kid_chart();
    chart.date_field_name = "birthday".to_string();

    let request = SeriesRequest::new(
        chicago(2010, 10, 8, 0, 0),
        chicago(2010, 10, 10, 23, 0),
        Interval::Days,
    );
    let result = db.compute_series(&chart, &request).await.unwrap();

    assert_eq!(
        result,
        single_series(&[
            (day(8), Some(0.0)),
            (day(9), Some(1.0)),
            (day(10), Some(0.0)),
        ])
    );
}
