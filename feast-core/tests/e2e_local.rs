use anyhow::Result;
use arrow::array::{Float64Array, Int64Array, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Duration, DurationRound, Utc};
use feast_core::feature_store::{EntityRow, FeatureStatus};
use feast_core::model::Value;
use feast_core::repo_operations::{FEATURE_STORE_YAML, apply_total, load_repo_config};
use feast_core::FeatureStore;
use parquet::arrow::ArrowWriter;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

const CONFIG: &str = r#"project: e2e_local
registry: data/registry.db
provider: local
online_store:
  type: sqlite
  path: data/online_store.db
materialization:
  batch_size: 7
"#;

const DEFINITIONS: &str = r#"- kind: entity
  name: driver_id
  value_type: INT64
  description: driver id
- kind: feature_view
  name: driver_hourly_stats
  entities: [driver_id]
  features:
    - name: conv_rate
      dtype: DOUBLE
    - name: avg_daily_trips
      dtype: INT64
  ttl_seconds: 0
  batch_source:
    path: data/driver_stats.parquet
    event_timestamp_column: datetime
    created_timestamp_column: created
"#;

struct Row {
    driver_id: i64,
    datetime: DateTime<Utc>,
    created: DateTime<Utc>,
    conv_rate: f64,
    avg_daily_trips: i64,
}

/// Hourly rows for five drivers over the day before `end`, plus a late correction of the
/// newest row of driver 1001 carrying a later created timestamp.
fn driver_hourly_stats(end: DateTime<Utc>) -> Vec<Row> {
    let mut rows = Vec::new();
    for driver_id in 1001..=1005 {
        for hour in (1..=24).rev() {
            let datetime = end - Duration::hours(hour);
            rows.push(Row {
                driver_id,
                datetime,
                created: datetime + Duration::minutes(1),
                conv_rate: (driver_id - 1000) as f64 / 10.0 + hour as f64 / 1000.0,
                avg_daily_trips: driver_id * 10 + hour,
            });
        }
    }
    let newest = end - Duration::hours(1);
    rows.push(Row {
        driver_id: 1001,
        datetime: newest,
        created: newest + Duration::minutes(30),
        conv_rate: 0.999,
        avg_daily_trips: 7,
    });
    rows
}

fn write_parquet(path: &Path, rows: &[Row]) -> Result<()> {
    let ts_type = DataType::Timestamp(TimeUnit::Microsecond, Some(Arc::from("UTC")));
    let schema = Arc::new(Schema::new(vec![
        Field::new("driver_id", DataType::Int64, false),
        Field::new("datetime", ts_type.clone(), false),
        Field::new("created", ts_type, false),
        Field::new("conv_rate", DataType::Float64, true),
        Field::new("avg_daily_trips", DataType::Int64, true),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.driver_id))),
            Arc::new(
                TimestampMicrosecondArray::from_iter_values(
                    rows.iter().map(|r| r.datetime.timestamp_micros()),
                )
                .with_timezone("UTC"),
            ),
            Arc::new(
                TimestampMicrosecondArray::from_iter_values(
                    rows.iter().map(|r| r.created.timestamp_micros()),
                )
                .with_timezone("UTC"),
            ),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.conv_rate))),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.avg_daily_trips))),
        ],
    )?;
    let mut writer = ArrowWriter::try_new(File::create(path)?, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

fn setup_repo(repo: &Path, rows: &[Row]) -> Result<()> {
    fs::create_dir_all(repo.join("data"))?;
    fs::write(repo.join(FEATURE_STORE_YAML), CONFIG)?;
    fs::write(repo.join("driver_repo.yaml"), DEFINITIONS)?;
    write_parquet(&repo.join("data").join("driver_stats.parquet"), rows)
}

fn driver(driver_id: i64) -> EntityRow {
    EntityRow::from([("driver_id".to_string(), Value::Int64(driver_id))])
}

#[tokio::test]
async fn materialize_and_serve_latest_values() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let end = Utc::now().duration_trunc(Duration::hours(1))?;
    let rows = driver_hourly_stats(end);
    setup_repo(dir.path(), &rows)?;

    let config = load_repo_config(dir.path(), None).await?;
    let report = apply_total(config.clone(), dir.path()).await?;
    assert_eq!(report.added.len(), 2);

    let store = FeatureStore::from_repo_config(config).await?;
    let outcomes = store
        .materialize(None, end - Duration::days(2), end, None)
        .await?;
    assert_eq!(outcomes.len(), 1);
    let stats = outcomes[0].result.as_ref().map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(stats.rows_read, rows.len());

    let response = store
        .get_online_features(
            &[
                "driver_hourly_stats:conv_rate",
                "driver_hourly_stats:avg_daily_trips",
            ],
            &[driver(1001), driver(1003), driver(4242)],
        )
        .await?;
    assert_eq!(
        response.values("driver_hourly_stats:conv_rate").unwrap(),
        &[Some(Value::Double(0.999)), Some(Value::Double(3.0 / 10.0 + 1.0 / 1000.0)), None]
    );
    assert_eq!(
        response.values("driver_hourly_stats:avg_daily_trips").unwrap(),
        &[Some(Value::Int64(7)), Some(Value::Int64(10031)), None]
    );
    assert_eq!(
        response.column("driver_hourly_stats:conv_rate").unwrap().statuses,
        vec![
            FeatureStatus::Present,
            FeatureStatus::Present,
            FeatureStatus::NotFound
        ]
    );

    // A second run over the same window changes nothing.
    let outcomes = store
        .materialize(None, end - Duration::days(2), end, None)
        .await?;
    let stats = outcomes[0].result.as_ref().map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(stats.written, 0);

    let view = store.get_feature_view("driver_hourly_stats").await?;
    assert_eq!(view.materialization_intervals.len(), 2);
    Ok(())
}

#[tokio::test]
async fn older_window_does_not_overwrite_newer_values() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let end = Utc::now().duration_trunc(Duration::hours(1))?;
    let rows = driver_hourly_stats(end);
    setup_repo(dir.path(), &rows)?;

    let config = load_repo_config(dir.path(), None).await?;
    apply_total(config.clone(), dir.path()).await?;
    let store = FeatureStore::from_repo_config(config).await?;

    let views = vec!["driver_hourly_stats".to_string()];
    let split = end - Duration::hours(12);
    store
        .materialize(Some(views.as_slice()), split, end, None)
        .await?;
    store
        .materialize(Some(views.as_slice()), end - Duration::days(2), split, None)
        .await?;

    let response = store
        .get_online_features(&["driver_hourly_stats:conv_rate"], &[driver(1002)])
        .await?;
    assert_eq!(
        response.values("driver_hourly_stats:conv_rate").unwrap(),
        &[Some(Value::Double(2.0 / 10.0 + 1.0 / 1000.0))]
    );
    Ok(())
}
