//! Feature repo handling: a directory holding `feature_store.yaml` plus YAML definition files.

use crate::config::RepoConfig;
use crate::error::{BackendContext, FeastError, Result};
use crate::feature_store::FeatureStore;
use crate::model::RegistryObject;
use crate::registry::ApplyReport;
use arrow::array::{Float64Array, Int64Array, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Duration, DurationRound, Utc};
use parquet::arrow::ArrowWriter;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

pub const FEATURE_STORE_YAML: &str = "feature_store.yaml";

const INIT_CONFIG: &str = r#"project: my_project
registry: data/registry.pb
provider: local
online_store:
  type: sqlite
  path: data/online_store.db
"#;

const INIT_DEFINITIONS: &str = r#"- kind: entity
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
  ttl_seconds: 86400
  batch_source:
    path: data/driver_stats.parquet
    event_timestamp_column: datetime
    created_timestamp_column: created
"#;

const SAMPLE_DRIVERS: [i64; 5] = [1001, 1002, 1003, 1004, 1005];
const SAMPLE_HOURS: i64 = 48;

/// Reads the repo config. `config_path` overrides `<repo_path>/feature_store.yaml`.
pub async fn load_repo_config(repo_path: &Path, config_path: Option<&Path>) -> Result<RepoConfig> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| repo_path.join(FEATURE_STORE_YAML));
    let yaml = match fs::read_to_string(&path).await {
        Ok(yaml) => yaml,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(FeastError::validation(format!(
                "Can't find feature repo configuration file at {}",
                path.display()
            )));
        }
        Err(err) => return Err(err).with_backend(|| format!("Failed to read {}", path.display())),
    };
    debug!("Loaded repo config from {}", path.display());
    Ok(RepoConfig::from_yaml_str(&yaml)?.with_repo_path(repo_path))
}

/// Parses one definitions document: a YAML list of `kind`-tagged objects.
pub fn parse_definitions(yaml: &str) -> Result<Vec<RegistryObject>> {
    if yaml.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_saphyr::from_str(yaml)
        .map_err(|err| FeastError::validation(format!("Invalid definitions: {}", err)))
}

pub async fn load_definitions_file(path: &Path) -> Result<Vec<RegistryObject>> {
    let yaml = fs::read_to_string(path)
        .await
        .with_backend(|| format!("Failed to read {}", path.display()))?;
    parse_definitions(&yaml).map_err(|err| match err {
        FeastError::Validation(message) => {
            FeastError::Validation(format!("{}: {}", path.display(), message))
        }
        other => other,
    })
}

fn is_definitions_file(path: &Path) -> bool {
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    is_yaml && path.file_name().and_then(|n| n.to_str()) != Some(FEATURE_STORE_YAML)
}

/// Every object defined in the repo's top-level definition files, in file name order.
pub async fn parse_repo(repo_path: &Path) -> Result<Vec<RegistryObject>> {
    let mut entries = fs::read_dir(repo_path)
        .await
        .with_backend(|| format!("Failed to list feature repo {}", repo_path.display()))?;
    let mut files: Vec<PathBuf> = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_backend(|| format!("Failed to list feature repo {}", repo_path.display()))?
    {
        let path = entry.path();
        if path.is_file() && is_definitions_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    let mut objects = Vec::new();
    for file in files {
        let mut parsed = load_definitions_file(&file).await?;
        debug!("Parsed {} objects from {}", parsed.len(), file.display());
        objects.append(&mut parsed);
    }
    Ok(objects)
}

/// Makes the registry project match the repo definitions and syncs online storage.
pub async fn apply_total(repo_config: RepoConfig, repo_path: &Path) -> Result<ApplyReport> {
    let objects = parse_repo(repo_path).await?;
    let store = FeatureStore::from_repo_config(repo_config).await?;
    store.apply_total(objects).await
}

pub async fn teardown(repo_config: RepoConfig) -> Result<()> {
    FeatureStore::from_repo_config(repo_config)
        .await?
        .teardown()
        .await
}

/// The registry contents as pretty-printed JSON.
pub async fn registry_dump(repo_config: RepoConfig) -> Result<String> {
    let store = FeatureStore::from_repo_config(repo_config).await?;
    let snapshot = store.registry().snapshot().await?;
    serde_json::to_string_pretty(snapshot.as_ref()).backend("Failed to serialize registry")
}

/// Creates a new feature repo in `repo_path`. Unless `minimal`, an example definitions file
/// and generated driver statistics are written alongside the config.
pub async fn init_repo(repo_path: &Path, minimal: bool) -> Result<()> {
    let config_path = repo_path.join(FEATURE_STORE_YAML);
    if fs::try_exists(&config_path)
        .await
        .with_backend(|| format!("Failed to inspect {}", config_path.display()))?
    {
        return Err(FeastError::validation(format!(
            "Feature repo already exists at {}",
            config_path.display()
        )));
    }
    fs::create_dir_all(repo_path.join("data"))
        .await
        .with_backend(|| format!("Failed to create {}", repo_path.display()))?;
    fs::write(&config_path, INIT_CONFIG)
        .await
        .with_backend(|| format!("Failed to write {}", config_path.display()))?;
    if !minimal {
        let definitions = repo_path.join("example.yaml");
        fs::write(&definitions, INIT_DEFINITIONS)
            .await
            .with_backend(|| format!("Failed to write {}", definitions.display()))?;
        let data_path = repo_path.join("data").join("driver_stats.parquet");
        let end = Utc::now()
            .duration_trunc(Duration::hours(1))
            .backend("Failed to compute sample window")?;
        tokio::task::spawn_blocking(move || write_driver_stats(&data_path, end))
            .await
            .backend("Sample data task failed")??;
    }
    info!("Initialized feature repo in {}", repo_path.display());
    Ok(())
}

/// Hourly driver statistics for the hours before `end`.
fn write_driver_stats(path: &Path, end: DateTime<Utc>) -> Result<()> {
    let micros = |ts: DateTime<Utc>| ts.timestamp_micros();
    let mut driver_ids = Vec::new();
    let mut datetimes = Vec::new();
    let mut created = Vec::new();
    let mut conv_rates = Vec::new();
    let mut trips = Vec::new();
    for (driver_index, driver_id) in SAMPLE_DRIVERS.iter().enumerate() {
        for hour in 0..SAMPLE_HOURS {
            let ts = end - Duration::hours(SAMPLE_HOURS - hour);
            let step = driver_index as i64 * SAMPLE_HOURS + hour;
            driver_ids.push(*driver_id);
            datetimes.push(micros(ts));
            created.push(micros(ts + Duration::minutes(5)));
            conv_rates.push(((step * 37) % 100) as f64 / 100.0);
            trips.push((step * 13) % 1000);
        }
    }
    let ts_type = DataType::Timestamp(TimeUnit::Microsecond, Some(Arc::from("UTC")));
    let schema = Arc::new(Schema::new(vec![
        Field::new("driver_id", DataType::Int64, false),
        Field::new("datetime", ts_type.clone(), false),
        Field::new("created", ts_type, false),
        Field::new("conv_rate", DataType::Float64, false),
        Field::new("avg_daily_trips", DataType::Int64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(driver_ids)),
            Arc::new(TimestampMicrosecondArray::from(datetimes).with_timezone("UTC")),
            Arc::new(TimestampMicrosecondArray::from(created).with_timezone("UTC")),
            Arc::new(Float64Array::from(conv_rates)),
            Arc::new(Int64Array::from(trips)),
        ],
    )
    .backend("Failed to build sample data")?;
    let file = std::fs::File::create(path)
        .with_backend(|| format!("Failed to create {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None).backend("Failed to open parquet writer")?;
    writer.write(&batch).backend("Failed to write sample data")?;
    writer.close().backend("Failed to finish sample data")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Labels;
    use anyhow::Result;
    use chrono::TimeZone;

    const MEMORY_CONFIG: &str = r#"project: repo_test
registry: registry.pb
online_store:
  type: memory
"#;

    #[tokio::test]
    async fn missing_config_is_reported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let err = load_repo_config(dir.path(), None).await.unwrap_err();
        assert!(err.is_validation());
        Ok(())
    }

    #[tokio::test]
    async fn parse_repo_skips_config_and_other_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(FEATURE_STORE_YAML), MEMORY_CONFIG)?;
        std::fs::write(dir.path().join("b_views.yml"), &INIT_DEFINITIONS[INIT_DEFINITIONS.find("- kind: feature_view").unwrap()..])?;
        std::fs::write(dir.path().join("a_entities.yaml"), "- kind: entity\n  name: driver_id\n  value_type: INT64\n")?;
        std::fs::write(dir.path().join("notes.txt"), "- kind: entity")?;
        let objects = parse_repo(dir.path()).await?;
        let names: Vec<&str> = objects.iter().map(RegistryObject::name).collect();
        assert_eq!(names, vec!["driver_id", "driver_hourly_stats"]);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_definitions_name_the_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "- kind: table\n  name: nope\n")?;
        let err = load_definitions_file(&path).await.unwrap_err();
        assert!(err.to_string().contains("broken.yaml"));
        Ok(())
    }

    #[tokio::test]
    async fn apply_dump_and_teardown() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(FEATURE_STORE_YAML), MEMORY_CONFIG)?;
        std::fs::write(dir.path().join("example.yaml"), INIT_DEFINITIONS)?;

        let config = load_repo_config(dir.path(), None).await?;
        let report = apply_total(config.clone(), dir.path()).await?;
        assert_eq!(report.added.len(), 2);
        let report = apply_total(config.clone(), dir.path()).await?;
        assert!(report.is_noop());

        let dump: serde_json::Value = serde_json::from_str(&registry_dump(config.clone()).await?)?;
        assert!(dump["projects"]["repo_test"]["feature_views"]["driver_hourly_stats"].is_object());

        teardown(config.clone()).await?;
        assert!(!dir.path().join("registry.pb").exists());
        let store = FeatureStore::from_repo_config(config).await?;
        assert!(store.list_entities(&Labels::new()).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn init_writes_a_loadable_repo() -> Result<()> {
        let dir = tempfile::tempdir()?;
        init_repo(dir.path(), false).await?;
        let config = load_repo_config(dir.path(), None).await?;
        assert_eq!(config.project, "my_project");
        assert_eq!(parse_repo(dir.path()).await?.len(), 2);
        assert!(dir.path().join("data/driver_stats.parquet").exists());

        let err = init_repo(dir.path(), true).await.unwrap_err();
        assert!(err.is_validation());
        Ok(())
    }

    #[tokio::test]
    async fn minimal_init_writes_only_config() -> Result<()> {
        let dir = tempfile::tempdir()?;
        init_repo(dir.path(), true).await?;
        assert!(dir.path().join(FEATURE_STORE_YAML).exists());
        assert!(parse_repo(dir.path()).await?.is_empty());
        Ok(())
    }

    #[test]
    fn sample_data_is_readable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stats.parquet");
        let end = Utc.with_ymd_and_hms(2021, 4, 12, 0, 0, 0).unwrap();
        write_driver_stats(&path, end)?;
        let file = std::fs::File::open(&path)?;
        let reader =
            parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        let rows: usize = reader.map(|batch| batch.map(|b| b.num_rows())).sum::<std::result::Result<usize, _>>()?;
        assert_eq!(rows, SAMPLE_DRIVERS.len() * SAMPLE_HOURS as usize);
        Ok(())
    }
}
