use crate::error::{BackendContext, FeastError, Result};
use crate::model::{EntityKey, FeatureView, Value, WriteRecord};
use arrow::array::{
    Array, ArrayRef, ArrowPrimitiveType, BinaryArray, BooleanArray, Float32Array, Float64Array,
    Int32Array, Int64Array, LargeBinaryArray, LargeStringArray, ListArray, PrimitiveArray,
    StringArray, TimestampMicrosecondArray, TimestampMillisecondArray,
    TimestampNanosecondArray, TimestampSecondArray,
};
use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Columns a feature view reads, as (view-side name, source column).
struct ColumnPlan {
    entities: Vec<(String, String)>,
    features: Vec<(String, String)>,
    event_timestamp: String,
    created_timestamp: Option<String>,
}

impl ColumnPlan {
    fn for_view(feature_view: &FeatureView) -> Self {
        let source = &feature_view.batch_source;
        let mapped = |name: &String| (name.clone(), source.source_column(name).to_string());
        Self {
            entities: feature_view.entities.iter().map(mapped).collect(),
            features: feature_view.features.iter().map(|f| mapped(&f.name)).collect(),
            event_timestamp: source.event_timestamp_column.clone(),
            created_timestamp: source.created_timestamp_column.clone(),
        }
    }

    fn source_columns(&self) -> impl Iterator<Item = &str> {
        self.entities
            .iter()
            .chain(self.features.iter())
            .map(|(_, column)| column.as_str())
            .chain(std::iter::once(self.event_timestamp.as_str()))
            .chain(self.created_timestamp.as_deref())
    }
}

/// Streams a Parquet file, or every `.parquet` file of a directory, as chunks of write
/// records inside `[start, end)`.
pub struct ParquetSource {
    files: VecDeque<PathBuf>,
    reader: Option<ParquetRecordBatchReader>,
    plan: ColumnPlan,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    chunk_size: usize,
    pending: Vec<WriteRecord>,
    finished: bool,
}

fn source_files(path: &Path) -> Result<VecDeque<PathBuf>> {
    if !path.is_dir() {
        return Ok(VecDeque::from([path.to_path_buf()]));
    }
    let mut files = Vec::new();
    let entries = std::fs::read_dir(path)
        .with_backend(|| format!("Failed to list batch source {}", path.display()))?;
    for entry in entries {
        let entry = entry.with_backend(|| format!("Failed to list batch source {}", path.display()))?;
        let file = entry.path();
        if file.extension().is_some_and(|ext| ext == "parquet") {
            files.push(file);
        }
    }
    files.sort();
    Ok(files.into())
}

impl ParquetSource {
    pub fn open(
        path: &str,
        feature_view: &FeatureView,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        chunk_size: usize,
    ) -> Result<Self> {
        let mut source = Self {
            files: source_files(Path::new(path))?,
            reader: None,
            plan: ColumnPlan::for_view(feature_view),
            start,
            end,
            chunk_size: chunk_size.max(1),
            pending: Vec::new(),
            finished: false,
        };
        // Open the first file right away so a missing file or column fails the caller.
        if let Some(first) = source.files.pop_front() {
            source.reader = Some(source.open_reader(&first)?);
        }
        Ok(source)
    }

    fn open_reader(&self, path: &Path) -> Result<ParquetRecordBatchReader> {
        debug!("Reading batch source {}", path.display());
        let file = File::open(path)
            .with_backend(|| format!("Failed to open batch source {}", path.display()))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .with_backend(|| format!("Failed to read parquet metadata of {}", path.display()))?;
        let schema = builder.schema().clone();
        let mut indices = Vec::new();
        for column in self.plan.source_columns() {
            let (index, _) = schema.column_with_name(column).ok_or_else(|| {
                FeastError::validation(format!(
                    "Column '{}' not found in {}",
                    column,
                    path.display()
                ))
            })?;
            indices.push(index);
        }
        let mask = ProjectionMask::roots(builder.parquet_schema(), indices);
        builder
            .with_projection(mask)
            .with_batch_size(self.chunk_size)
            .build()
            .with_backend(|| format!("Failed to read {}", path.display()))
    }

    fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        loop {
            if let Some(reader) = self.reader.as_mut() {
                match reader.next() {
                    Some(batch) => return batch.map(Some).backend("Failed to read parquet batch"),
                    None => self.reader = None,
                }
            }
            match self.files.pop_front() {
                Some(path) => self.reader = Some(self.open_reader(&path)?),
                None => return Ok(None),
            }
        }
    }

    fn convert_batch(&self, batch: &RecordBatch) -> Result<Vec<WriteRecord>> {
        let column = |name: &str| {
            batch.column_by_name(name).ok_or_else(|| {
                FeastError::validation(format!("Column '{}' missing from batch", name))
            })
        };
        let event_ts = timestamp_values(column(&self.plan.event_timestamp)?, &self.plan.event_timestamp)?;
        let created_ts = match &self.plan.created_timestamp {
            Some(name) => Some(timestamp_values(column(name)?, name)?),
            None => None,
        };
        let mut entities = Vec::with_capacity(self.plan.entities.len());
        for (name, source) in &self.plan.entities {
            entities.push((name, source, column_values(column(source)?, source)?));
        }
        let mut features = Vec::with_capacity(self.plan.features.len());
        for (name, source) in &self.plan.features {
            features.push((name, column_values(column(source)?, source)?));
        }

        let mut records = Vec::new();
        for row in 0..batch.num_rows() {
            let Some(event_ts) = event_ts[row] else {
                return Err(FeastError::validation(format!(
                    "Null event timestamp in column '{}'",
                    self.plan.event_timestamp
                )));
            };
            if event_ts < self.start || event_ts >= self.end {
                continue;
            }
            let mut key = Vec::with_capacity(entities.len());
            for (name, source, values) in &entities {
                let value = values[row].clone().ok_or_else(|| {
                    FeastError::validation(format!("Null entity value in column '{}'", source))
                })?;
                key.push((name.as_str(), value));
            }
            let values: BTreeMap<String, Value> = features
                .iter()
                .filter_map(|(name, values)| values[row].clone().map(|v| ((*name).clone(), v)))
                .collect();
            records.push(WriteRecord {
                entity_key: EntityKey::new(key)?,
                values,
                event_ts,
                created_ts: created_ts.as_ref().and_then(|c| c[row]),
            });
        }
        Ok(records)
    }

    fn fail(&mut self, err: FeastError) -> Option<Result<Vec<WriteRecord>>> {
        self.finished = true;
        self.reader = None;
        self.files.clear();
        self.pending.clear();
        Some(Err(err))
    }
}

impl Iterator for ParquetSource {
    type Item = Result<Vec<WriteRecord>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.pending.len() >= self.chunk_size {
                return Some(Ok(self.pending.drain(..self.chunk_size).collect()));
            }
            if self.finished {
                if self.pending.is_empty() {
                    return None;
                }
                return Some(Ok(std::mem::take(&mut self.pending)));
            }
            match self.next_batch() {
                Ok(Some(batch)) => match self.convert_batch(&batch) {
                    Ok(records) => self.pending.extend(records),
                    Err(err) => return self.fail(err),
                },
                Ok(None) => self.finished = true,
                Err(err) => return self.fail(err),
            }
        }
    }
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, column: &str) -> Result<&'a T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        FeastError::validation(format!(
            "Column '{}' does not match its declared type {}",
            column,
            array.data_type()
        ))
    })
}

fn collect<A: Array, F: Fn(&A, usize) -> Value>(array: &A, value: F) -> Vec<Option<Value>> {
    (0..array.len())
        .map(|i| (!array.is_null(i)).then(|| value(array, i)))
        .collect()
}

/// Converts a column into per-row values. Narrow integers and floats are widened.
fn column_values(array: &ArrayRef, column: &str) -> Result<Vec<Option<Value>>> {
    let values = match array.data_type() {
        DataType::Int64 => collect(downcast::<Int64Array>(array, column)?, |a, i| {
            Value::Int64(a.value(i))
        }),
        DataType::Int32 => collect(downcast::<Int32Array>(array, column)?, |a, i| {
            Value::Int64(a.value(i) as i64)
        }),
        DataType::Float64 => collect(downcast::<Float64Array>(array, column)?, |a, i| {
            Value::Double(a.value(i))
        }),
        DataType::Float32 => collect(downcast::<Float32Array>(array, column)?, |a, i| {
            Value::Double(a.value(i) as f64)
        }),
        DataType::Boolean => collect(downcast::<BooleanArray>(array, column)?, |a, i| {
            Value::Bool(a.value(i))
        }),
        DataType::Utf8 => collect(downcast::<StringArray>(array, column)?, |a, i| {
            Value::String(a.value(i).to_string())
        }),
        DataType::LargeUtf8 => collect(downcast::<LargeStringArray>(array, column)?, |a, i| {
            Value::String(a.value(i).to_string())
        }),
        DataType::Binary => collect(downcast::<BinaryArray>(array, column)?, |a, i| {
            Value::Bytes(a.value(i).to_vec())
        }),
        DataType::LargeBinary => collect(downcast::<LargeBinaryArray>(array, column)?, |a, i| {
            Value::Bytes(a.value(i).to_vec())
        }),
        DataType::List(_) => {
            let list = downcast::<ListArray>(array, column)?;
            let mut values = Vec::with_capacity(list.len());
            for i in 0..list.len() {
                if list.is_null(i) {
                    values.push(None);
                } else {
                    values.push(Some(list_value(&list.value(i), column)?));
                }
            }
            values
        }
        other => {
            return Err(FeastError::validation(format!(
                "Column '{}' has unsupported type {}",
                column, other
            )));
        }
    };
    Ok(values)
}

fn list_value(items: &ArrayRef, column: &str) -> Result<Value> {
    if items.null_count() > 0 {
        return Err(FeastError::validation(format!(
            "Column '{}' holds a list with null elements",
            column
        )));
    }
    let n = items.len();
    let value = match items.data_type() {
        DataType::Int64 => {
            let a = downcast::<Int64Array>(items, column)?;
            Value::Int64List(a.values().to_vec())
        }
        DataType::Int32 => {
            let a = downcast::<Int32Array>(items, column)?;
            Value::Int64List(a.values().iter().map(|v| *v as i64).collect())
        }
        DataType::Float64 => {
            let a = downcast::<Float64Array>(items, column)?;
            Value::DoubleList(a.values().to_vec())
        }
        DataType::Float32 => {
            let a = downcast::<Float32Array>(items, column)?;
            Value::DoubleList(a.values().iter().map(|v| *v as f64).collect())
        }
        DataType::Boolean => {
            let a = downcast::<BooleanArray>(items, column)?;
            Value::BoolList((0..n).map(|i| a.value(i)).collect())
        }
        DataType::Utf8 => {
            let a = downcast::<StringArray>(items, column)?;
            Value::StringList((0..n).map(|i| a.value(i).to_string()).collect())
        }
        DataType::LargeUtf8 => {
            let a = downcast::<LargeStringArray>(items, column)?;
            Value::StringList((0..n).map(|i| a.value(i).to_string()).collect())
        }
        DataType::Binary => {
            let a = downcast::<BinaryArray>(items, column)?;
            Value::BytesList((0..n).map(|i| a.value(i).to_vec()).collect())
        }
        other => {
            return Err(FeastError::validation(format!(
                "Column '{}' has unsupported list element type {}",
                column, other
            )));
        }
    };
    Ok(value)
}

fn raw_timestamps<T>(
    array: &PrimitiveArray<T>,
    column: &str,
    convert: fn(i64) -> Option<DateTime<Utc>>,
) -> Result<Vec<Option<DateTime<Utc>>>>
where
    T: ArrowPrimitiveType<Native = i64>,
{
    (0..array.len())
        .map(|i| {
            if array.is_null(i) {
                return Ok(None);
            }
            let raw = array.value(i);
            convert(raw).map(Some).ok_or_else(|| {
                FeastError::validation(format!(
                    "Timestamp {} in column '{}' is out of range",
                    raw, column
                ))
            })
        })
        .collect()
}

/// Reads a timestamp column as UTC instants.
///
/// Arrow stores timezone-aware timestamps as UTC epoch values, and naive ones as wall
/// clock values; both are taken as-is, so naive timestamps are interpreted as UTC.
fn timestamp_values(array: &ArrayRef, column: &str) -> Result<Vec<Option<DateTime<Utc>>>> {
    match array.data_type() {
        DataType::Timestamp(TimeUnit::Second, _) => raw_timestamps(
            downcast::<TimestampSecondArray>(array, column)?,
            column,
            |v| DateTime::from_timestamp(v, 0),
        ),
        DataType::Timestamp(TimeUnit::Millisecond, _) => raw_timestamps(
            downcast::<TimestampMillisecondArray>(array, column)?,
            column,
            DateTime::from_timestamp_millis,
        ),
        DataType::Timestamp(TimeUnit::Microsecond, _) => raw_timestamps(
            downcast::<TimestampMicrosecondArray>(array, column)?,
            column,
            DateTime::from_timestamp_micros,
        ),
        DataType::Timestamp(TimeUnit::Nanosecond, _) => raw_timestamps(
            downcast::<TimestampNanosecondArray>(array, column)?,
            column,
            |v| Some(DateTime::from_timestamp_nanos(v)),
        ),
        other => Err(FeastError::validation(format!(
            "Column '{}' must be a timestamp, found {}",
            column, other
        ))),
    }
}
