use crate::error::{FeastError, Result};
use crate::feast::core::{
    DataSource as DataSourceProto, Entity as EntityProto, EntityMeta as EntityMetaProto,
    EntitySpec as EntitySpecProto, FeatureSpec as FeatureSpecProto,
    FeatureView as FeatureViewProto, FeatureViewMeta as FeatureViewMetaProto,
    FeatureViewSpec as FeatureViewSpecProto, FileFormat as FileFormatProto,
    MaterializationInterval as MaterializationIntervalProto,
};
use crate::feast::types::value::Val;
use crate::feast::types::{
    BoolList, BytesList, DoubleList, Int64List, StringList, Value as ValueProto,
};
use crate::key_serialization::serialize_key;
use crate::util::{
    datetime_to_prost_timestamp, duration_to_prost_duration, prost_duration_to_duration,
    prost_timestamp_to_datetime,
};
use chrono::{DateTime, Duration, Utc};
use prost::Message;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub use crate::feast::types::ValueType;

pub type Labels = BTreeMap<String, String>;

impl ValueType {
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Invalid => "INVALID",
            ValueType::Bytes => "BYTES",
            ValueType::String => "STRING",
            ValueType::Int64 => "INT64",
            ValueType::Double => "DOUBLE",
            ValueType::Bool => "BOOL",
            ValueType::BytesList => "BYTES_LIST",
            ValueType::StringList => "STRING_LIST",
            ValueType::Int64List => "INT64_LIST",
            ValueType::DoubleList => "DOUBLE_LIST",
            ValueType::BoolList => "BOOL_LIST",
        }
    }

    fn from_proto_i32(value: i32, owner: &str) -> Result<Self> {
        match ValueType::try_from(value) {
            Ok(ValueType::Invalid) | Err(_) => Err(FeastError::validation(format!(
                "Invalid value type {} for {}",
                value, owner
            ))),
            Ok(value_type) => Ok(value_type),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ValueType {
    type Err = FeastError;

    fn from_str(s: &str) -> Result<Self> {
        let value_type = match s.to_ascii_uppercase().as_str() {
            "BYTES" => ValueType::Bytes,
            "STRING" => ValueType::String,
            "INT64" => ValueType::Int64,
            "DOUBLE" => ValueType::Double,
            "BOOL" => ValueType::Bool,
            "BYTES_LIST" => ValueType::BytesList,
            "STRING_LIST" => ValueType::StringList,
            "INT64_LIST" => ValueType::Int64List,
            "DOUBLE_LIST" => ValueType::DoubleList,
            "BOOL_LIST" => ValueType::BoolList,
            other => {
                return Err(FeastError::validation(format!(
                    "Unknown value type '{}'",
                    other
                )));
            }
        };
        Ok(value_type)
    }
}

impl Serialize for ValueType {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for ValueType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        ValueType::from_str(&name).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Int64(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Int64List(Vec<i64>),
    DoubleList(Vec<f64>),
    StringList(Vec<String>),
    BytesList(Vec<Vec<u8>>),
    BoolList(Vec<bool>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int64(_) => ValueType::Int64,
            Value::Double(_) => ValueType::Double,
            Value::String(_) => ValueType::String,
            Value::Bytes(_) => ValueType::Bytes,
            Value::Bool(_) => ValueType::Bool,
            Value::Int64List(_) => ValueType::Int64List,
            Value::DoubleList(_) => ValueType::DoubleList,
            Value::StringList(_) => ValueType::StringList,
            Value::BytesList(_) => ValueType::BytesList,
            Value::BoolList(_) => ValueType::BoolList,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        ValueProto::from(self).encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let proto = ValueProto::decode(bytes)
            .map_err(|e| FeastError::backend("Failed to decode stored value", e))?;
        Value::try_from(proto)
    }
}

impl From<&Value> for ValueProto {
    fn from(value: &Value) -> Self {
        let val = match value.clone() {
            Value::Int64(v) => Val::Int64Val(v),
            Value::Double(v) => Val::DoubleVal(v),
            Value::String(v) => Val::StringVal(v),
            Value::Bytes(v) => Val::BytesVal(v),
            Value::Bool(v) => Val::BoolVal(v),
            Value::Int64List(val) => Val::Int64ListVal(Int64List { val }),
            Value::DoubleList(val) => Val::DoubleListVal(DoubleList { val }),
            Value::StringList(val) => Val::StringListVal(StringList { val }),
            Value::BytesList(val) => Val::BytesListVal(BytesList { val }),
            Value::BoolList(val) => Val::BoolListVal(BoolList { val }),
        };
        ValueProto { val: Some(val) }
    }
}

impl TryFrom<ValueProto> for Value {
    type Error = FeastError;

    fn try_from(proto: ValueProto) -> Result<Self> {
        let val = proto
            .val
            .ok_or_else(|| FeastError::validation("Value message without a value"))?;
        Ok(match val {
            Val::Int64Val(v) => Value::Int64(v),
            Val::DoubleVal(v) => Value::Double(v),
            Val::StringVal(v) => Value::String(v),
            Val::BytesVal(v) => Value::Bytes(v),
            Val::BoolVal(v) => Value::Bool(v),
            Val::Int64ListVal(list) => Value::Int64List(list.val),
            Val::DoubleListVal(list) => Value::DoubleList(list.val),
            Val::StringListVal(list) => Value::StringList(list.val),
            Val::BytesListVal(list) => Value::BytesList(list.val),
            Val::BoolListVal(list) => Value::BoolList(list.val),
        })
    }
}

/// Canonical entity key: join key names sorted, each value carried along with its name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityKey {
    entity_names: Vec<String>,
    entity_values: Vec<Value>,
}

impl EntityKey {
    pub fn new<I, N>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (N, Value)>,
        N: Into<String>,
    {
        let mut pairs: Vec<(String, Value)> =
            pairs.into_iter().map(|(n, v)| (n.into(), v)).collect();
        if pairs.is_empty() {
            return Err(FeastError::validation("Entity key without join keys"));
        }
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(dup) = pairs.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(FeastError::validation(format!(
                "Duplicate join key '{}' in entity key",
                dup[0].0
            )));
        }
        let (entity_names, entity_values) = pairs.into_iter().unzip();
        Ok(Self {
            entity_names,
            entity_values,
        })
    }

    pub fn single(name: impl Into<String>, value: Value) -> Self {
        Self {
            entity_names: vec![name.into()],
            entity_values: vec![value],
        }
    }

    pub fn entity_names(&self) -> &[String] {
        &self.entity_names
    }

    pub fn entity_values(&self) -> &[Value] {
        &self.entity_values
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entity_names
            .binary_search_by(|n| n.as_str().cmp(name))
            .ok()
            .map(|idx| &self.entity_values[idx])
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serialize_key(self)
    }
}

/// Parses a flat `k1,v1,k2,v2` label string taken verbatim. Empty input yields no labels.
pub fn parse_labels(labels: &str) -> Result<Labels> {
    let mut result = Labels::new();
    if labels.is_empty() {
        return Ok(result);
    }
    let parts: Vec<&str> = labels.split(',').collect();
    if parts.len() % 2 == 1 {
        return Err(FeastError::validation(
            "Uneven key-value label pairs were entered",
        ));
    }
    for pair in parts.chunks(2) {
        result.insert(pair[0].to_string(), pair[1].to_string());
    }
    Ok(result)
}

/// True when `labels` contains every pair of `filter`.
pub fn labels_match(labels: &Labels, filter: &Labels) -> bool {
    filter
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub value_type: ValueType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default, skip_deserializing)]
    pub last_updated_timestamp: Option<DateTime<Utc>>,
}

impl Entity {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            description: String::new(),
            labels: Labels::new(),
            last_updated_timestamp: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Compares user-declared fields only.
    pub fn same_definition(&self, other: &Entity) -> bool {
        self.name == other.name
            && self.value_type == other.value_type
            && self.description == other.description
            && self.labels == other.labels
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub dtype: ValueType,
}

impl Feature {
    pub fn new(name: impl Into<String>, dtype: ValueType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    #[default]
    Parquet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSource {
    pub path: String,
    #[serde(default)]
    pub file_format: FileFormat,
    pub event_timestamp_column: String,
    #[serde(default)]
    pub created_timestamp_column: Option<String>,
    /// Source column name to feature or entity name.
    #[serde(default)]
    pub field_mapping: BTreeMap<String, String>,
}

impl BatchSource {
    pub fn parquet(path: impl Into<String>, event_timestamp_column: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            file_format: FileFormat::Parquet,
            event_timestamp_column: event_timestamp_column.into(),
            created_timestamp_column: None,
            field_mapping: BTreeMap::new(),
        }
    }

    pub fn with_created_timestamp_column(mut self, column: impl Into<String>) -> Self {
        self.created_timestamp_column = Some(column.into());
        self
    }

    /// Name of the source column holding `field`, honouring the field mapping.
    pub fn source_column<'a>(&'a self, field: &'a str) -> &'a str {
        self.field_mapping
            .iter()
            .find(|(_, target)| target.as_str() == field)
            .map(|(source, _)| source.as_str())
            .unwrap_or(field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializationInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

mod ttl_seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(ttl.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let seconds = i64::deserialize(deserializer)?;
        Ok(Duration::seconds(seconds.max(0)))
    }
}

fn zero_ttl() -> Duration {
    Duration::zero()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureView {
    pub name: String,
    pub entities: Vec<String>,
    pub features: Vec<Feature>,
    #[serde(default)]
    pub tags: Labels,
    /// Zero means values never expire.
    #[serde(rename = "ttl_seconds", with = "ttl_seconds", default = "zero_ttl")]
    pub ttl: Duration,
    pub batch_source: BatchSource,
    #[serde(default, skip_deserializing)]
    pub created_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_deserializing)]
    pub last_updated_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_deserializing)]
    pub materialization_intervals: Vec<MaterializationInterval>,
}

impl FeatureView {
    pub fn new(
        name: impl Into<String>,
        entities: Vec<String>,
        features: Vec<Feature>,
        batch_source: BatchSource,
    ) -> Self {
        Self {
            name: name.into(),
            entities,
            features,
            tags: Labels::new(),
            ttl: Duration::zero(),
            batch_source,
            created_timestamp: None,
            last_updated_timestamp: None,
            materialization_intervals: Vec::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn feature(&self, name: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.name == name)
    }

    /// Compares user-declared fields only, ignoring registry metadata.
    pub fn same_definition(&self, other: &FeatureView) -> bool {
        self.name == other.name
            && self.entities == other.entities
            && self.features == other.features
            && self.tags == other.tags
            && self.ttl == other.ttl
            && self.batch_source == other.batch_source
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(FeastError::validation("Feature view without a name"));
        }
        if self.entities.is_empty() {
            return Err(FeastError::validation(format!(
                "Feature view '{}' references no entities",
                self.name
            )));
        }
        let mut seen = std::collections::BTreeSet::new();
        for feature in &self.features {
            if !seen.insert(feature.name.as_str()) {
                return Err(FeastError::validation(format!(
                    "Feature '{}' declared twice in feature view '{}'",
                    feature.name, self.name
                )));
            }
            if self.entities.contains(&feature.name) {
                return Err(FeastError::validation(format!(
                    "Feature '{}' in feature view '{}' shadows an entity",
                    feature.name, self.name
                )));
            }
        }
        if self.batch_source.event_timestamp_column.is_empty() {
            return Err(FeastError::validation(format!(
                "Feature view '{}' has no event timestamp column",
                self.name
            )));
        }
        Ok(())
    }
}

/// An object declared in a feature repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegistryObject {
    Entity(Entity),
    FeatureView(FeatureView),
}

impl RegistryObject {
    pub fn name(&self) -> &str {
        match self {
            RegistryObject::Entity(e) => &e.name,
            RegistryObject::FeatureView(fv) => &fv.name,
        }
    }
}

impl From<Entity> for RegistryObject {
    fn from(entity: Entity) -> Self {
        RegistryObject::Entity(entity)
    }
}

impl From<FeatureView> for RegistryObject {
    fn from(feature_view: FeatureView) -> Self {
        RegistryObject::FeatureView(feature_view)
    }
}

/// Conflict-resolution order of an online value: event time first, created time as the
/// tie breaker. A missing created timestamp orders before any present one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RecordVersion {
    pub event_ts: DateTime<Utc>,
    pub created_ts: Option<DateTime<Utc>>,
}

/// Integer encoding of a missing created timestamp; sorts before every real timestamp.
const MISSING_CREATED_TS: i64 = i64::MIN;

impl RecordVersion {
    pub fn new(event_ts: DateTime<Utc>, created_ts: Option<DateTime<Utc>>) -> Self {
        Self {
            event_ts,
            created_ts,
        }
    }

    pub fn supersedes(&self, stored: &RecordVersion) -> bool {
        self > stored
    }

    /// Order preserving nanosecond encoding used by storage backends.
    pub(crate) fn to_nanos(self) -> Result<(i64, i64)> {
        let to_nanos = |ts: DateTime<Utc>| {
            ts.timestamp_nanos_opt().ok_or_else(|| {
                FeastError::validation(format!("Timestamp {} is out of storable range", ts))
            })
        };
        let event = to_nanos(self.event_ts)?;
        let created = match self.created_ts {
            Some(ts) => to_nanos(ts)?,
            None => MISSING_CREATED_TS,
        };
        Ok((event, created))
    }

    pub(crate) fn from_nanos(event: i64, created: i64) -> Self {
        Self {
            event_ts: DateTime::from_timestamp_nanos(event),
            created_ts: (created != MISSING_CREATED_TS)
                .then(|| DateTime::from_timestamp_nanos(created)),
        }
    }
}

/// One row produced by a batch source or an ingestion client.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub entity_key: EntityKey,
    pub values: BTreeMap<String, Value>,
    pub event_ts: DateTime<Utc>,
    pub created_ts: Option<DateTime<Utc>>,
}

impl WriteRecord {
    pub fn version(&self) -> RecordVersion {
        RecordVersion::new(self.event_ts, self.created_ts)
    }
}

/// The single value kept per (entity key, feature).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredValue {
    pub value: Value,
    pub version: RecordVersion,
}

pub type FeatureMap = BTreeMap<String, StoredValue>;

impl TryFrom<EntityProto> for Entity {
    type Error = FeastError;

    fn try_from(entity_proto: EntityProto) -> Result<Self> {
        let spec = entity_proto
            .spec
            .ok_or_else(|| FeastError::validation("Missing entity spec"))?;
        let value_type =
            ValueType::from_proto_i32(spec.value_type, &format!("entity {}", spec.name))?;
        Ok(Entity {
            name: spec.name,
            value_type,
            description: spec.description,
            labels: spec.labels,
            last_updated_timestamp: entity_proto
                .meta
                .and_then(|meta| meta.last_updated_timestamp)
                .map(|ts| prost_timestamp_to_datetime(&ts)),
        })
    }
}

impl From<&Entity> for EntityProto {
    fn from(entity: &Entity) -> Self {
        EntityProto {
            spec: Some(EntitySpecProto {
                name: entity.name.clone(),
                value_type: entity.value_type as i32,
                description: entity.description.clone(),
                labels: entity.labels.clone(),
            }),
            meta: Some(EntityMetaProto {
                last_updated_timestamp: entity
                    .last_updated_timestamp
                    .as_ref()
                    .map(datetime_to_prost_timestamp),
            }),
        }
    }
}

impl TryFrom<FeatureSpecProto> for Feature {
    type Error = FeastError;

    fn try_from(feature_spec_proto: FeatureSpecProto) -> Result<Self> {
        let dtype = ValueType::from_proto_i32(
            feature_spec_proto.value_type,
            &format!("feature {}", feature_spec_proto.name),
        )?;
        Ok(Feature {
            name: feature_spec_proto.name,
            dtype,
        })
    }
}

impl TryFrom<DataSourceProto> for BatchSource {
    type Error = FeastError;

    fn try_from(source: DataSourceProto) -> Result<Self> {
        let file_format = match FileFormatProto::try_from(source.file_format) {
            Ok(FileFormatProto::Parquet) => FileFormat::Parquet,
            _ => {
                return Err(FeastError::validation(format!(
                    "Unsupported file format {} for source {}",
                    source.file_format, source.file_url
                )));
            }
        };
        let non_empty = |s: String| (!s.is_empty()).then_some(s);
        Ok(BatchSource {
            path: source.file_url,
            file_format,
            event_timestamp_column: source.event_timestamp_column,
            created_timestamp_column: non_empty(source.created_timestamp_column),
            field_mapping: source.field_mapping,
        })
    }
}

impl From<&BatchSource> for DataSourceProto {
    fn from(source: &BatchSource) -> Self {
        let file_format = match source.file_format {
            FileFormat::Parquet => FileFormatProto::Parquet,
        };
        DataSourceProto {
            file_url: source.path.clone(),
            file_format: file_format as i32,
            event_timestamp_column: source.event_timestamp_column.clone(),
            created_timestamp_column: source.created_timestamp_column.clone().unwrap_or_default(),
            field_mapping: source.field_mapping.clone(),
        }
    }
}

impl TryFrom<FeatureViewProto> for FeatureView {
    type Error = FeastError;

    fn try_from(feature_view_proto: FeatureViewProto) -> Result<Self> {
        let spec = feature_view_proto
            .spec
            .ok_or_else(|| FeastError::validation("Missing feature view spec"))?;
        let meta = feature_view_proto.meta.unwrap_or_default();
        let features = spec
            .features
            .into_iter()
            .map(Feature::try_from)
            .collect::<Result<Vec<_>>>()?;
        let batch_source = spec.batch_source.ok_or_else(|| {
            FeastError::validation(format!("Feature view {} has no batch source", spec.name))
        })?;
        let materialization_intervals = meta
            .materialization_intervals
            .into_iter()
            .map(|interval| {
                match (interval.start_time, interval.end_time) {
                    (Some(start), Some(end)) => Ok(MaterializationInterval {
                        start: prost_timestamp_to_datetime(&start),
                        end: prost_timestamp_to_datetime(&end),
                    }),
                    _ => Err(FeastError::validation(format!(
                        "Incomplete materialization interval in feature view {}",
                        spec.name
                    ))),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(FeatureView {
            batch_source: BatchSource::try_from(batch_source)?,
            name: spec.name,
            entities: spec.entities,
            features,
            tags: spec.tags,
            ttl: spec
                .ttl
                .as_ref()
                .map(prost_duration_to_duration)
                .unwrap_or_else(Duration::zero),
            created_timestamp: meta
                .created_timestamp
                .map(|ts| prost_timestamp_to_datetime(&ts)),
            last_updated_timestamp: meta
                .last_updated_timestamp
                .map(|ts| prost_timestamp_to_datetime(&ts)),
            materialization_intervals,
        })
    }
}

impl From<&FeatureView> for FeatureViewProto {
    fn from(view: &FeatureView) -> Self {
        FeatureViewProto {
            spec: Some(FeatureViewSpecProto {
                name: view.name.clone(),
                entities: view.entities.clone(),
                features: view
                    .features
                    .iter()
                    .map(|f| FeatureSpecProto {
                        name: f.name.clone(),
                        value_type: f.dtype as i32,
                    })
                    .collect(),
                tags: view.tags.clone(),
                ttl: Some(duration_to_prost_duration(&view.ttl)),
                batch_source: Some(DataSourceProto::from(&view.batch_source)),
            }),
            meta: Some(FeatureViewMetaProto {
                created_timestamp: view.created_timestamp.as_ref().map(datetime_to_prost_timestamp),
                last_updated_timestamp: view
                    .last_updated_timestamp
                    .as_ref()
                    .map(datetime_to_prost_timestamp),
                materialization_intervals: view
                    .materialization_intervals
                    .iter()
                    .map(|interval| MaterializationIntervalProto {
                        start_time: Some(datetime_to_prost_timestamp(&interval.start)),
                        end_time: Some(datetime_to_prost_timestamp(&interval.end)),
                    })
                    .collect(),
            }),
        }
    }
}
