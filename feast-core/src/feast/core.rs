//! Wire messages for registry objects and the persisted registry snapshot.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EntitySpec {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(enumeration = "super::types::ValueType", tag = "2")]
    pub value_type: i32,
    #[prost(string, tag = "3")]
    pub description: ::prost::alloc::string::String,
    #[prost(btree_map = "string, string", tag = "4")]
    pub labels: ::prost::alloc::collections::BTreeMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EntityMeta {
    #[prost(message, optional, tag = "1")]
    pub last_updated_timestamp: ::core::option::Option<::prost_types::Timestamp>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Entity {
    #[prost(message, optional, tag = "1")]
    pub spec: ::core::option::Option<EntitySpec>,
    #[prost(message, optional, tag = "2")]
    pub meta: ::core::option::Option<EntityMeta>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FeatureSpec {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(enumeration = "super::types::ValueType", tag = "2")]
    pub value_type: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FileFormat {
    Invalid = 0,
    Parquet = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataSource {
    #[prost(string, tag = "1")]
    pub file_url: ::prost::alloc::string::String,
    #[prost(enumeration = "FileFormat", tag = "2")]
    pub file_format: i32,
    #[prost(string, tag = "3")]
    pub event_timestamp_column: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub created_timestamp_column: ::prost::alloc::string::String,
    #[prost(btree_map = "string, string", tag = "6")]
    pub field_mapping: ::prost::alloc::collections::BTreeMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FeatureViewSpec {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "2")]
    pub entities: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(message, repeated, tag = "3")]
    pub features: ::prost::alloc::vec::Vec<FeatureSpec>,
    #[prost(btree_map = "string, string", tag = "4")]
    pub tags: ::prost::alloc::collections::BTreeMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
    #[prost(message, optional, tag = "5")]
    pub ttl: ::core::option::Option<::prost_types::Duration>,
    #[prost(message, optional, tag = "6")]
    pub batch_source: ::core::option::Option<DataSource>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MaterializationInterval {
    #[prost(message, optional, tag = "1")]
    pub start_time: ::core::option::Option<::prost_types::Timestamp>,
    #[prost(message, optional, tag = "2")]
    pub end_time: ::core::option::Option<::prost_types::Timestamp>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FeatureViewMeta {
    #[prost(message, optional, tag = "1")]
    pub created_timestamp: ::core::option::Option<::prost_types::Timestamp>,
    #[prost(message, optional, tag = "2")]
    pub last_updated_timestamp: ::core::option::Option<::prost_types::Timestamp>,
    #[prost(message, repeated, tag = "3")]
    pub materialization_intervals: ::prost::alloc::vec::Vec<MaterializationInterval>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FeatureView {
    #[prost(message, optional, tag = "1")]
    pub spec: ::core::option::Option<FeatureViewSpec>,
    #[prost(message, optional, tag = "2")]
    pub meta: ::core::option::Option<FeatureViewMeta>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Project {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub archived: bool,
    #[prost(message, repeated, tag = "3")]
    pub entities: ::prost::alloc::vec::Vec<Entity>,
    #[prost(message, repeated, tag = "4")]
    pub feature_views: ::prost::alloc::vec::Vec<FeatureView>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Registry {
    #[prost(message, repeated, tag = "1")]
    pub projects: ::prost::alloc::vec::Vec<Project>,
    #[prost(message, optional, tag = "2")]
    pub last_updated: ::core::option::Option<::prost_types::Timestamp>,
    #[prost(uint64, tag = "3")]
    pub version: u64,
}
