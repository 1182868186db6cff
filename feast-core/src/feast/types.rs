//! Wire messages for feature values, tag-compatible with Feast's `feast/types/Value.proto`.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Value {
    #[prost(oneof = "value::Val", tags = "1, 2, 4, 5, 7, 11, 12, 14, 15, 17")]
    pub val: ::core::option::Option<value::Val>,
}

pub mod value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Val {
        #[prost(bytes = "vec", tag = "1")]
        BytesVal(::prost::alloc::vec::Vec<u8>),
        #[prost(string, tag = "2")]
        StringVal(::prost::alloc::string::String),
        #[prost(int64, tag = "4")]
        Int64Val(i64),
        #[prost(double, tag = "5")]
        DoubleVal(f64),
        #[prost(bool, tag = "7")]
        BoolVal(bool),
        #[prost(message, tag = "11")]
        BytesListVal(super::BytesList),
        #[prost(message, tag = "12")]
        StringListVal(super::StringList),
        #[prost(message, tag = "14")]
        Int64ListVal(super::Int64List),
        #[prost(message, tag = "15")]
        DoubleListVal(super::DoubleList),
        #[prost(message, tag = "17")]
        BoolListVal(super::BoolList),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BytesList {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StringList {
    #[prost(string, repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Int64List {
    #[prost(int64, repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DoubleList {
    #[prost(double, repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<f64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BoolList {
    #[prost(bool, repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ValueType {
    Invalid = 0,
    Bytes = 1,
    String = 2,
    Int64 = 4,
    Double = 5,
    Bool = 7,
    BytesList = 11,
    StringList = 12,
    Int64List = 14,
    DoubleList = 15,
    BoolList = 17,
}
