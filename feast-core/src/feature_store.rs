//! Feature Store module. Contains main logic for feature retrieval and management.

mod feature_store_impl;
mod response_builder;

use crate::error::{FeastError, Result};
use crate::model::Value;
use std::collections::BTreeMap;
use std::fmt;

pub use feature_store_impl::FeatureStore;
pub use response_builder::{FeatureResults, FeatureStatus, OnlineResponse};

/// Entity name to value for one requested row.
pub type EntityRow = BTreeMap<String, Value>;

/// A `<feature view>:<feature>` reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeatureRef {
    pub feature_view: String,
    pub feature: String,
}

impl FeatureRef {
    pub fn parse(reference: &str) -> Result<Self> {
        match reference.split_once(':') {
            Some((view, feature))
                if !view.is_empty() && !feature.is_empty() && !feature.contains(':') =>
            {
                Ok(Self {
                    feature_view: view.to_string(),
                    feature: feature.to_string(),
                })
            }
            _ => Err(FeastError::validation(format!(
                "Invalid feature reference '{}', expected '<feature view>:<feature>'",
                reference
            ))),
        }
    }
}

impl fmt::Display for FeatureRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.feature_view, self.feature)
    }
}
