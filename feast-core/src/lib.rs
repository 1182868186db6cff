pub mod config;
pub mod error;
pub mod feature_store;
mod key_serialization;
pub mod materializer;
pub mod model;
pub mod offlinestore;
pub mod onlinestore;
pub mod provider;
pub mod registry;
pub mod repo_operations;
mod util;

pub mod feast {
    pub mod types;
    pub mod core;
}

pub use error::{FeastError, Result};
pub use feature_store::{EntityRow, FeatureStore, OnlineResponse};
