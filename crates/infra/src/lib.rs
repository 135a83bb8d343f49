//! Infrastructure layer: ingestion queue, stores, migrations, config.

pub mod config;
pub mod ingestion;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, IngestionConfig};
