//! DVF+ - French real-estate price estimation
//!
//! This library provides:
//! - Cleaning of DVF transactions and BDNB building records
//! - Dataset assembly with price trends, external layers and dummy encoding
//! - Feature scoring and selection
//! - Price estimation for a user-described property
//!
//! # Example
//!
//! ```no_run
//! use dvfplus::data::read_table;
//! use dvfplus::dataset::{prepare_dataset, PrepareConfig};
//!
//! let sales = read_table("data/output/paris-flats.parquet").unwrap();
//! let dataset = prepare_dataset(&sales, &PrepareConfig::default()).unwrap();
//! println!("{} rows prepared", dataset.height());
//! ```

pub mod data;
pub mod dataset;
pub mod error;
pub mod geocoder;
pub mod model;
pub mod models;
pub mod predictor;
pub mod preprocessing;

// Re-export commonly used types
pub use data::{Dataset, FeatureCatalog, FeatureGroup};
pub use error::{PipelineError, Result};
pub use models::{PredictionRequest, PredictionResponse, PropertyType};
pub use predictor::PricePredictor;
