//! Model persistence: one JSON bundle per (estimator, area, type, version)

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{LinearRegressor, RegressionMetrics, Regressor};
use crate::dataset::build::PrepareConfig;
use crate::error::{PipelineError, Result};
use crate::models::PropertyType;

/// Fitted parameters of the persisted estimator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelParams {
    Linear(LinearRegressor),
    /// ONNX graph stored next to the bundle
    Onnx { file: String },
}

/// Everything needed to reproduce the features and predict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBundle {
    pub estimator: String,
    pub geo_area: String,
    pub property_type: PropertyType,
    pub version: u32,
    /// Feature order expected by the model
    pub feature_names: Vec<String>,
    #[serde(default)]
    pub metrics: Option<RegressionMetrics>,
    pub config: PrepareConfig,
    pub model: ModelParams,
}

impl ModelBundle {
    pub fn file_name(&self) -> String {
        file_name(&self.estimator, &self.geo_area, self.property_type, self.version)
    }

    /// Instantiate the estimator. ONNX graphs are resolved against `dir`.
    pub fn regressor(&self, dir: &Path) -> Result<Box<dyn Regressor>> {
        match &self.model {
            ModelParams::Linear(model) => Ok(Box::new(model.clone())),
            #[cfg(feature = "onnx")]
            ModelParams::Onnx { file } => Ok(Box::new(super::OnnxRegressor::load(
                dir.join(file),
                self.feature_names.len(),
            )?)),
            #[cfg(not(feature = "onnx"))]
            ModelParams::Onnx { file } => Err(PipelineError::Model(format!(
                "{} requires the onnx feature",
                dir.join(file).display()
            ))),
        }
    }
}

/// `{estimator}-{geo_area}-{property_type}-v{version}.json`, lower case
pub fn file_name(estimator: &str, geo_area: &str, property_type: PropertyType, version: u32) -> String {
    format!(
        "{}-{}-{}-v{}.json",
        estimator,
        geo_area,
        property_type.as_str(),
        version
    )
    .to_lowercase()
}

pub fn save_model(dir: &Path, bundle: &ModelBundle) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(bundle.file_name());
    fs::write(&path, serde_json::to_string_pretty(bundle)?)?;
    info!("{} and feature names saved at {:?}", bundle.estimator, path);
    Ok(path)
}

pub fn load_model(
    dir: &Path,
    estimator: &str,
    geo_area: &str,
    property_type: PropertyType,
    version: u32,
) -> Result<ModelBundle> {
    let path = dir.join(file_name(estimator, geo_area, property_type, version));
    if !path.exists() {
        return Err(PipelineError::Model(format!(
            "no model bundle at {}",
            path.display()
        )));
    }
    let bundle: ModelBundle = serde_json::from_str(&fs::read_to_string(&path)?)?;
    info!(
        "Loaded {} ({} features) from {:?}",
        bundle.estimator,
        bundle.feature_names.len(),
        path
    );
    Ok(bundle)
}
