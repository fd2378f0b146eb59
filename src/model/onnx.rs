//! Regressor running an exported ONNX graph

use ndarray::{Array1, Array2};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use std::path::Path;
use tracing::info;

use super::Regressor;
use crate::error::{PipelineError, Result};

fn model_error(e: ort::Error) -> PipelineError {
    PipelineError::Model(e.to_string())
}

/// Inference-only estimator: one `float32[n, features]` input named
/// `input`, one `float32[n]` or `float32[n, 1]` output
pub struct OnnxRegressor {
    name: String,
    session: Session,
    num_features: usize,
}

impl OnnxRegressor {
    pub fn load<P: AsRef<Path>>(path: P, num_features: usize) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading model: {:?}", path);
        let session = Session::builder()
            .map_err(model_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(model_error)?
            .commit_from_file(path)
            .map_err(model_error)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "onnx".to_string());
        Ok(Self {
            name,
            session,
            num_features,
        })
    }
}

impl Regressor for OnnxRegressor {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_fitted(&self) -> bool {
        true
    }

    fn fit(&mut self, _x: &Array2<f64>, _y: &Array1<f64>) -> Result<()> {
        Err(PipelineError::Model(
            "ONNX models are trained outside this crate".to_string(),
        ))
    }

    fn predict(&mut self, x: &Array2<f64>) -> Result<Array1<f64>> {
        if x.ncols() != self.num_features {
            return Err(PipelineError::Shape(format!(
                "expected {} features, got {}",
                self.num_features,
                x.ncols()
            )));
        }
        let rows = x.nrows();
        let input: Vec<f32> = x.iter().map(|&v| v as f32).collect();
        let tensor = Tensor::from_array(([rows, self.num_features], input)).map_err(model_error)?;
        let outputs = self
            .session
            .run(ort::inputs!["input" => tensor])
            .map_err(model_error)?;
        let (_, data) = outputs[0].try_extract_tensor::<f32>().map_err(model_error)?;
        Ok(data.iter().take(rows).map(|&v| v as f64).collect())
    }
}
