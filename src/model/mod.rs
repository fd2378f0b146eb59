//! Model seam: estimators, metrics and persistence

pub mod linear;
pub mod loader;
pub mod metrics;
#[cfg(feature = "onnx")]
pub mod onnx;

use ndarray::{Array1, Array2};

use crate::error::Result;
pub use linear::LinearRegressor;
pub use loader::{load_model, save_model, ModelBundle, ModelParams};
pub use metrics::{compute_metrics, RegressionMetrics};
#[cfg(feature = "onnx")]
pub use onnx::OnnxRegressor;

/// A regression estimator
///
/// `predict` takes `&mut self` so session-backed runtimes can be wrapped.
pub trait Regressor: Send {
    fn name(&self) -> &str;

    fn is_fitted(&self) -> bool;

    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> Result<()>;

    fn predict(&mut self, x: &Array2<f64>) -> Result<Array1<f64>>;

    /// Metrics of the predictions on `x` against `y`
    fn score(&mut self, x: &Array2<f64>, y: &Array1<f64>, to_prices: bool) -> Result<RegressionMetrics> {
        let y_pred = self.predict(x)?;
        compute_metrics(&y.to_vec(), &y_pred.to_vec(), to_prices)
    }
}

/// Estimators exposing one importance score per feature
pub trait FeatureImportance: Regressor {
    fn feature_importances(&self) -> Result<Vec<f64>>;
}
