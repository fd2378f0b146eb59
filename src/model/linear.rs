//! Ordinary least squares regressor backed by linfa

use linfa::prelude::*;
use linfa_linear::LinearRegression;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{FeatureImportance, Regressor};
use crate::error::{PipelineError, Result};

/// Linear regression whose fitted coefficients are plain data, so a
/// trained model serializes with the rest of the bundle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearRegressor {
    coefficients: Vec<f64>,
    intercept: f64,
    /// Standard deviation of each training feature
    feature_std: Vec<f64>,
}

impl LinearRegressor {
    pub const NAME: &'static str = "linearregression";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }
}

impl Regressor for LinearRegressor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_fitted(&self) -> bool {
        !self.coefficients.is_empty()
    }

    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> Result<()> {
        if x.nrows() != y.len() {
            return Err(PipelineError::Shape(format!(
                "{} rows of features but {} targets",
                x.nrows(),
                y.len()
            )));
        }
        if x.nrows() == 0 {
            return Err(PipelineError::Model("cannot fit on an empty dataset".to_string()));
        }

        let dataset = Dataset::new(x.clone(), y.clone());
        let model = LinearRegression::default()
            .fit(&dataset)
            .map_err(|e| PipelineError::Model(format!("linear regression failed: {}", e)))?;

        self.coefficients = model.params().to_vec();
        self.intercept = model.intercept();
        self.feature_std = x.std_axis(Axis(0), 0.0).to_vec();
        info!(
            "Linear regression fitted on {} rows x {} features",
            x.nrows(),
            x.ncols()
        );
        Ok(())
    }

    fn predict(&mut self, x: &Array2<f64>) -> Result<Array1<f64>> {
        if !self.is_fitted() {
            return Err(PipelineError::Model("model is not fitted".to_string()));
        }
        if x.ncols() != self.coefficients.len() {
            return Err(PipelineError::Shape(format!(
                "expected {} features, got {}",
                self.coefficients.len(),
                x.ncols()
            )));
        }
        let coefficients = Array1::from(self.coefficients.clone());
        Ok(x.dot(&coefficients) + self.intercept)
    }
}

impl FeatureImportance for LinearRegressor {
    /// Absolute standardized coefficients
    fn feature_importances(&self) -> Result<Vec<f64>> {
        if !self.is_fitted() {
            return Err(PipelineError::Model("model is not fitted".to_string()));
        }
        Ok(self
            .coefficients
            .iter()
            .zip(&self.feature_std)
            .map(|(c, s)| (c * s).abs())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> (Array2<f64>, Array1<f64>) {
        // y = 2 * a + 0.5 * b + 1
        let x = Array2::from_shape_vec(
            (5, 2),
            vec![1.0, 10.0, 2.0, 7.0, 3.0, 12.0, 4.0, 3.0, 5.0, 8.0],
        )
        .unwrap();
        let y = x.column(0).mapv(|a| 2.0 * a) + x.column(1).mapv(|b| 0.5 * b) + 1.0;
        (x, y)
    }

    #[test]
    fn test_fit_and_predict() {
        let (x, y) = data();
        let mut model = LinearRegressor::new();
        assert!(!model.is_fitted());
        model.fit(&x, &y).unwrap();
        assert!((model.coefficients()[0] - 2.0).abs() < 1e-6);
        assert!((model.intercept() - 1.0).abs() < 1e-6);

        let pred = model.predict(&x).unwrap();
        for (p, t) in pred.iter().zip(y.iter()) {
            assert!((p - t).abs() < 1e-6);
        }
        let metrics = model.score(&x, &y, false).unwrap();
        assert!(metrics.r2 > 0.999);
    }

    #[test]
    fn test_unfitted_and_shape_errors() {
        let (x, y) = data();
        let mut model = LinearRegressor::new();
        assert!(matches!(model.predict(&x), Err(PipelineError::Model(_))));
        model.fit(&x, &y).unwrap();
        let narrow = Array2::zeros((1, 1));
        assert!(matches!(model.predict(&narrow), Err(PipelineError::Shape(_))));
    }

    #[test]
    fn test_importances_and_serde() {
        let (x, y) = data();
        let mut model = LinearRegressor::new();
        model.fit(&x, &y).unwrap();
        let importances = model.feature_importances().unwrap();
        assert_eq!(importances.len(), 2);
        assert!(importances.iter().all(|v| *v > 0.0));

        let json = serde_json::to_string(&model).unwrap();
        let restored: LinearRegressor = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, model);
    }
}
