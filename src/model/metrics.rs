//! Regression Metrics
//!
//! MAE, MAPE, median APE, MSE and R² on log or price scale.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::data::utils::median;
use crate::error::{PipelineError, Result};

/// Regression evaluation metrics. Percentage errors are fractions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub mae: f64,
    pub mape: f64,
    pub mdape: f64,
    pub mse: f64,
    pub r2: f64,
}

/// Absolute percentage errors; a zero target uses machine epsilon as
/// denominator
fn absolute_percentage_errors(y: &[f64], y_pred: &[f64]) -> Vec<f64> {
    y.iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).abs() / t.abs().max(f64::EPSILON))
        .collect()
}

/// Compute metrics, exponentiating both series first when `to_prices` is set
pub fn compute_metrics(y: &[f64], y_pred: &[f64], to_prices: bool) -> Result<RegressionMetrics> {
    if y.len() != y_pred.len() {
        return Err(PipelineError::Shape(format!(
            "{} targets but {} predictions",
            y.len(),
            y_pred.len()
        )));
    }
    if y.is_empty() {
        return Ok(RegressionMetrics::default());
    }

    let (y, y_pred): (Vec<f64>, Vec<f64>) = if to_prices {
        (
            y.iter().map(|v| v.exp()).collect(),
            y_pred.iter().map(|v| v.exp()).collect(),
        )
    } else {
        (y.to_vec(), y_pred.to_vec())
    };
    let n = y.len() as f64;

    let mae = y.iter().zip(&y_pred).map(|(t, p)| (t - p).abs()).sum::<f64>() / n;
    let mse = y.iter().zip(&y_pred).map(|(t, p)| (t - p).powi(2)).sum::<f64>() / n;

    let apes = absolute_percentage_errors(&y, &y_pred);
    let mape = apes.iter().sum::<f64>() / n;
    let mdape = median(&apes).unwrap_or(0.0);

    // R² = 1 - SS_res / SS_tot
    let mean = y.iter().sum::<f64>() / n;
    let ss_tot: f64 = y.iter().map(|t| (t - mean).powi(2)).sum();
    let ss_res = mse * n;
    let r2 = if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else if ss_res == 0.0 {
        1.0
    } else {
        0.0
    };

    Ok(RegressionMetrics {
        mae,
        mape,
        mdape,
        mse,
        r2,
    })
}

impl fmt::Display for RegressionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MAE {:.2} | MAPE {:.2}% | MdAPE {:.2}% | MSE {:.2e} | R² {:.2}%",
            self.mae,
            100.0 * self.mape,
            100.0 * self.mdape,
            self.mse,
            100.0 * self.r2
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_predictions() {
        let y = [100.0, 200.0, 300.0];
        let m = compute_metrics(&y, &y, false).unwrap();
        assert_eq!(m.mae, 0.0);
        assert_eq!(m.mape, 0.0);
        assert!((m.r2 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_metrics_values() {
        let y = [100.0, 200.0, 400.0];
        let pred = [110.0, 180.0, 400.0];
        let m = compute_metrics(&y, &pred, false).unwrap();
        assert!((m.mae - 10.0).abs() < 1e-9);
        assert!((m.mape - (0.1 + 0.1 + 0.0) / 3.0).abs() < 1e-12);
        assert!((m.mdape - 0.1).abs() < 1e-12);
        assert!((m.mse - 500.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_log_scale_to_prices() {
        let y = [100f64.ln(), 200f64.ln()];
        let pred = [110f64.ln(), 200f64.ln()];
        let m = compute_metrics(&y, &pred, true).unwrap();
        assert!((m.mae - 5.0).abs() < 1e-9);
        assert!((m.mape - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_length_mismatch() {
        assert!(compute_metrics(&[1.0], &[], false).is_err());
        assert_eq!(
            compute_metrics(&[], &[], false).unwrap(),
            RegressionMetrics::default()
        );
    }
}
