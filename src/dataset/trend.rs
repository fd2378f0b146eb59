//! Lagged moving-average price trends per neighborhood and period

use polars::prelude::*;

use crate::data::frame::{self, left_join, text_key};
use crate::error::{PipelineError, Result};

const PERIOD_MEAN: &str = "__period_mean";

/// Name of the trend column for `price_var` and `window`
pub fn trend_column_name(price_var: &str, window: usize) -> String {
    format!("{}_ma{}", price_var, window)
}

/// Window size encoded in a trend column name (`l_valeur_fonciere_ma3` -> 3)
pub fn window_from_name(name: &str) -> Option<usize> {
    let (_, window) = name.rsplit_once("_ma")?;
    window.parse().ok()
}

fn trend_keys<'a>(date_var: &'a str, neighborhood_var: Option<&'a str>) -> Vec<&'a str> {
    neighborhood_var.into_iter().chain([date_var]).collect()
}

/// Mean price per period, shifted by `lag` periods and averaged over the
/// trailing `window` periods, computed separately for each neighborhood.
///
/// The result has one row per (neighborhood, period) with the key columns
/// and `{price_var}_ma{window}`. A value is present only when the whole
/// window is available, so with `lag >= 1` a period never sees its own
/// prices or any later ones.
pub fn calc_movav_prices(
    df: &DataFrame,
    window: usize,
    lag: usize,
    price_var: &str,
    date_var: &str,
    neighborhood_var: Option<&str>,
) -> Result<DataFrame> {
    if window == 0 {
        return Err(PipelineError::Validation(
            "moving-average window must be at least 1".to_string(),
        ));
    }
    frame::column(df, price_var)?;
    let keys = trend_keys(date_var, neighborhood_var);
    let mut prices = df.clone();
    for key in &keys {
        prices = text_key(&prices, key, None)?;
    }

    let complete = keys
        .iter()
        .fold(col(price_var).is_not_null(), |acc, k| acc.and(col(*k).is_not_null()));
    let key_exprs: Vec<Expr> = keys.iter().map(|k| col(*k)).collect();

    // sum of the `window` period means ending `lag` periods back; a missing
    // term leaves the whole window missing
    let mut sum = col(PERIOD_MEAN).shift(lit(lag as i64));
    for k in 1..window {
        sum = sum + col(PERIOD_MEAN).shift(lit((lag + k) as i64));
    }
    let mut trend = sum / lit(window as f64);
    if let Some(var) = neighborhood_var {
        trend = trend.over([col(var)]);
    }

    let name = trend_column_name(price_var, window);
    let mut output = key_exprs.clone();
    output.push(trend.alias(name.as_str()));

    Ok(prices
        .lazy()
        .filter(complete)
        .group_by(key_exprs.clone())
        .agg([col(price_var).cast(DataType::Float64).mean().alias(PERIOD_MEAN)])
        .sort_by_exprs(key_exprs, SortMultipleOptions::default())
        .select(output)
        .collect()?)
}

/// Attach trend values to every row sharing the (neighborhood, period) key
pub fn add_movav_prices(
    df: &DataFrame,
    trends: &DataFrame,
    date_var: &str,
    neighborhood_var: Option<&str>,
) -> Result<DataFrame> {
    let keys = trend_keys(date_var, neighborhood_var);
    left_join(df, trends, &keys, &keys, "_trend")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frame::f64_values;

    fn monthly(prices: &[(&str, &str, f64)]) -> DataFrame {
        df!(
            "arrondissement" => prices.iter().map(|p| p.0).collect::<Vec<_>>(),
            "date_mutation" => prices.iter().map(|p| p.1).collect::<Vec<_>>(),
            "valeur_fonciere" => prices.iter().map(|p| p.2).collect::<Vec<_>>()
        )
        .unwrap()
    }

    #[test]
    fn test_window_from_name() {
        assert_eq!(window_from_name("l_valeur_fonciere_ma12"), Some(12));
        assert_eq!(window_from_name("valeur_fonciere"), None);
    }

    #[test]
    fn test_trend_ignores_current_period_spike() {
        let df = monthly(&[
            ("1", "2021-01", 100.0),
            ("1", "2021-02", 100.0),
            ("1", "2021-03", 100.0),
            ("1", "2021-04", 10_000.0),
            ("1", "2021-05", 100.0),
        ]);
        let trends =
            calc_movav_prices(&df, 2, 1, "valeur_fonciere", "date_mutation", Some("arrondissement"))
                .unwrap();
        // period index 3 holds the spike
        assert_eq!(
            f64_values(&trends, "valeur_fonciere_ma2").unwrap(),
            vec![None, None, Some(100.0), Some(100.0), Some(5_050.0)]
        );
    }

    #[test]
    fn test_lag_is_applied_per_neighborhood() {
        let df = monthly(&[
            ("1", "2021-01", 100.0),
            ("1", "2021-02", 200.0),
            ("2", "2021-01", 1_000.0),
            ("2", "2021-02", 2_000.0),
        ]);
        let trends =
            calc_movav_prices(&df, 1, 1, "valeur_fonciere", "date_mutation", Some("arrondissement"))
                .unwrap();
        assert_eq!(
            f64_values(&trends, "valeur_fonciere_ma1").unwrap(),
            vec![None, Some(100.0), None, Some(1_000.0)]
        );
    }

    #[test]
    fn test_period_mean_and_merge_back() {
        let df = monthly(&[
            ("1", "2021-01", 100.0),
            ("1", "2021-01", 300.0),
            ("1", "2021-02", 50.0),
            ("1", "2021-02", 70.0),
        ]);
        let trends =
            calc_movav_prices(&df, 1, 1, "valeur_fonciere", "date_mutation", Some("arrondissement"))
                .unwrap();
        let merged =
            add_movav_prices(&df, &trends, "date_mutation", Some("arrondissement")).unwrap();
        assert_eq!(merged.height(), 4);
        assert_eq!(
            f64_values(&merged, "valeur_fonciere_ma1").unwrap(),
            vec![None, None, Some(200.0), Some(200.0)]
        );
    }

    #[test]
    fn test_without_neighborhood() {
        let df = monthly(&[("1", "2021-01", 100.0), ("2", "2021-02", 300.0)]);
        let trends = calc_movav_prices(&df, 1, 0, "valeur_fonciere", "date_mutation", None).unwrap();
        assert_eq!(trends.width(), 2);
        let merged = add_movav_prices(&df, &trends, "date_mutation", None).unwrap();
        assert_eq!(
            f64_values(&merged, "valeur_fonciere_ma1").unwrap(),
            vec![Some(100.0), Some(300.0)]
        );
    }

    #[test]
    fn test_zero_window_is_rejected() {
        let df = monthly(&[("1", "2021-01", 100.0)]);
        assert!(matches!(
            calc_movav_prices(&df, 0, 1, "valeur_fonciere", "date_mutation", None),
            Err(PipelineError::Validation(_))
        ));
    }
}
