//! Column-level helpers shared by the preprocessors and the dataset builder

use polars::prelude::*;
use regex::Regex;
use std::sync::OnceLock;

use super::frame::{self, format_number, rendered};
use crate::error::{PipelineError, Result};

fn digits() -> &'static Regex {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    DIGITS.get_or_init(|| Regex::new(r"[0-9]+").expect("digit pattern compiles"))
}

/// Fraction of missing cells in a column (0 for an empty column)
pub fn na_proportion(column: &Column) -> f64 {
    if column.is_empty() {
        return 0.0;
    }
    column.null_count() as f64 / column.len() as f64
}

/// Keep rows whose `var` value lies in the closed interval.
///
/// An unset bound defaults to the observed min/max. Rows with a missing
/// value never satisfy the interval.
pub fn filter_numeric_var(
    df: &DataFrame,
    var: &str,
    interval: (Option<f64>, Option<f64>),
) -> Result<DataFrame> {
    if let (Some(min), Some(max)) = interval {
        if min >= max {
            return Err(PipelineError::InvalidRange {
                column: var.to_string(),
                min,
                max,
            });
        }
    }

    let values = present(&frame::f64_values(df, var)?);
    let observed = Float64Chunked::from_vec("observed".into(), values);
    let (Some(min), Some(max)) = (
        interval.0.or_else(|| observed.min()),
        interval.1.or_else(|| observed.max()),
    ) else {
        // nothing observed and no explicit bound: no row can satisfy it
        return Ok(df.clear());
    };

    let value = col(var).cast(DataType::Float64);
    Ok(df
        .clone()
        .lazy()
        .filter(value.clone().gt_eq(lit(min)).and(value.lt_eq(lit(max))))
        .collect()?)
}

/// Divide by `area` when given, then take the natural log when `log` is set
pub fn transform_price(price: f64, log: bool, area: Option<f64>) -> f64 {
    let mut y = price;
    if let Some(a) = area {
        y /= a;
    }
    if log {
        y = y.ln();
    }
    y
}

/// Log transform that maps non-positive input to a missing value
pub fn safe_ln(x: f64) -> Option<f64> {
    (x > 0.0).then(|| x.ln()).filter(|v| v.is_finite())
}

/// Single digit group of `text` (`"Paris 15e Arrondissement"` -> `"15"`).
///
/// Returns `Ok(None)` when the text holds no digits and fails when it holds
/// more than one group.
pub fn extract_int_from_string(text: &str) -> Result<Option<String>> {
    let mut groups = digits().find_iter(text);
    let first = groups.next().map(|m| m.as_str().to_string());
    if groups.next().is_some() {
        return Err(PipelineError::MultipleIntegers(text.to_string()));
    }
    Ok(first)
}

pub fn flatten_list<T: Clone>(lists: &[Vec<T>]) -> Vec<T> {
    lists.iter().flat_map(|l| l.iter().cloned()).collect()
}

/// Integer part of a float rendered as a string (`3.0` -> `"3"`)
pub fn float_to_string(x: f64) -> String {
    format!("{}", x.trunc() as i64)
}

fn chunked(values: &[f64]) -> Float64Chunked {
    Float64Chunked::from_slice("values".into(), values)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    chunked(values).mean()
}

/// Quantile with linear interpolation between closest ranks
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    chunked(values)
        .quantile(q.clamp(0.0, 1.0), QuantileMethod::Linear)
        .ok()
        .flatten()
}

pub fn median(values: &[f64]) -> Option<f64> {
    chunked(values).median()
}

/// Most frequent present value of a column, rendered; ties resolve to the
/// smallest value
pub fn mode(df: &DataFrame, name: &str) -> Result<Option<String>> {
    frame::column(df, name)?;
    let out = df
        .clone()
        .lazy()
        .select([col(name).drop_nulls().mode().min().alias(name)])
        .collect()?;
    Ok(frame::text_at(&out, name, 0))
}

/// Mode of a plain list of values
pub fn mode_of(values: &[String]) -> Result<Option<String>> {
    let df = DataFrame::new(vec![Column::new("values".into(), values)])?;
    mode(&df, "values")
}

/// Present values of a numeric column
pub fn present(values: &[Option<f64>]) -> Vec<f64> {
    values.iter().flatten().copied().collect()
}

/// Distinct present values, rendered, in first-seen order
pub fn unique_values(column: &Column) -> Result<Vec<String>> {
    let distinct = column
        .as_materialized_series()
        .drop_nulls()
        .unique_stable()?;
    Ok(rendered(&Column::from(distinct))?
        .into_iter()
        .flatten()
        .collect())
}

/// Keys of column `key` occurring exactly once, in first-seen order
pub fn get_unique_entries(df: &DataFrame, key: &str) -> Result<Vec<String>> {
    frame::column(df, key)?;
    let counts = df
        .clone()
        .lazy()
        .filter(col(key).is_not_null())
        .group_by_stable([col(key)])
        .agg([col(key).count().alias("count")])
        .filter(col("count").eq(lit(1)))
        .collect()?;
    Ok(frame::text_values(&counts, key)?
        .into_iter()
        .flatten()
        .collect())
}

/// Replace missing numeric cells with the median, missing text cells with
/// the mode. Returns the filled frame and the value used, if any.
pub fn impute_missing(df: &DataFrame, name: &str) -> Result<(DataFrame, Option<String>)> {
    if frame::is_numeric_column(df, name) {
        let Some(med) = median(&present(&frame::f64_values(df, name)?)) else {
            return Ok((df.clone(), None));
        };
        let filled = df
            .clone()
            .lazy()
            .with_column(col(name).cast(DataType::Float64).fill_null(lit(med)))
            .collect()?;
        return Ok((filled, Some(format_number(med))));
    }

    let Some(most) = mode(df, name)? else {
        return Ok((df.clone(), None));
    };
    let filled = df
        .clone()
        .lazy()
        .with_column(col(name).fill_null(lit(most.clone())))
        .collect()?;
    Ok((filled, Some(most)))
}

/// Mean Earth radius in metres
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Great-circle distance in metres between two (lat, lon) points in degrees
pub fn haversine_m(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let h = ((lat2 - lat1) / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * ((lon2 - lon1) / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}
