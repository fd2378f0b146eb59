//! Descriptive summary of a cleaned transaction table

use polars::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::data::catalog::{FIELD_SURFACE_VAR, PRICE_M2_VAR, PRICE_VAR, ROOMS_VAR, SURFACE_VAR};
use crate::data::frame::{self, f64_values, float_column, rendered};
use crate::data::utils::{na_proportion, transform_price};
use crate::error::Result;

pub const SUMMARY_PERCENTILES: [f64; 9] = [0.01, 0.05, 0.1, 0.25, 0.5, 0.75, 0.9, 0.95, 0.99];

#[derive(Debug, Clone, Serialize)]
pub struct NumericSummary {
    pub variable: String,
    pub count: usize,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    /// (percentile, value) pairs
    pub percentiles: Vec<(f64, f64)>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub observations: usize,
    /// Missing-value share per variable
    pub missing: Vec<(String, f64)>,
    pub numeric: Vec<NumericSummary>,
    /// Share of rows per room count, missing counts included
    pub rooms: Vec<(String, f64)>,
}

fn describe(column: &Column) -> Result<NumericSummary> {
    let cast = column.cast(&DataType::Float64)?;
    let values = cast.f64()?;
    let count = values.len() - values.null_count();
    Ok(NumericSummary {
        variable: column.name().to_string(),
        count,
        mean: values.mean(),
        std: values.std(1).filter(|_| count > 1),
        min: values.min(),
        percentiles: SUMMARY_PERCENTILES
            .iter()
            .filter_map(|p| Some((*p, values.quantile(*p, QuantileMethod::Linear).ok()??)))
            .collect(),
        max: values.max(),
    })
}

/// Missing values, price per m² and surface percentiles, room distribution
pub fn summarize_dataset(df: &DataFrame) -> Result<DatasetSummary> {
    let prices = f64_values(df, PRICE_VAR)?;
    let surfaces = f64_values(df, SURFACE_VAR)?;
    let per_m2 = float_column(
        PRICE_M2_VAR,
        prices
            .iter()
            .zip(&surfaces)
            .map(|(p, s)| Some(transform_price((*p)?, false, Some((*s)?))))
            .collect(),
    );
    let rooms = frame::column(df, ROOMS_VAR)?;
    let surface = frame::column(df, SURFACE_VAR)?;

    let mut numeric = vec![&per_m2, surface];
    let mut missing_vars = vec![rooms, surface];
    if let Ok(field) = df.column(FIELD_SURFACE_VAR) {
        numeric.push(field);
        missing_vars.push(field);
    }
    missing_vars.push(&per_m2);

    let missing = missing_vars
        .iter()
        .map(|c| (c.name().to_string(), na_proportion(c)))
        .collect();

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for cell in rendered(rooms)? {
        *counts.entry(cell.unwrap_or_else(|| "NA".to_string())).or_default() += 1;
    }
    let total = df.height().max(1) as f64;
    let mut rooms_share: Vec<(String, f64)> = counts
        .into_iter()
        .map(|(k, n)| (k, n as f64 / total))
        .collect();
    rooms_share.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    Ok(DatasetSummary {
        observations: df.height(),
        missing,
        numeric: numeric.into_iter().map(describe).collect::<Result<Vec<_>>>()?,
        rooms: rooms_share,
    })
}

fn cell(v: Option<f64>) -> String {
    v.map(|x| format!("{:.2}", x)).unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for DatasetSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Dataset summary for {} observations", self.observations)?;
        writeln!(f, "{}", "*".repeat(80))?;
        writeln!(f, "Missing values")?;
        for (var, na) in &self.missing {
            writeln!(f, "  {:<32} {:>6.2}%", var, 100.0 * na)?;
        }
        writeln!(f, "{}", "*".repeat(80))?;
        writeln!(f, "Numeric variables")?;
        for s in &self.numeric {
            writeln!(f, "  {} (n={})", s.variable, s.count)?;
            writeln!(
                f,
                "    mean {}  std {}  min {}  max {}",
                cell(s.mean),
                cell(s.std),
                cell(s.min),
                cell(s.max)
            )?;
            for (p, v) in &s.percentiles {
                writeln!(f, "    {:>3.0}%  {:.2}", p * 100.0, v)?;
            }
        }
        writeln!(f, "{}", "*".repeat(80))?;
        writeln!(f, "Number of rooms")?;
        for (rooms, share) in &self.rooms {
            writeln!(f, "  {:<4} {:>6.2}%", rooms, 100.0 * share)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_dataset() {
        let df = df!(
            "valeur_fonciere" => &[100_000.0, 200_000.0, 300_000.0, 400_000.0],
            "surface_reelle_bati" => &[Some(10.0), Some(20.0), Some(30.0), None],
            "nombre_pieces_principales" => &[Some(2.0), Some(2.0), Some(3.0), None]
        )
        .unwrap();
        let summary = summarize_dataset(&df).unwrap();
        assert_eq!(summary.observations, 4);

        let per_m2 = &summary.numeric[0];
        assert_eq!(per_m2.variable, "valeur_fonciere_m2");
        assert_eq!(per_m2.count, 3);
        assert_eq!(per_m2.min, Some(10_000.0));
        assert_eq!(per_m2.percentiles.len(), 9);
        assert!((per_m2.std.unwrap() - 0.0).abs() < 1e-9);

        let missing: BTreeMap<_, _> = summary.missing.iter().cloned().collect();
        assert_eq!(missing["surface_reelle_bati"], 0.25);
        assert_eq!(summary.rooms[0], ("2".to_string(), 0.5));
        assert!(summary.to_string().contains("Number of rooms"));
    }
}
