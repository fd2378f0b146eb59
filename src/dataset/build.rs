//! Dataset assembly: one preparation pass from merged sources to features

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use super::trend::{add_movav_prices, calc_movav_prices, trend_column_name};
use crate::data::catalog::{
    Dataset, FeatureCatalog, FeatureGroup, BNB_PARCEL_KEY, CATEGORICAL_VARS, COMMUNE_VAR,
    DISCRETE_VARS, DVF_LOCATION_VARS, DVF_PARCEL_KEY, IDENTIFIER_VARS, LOG_PRICE_VAR,
    PRICE_M2_VAR, PRICE_VAR, ROOMS_VAR, SURFACE_VAR, WINDOW_INDETERMINATE, WINDOW_ORIENTATION,
};
use crate::data::catalog::is_indicator_var;
use crate::data::frame::{
    self, column_names, f64_values, float_column, format_number, has_column, is_numeric_column,
    left_join, text_column, text_values,
};
use crate::data::utils::{
    extract_int_from_string, filter_numeric_var, impute_missing, na_proportion, safe_ln,
    transform_price,
};
use crate::error::{PipelineError, Result};

/// Rooms at or above this count share one category
pub const ROOMS_BUCKET_CAP: i64 = 6;

/// Regression target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetVar {
    #[serde(rename = "valeur_fonciere")]
    Price,
    #[serde(rename = "l_valeur_fonciere")]
    LogPrice,
}

impl TargetVar {
    pub fn column(&self) -> &'static str {
        match self {
            TargetVar::Price => PRICE_VAR,
            TargetVar::LogPrice => LOG_PRICE_VAR,
        }
    }

    pub fn is_log(&self) -> bool {
        matches!(self, TargetVar::LogPrice)
    }
}

/// Closed interval filter; an unset bound defaults to the observed extreme
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericFilter {
    pub column: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl NumericFilter {
    pub fn new(column: &str, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            column: column.to_string(),
            min,
            max,
        }
    }
}

/// Preparation parameters, persisted with each model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrepareConfig {
    pub target: TargetVar,
    pub numeric_filters: Vec<NumericFilter>,
    /// Columns with a larger fraction of missing values are dropped
    pub na_threshold: f64,
    pub ma_windows: Vec<usize>,
    pub ma_lag: usize,
    pub neighborhood_var: Option<String>,
    pub date_var: String,
    pub keep_location_vars: bool,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            target: TargetVar::LogPrice,
            numeric_filters: Vec::new(),
            na_threshold: 0.2,
            ma_windows: Vec::new(),
            ma_lag: 1,
            neighborhood_var: None,
            date_var: "date_mutation".to_string(),
            keep_location_vars: false,
        }
    }
}

impl PrepareConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Name of the trend column produced for `window`
    pub fn trend_column(&self, window: usize) -> String {
        if self.target.is_log() {
            trend_column_name(LOG_PRICE_VAR, window)
        } else {
            trend_column_name(PRICE_VAR, window)
        }
    }
}

/// Left-join transactions with the building table (on parcel id) and with
/// external layers keyed by `id_mutation`. The row count never changes.
pub fn merge_sources(
    transactions: &DataFrame,
    buildings: Option<&DataFrame>,
    external: &[DataFrame],
) -> Result<DataFrame> {
    let mut merged = transactions.clone();
    if let Some(b) = buildings {
        merged = left_join(&merged, b, &[DVF_PARCEL_KEY], &[BNB_PARCEL_KEY], "_bnb")?;
    }
    for layer in external {
        merged = left_join(&merged, layer, &["id_mutation"], &["id_mutation"], "_ext")?;
    }
    if merged.height() != transactions.height() {
        return Err(PipelineError::Shape(format!(
            "merge changed row count from {} to {}",
            transactions.height(),
            merged.height()
        )));
    }
    Ok(merged)
}

/// Columns that are never triaged: location columns kept for lookups
fn is_triage_exempt(name: &str) -> bool {
    DVF_LOCATION_VARS.contains(&name)
}

/// Continuous columns that get a parallel `l_` log column. Indicators
/// are told apart by name, never by the values a sample happens to hold.
fn takes_log(df: &DataFrame, name: &str) -> bool {
    is_numeric_column(df, name)
        && name != PRICE_VAR
        && !name.starts_with("l_")
        && !DISCRETE_VARS.contains(&name)
        && !CATEGORICAL_VARS.contains(&name)
        && !IDENTIFIER_VARS.contains(&name)
        && !DVF_LOCATION_VARS.contains(&name)
        && !is_indicator_var(name)
}

fn log_column(name: &str, values: &[Option<f64>]) -> Column {
    float_column(name, values.iter().map(|v| v.and_then(safe_ln)).collect())
}

fn rooms_bucket(value: f64) -> String {
    let rooms = value.trunc() as i64;
    if rooms >= ROOMS_BUCKET_CAP {
        format!("{}+", ROOMS_BUCKET_CAP)
    } else {
        rooms.to_string()
    }
}

/// Steps 1-2: catalog selection and missing-value triage. Returns the
/// dataset and the columns dropped for missing values.
fn select_and_triage(df: &DataFrame, config: &PrepareConfig) -> Result<(Dataset, Vec<String>)> {
    let catalog = FeatureCatalog::for_frame(df, config.keep_location_vars);
    let mut dataset = Dataset::new(df, catalog)?;

    let mut dropped = Vec::new();
    let mut imputed = Vec::new();
    for name in dataset.catalog().all() {
        if is_triage_exempt(&name) {
            continue;
        }
        let na = na_proportion(frame::column(dataset.frame(), &name)?);
        if na > config.na_threshold {
            dataset = dataset.drop_column(&name)?;
            dropped.push(name);
        } else if na > 0.0 && name != PRICE_VAR {
            let (filled, _) = impute_missing(dataset.frame(), &name)?;
            dataset = dataset.map_rows(|_| Ok(filled))?;
            imputed.push(name);
        }
    }
    if !dropped.is_empty() {
        info!(
            "{:?} removed due to missing values above {}",
            dropped, config.na_threshold
        );
    }
    if !imputed.is_empty() {
        info!("{} columns imputed (median or most frequent)", imputed.len());
    }
    Ok((dataset, dropped))
}

/// Steps 3-4: target and price per m²
fn add_target(dataset: Dataset, config: &PrepareConfig) -> Result<Dataset> {
    if !has_column(dataset.frame(), PRICE_VAR) {
        return Err(PipelineError::MissingColumn(PRICE_VAR.to_string()));
    }
    let mut dataset = dataset;
    let prices = f64_values(dataset.frame(), PRICE_VAR)?;

    if config.target.is_log() {
        dataset = dataset.add_column(FeatureGroup::Transaction, log_column(LOG_PRICE_VAR, &prices))?;

        let mut logged = Vec::new();
        for name in column_names(dataset.frame()) {
            if !takes_log(dataset.frame(), &name) {
                continue;
            }
            let Some(group) = dataset.catalog().group_of(&name) else {
                continue;
            };
            let values = f64_values(dataset.frame(), &name)?;
            logged.push((group, log_column(&format!("l_{}", name), &values)));
        }
        for (group, column) in logged {
            dataset = dataset.add_column(group, column)?;
        }
    }

    let surfaces = f64_values(dataset.frame(), SURFACE_VAR)?;
    let per_m2 = prices
        .iter()
        .zip(&surfaces)
        .map(|(p, s)| match (p, s) {
            (Some(p), Some(s)) => Some(transform_price(*p, false, Some(*s))),
            _ => None,
        })
        .collect();
    dataset.add_column(FeatureGroup::Transaction, float_column(PRICE_M2_VAR, per_m2))
}

/// Step 5: range filters. A filter on a column dropped by the
/// missing-value triage is skipped; any other absent column is an error.
fn apply_filters(dataset: Dataset, triaged: &[String], config: &PrepareConfig) -> Result<Dataset> {
    let mut dataset = dataset;
    for filter in &config.numeric_filters {
        if !has_column(dataset.frame(), &filter.column) {
            if triaged.contains(&filter.column) {
                warn!(
                    "Filter on {} skipped: column removed during missing-value triage",
                    filter.column
                );
                continue;
            }
            return Err(PipelineError::MissingColumn(filter.column.clone()));
        }
        let before = dataset.height();
        dataset = dataset.map_rows(|df| filter_numeric_var(df, &filter.column, (filter.min, filter.max)))?;
        info!(
            "{} filter kept {} of {} rows",
            filter.column,
            dataset.height(),
            before
        );
    }
    Ok(dataset)
}

/// Step 6: codified categoricals as text
fn normalize_categoricals(dataset: Dataset) -> Result<Dataset> {
    let mut dataset = dataset;
    for var in CATEGORICAL_VARS {
        if !is_numeric_column(dataset.frame(), var) {
            continue;
        }
        let values = f64_values(dataset.frame(), var)?;
        let text = if *var == ROOMS_VAR {
            values.iter().map(|v| v.map(rooms_bucket)).collect()
        } else {
            values.iter().map(|v| v.map(|x| format_number(x.trunc()))).collect()
        };
        dataset = dataset.replace_column(text_column(var, text))?;
    }
    Ok(dataset)
}

/// Step 7: neighborhood number from the commune name
fn add_neighborhood(dataset: Dataset, var: &str) -> Result<Dataset> {
    let communes = text_values(dataset.frame(), COMMUNE_VAR)?;
    let values = communes
        .iter()
        .map(|c| match c {
            Some(name) => extract_int_from_string(name),
            None => Ok(None),
        })
        .collect::<Result<Vec<_>>>()?;
    dataset.add_column(FeatureGroup::Transaction, text_column(var, values))
}

/// Step 8: lagged moving-average price per neighborhood and period
fn add_trends(dataset: Dataset, config: &PrepareConfig) -> Result<Dataset> {
    if !has_column(dataset.frame(), &config.date_var) {
        return Err(PipelineError::MissingColumn(config.date_var.clone()));
    }
    let neighborhood = config.neighborhood_var.as_deref();
    let mut dataset = dataset;
    for &window in &config.ma_windows {
        let trends = calc_movav_prices(
            dataset.frame(),
            window,
            config.ma_lag,
            PRICE_VAR,
            &config.date_var,
            neighborhood,
        )?;
        let merged = add_movav_prices(dataset.frame(), &trends, &config.date_var, neighborhood)?;
        let linear_name = trend_column_name(PRICE_VAR, window);
        let values = f64_values(&merged, &linear_name)?;

        let column = if config.target.is_log() {
            log_column(&config.trend_column(window), &values)
        } else {
            float_column(&linear_name, values)
        };
        info!(
            "Trend {} available for {} of {} rows",
            column.name(),
            column.len() - column.null_count(),
            column.len()
        );
        dataset = dataset.add_column(FeatureGroup::Other, column)?;
    }
    Ok(dataset)
}

/// Step 9: rows with no window orientation set get the indeterminate flag
fn consolidate_window_orientation(dataset: Dataset) -> Result<Dataset> {
    let prefix = format!("{}_", WINDOW_ORIENTATION);
    let indicators: Vec<String> = column_names(dataset.frame())
        .into_iter()
        .filter(|n| n.starts_with(&prefix))
        .collect();
    if indicators.is_empty() {
        return Ok(dataset);
    }

    let height = dataset.height();
    let mut none_set = vec![true; height];
    for name in &indicators {
        let values = f64_values(dataset.frame(), name)?;
        for (flag, v) in none_set.iter_mut().zip(values) {
            if v.is_some_and(|x| x != 0.0) {
                *flag = false;
            }
        }
    }

    let current = f64_values(dataset.frame(), WINDOW_INDETERMINATE).ok();
    let values = (0..height)
        .map(|i| {
            if none_set[i] {
                Some(1.0)
            } else {
                current.as_ref().map(|c| c[i]).unwrap_or(Some(0.0))
            }
        })
        .collect();
    let group = dataset
        .catalog()
        .group_of(WINDOW_INDETERMINATE)
        .unwrap_or(FeatureGroup::Building);
    dataset.add_column(group, float_column(WINDOW_INDETERMINATE, values))
}

/// Run the whole preparation pass.
///
/// Structural problems (missing price column, inverted filter bounds,
/// ambiguous neighborhood names) abort with an error; data-quality issues
/// are handled by the drop/impute policy and logged.
pub fn prepare_dataset(df: &DataFrame, config: &PrepareConfig) -> Result<Dataset> {
    info!("Preparing dataset from {} rows", df.height());

    let (mut dataset, triaged) = select_and_triage(df, config)?;
    dataset = add_target(dataset, config)?;
    dataset = apply_filters(dataset, &triaged, config)?;
    dataset = normalize_categoricals(dataset)?;
    if let Some(var) = &config.neighborhood_var {
        dataset = add_neighborhood(dataset, var)?;
    }
    if !config.ma_windows.is_empty() {
        dataset = add_trends(dataset, config)?;
    }
    dataset = consolidate_window_orientation(dataset)?;

    info!(
        "Prepared {} rows x {} columns",
        dataset.height(),
        dataset.frame().width()
    );
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frame::text_at;

    fn single_sale() -> DataFrame {
        df!(
            "id_mutation" => &["A"],
            "nature_mutation" => &["Sale"],
            "code_type_local" => &[2.0],
            "surface_reelle_bati" => &[50.0],
            "valeur_fonciere" => &[500000.0],
            "nombre_pieces_principales" => &[3.0]
        )
        .unwrap()
    }

    fn paris_sales() -> DataFrame {
        df!(
            "id_mutation" => &["1", "2", "3", "4", "5", "6"],
            "date_mutation" => &["2021-01", "2021-01", "2021-02", "2021-02", "2021-03", "2021-03"],
            "nom_commune" => &[
                "Paris 15e Arrondissement",
                "Paris 15e Arrondissement",
                "Paris 15e Arrondissement",
                "Paris 3e Arrondissement",
                "Paris 15e Arrondissement",
                "Paris 3e Arrondissement",
            ],
            "valeur_fonciere" => &[100.0, 300.0, 400.0, 50.0, 600.0, 70.0],
            "surface_reelle_bati" => &[10.0, 20.0, 20.0, 5.0, 30.0, 7.0],
            "surface_terrain" => &[None, None, None, None, None, Some(100.0)],
            "nombre_pieces_principales" => &[Some(1.0), Some(2.0), None, Some(7.0), Some(3.0), Some(2.0)],
            "mois" => &[1.0, 1.0, 2.0, 2.0, 3.0, 3.0],
            "baie_orientation_nord" => &[1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            "baie_orientation_sud" => &[0.0, 0.0, 1.0, 0.0, 0.0, 0.0],
            "unknown_column" => &[0.0; 6]
        )
        .unwrap()
    }

    #[test]
    fn test_single_sale_log_target() {
        let config = PrepareConfig {
            na_threshold: 0.5,
            ..Default::default()
        };
        let dataset = prepare_dataset(&single_sale(), &config).unwrap();
        let df = dataset.frame();
        assert_eq!(df.height(), 1);
        let m2 = f64_values(df, "valeur_fonciere_m2").unwrap()[0].unwrap();
        assert!((m2 - 10000.0).abs() < 1e-9);
        let log_price = f64_values(df, "l_valeur_fonciere").unwrap()[0].unwrap();
        assert!((log_price - 500000f64.ln()).abs() < 1e-12);
        assert_eq!(text_at(df, "nombre_pieces_principales", 0).as_deref(), Some("3"));
        assert!(!has_column(df, "nature_mutation"));
    }

    #[test]
    fn test_missing_price_column() {
        let df = single_sale().drop("valeur_fonciere").unwrap();
        assert!(matches!(
            prepare_dataset(&df, &PrepareConfig::default()),
            Err(PipelineError::MissingColumn(c)) if c == "valeur_fonciere"
        ));
    }

    #[test]
    fn test_triage_and_catalog_lockstep() {
        let dataset = prepare_dataset(&paris_sales(), &PrepareConfig::default()).unwrap();
        let df = dataset.frame();
        // 5 of 6 surface_terrain values are missing
        assert!(!has_column(df, "surface_terrain"));
        assert!(!dataset.catalog().contains("surface_terrain"));
        assert!(!has_column(df, "unknown_column"));
        // one missing room count imputed with the median (2)
        let rooms = text_values(df, "nombre_pieces_principales").unwrap();
        assert_eq!(rooms[2].as_deref(), Some("2"));
        assert_eq!(rooms[3].as_deref(), Some("6+"));
        assert!(has_column(df, "l_surface_reelle_bati"));
        assert!(!has_column(df, "l_mois"));
        assert!(!has_column(df, "l_baie_orientation_nord"));
        let (untracked, dangling) = dataset.drift();
        assert!(untracked.is_empty() && dangling.is_empty());
    }

    #[test]
    fn test_log_columns_follow_names_not_sample_values() {
        // every value of these continuous columns happens to be 0 or 1
        let df = df!(
            "id_mutation" => &["A", "B"],
            "valeur_fonciere" => &[200000.0, 300000.0],
            "surface_reelle_bati" => &[40.0, 60.0],
            "surface_terrain" => &[1.0, 1.0],
            "hauteur_mean" => &[0.0, 1.0],
            "dependance" => &[1.0, 0.0],
            "qpv" => &[0.0, 1.0]
        )
        .unwrap();
        let dataset = prepare_dataset(&df, &PrepareConfig::default()).unwrap();
        let out = dataset.frame();
        assert_eq!(
            f64_values(out, "l_surface_terrain").unwrap(),
            vec![Some(0.0), Some(0.0)]
        );
        assert_eq!(f64_values(out, "l_hauteur_mean").unwrap(), vec![None, Some(0.0)]);
        assert_eq!(
            dataset.catalog().group_of("l_hauteur_mean"),
            Some(FeatureGroup::Building)
        );
        assert!(!has_column(out, "l_dependance"));
        assert!(!has_column(out, "l_qpv"));
    }

    #[test]
    fn test_filters() {
        let config = PrepareConfig {
            numeric_filters: vec![
                NumericFilter::new("valeur_fonciere", Some(60.0), Some(500.0)),
                NumericFilter::new("surface_terrain", Some(0.0), Some(10.0)),
            ],
            ..Default::default()
        };
        let dataset = prepare_dataset(&paris_sales(), &config).unwrap();
        let prices = f64_values(dataset.frame(), "valeur_fonciere").unwrap();
        assert_eq!(prices.len(), 4);
        assert!(prices.iter().flatten().all(|p| (60.0..=500.0).contains(p)));

        let bad = PrepareConfig {
            numeric_filters: vec![NumericFilter::new("valeur_fonciere", Some(500.0), Some(60.0))],
            ..Default::default()
        };
        assert!(matches!(
            prepare_dataset(&paris_sales(), &bad),
            Err(PipelineError::InvalidRange { .. })
        ));

        let unknown = PrepareConfig {
            numeric_filters: vec![NumericFilter::new("hauteur_mean", None, Some(1.0))],
            ..Default::default()
        };
        assert!(matches!(
            prepare_dataset(&paris_sales(), &unknown),
            Err(PipelineError::MissingColumn(_))
        ));
    }

    #[test]
    fn test_filter_on_uncataloged_source_column_fails() {
        // code_type_local is in the input but never selected
        let config = PrepareConfig {
            numeric_filters: vec![NumericFilter::new("code_type_local", Some(1.0), Some(3.0))],
            ..Default::default()
        };
        assert!(matches!(
            prepare_dataset(&single_sale(), &config),
            Err(PipelineError::MissingColumn(c)) if c == "code_type_local"
        ));
    }

    #[test]
    fn test_filter_on_triaged_column_is_skipped() {
        let mut df = single_sale();
        df.with_column(Column::new("surface_terrain".into(), &[None::<f64>]))
            .unwrap();
        let config = PrepareConfig {
            numeric_filters: vec![NumericFilter::new("surface_terrain", Some(0.0), Some(10.0))],
            ..Default::default()
        };
        let dataset = prepare_dataset(&df, &config).unwrap();
        assert_eq!(dataset.height(), 1);
        assert!(!has_column(dataset.frame(), "surface_terrain"));
    }

    #[test]
    fn test_neighborhood_and_trend() {
        let config = PrepareConfig {
            neighborhood_var: Some("arrondissement".to_string()),
            ma_windows: vec![1],
            ma_lag: 1,
            ..Default::default()
        };
        let dataset = prepare_dataset(&paris_sales(), &config).unwrap();
        let df = dataset.frame();
        assert_eq!(text_at(df, "arrondissement", 3).as_deref(), Some("3"));
        assert!(!has_column(df, "valeur_fonciere_ma1"));
        let trend = f64_values(df, "l_valeur_fonciere_ma1").unwrap();
        // 15e: Jan mean 200 feeds Feb, Feb mean 400 feeds Mar
        assert_eq!(trend[0], None);
        assert!((trend[2].unwrap() - 200f64.ln()).abs() < 1e-12);
        assert!((trend[4].unwrap() - 400f64.ln()).abs() < 1e-12);
        // 3e: Feb is its first period
        assert_eq!(trend[3], None);
        assert!((trend[5].unwrap() - 50f64.ln()).abs() < 1e-12);
        assert_eq!(dataset.catalog().group_of("l_valeur_fonciere_ma1"), Some(FeatureGroup::Other));
    }

    #[test]
    fn test_ambiguous_neighborhood() {
        let mut df = single_sale();
        df.with_column(Column::new("nom_commune".into(), &["Marseille 13e 2"]))
            .unwrap();
        let config = PrepareConfig {
            neighborhood_var: Some("arrondissement".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            prepare_dataset(&df, &config),
            Err(PipelineError::MultipleIntegers(_))
        ));
    }

    #[test]
    fn test_window_orientation_consolidation() {
        let dataset = prepare_dataset(&paris_sales(), &PrepareConfig::default()).unwrap();
        assert_eq!(
            f64_values(dataset.frame(), WINDOW_INDETERMINATE).unwrap(),
            vec![Some(0.0), Some(1.0), Some(0.0), Some(1.0), Some(1.0), Some(1.0)]
        );
        assert_eq!(
            dataset.catalog().group_of(WINDOW_INDETERMINATE),
            Some(FeatureGroup::Building)
        );
    }

    #[test]
    fn test_merge_sources_keeps_row_count() {
        let dvf = df!(
            "id_mutation" => &["1", "2"],
            "id_parcelle" => &["p1", "p1"]
        )
        .unwrap();
        let bnb = df!(
            "parcelle_id" => &["p1", "p1"],
            "hauteur_mean" => &[10.0, 20.0]
        )
        .unwrap();
        let ext = df!(
            "id_mutation" => &["2"],
            "distance_transport" => &[150.0]
        )
        .unwrap();
        let merged = merge_sources(&dvf, Some(&bnb), &[ext]).unwrap();
        assert_eq!(merged.height(), 2);
        assert_eq!(f64_values(&merged, "hauteur_mean").unwrap(), vec![Some(10.0), Some(10.0)]);
        assert_eq!(
            f64_values(&merged, "distance_transport").unwrap(),
            vec![None, Some(150.0)]
        );
    }
}
