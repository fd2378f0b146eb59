//! Price estimation for a single user-described property
//!
//! The model only knows what the user typed (surface, rooms, address). The
//! remaining features come from the local sales history: the latest price
//! trends, the closest comparable sale when it sits at the same address,
//! and otherwise the median (or most frequent level) of the area.

use chrono::{Datelike, Local, NaiveDate};
use ndarray::Array2;
use polars::prelude::*;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::data::catalog::{
    is_indicator_var, COMMUNE_VAR, DEPENDENCY_VAR, FIELD_SURFACE_VAR, PRICE_VAR, ROOMS_VAR,
    SURFACE_VAR,
};
use crate::data::frame::{
    f64_at, f64_values, float_column, has_column, is_numeric, text_at, text_column, text_values,
};
use crate::data::history::{find_closest, return_close_properties, Comparable, TransactionHistory};
use crate::data::utils::{median, mode, present, quantile};
use crate::dataset::build::{prepare_dataset, NumericFilter, PrepareConfig};
use crate::dataset::dummies::{encode_categoricals, to_dummies, MAX_CATEGORY_LEVELS};
use crate::dataset::trend::window_from_name;
use crate::error::{validate_prediction_request, PipelineError, Result};
use crate::geocoder::Geocoder;
use crate::model::{ModelBundle, Regressor};
use crate::models::{
    ComparableSummary, ModelInfo, PredictionRequest, PredictionResponse, PropertyType,
};
use crate::preprocessing::geo::extract_department_code;

/// Missing-value threshold used when preparing the local history
const HISTORY_NA_THRESHOLD: f64 = 0.5;
/// Quantile bounds trimming extreme sales from the local history
const HISTORY_QUANTILES: (f64, f64) = (0.05, 0.99);
const QUERY_ID: &str = "query";

/// Latest trend values, overall and per neighborhood
#[derive(Debug, Clone, Default)]
struct LatestTrends {
    overall: BTreeMap<String, (String, f64)>,
    by_neighborhood: BTreeMap<String, BTreeMap<String, (String, f64)>>,
}

fn keep_latest(slot: &mut BTreeMap<String, (String, f64)>, column: &str, date: &str, value: f64) {
    match slot.get(column) {
        Some((latest, _)) if latest.as_str() >= date => {}
        _ => {
            slot.insert(column.to_string(), (date.to_string(), value));
        }
    }
}

impl LatestTrends {
    fn from_frame(
        df: &DataFrame,
        columns: &[String],
        date_var: &str,
        neighborhood_var: Option<&str>,
    ) -> Result<Self> {
        let mut latest = Self::default();
        if columns.is_empty() {
            return Ok(latest);
        }
        let dates = text_values(df, date_var)?;
        let neighborhoods = match neighborhood_var.filter(|v| has_column(df, v)) {
            Some(var) => text_values(df, var)?,
            None => vec![None; df.height()],
        };
        for column in columns {
            let values = f64_values(df, column)?;
            for ((value, date), neighborhood) in values.iter().zip(&dates).zip(&neighborhoods) {
                let (Some(value), Some(date)) = (value, date) else {
                    continue;
                };
                keep_latest(&mut latest.overall, column, date, *value);
                if let Some(n) = neighborhood {
                    keep_latest(
                        latest.by_neighborhood.entry(n.clone()).or_default(),
                        column,
                        date,
                        *value,
                    );
                }
            }
        }
        Ok(latest)
    }

    fn get(&self, column: &str, neighborhood: Option<&str>) -> Option<f64> {
        neighborhood
            .and_then(|n| self.by_neighborhood.get(n))
            .and_then(|trends| trends.get(column))
            .or_else(|| self.overall.get(column))
            .map(|(_, value)| *value)
    }
}

/// Local history prepared and encoded the way the model saw its training set
#[derive(Debug, Clone)]
struct PreparedHistory {
    frame: DataFrame,
    categorical_vars: Vec<String>,
    imputed: BTreeMap<String, f64>,
    trends: LatestTrends,
}

impl PreparedHistory {
    fn row_of(&self, id_mutation: &str) -> Option<usize> {
        text_values(&self.frame, "id_mutation")
            .ok()?
            .iter()
            .position(|id| id.as_deref() == Some(id_mutation))
    }
}

/// Trend windows the model was trained with, read back from its feature names
fn trend_windows(bundle: &ModelBundle) -> Vec<usize> {
    let mut windows: Vec<usize> = bundle
        .feature_names
        .iter()
        .filter_map(|name| {
            let window = window_from_name(name)?;
            (bundle.config.trend_column(window) == *name).then_some(window)
        })
        .collect();
    windows.sort_unstable();
    windows.dedup();
    windows
}

fn quantile_filters(df: &DataFrame, property_type: PropertyType) -> Vec<NumericFilter> {
    let mut columns = vec![ROOMS_VAR, SURFACE_VAR, PRICE_VAR];
    if property_type == PropertyType::Houses {
        columns.push(FIELD_SURFACE_VAR);
    }
    columns
        .into_iter()
        .filter_map(|name| {
            let values = present(&f64_values(df, name).ok()?);
            let lo = quantile(&values, HISTORY_QUANTILES.0)?;
            let hi = quantile(&values, HISTORY_QUANTILES.1)?;
            (lo < hi).then(|| NumericFilter::new(name, Some(lo), Some(hi)))
        })
        .collect()
}

/// Mode for indicator columns (cataloged flags and the dummies of
/// `categorical_vars`), median for the other numeric columns
fn imputed_values(
    df: &DataFrame,
    categorical_vars: &[String],
) -> Result<BTreeMap<String, f64>> {
    let prefixes: Vec<String> = categorical_vars.iter().map(|v| format!("{}_", v)).collect();
    let mut imputed = BTreeMap::new();
    for column in df.get_columns() {
        if !is_numeric(column.dtype()) {
            continue;
        }
        let name = column.name().as_str();
        let value = if is_indicator_var(name) || prefixes.iter().any(|p| name.starts_with(p)) {
            mode(df, name)?.and_then(|m| m.parse::<f64>().ok())
        } else {
            median(&present(&f64_values(df, name)?))
        };
        if let Some(value) = value {
            imputed.insert(name.to_string(), value);
        }
    }
    Ok(imputed)
}

fn prepare_history(local: &DataFrame, bundle: &ModelBundle) -> Result<PreparedHistory> {
    let config = PrepareConfig {
        numeric_filters: quantile_filters(local, bundle.property_type),
        na_threshold: HISTORY_NA_THRESHOLD,
        ma_windows: trend_windows(bundle),
        ma_lag: 0,
        keep_location_vars: true,
        ..bundle.config.clone()
    };
    let dataset = prepare_dataset(local, &config)?;

    let trend_columns: Vec<String> = config
        .ma_windows
        .iter()
        .map(|w| config.trend_column(*w))
        .collect();
    let trends = LatestTrends::from_frame(
        dataset.frame(),
        &trend_columns,
        &config.date_var,
        config.neighborhood_var.as_deref(),
    )?;

    let (dataset, categorical_vars) = encode_categoricals(dataset, MAX_CATEGORY_LEVELS, false)?;
    let (frame, _) = dataset.into_parts();

    let imputed = imputed_values(&frame, &categorical_vars)?;
    info!(
        "Local history prepared: {} sales, {} columns",
        frame.height(),
        frame.width()
    );
    Ok(PreparedHistory {
        frame,
        categorical_vars,
        imputed,
        trends,
    })
}

/// One-row raw frame describing the user's property
fn synthetic_frame(
    request: &PredictionRequest,
    commune: &str,
    date_var: &str,
    today: NaiveDate,
) -> Result<DataFrame> {
    let number = |v: f64| vec![Some(v)];
    let mut columns = vec![
        text_column("id_mutation", vec![Some(QUERY_ID.to_string())]),
        text_column(date_var, vec![Some(today.format("%Y-%m-%d").to_string())]),
        float_column(PRICE_VAR, number(1.0)),
        text_column(COMMUNE_VAR, vec![Some(commune.to_string())]),
        float_column(SURFACE_VAR, number(request.surface)),
        float_column(ROOMS_VAR, number(request.num_rooms as f64)),
        float_column(DEPENDENCY_VAR, number(if request.dependance { 1.0 } else { 0.0 })),
        float_column("trimestre", number((today.month0() / 3 + 1) as f64)),
        float_column("mois", number(today.month() as f64)),
    ];
    if request.field_surface > 0.0 {
        columns.push(float_column(FIELD_SURFACE_VAR, number(request.field_surface)));
    }
    Ok(DataFrame::new(columns)?)
}

fn comparable_summary(candidates: &DataFrame, comparable: &Comparable) -> ComparableSummary {
    let text = |name: &str| text_at(candidates, name, comparable.row);
    ComparableSummary {
        id_mutation: text("id_mutation").unwrap_or_default(),
        date_mutation: text("date_mutation"),
        valeur_fonciere: f64_at(candidates, PRICE_VAR, comparable.row),
        distance_m: comparable.distance_m,
    }
}

/// Estimator plus the sales history of its area
pub struct PricePredictor {
    bundle: ModelBundle,
    regressor: Box<dyn Regressor>,
    history: TransactionHistory,
    /// Prepared history per postal code (Paris) or department
    prepared: HashMap<u32, PreparedHistory>,
    geocoder: Option<Box<dyn Geocoder>>,
    today: Option<NaiveDate>,
}

impl PricePredictor {
    /// `history` holds the raw sales of the bundle's area and property type
    pub fn new(bundle: ModelBundle, regressor: Box<dyn Regressor>, history: TransactionHistory) -> Self {
        Self {
            bundle,
            regressor,
            history,
            prepared: HashMap::new(),
            geocoder: None,
            today: None,
        }
    }

    pub fn from_bundle(
        bundle: ModelBundle,
        model_dir: &Path,
        history: TransactionHistory,
    ) -> Result<Self> {
        let regressor = bundle.regressor(model_dir)?;
        Ok(Self::new(bundle, regressor, history))
    }

    pub fn with_geocoder(mut self, geocoder: Box<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    /// Pin the sale date used for seasonal features
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn bundle(&self) -> &ModelBundle {
        &self.bundle
    }

    /// Description of the loaded model and its history
    pub fn model_info(&self) -> ModelInfo {
        ModelInfo {
            file_name: self.bundle.file_name(),
            estimator: self.bundle.estimator.clone(),
            geo_area: self.bundle.geo_area.clone(),
            property_type: self.bundle.property_type,
            version: self.bundle.version,
            mape: self.bundle.metrics.map(|m| m.mape),
            history_size: self.history.len(),
        }
    }

    fn coordinates(&self, request: &PredictionRequest) -> Option<(f64, f64)> {
        if let Some(coordinates) = request.coordinates() {
            return Some(coordinates);
        }
        let geocoder = self.geocoder.as_ref()?;
        match geocoder.geocode(&request.address()) {
            Ok(found) => found,
            Err(e) => {
                warn!("Geocoding of '{}' failed: {}", request.address(), e);
                None
            }
        }
    }

    /// Feature vector in the model's order, and the comparable sale used
    pub fn build_features(
        &mut self,
        request: &PredictionRequest,
    ) -> Result<(Vec<f64>, Option<ComparableSummary>)> {
        validate_prediction_request(request)?;
        if request.property_type != self.bundle.property_type {
            return Err(PipelineError::Validation(format!(
                "model is trained for {}, got a request for {}",
                self.bundle.property_type, request.property_type
            )));
        }

        let coordinates = self.coordinates(request);
        let local = self.history.local(request.zip_code)?;
        let candidates = return_close_properties(&local, request)?;
        let comparable = find_closest(&candidates, coordinates);
        let summary = comparable.as_ref().map(|c| comparable_summary(&candidates, c));
        debug!("Comparable: {:?}", summary);

        let department = extract_department_code(request.zip_code);
        let key = if department == 75 { request.zip_code } else { department };
        let history = match self.prepared.entry(key) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(prepare_history(&local, &self.bundle)?),
        };

        let commune = comparable
            .as_ref()
            .and_then(|c| text_at(&candidates, COMMUNE_VAR, c.row))
            .unwrap_or_else(|| request.city.clone());
        let config = PrepareConfig {
            numeric_filters: Vec::new(),
            na_threshold: 1.0,
            ma_windows: Vec::new(),
            keep_location_vars: false,
            ..self.bundle.config.clone()
        };
        let today = self.today.unwrap_or_else(|| Local::now().date_naive());
        let prepared = prepare_dataset(
            &synthetic_frame(request, &commune, &config.date_var, today)?,
            &config,
        )?;

        let neighborhood = config
            .neighborhood_var
            .as_deref()
            .and_then(|var| text_at(prepared.frame(), var, 0));
        let encoded_vars: Vec<String> = history
            .categorical_vars
            .iter()
            .filter(|v| text_at(prepared.frame(), v, 0).is_some())
            .cloned()
            .collect();
        let encoded = to_dummies(prepared, &encoded_vars)?;
        let row = encoded.frame();
        if row.height() != 1 {
            return Err(PipelineError::Shape(format!(
                "synthetic property expanded to {} rows",
                row.height()
            )));
        }

        let prefixes: Vec<String> = encoded_vars.iter().map(|v| format!("{}_", v)).collect();
        let comparable_row = comparable
            .filter(Comparable::is_same_location)
            .and_then(|_| summary.as_ref())
            .and_then(|s| history.row_of(&s.id_mutation));

        let mut features = Vec::with_capacity(self.bundle.feature_names.len());
        for name in &self.bundle.feature_names {
            let value = if let Some(v) = f64_at(row, name, 0) {
                v
            } else if !has_column(&history.frame, name) || prefixes.iter().any(|p| name.starts_with(p)) {
                0.0
            } else if let Some(v) = history.trends.get(name, neighborhood.as_deref()) {
                v
            } else if let Some(v) = comparable_row.and_then(|r| f64_at(&history.frame, name, r)) {
                v
            } else {
                history
                    .imputed
                    .get(name)
                    .copied()
                    .ok_or_else(|| PipelineError::Model(format!("no value for feature '{}'", name)))?
            };
            features.push(value);
        }
        Ok((features, summary))
    }

    pub fn predict(&mut self, request: &PredictionRequest) -> Result<PredictionResponse> {
        let (features, comparable) = self.build_features(request)?;
        let x = Array2::from_shape_vec((1, features.len()), features)
            .map_err(|e| PipelineError::Shape(e.to_string()))?;
        let raw = self
            .regressor
            .predict(&x)?
            .get(0)
            .copied()
            .ok_or_else(|| PipelineError::Model("empty prediction".to_string()))?;

        let price = if self.bundle.config.target.is_log() {
            raw.exp()
        } else {
            raw
        }
        .round();
        info!("Estimated {} EUR for {}", price, request.address());

        Ok(PredictionResponse {
            price,
            mape: self.bundle.metrics.map(|m| m.mape),
            geo_area: self.bundle.geo_area.clone(),
            property_type: self.bundle.property_type,
            comparable,
        })
    }
}
