//! Indicator encoding of categorical columns

use polars::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use crate::data::catalog::{
    Dataset, DATE_VAR, DVF_LOCATION_VARS, IDENTIFIER_VARS, WINDOW_ORIENTATION,
};
use crate::data::frame::{column_names, f64_values, filter_rows, has_column, is_numeric, text_key};
use crate::data::utils::{mean, mode, present, unique_values};
use crate::error::{PipelineError, Result};

/// Text columns with fewer distinct levels are treated as categorical
pub const MAX_CATEGORY_LEVELS: usize = 30;

/// Columns never encoded nor removed for being constant
pub fn protected_columns() -> Vec<&'static str> {
    let mut cols: Vec<&str> = IDENTIFIER_VARS.to_vec();
    cols.extend(DVF_LOCATION_VARS);
    cols.push("adresse_nom_voie");
    cols.push("nom_commune");
    cols.sort_unstable();
    cols.dedup();
    cols
}

pub fn dummy_name(var: &str, level: &str) -> String {
    format!("{}_{}", var, level)
}

/// Names of the indicator columns derived from `var`
pub fn get_dummy_names(df: &DataFrame, var: &str) -> Vec<String> {
    let prefix = format!("{}_", var);
    column_names(df)
        .into_iter()
        .filter(|n| n.starts_with(&prefix))
        .collect()
}

/// Text columns with fewer than `n_levels_max` distinct values
pub fn get_categorical_vars(df: &DataFrame, n_levels_max: usize) -> Result<Vec<String>> {
    let protected = protected_columns();
    let mut vars = Vec::new();
    for column in df.get_columns() {
        let name = column.name().as_str();
        if is_numeric(column.dtype()) || protected.contains(&name) || name == DATE_VAR {
            continue;
        }
        if unique_values(column)?.len() < n_levels_max {
            vars.push(name.to_string());
        }
    }
    Ok(vars)
}

/// Reference level of each variable: its most frequent level. For window
/// orientation, whose indicators already exist, the indicator with the
/// highest mean.
pub fn get_most_frequent_levels(
    df: &DataFrame,
    vars: &[String],
) -> Result<BTreeMap<String, String>> {
    let mut levels = BTreeMap::new();
    for var in vars {
        if var == WINDOW_ORIENTATION && !has_column(df, var) {
            let prefix = format!("{}_", WINDOW_ORIENTATION);
            let mut best: Option<(String, f64)> = None;
            for name in get_dummy_names(df, WINDOW_ORIENTATION) {
                let Some(m) = mean(&present(&f64_values(df, &name)?)) else {
                    continue;
                };
                if best.as_ref().map_or(true, |(_, bm)| m > *bm) {
                    best = Some((name, m));
                }
            }
            if let Some((name, _)) = best {
                levels.insert(var.clone(), name.trim_start_matches(&prefix).to_string());
            }
            continue;
        }
        if !has_column(df, var) {
            continue;
        }
        if let Some(level) = mode(df, var)? {
            levels.insert(var.clone(), level);
        }
    }
    Ok(levels)
}

/// One indicator per observed level of each variable. Rows where a
/// variable is missing are dropped instead of getting an all-zero encoding.
pub fn to_dummies(dataset: Dataset, categorical_vars: &[String]) -> Result<Dataset> {
    let mut dataset = dataset;
    let mut keep = vec![true; dataset.height()];

    for var in categorical_vars {
        if !has_column(dataset.frame(), var) {
            continue;
        }
        let group = dataset
            .catalog()
            .group_of(var)
            .ok_or_else(|| PipelineError::MissingColumn(var.clone()))?;
        let keyed = text_key(dataset.frame(), var, None)?;
        let cells = keyed.column(var.as_str())?.str()?.clone();
        let levels: BTreeSet<&str> = cells.into_iter().flatten().collect();

        let indicators: Vec<Expr> = levels
            .iter()
            .map(|level| {
                col(var.as_str())
                    .eq(lit(*level))
                    .cast(DataType::Float64)
                    .alias(dummy_name(var, level).as_str())
            })
            .collect();
        for (k, c) in keep.iter_mut().zip(cells.into_iter()) {
            *k &= c.is_some();
        }
        let encoded = keyed.clone().lazy().select(indicators).collect()?;

        dataset = dataset.drop_column(var)?;
        for indicator in encoded.get_columns() {
            dataset = dataset.add_column(group, indicator.clone())?;
        }
    }

    let dropped = keep.iter().filter(|k| !**k).count();
    if dropped > 0 {
        info!("{} rows with an unresolved category removed", dropped);
        dataset = dataset.map_rows(|df| filter_rows(df, &keep))?;
    }
    Ok(dataset)
}

/// Drop the indicator of each variable's reference level
pub fn remove_reference_levels(
    dataset: Dataset,
    reference_levels: &BTreeMap<String, String>,
) -> Result<(Dataset, Vec<String>)> {
    let mut dataset = dataset;
    let mut removed = Vec::new();
    for (var, level) in reference_levels {
        let name = dummy_name(var, level);
        if has_column(dataset.frame(), &name) {
            dataset = dataset.drop_column(&name)?;
            removed.push(name);
        }
    }
    Ok((dataset, removed))
}

/// Drop columns holding a single distinct value, except `protected` ones
pub fn remove_constant_columns(
    dataset: Dataset,
    protected: &[&str],
) -> Result<(Dataset, Vec<String>)> {
    let mut constant = Vec::new();
    for column in dataset.frame().get_columns() {
        let name = column.name().as_str();
        if !protected.contains(&name) && unique_values(column)?.len() == 1 {
            constant.push(name.to_string());
        }
    }

    let mut dataset = dataset;
    for name in &constant {
        dataset = dataset.drop_column(name)?;
    }
    if !constant.is_empty() {
        info!("{:?} removed for holding a single value", constant);
    }
    Ok((dataset, constant))
}

/// Encode, drop reference levels, then optionally drop constant columns
pub fn prepare_dummies(
    dataset: Dataset,
    categorical_vars: &[String],
    reference_levels: &BTreeMap<String, String>,
    remove_constant: bool,
) -> Result<Dataset> {
    let dataset = to_dummies(dataset, categorical_vars)?;
    let (dataset, removed) = remove_reference_levels(dataset, reference_levels)?;
    info!("Reference levels removed: {:?}", removed);
    if !remove_constant {
        return Ok(dataset);
    }
    let (dataset, _) = remove_constant_columns(dataset, &protected_columns())?;
    Ok(dataset)
}

/// Encode every categorical text column and the window orientation
/// indicators against their most frequent level. Returns the encoded
/// dataset and the variables considered.
pub fn encode_categoricals(
    dataset: Dataset,
    n_levels_max: usize,
    remove_constant: bool,
) -> Result<(Dataset, Vec<String>)> {
    let mut categorical_vars = get_categorical_vars(dataset.frame(), n_levels_max)?;
    categorical_vars.push(WINDOW_ORIENTATION.to_string());
    let reference_levels = get_most_frequent_levels(dataset.frame(), &categorical_vars)?;
    let dataset = prepare_dummies(dataset, &categorical_vars, &reference_levels, remove_constant)?;
    Ok((dataset, categorical_vars))
}
