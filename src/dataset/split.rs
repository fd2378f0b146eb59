//! Temporal train/test split and conversion to model matrices

use ndarray::{Array1, Array2};
use polars::prelude::*;
use tracing::info;

use crate::data::catalog::{IDENTIFIER_VARS, LOG_PRICE_VAR, PRICE_M2_VAR, PRICE_VAR};
use crate::data::frame::{
    self, column_names, f64_values, filter_rows, is_numeric, missing_per_row, select_columns,
    text_values,
};
use crate::error::{PipelineError, Result};

/// Train and test rows with their transaction dates, aligned row by row
#[derive(Debug, Clone)]
pub struct TemporalSplit {
    pub train: DataFrame,
    pub test: DataFrame,
    pub train_dates: Vec<String>,
    pub test_dates: Vec<String>,
}

/// Rows without any missing value
pub fn drop_incomplete_rows(df: &DataFrame) -> Result<DataFrame> {
    let mask: Vec<bool> = missing_per_row(df).into_iter().map(|n| n == 0).collect();
    filter_rows(df, &mask)
}

fn finish_part(part: DataFrame, date_var: &str) -> Result<(DataFrame, Vec<String>)> {
    let complete = drop_incomplete_rows(&part)?;
    let dates = text_values(&complete, date_var)?.into_iter().flatten().collect();
    Ok((frame::drop_column(complete, date_var)?, dates))
}

/// Sort by date and put the earliest `train_prop` share of rows in the
/// training set. The date column is removed from both parts, then rows
/// with missing values are dropped.
pub fn temporal_train_test_split(
    df: &DataFrame,
    date_var: &str,
    train_prop: f64,
) -> Result<TemporalSplit> {
    if !(0.0..=1.0).contains(&train_prop) {
        return Err(PipelineError::Validation(format!(
            "train proportion must lie in [0, 1], got {}",
            train_prop
        )));
    }
    if frame::column(df, date_var)?.null_count() > 0 {
        return Err(PipelineError::Validation(format!(
            "{} has missing values",
            date_var
        )));
    }

    let sorted = df.sort(
        [date_var],
        SortMultipleOptions::default().with_maintain_order(true),
    )?;
    let height = sorted.height();
    let train_size = (height as f64 * train_prop) as usize;

    let (train, train_dates) = finish_part(sorted.slice(0, train_size), date_var)?;
    let (test, test_dates) =
        finish_part(sorted.slice(train_size as i64, height - train_size), date_var)?;
    info!(
        "Temporal split: {} training rows, {} test rows",
        train.height(),
        test.height()
    );
    Ok(TemporalSplit {
        train,
        test,
        train_dates,
        test_dates,
    })
}

/// Every column name except the target
pub fn feature_names(df: &DataFrame, target: &str) -> Vec<String> {
    column_names(df).into_iter().filter(|n| n != target).collect()
}

/// Date, target and every numeric feature column. Other price columns and
/// identifiers are left out so the target cannot leak.
pub fn modeling_table(df: &DataFrame, target: &str, date_var: &str) -> Result<DataFrame> {
    let leaks = [PRICE_VAR, LOG_PRICE_VAR, PRICE_M2_VAR];
    let mut columns = vec![date_var.to_string()];
    columns.extend(
        df.get_columns()
            .iter()
            .filter(|c| is_numeric(c.dtype()))
            .map(|c| c.name().as_str())
            .filter(|n| *n != target && *n != date_var)
            .filter(|n| !leaks.contains(n) && !IDENTIFIER_VARS.contains(n))
            .map(String::from),
    );
    columns.push(target.to_string());
    select_columns(df, &columns)
}

/// Row-major feature matrix. Every feature must be numeric and complete.
pub fn feature_matrix<S: AsRef<str>>(df: &DataFrame, features: &[S]) -> Result<Array2<f64>> {
    let mut matrix = Array2::<f64>::zeros((df.height(), features.len()));
    for (j, name) in features.iter().enumerate() {
        let name = name.as_ref();
        for (i, value) in f64_values(df, name)?.into_iter().enumerate() {
            matrix[[i, j]] = value.ok_or_else(|| {
                PipelineError::Validation(format!("{} has a missing value at row {}", name, i))
            })?;
        }
    }
    Ok(matrix)
}

pub fn target_vector(df: &DataFrame, target: &str) -> Result<Array1<f64>> {
    f64_values(df, target)?
        .into_iter()
        .enumerate()
        .map(|(i, v)| {
            v.ok_or_else(|| {
                PipelineError::Validation(format!("{} has a missing value at row {}", target, i))
            })
        })
        .collect::<Result<Vec<f64>>>()
        .map(Array1::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frame::has_column;

    fn sample() -> DataFrame {
        df!(
            "date_mutation" => &["2021-03-01", "2021-01-01", "2021-04-01", "2021-02-01", "2021-05-01"],
            "x" => &[Some(3.0), Some(1.0), Some(4.0), None, Some(5.0)],
            "y" => &[30.0, 10.0, 40.0, 20.0, 50.0]
        )
        .unwrap()
    }

    #[test]
    fn test_split_is_temporal() {
        let split = temporal_train_test_split(&sample(), "date_mutation", 0.7).unwrap();
        // 3 earliest rows go to train, the one with a missing x is dropped
        assert_eq!(f64_values(&split.train, "y").unwrap(), vec![Some(10.0), Some(30.0)]);
        assert_eq!(split.train_dates, vec!["2021-01-01", "2021-03-01"]);
        assert_eq!(f64_values(&split.test, "y").unwrap(), vec![Some(40.0), Some(50.0)]);
        assert!(!has_column(&split.train, "date_mutation"));
        assert!(split.train_dates.iter().all(|d| split.test_dates.iter().all(|t| d < t)));
    }

    #[test]
    fn test_modeling_table() {
        let mut df = sample();
        df.with_column(Column::new("id_mutation".into(), &["a", "b", "c", "d", "e"]))
            .unwrap();
        df.with_column(Column::new("valeur_fonciere".into(), &[1.0; 5]))
            .unwrap();
        df.with_column(Column::new("latitude".into(), &[48.0; 5]))
            .unwrap();
        let modeling = modeling_table(&df, "y", "date_mutation").unwrap();
        assert_eq!(column_names(&modeling), vec!["date_mutation", "x", "y"]);
    }

    #[test]
    fn test_split_rejects_bad_proportion() {
        assert!(temporal_train_test_split(&sample(), "date_mutation", 1.5).is_err());
    }

    #[test]
    fn test_matrices() {
        let complete = drop_incomplete_rows(&sample()).unwrap();
        let names = feature_names(&complete, "y");
        assert_eq!(names, vec!["date_mutation", "x"]);
        let x = feature_matrix(&complete, &["x"]).unwrap();
        assert_eq!(x.dim(), (4, 1));
        assert_eq!(target_vector(&complete, "y").unwrap()[3], 50.0);
        assert!(matches!(
            feature_matrix(&sample(), &["x"]),
            Err(PipelineError::Validation(_))
        ));
        assert!(matches!(
            feature_matrix(&complete, &["date_mutation"]),
            Err(PipelineError::ColumnType { .. })
        ));
    }
}
