//! Column access, joins and stacking over polars frames

use polars::prelude::*;

use crate::error::{PipelineError, Result};

const ROW_INDEX: &str = "__row_index";

/// Integral floats render without a fractional part (`75001.0` -> `"75001"`)
pub fn format_number(x: f64) -> String {
    if x.fract() == 0.0 && x.abs() < 1e15 {
        format!("{}", x as i64)
    } else {
        format!("{}", x)
    }
}

/// Integer, float and boolean columns; everything else is treated as text
pub fn is_numeric(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
            | DataType::Boolean
    )
}

pub fn has_column(df: &DataFrame, name: &str) -> bool {
    df.column(name).is_ok()
}

pub fn column<'a>(df: &'a DataFrame, name: &str) -> Result<&'a Column> {
    df.column(name)
        .map_err(|_| PipelineError::MissingColumn(name.to_string()))
}

pub fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .into_iter()
        .map(|n| n.to_string())
        .collect()
}

pub fn is_numeric_column(df: &DataFrame, name: &str) -> bool {
    df.column(name).is_ok_and(|c| is_numeric(c.dtype()))
}

/// Values of a numeric column as f64; NaN counts as missing
pub fn f64_values(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let column = column(df, name)?;
    if !is_numeric(column.dtype()) {
        return Err(PipelineError::ColumnType {
            column: name.to_string(),
            expected: "numeric",
        });
    }
    let cast = column.cast(&DataType::Float64)?;
    Ok(cast
        .f64()?
        .into_iter()
        .map(|v| v.filter(|x| x.is_finite()))
        .collect())
}

/// Cells rendered as text, numbers through [`format_number`]
pub fn rendered(column: &Column) -> Result<Vec<Option<String>>> {
    if is_numeric(column.dtype()) {
        let cast = column.cast(&DataType::Float64)?;
        return Ok(cast
            .f64()?
            .into_iter()
            .map(|v| v.filter(|x| x.is_finite()).map(format_number))
            .collect());
    }
    let cast = column.cast(&DataType::String)?;
    Ok(cast
        .str()?
        .into_iter()
        .map(|v| v.map(String::from))
        .collect())
}

pub fn text_values(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    rendered(column(df, name)?)
}

/// Single cell of a numeric column
pub fn f64_at(df: &DataFrame, name: &str, row: usize) -> Option<f64> {
    f64_values(&df.slice(row as i64, 1), name)
        .ok()?
        .into_iter()
        .next()
        .flatten()
}

/// Single cell, rendered
pub fn text_at(df: &DataFrame, name: &str, row: usize) -> Option<String> {
    text_values(&df.slice(row as i64, 1), name)
        .ok()?
        .into_iter()
        .next()
        .flatten()
}

pub fn float_column(name: &str, values: Vec<Option<f64>>) -> Column {
    Column::new(name.into(), values)
}

pub fn text_column(name: &str, values: Vec<Option<String>>) -> Column {
    Column::new(name.into(), values)
}

/// Add a column, replacing any column of the same name
pub fn set_column(mut df: DataFrame, column: Column) -> Result<DataFrame> {
    if df.width() > 0 && column.len() != df.height() {
        return Err(PipelineError::Shape(format!(
            "column '{}' has {} rows, frame has {}",
            column.name(),
            column.len(),
            df.height()
        )));
    }
    df.with_column(column)?;
    Ok(df)
}

/// Drop `name` if present
pub fn drop_column(df: DataFrame, name: &str) -> Result<DataFrame> {
    if has_column(&df, name) {
        Ok(df.drop(name)?)
    } else {
        Ok(df)
    }
}

/// Columns in the given order; absent names fail as missing columns
pub fn select_columns<S: AsRef<str>>(df: &DataFrame, names: &[S]) -> Result<DataFrame> {
    let exprs = names
        .iter()
        .map(|n| {
            column(df, n.as_ref())?;
            Ok(col(n.as_ref()))
        })
        .collect::<Result<Vec<Expr>>>()?;
    Ok(df.clone().lazy().select(exprs).collect()?)
}

/// Rows where `mask` is true
pub fn filter_rows(df: &DataFrame, mask: &[bool]) -> Result<DataFrame> {
    let mask = BooleanChunked::from_slice("mask".into(), mask);
    Ok(df.filter(&mask)?)
}

/// Missing cells in each row
pub fn missing_per_row(df: &DataFrame) -> Vec<usize> {
    let mut counts = vec![0; df.height()];
    for column in df.get_columns() {
        if column.null_count() == 0 {
            continue;
        }
        for (count, missing) in counts.iter_mut().zip(column.is_null().into_iter()) {
            if missing == Some(true) {
                *count += 1;
            }
        }
    }
    counts
}

/// Key column replaced by its rendered, trimmed text, left-padded with
/// zeros to `width` when given (`10530000` -> `"010530000"` for 9)
pub fn text_key(df: &DataFrame, key: &str, width: Option<usize>) -> Result<DataFrame> {
    let values = text_values(df, key)?
        .into_iter()
        .map(|v| {
            v.map(|s| match width {
                Some(w) => format!("{:0>w$}", s.trim(), w = w),
                None => s.trim().to_string(),
            })
        })
        .collect();
    set_column(df.clone(), text_column(key, values))
}

/// Left join on text keys, keeping the left row order.
///
/// Keys are compared as rendered text on both sides and come back as text. With a single key
/// only the first right row of each key joins, so the row count never
/// grows. Clashing right columns get `suffix`.
pub fn left_join(
    left: &DataFrame,
    right: &DataFrame,
    left_on: &[&str],
    right_on: &[&str],
    suffix: &str,
) -> Result<DataFrame> {
    if left_on.len() != right_on.len() || left_on.is_empty() {
        return Err(PipelineError::Validation(format!(
            "cannot join on {:?} = {:?}",
            left_on, right_on
        )));
    }
    let mut left = left.clone();
    for key in left_on {
        left = text_key(&left, key, None)?;
    }
    let mut right_df = right.clone();
    for key in right_on {
        right_df = text_key(&right_df, key, None)?;
    }

    let mut right = right_df.lazy();
    if let [key] = right_on {
        right = right.filter(col(*key).is_first_distinct());
    }
    let left_keys: Vec<Expr> = left_on.iter().map(|k| col(*k)).collect();
    let right_keys: Vec<Expr> = right_on.iter().map(|k| col(*k)).collect();

    let joined = left
        .lazy()
        .with_row_index(ROW_INDEX, None)
        .join(
            right,
            left_keys,
            right_keys,
            JoinArgs::new(JoinType::Left).with_suffix(Some(suffix.into())),
        )
        .sort([ROW_INDEX], SortMultipleOptions::default())
        .collect()?;
    Ok(joined.drop(ROW_INDEX)?)
}

/// Stack frames with possibly different columns; a column absent from a
/// frame is missing in its rows, and mixed types resolve to their supertype
pub fn concat_diagonal(frames: Vec<DataFrame>) -> Result<DataFrame> {
    if frames.is_empty() {
        return Ok(DataFrame::empty());
    }
    let lazy: Vec<LazyFrame> = frames.into_iter().map(|f| f.lazy()).collect();
    let args = UnionArgs {
        to_supertypes: true,
        ..Default::default()
    };
    Ok(concat_lf_diagonal(lazy, args)?.collect()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(75001.0), "75001");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(-3.0), "-3");
    }

    #[test]
    fn test_values_and_rendering() {
        let df = df!(
            "price" => &[Some(1.5), None, Some(f64::NAN)],
            "rooms" => &[Some(3i64), Some(2), None],
            "city" => &[Some("Paris"), None, Some("Lyon")]
        )
        .unwrap();
        assert_eq!(f64_values(&df, "price").unwrap(), vec![Some(1.5), None, None]);
        assert_eq!(
            text_values(&df, "rooms").unwrap(),
            vec![Some("3".to_string()), Some("2".to_string()), None]
        );
        assert!(matches!(
            f64_values(&df, "city"),
            Err(PipelineError::ColumnType { .. })
        ));
        assert!(matches!(
            f64_values(&df, "surface"),
            Err(PipelineError::MissingColumn(_))
        ));
        assert_eq!(text_at(&df, "city", 2).as_deref(), Some("Lyon"));
        assert_eq!(f64_at(&df, "rooms", 0), Some(3.0));
        assert_eq!(missing_per_row(&df), vec![0, 2, 2]);
    }

    #[test]
    fn test_set_column_checks_length() {
        let df = df!("a" => &[1.0, 2.0]).unwrap();
        let df = set_column(df, float_column("a", vec![Some(5.0), None])).unwrap();
        assert_eq!(f64_values(&df, "a").unwrap(), vec![Some(5.0), None]);
        assert!(matches!(
            set_column(df, float_column("b", vec![Some(1.0)])),
            Err(PipelineError::Shape(_))
        ));
    }

    #[test]
    fn test_text_key_pads_numeric_codes() {
        let df = df!("code_iris" => &[10530000.0, 751010101.0]).unwrap();
        let keyed = text_key(&df, "code_iris", Some(9)).unwrap();
        assert_eq!(
            text_values(&keyed, "code_iris").unwrap(),
            vec![Some("010530000".to_string()), Some("751010101".to_string())]
        );
    }

    #[test]
    fn test_left_join_keeps_order_and_first_match() {
        let left = df!(
            "id_parcelle" => &["p2", "p1", "p3", "p1"],
            "value" => &[1.0, 2.0, 3.0, 4.0]
        )
        .unwrap();
        let right = df!(
            "parcelle_id" => &["p1", "p1", "p2"],
            "value" => &[10.0, 20.0, 30.0]
        )
        .unwrap();
        let joined = left_join(&left, &right, &["id_parcelle"], &["parcelle_id"], "_bnb").unwrap();
        assert_eq!(joined.height(), 4);
        assert_eq!(
            f64_values(&joined, "value").unwrap(),
            vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)]
        );
        assert_eq!(
            f64_values(&joined, "value_bnb").unwrap(),
            vec![Some(30.0), Some(10.0), None, Some(10.0)]
        );
        assert!(!has_column(&joined, "parcelle_id"));
    }

    #[test]
    fn test_left_join_renders_numeric_keys() {
        let left = df!("code_commune" => &["01001", "75115"]).unwrap();
        let right = df!(
            "code_commune" => &[75115i64, 1001],
            "population" => &[230_000.0, 800.0]
        )
        .unwrap();
        let joined = left_join(&left, &right, &["code_commune"], &["code_commune"], "_r").unwrap();
        // "01001" and 1001 differ as text
        assert_eq!(
            f64_values(&joined, "population").unwrap(),
            vec![None, Some(230_000.0)]
        );
    }

    #[test]
    fn test_concat_diagonal_pads_missing_columns() {
        let a = df!("x" => &[1.0], "y" => &["a"]).unwrap();
        let b = df!("x" => &[2.0], "z" => &[5.0]).unwrap();
        let stacked = concat_diagonal(vec![a, b]).unwrap();
        assert_eq!(stacked.height(), 2);
        assert_eq!(f64_values(&stacked, "z").unwrap(), vec![None, Some(5.0)]);
        assert_eq!(text_values(&stacked, "y").unwrap(), vec![Some("a".to_string()), None]);
        assert_eq!(concat_diagonal(Vec::new()).unwrap().height(), 0);
    }

    #[test]
    fn test_select_and_filter() {
        let df = df!("a" => &[1.0, 2.0, 3.0], "b" => &["x", "y", "z"]).unwrap();
        let selected = select_columns(&df, &["b", "a"]).unwrap();
        assert_eq!(column_names(&selected), vec!["b", "a"]);
        assert!(matches!(
            select_columns(&df, &["c"]),
            Err(PipelineError::MissingColumn(_))
        ));
        let filtered = filter_rows(&df, &[true, false, true]).unwrap();
        assert_eq!(f64_values(&filtered, "a").unwrap(), vec![Some(1.0), Some(3.0)]);
        assert!(!has_column(&drop_column(df, "a").unwrap(), "a"));
    }
}
