//! Tabular file I/O: CSV, zipped CSV and parquet, loaded as polars frames

use polars::prelude::*;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use tracing::debug;
use ::zip::ZipArchive;

use super::frame::is_numeric;
use crate::error::{PipelineError, Result};

const INFER_SCHEMA_ROWS: usize = 10_000;

/// Load a comma-separated file with a header row
pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<DataFrame> {
    read_csv_with_separator(path, b',')
}

pub fn read_csv_with_separator<P: AsRef<Path>>(path: P, separator: u8) -> Result<DataFrame> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(INFER_SCHEMA_ROWS))
        .with_parse_options(CsvParseOptions::default().with_separator(separator))
        .try_into_reader_with_file_path(Some(path.as_ref().to_path_buf()))?
        .finish()?;
    debug!("Read {} rows from {:?}", df.height(), path.as_ref());
    numeric_as_float(df)
}

/// Parse CSV content already in memory
pub fn read_csv_bytes(bytes: Vec<u8>, separator: u8) -> Result<DataFrame> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(INFER_SCHEMA_ROWS))
        .with_parse_options(CsvParseOptions::default().with_separator(separator))
        .into_reader_with_file_handle(Cursor::new(bytes))
        .finish()?;
    numeric_as_float(df)
}

/// Load the CSV entry `entry` of a zip archive
pub fn read_zip_csv<P: AsRef<Path>>(zip_path: P, entry: &str) -> Result<DataFrame> {
    let file = File::open(zip_path.as_ref())?;
    let mut archive = ZipArchive::new(file)?;
    let mut inner = archive.by_name(entry)?;
    let mut buffer = Vec::with_capacity(inner.size() as usize);
    inner.read_to_end(&mut buffer)?;
    debug!("Extracted {} ({} bytes) from {:?}", entry, buffer.len(), zip_path.as_ref());
    read_csv_bytes(buffer, b',')
}

/// Names of the CSV entries of a zip archive
pub fn list_zip_csv<P: AsRef<Path>>(zip_path: P) -> Result<Vec<String>> {
    let file = File::open(zip_path.as_ref())?;
    let archive = ZipArchive::new(file)?;
    Ok(archive
        .file_names()
        .filter(|n| n.ends_with(".csv"))
        .map(String::from)
        .collect())
}

pub fn read_parquet<P: AsRef<Path>>(path: P) -> Result<DataFrame> {
    let file = File::open(path.as_ref())?;
    let df = ParquetReader::new(file).finish()?;
    numeric_as_float(df)
}

pub fn write_parquet<P: AsRef<Path>>(df: &DataFrame, path: P) -> Result<()> {
    let mut df = df.clone();
    let file = File::create(path.as_ref())?;
    ParquetWriter::new(file).finish(&mut df)?;
    Ok(())
}

pub fn write_csv<P: AsRef<Path>>(df: &DataFrame, path: P) -> Result<()> {
    let mut df = df.clone();
    let mut file = File::create(path.as_ref())?;
    CsvWriter::new(&mut file).include_header(true).finish(&mut df)?;
    Ok(())
}

/// Load by extension: `.csv`, `.parquet`, or `archive.zip:entry.csv`
pub fn read_table<P: AsRef<Path>>(path: P) -> Result<DataFrame> {
    let path = path.as_ref();
    let display = path.to_string_lossy();
    if let Some((archive, entry)) = display.split_once(".zip:") {
        return read_zip_csv(format!("{}.zip", archive), entry);
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("parquet") => read_parquet(path),
        Some("csv") | Some("txt") => read_csv(path),
        other => Err(PipelineError::Validation(format!(
            "unsupported file type {:?} for {}",
            other, display
        ))),
    }
}

/// Integer and boolean columns are widened to Float64 so every numeric
/// column downstream shares one dtype
pub fn numeric_as_float(df: DataFrame) -> Result<DataFrame> {
    let casts: Vec<Expr> = df
        .get_columns()
        .iter()
        .filter(|c| is_numeric(c.dtype()) && *c.dtype() != DataType::Float64)
        .map(|c| col(c.name().as_str()).cast(DataType::Float64))
        .collect();
    if casts.is_empty() {
        return Ok(df);
    }
    Ok(df.lazy().with_columns(casts).collect()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frame::{f64_values, text_at};
    use std::io::Write;

    #[test]
    fn test_read_csv_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dvf.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "id_mutation,valeur_fonciere,nom_commune").unwrap();
        writeln!(f, "2017-1,500000,Paris 15e Arrondissement").unwrap();
        writeln!(f, "2017-2,,Lyon").unwrap();
        drop(f);

        let df = read_csv(&path).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.column("valeur_fonciere").unwrap().dtype(), &DataType::Float64);
        assert_eq!(
            f64_values(&df, "valeur_fonciere").unwrap(),
            vec![Some(500000.0), None]
        );
        assert_eq!(text_at(&df, "nom_commune", 1).as_deref(), Some("Lyon"));
    }

    #[test]
    fn test_parquet_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bnb.parquet");
        let df = df!(
            "parcelle_id" => &["p1", "p2"],
            "hauteur_mean" => &[Some(12.5), None]
        )
        .unwrap();

        write_parquet(&df, &path).unwrap();
        let back = read_parquet(&path).unwrap();
        assert!(back.equals_missing(&df));
    }

    #[test]
    fn test_read_zip_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dvf.zip");
        let file = File::create(&path).unwrap();
        let mut writer = ::zip::ZipWriter::new(file);
        writer
            .start_file("dvf/2022.csv", ::zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"a,b\n1,x\n2,y\n").unwrap();
        writer.finish().unwrap();

        assert_eq!(list_zip_csv(&path).unwrap(), vec!["dvf/2022.csv"]);
        let df = read_zip_csv(&path, "dvf/2022.csv").unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(f64_values(&df, "a").unwrap(), vec![Some(1.0), Some(2.0)]);
    }

    #[test]
    fn test_numeric_as_float_keeps_text() {
        let df = df!("n" => &[1i64, 2], "flag" => &[true, false], "t" => &["a", "b"]).unwrap();
        let df = numeric_as_float(df).unwrap();
        assert_eq!(df.column("n").unwrap().dtype(), &DataType::Float64);
        assert_eq!(f64_values(&df, "flag").unwrap(), vec![Some(1.0), Some(0.0)]);
        assert_eq!(df.column("t").unwrap().dtype(), &DataType::String);
    }
}
