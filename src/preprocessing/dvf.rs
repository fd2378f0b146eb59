//! DVF transaction preprocessing
//!
//! Raw DVF rows are checked once against the required schema and turned
//! into typed [`Transaction`] records. Selection, deduplication and the
//! dependency flag then operate on records; [`to_frame`] converts back.

use chrono::{Datelike, NaiveDate};
use polars::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::info;

use crate::data::csv_loader::read_zip_csv;
use crate::data::frame::{
    self, filter_rows, float_column, has_column, is_numeric_column, text_column, text_values,
};
use crate::error::{PipelineError, Result};

/// Columns a raw DVF table must provide
pub const REQUIRED_COLUMNS: &[&str] = &[
    "id_mutation",
    "nature_mutation",
    "code_type_local",
    "valeur_fonciere",
];

/// Accepted values of `nature_mutation` for a sale
pub const SALE_NATURES: &[&str] = &["Vente", "Sale"];

pub const HOUSE: i64 = 1;
pub const FLAT: i64 = 2;
pub const OUTBUILDING: i64 = 3;
pub const INDUSTRIAL: i64 = 4;

pub fn property_type_label(code: i64) -> Option<&'static str> {
    match code {
        HOUSE => Some("Maison"),
        FLAT => Some("Appartement"),
        OUTBUILDING => Some("Dépendance"),
        INDUSTRIAL => Some("Local industriel. commercial ou assimilé"),
        _ => None,
    }
}

/// One raw DVF row
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transaction {
    pub id_mutation: String,
    pub date_mutation: Option<NaiveDate>,
    pub nature_mutation: String,
    pub valeur_fonciere: Option<f64>,
    pub code_type_local: Option<i64>,
    pub surface_reelle_bati: Option<f64>,
    pub nombre_pieces_principales: Option<f64>,
    pub surface_terrain: Option<f64>,
    pub nom_commune: Option<String>,
    pub code_commune: Option<String>,
    pub code_departement: Option<String>,
    pub code_postal: Option<f64>,
    pub adresse_numero: Option<f64>,
    pub adresse_nom_voie: Option<String>,
    pub id_parcelle: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub dependance: bool,
}

impl Transaction {
    pub fn is_sale(&self) -> bool {
        SALE_NATURES.contains(&self.nature_mutation.as_str())
    }

    pub fn is_residential(&self) -> bool {
        matches!(self.code_type_local, Some(c) if (HOUSE..=OUTBUILDING).contains(&c))
    }
}

/// Fail with a schema error naming the first absent column
pub fn check_schema(df: &DataFrame, required: &[&str]) -> Result<()> {
    match required.iter().find(|c| !has_column(df, c)) {
        Some(missing) => Err(PipelineError::Schema(missing.to_string())),
        None => Ok(()),
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
        .ok()
}

/// Optional text column, all missing when absent
fn text_or_missing(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    if has_column(df, name) {
        text_values(df, name)
    } else {
        Ok(vec![None; df.height()])
    }
}

/// Optional numeric column; text cells are parsed, absent columns are missing
fn number_or_missing(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    if is_numeric_column(df, name) {
        return frame::f64_values(df, name);
    }
    Ok(text_or_missing(df, name)?
        .into_iter()
        .map(|v| v.and_then(|s| s.trim().parse().ok()))
        .collect())
}

/// Typed records of a raw DVF frame
pub fn from_frame(df: &DataFrame) -> Result<Vec<Transaction>> {
    check_schema(df, REQUIRED_COLUMNS)?;

    let ids = text_or_missing(df, "id_mutation")?;
    let dates = text_or_missing(df, "date_mutation")?;
    let natures = text_or_missing(df, "nature_mutation")?;
    let prices = number_or_missing(df, "valeur_fonciere")?;
    let types = number_or_missing(df, "code_type_local")?;
    let surfaces = number_or_missing(df, "surface_reelle_bati")?;
    let rooms = number_or_missing(df, "nombre_pieces_principales")?;
    let fields = number_or_missing(df, "surface_terrain")?;
    let communes = text_or_missing(df, "nom_commune")?;
    let commune_codes = text_or_missing(df, "code_commune")?;
    let departments = text_or_missing(df, "code_departement")?;
    let postal_codes = number_or_missing(df, "code_postal")?;
    let numbers = number_or_missing(df, "adresse_numero")?;
    let streets = text_or_missing(df, "adresse_nom_voie")?;
    let parcels = text_or_missing(df, "id_parcelle")?;
    let latitudes = number_or_missing(df, "latitude")?;
    let longitudes = number_or_missing(df, "longitude")?;
    let dependencies = number_or_missing(df, "dependance")?;

    let records = (0..df.height())
        .map(|i| Transaction {
            id_mutation: ids[i].clone().unwrap_or_default(),
            date_mutation: dates[i].as_deref().and_then(parse_date),
            nature_mutation: natures[i].clone().unwrap_or_default(),
            valeur_fonciere: prices[i],
            code_type_local: types[i].map(|c| c as i64),
            surface_reelle_bati: surfaces[i],
            nombre_pieces_principales: rooms[i],
            surface_terrain: fields[i],
            nom_commune: communes[i].clone(),
            code_commune: commune_codes[i].clone(),
            code_departement: departments[i].clone(),
            code_postal: postal_codes[i],
            adresse_numero: numbers[i],
            adresse_nom_voie: streets[i].clone(),
            id_parcelle: parcels[i].clone(),
            latitude: latitudes[i],
            longitude: longitudes[i],
            dependance: dependencies[i].is_some_and(|d| d > 0.0),
        })
        .collect();
    Ok(records)
}

/// Keep rows of a raw frame whose `nature_mutation` denotes a sale
pub fn select_sales(df: &DataFrame) -> Result<DataFrame> {
    check_schema(df, &["nature_mutation"])?;
    let mask: Vec<bool> = text_values(df, "nature_mutation")?
        .iter()
        .map(|n| n.as_deref().is_some_and(|n| SALE_NATURES.contains(&n)))
        .collect();
    filter_rows(df, &mask)
}

/// Keep rows of a raw frame with a house, flat or outbuilding type code
pub fn remove_non_residential(df: &DataFrame) -> Result<DataFrame> {
    check_schema(df, &["code_type_local"])?;
    let code = col("code_type_local").cast(DataType::Float64);
    Ok(df
        .clone()
        .lazy()
        .filter(
            code.clone()
                .gt_eq(lit(HOUSE as f64))
                .and(code.lt_eq(lit(OUTBUILDING as f64))),
        )
        .collect()?)
}

pub fn select_sale_records(records: Vec<Transaction>) -> Vec<Transaction> {
    records.into_iter().filter(Transaction::is_sale).collect()
}

pub fn remove_non_residential_records(records: Vec<Transaction>) -> Vec<Transaction> {
    records.into_iter().filter(Transaction::is_residential).collect()
}

/// Records partitioned by type code
#[derive(Debug, Clone, Default)]
pub struct PropertyTypeSplit {
    pub houses: Vec<Transaction>,
    pub flats: Vec<Transaction>,
    pub outbuildings: Vec<Transaction>,
}

pub fn classify_by_type(records: Vec<Transaction>) -> PropertyTypeSplit {
    let mut split = PropertyTypeSplit::default();
    for record in records {
        match record.code_type_local {
            Some(HOUSE) => split.houses.push(record),
            Some(FLAT) => split.flats.push(record),
            Some(OUTBUILDING) => split.outbuildings.push(record),
            _ => {}
        }
    }
    split
}

/// Mutations spanning exactly one row, and the rows of all others
#[derive(Debug, Clone, Default)]
pub struct Deduplicated {
    pub unique: Vec<Transaction>,
    pub duplicates: Vec<Transaction>,
}

/// Partition records by mutation id multiplicity, preserving row order
pub fn deduplicate_mutations(records: Vec<Transaction>) -> Deduplicated {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for r in &records {
        *counts.entry(r.id_mutation.clone()).or_default() += 1;
    }

    let mut out = Deduplicated::default();
    for r in records {
        if counts.get(&r.id_mutation) == Some(&1) {
            out.unique.push(r);
        } else {
            out.duplicates.push(r);
        }
    }
    out
}

/// Policy applied to the rows of one multi-row mutation
pub trait DuplicateResolver {
    fn name(&self) -> &str;

    /// Rows to keep out of `group`, all sharing one mutation id
    fn resolve(&self, group: &[Transaction]) -> Vec<Transaction>;
}

/// Multi-row mutations are left out of the canonical dataset
#[derive(Debug, Clone, Copy, Default)]
pub struct DropComplexDuplicates;

impl DuplicateResolver for DropComplexDuplicates {
    fn name(&self) -> &str {
        "drop"
    }

    fn resolve(&self, _group: &[Transaction]) -> Vec<Transaction> {
        Vec::new()
    }
}

/// Unique records followed by whatever the resolver keeps of each complex
/// mutation, complex groups visited in first-seen order
pub fn resolve_duplicates(dedup: Deduplicated, resolver: &dyn DuplicateResolver) -> Vec<Transaction> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Transaction>> = HashMap::new();
    for r in dedup.duplicates {
        if !groups.contains_key(&r.id_mutation) {
            order.push(r.id_mutation.clone());
        }
        groups.entry(r.id_mutation.clone()).or_default().push(r);
    }

    let mut kept = dedup.unique;
    for id in order {
        if let Some(group) = groups.get(&id) {
            kept.extend(resolver.resolve(group));
        }
    }
    kept
}

/// Flag records whose mutation id also appears among outbuilding rows
pub fn add_dependency_dummy(base: &[Transaction], dependencies: &[Transaction]) -> Vec<Transaction> {
    let ids: HashSet<&str> = dependencies.iter().map(|d| d.id_mutation.as_str()).collect();
    base.iter()
        .map(|r| Transaction {
            dependance: ids.contains(r.id_mutation.as_str()),
            ..r.clone()
        })
        .collect()
}

/// Cleaned houses and flats, one row per mutation
#[derive(Debug, Clone, Default)]
pub struct CleanSales {
    pub houses: Vec<Transaction>,
    pub flats: Vec<Transaction>,
}

/// Sales -> residential -> single-row houses/flats with the dependency flag
pub fn build_sales(records: Vec<Transaction>, resolver: &dyn DuplicateResolver) -> CleanSales {
    let n_raw = records.len();
    let residential = remove_non_residential_records(select_sale_records(records));
    let (outbuildings, main): (Vec<_>, Vec<_>) = residential
        .into_iter()
        .partition(|r| r.code_type_local == Some(OUTBUILDING));

    let dedup = deduplicate_mutations(main);
    info!(
        "{} raw rows, {} single-row mutations, {} rows in multi-row mutations (resolver: {})",
        n_raw,
        dedup.unique.len(),
        dedup.duplicates.len(),
        resolver.name()
    );
    let kept = resolve_duplicates(dedup, resolver);

    let kept_ids: HashSet<&str> = kept.iter().map(|r| r.id_mutation.as_str()).collect();
    let outbuildings: Vec<Transaction> = outbuildings
        .iter()
        .filter(|o| kept_ids.contains(o.id_mutation.as_str()))
        .cloned()
        .collect();

    let split = classify_by_type(kept);
    CleanSales {
        houses: add_dependency_dummy(&split.houses, &outbuildings),
        flats: add_dependency_dummy(&split.flats, &outbuildings),
    }
}

/// Frame view of records, with `annee`, `trimestre`, `mois` and `jour`
pub fn to_frame(records: &[Transaction]) -> Result<DataFrame> {
    let text = |f: fn(&Transaction) -> Option<String>| records.iter().map(f).collect::<Vec<_>>();
    let num = |f: fn(&Transaction) -> Option<f64>| records.iter().map(f).collect::<Vec<_>>();
    let date_part = |f: fn(&NaiveDate) -> u32| {
        records
            .iter()
            .map(|r| r.date_mutation.as_ref().map(|d| f(d) as f64))
            .collect::<Vec<_>>()
    };

    Ok(DataFrame::new(vec![
        text_column("id_mutation", text(|r| Some(r.id_mutation.clone()))),
        text_column(
            "date_mutation",
            text(|r| r.date_mutation.map(|d| d.format("%Y-%m-%d").to_string())),
        ),
        text_column("nature_mutation", text(|r| Some(r.nature_mutation.clone()))),
        float_column("valeur_fonciere", num(|r| r.valeur_fonciere)),
        float_column("code_type_local", num(|r| r.code_type_local.map(|c| c as f64))),
        float_column("surface_reelle_bati", num(|r| r.surface_reelle_bati)),
        float_column("nombre_pieces_principales", num(|r| r.nombre_pieces_principales)),
        float_column("surface_terrain", num(|r| r.surface_terrain)),
        text_column("nom_commune", text(|r| r.nom_commune.clone())),
        text_column("code_commune", text(|r| r.code_commune.clone())),
        text_column("code_departement", text(|r| r.code_departement.clone())),
        float_column("code_postal", num(|r| r.code_postal)),
        float_column("adresse_numero", num(|r| r.adresse_numero)),
        text_column("adresse_nom_voie", text(|r| r.adresse_nom_voie.clone())),
        text_column("id_parcelle", text(|r| r.id_parcelle.clone())),
        float_column("latitude", num(|r| r.latitude)),
        float_column("longitude", num(|r| r.longitude)),
        float_column("dependance", num(|r| Some(if r.dependance { 1.0 } else { 0.0 }))),
        float_column("annee", date_part(|d| d.year() as u32)),
        float_column("trimestre", date_part(|d| d.month0() / 3 + 1)),
        float_column("mois", date_part(|d| d.month())),
        float_column("jour", date_part(|d| d.day())),
    ])?)
}

/// Raw DVF rows of one year, stored as `dvf/{year}.csv` in the archive
pub fn load_zip_csv<P: AsRef<Path>>(zip_path: P, year: i32) -> Result<DataFrame> {
    let zip_path = zip_path.as_ref();
    if zip_path.extension().and_then(|e| e.to_str()) != Some("zip") {
        return Err(PipelineError::Validation(format!(
            "expected a .zip archive, got {}",
            zip_path.display()
        )));
    }
    read_zip_csv(zip_path, &format!("dvf/{}.csv", year))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(id: &str, nature: &str, code: i64) -> Transaction {
        Transaction {
            id_mutation: id.to_string(),
            nature_mutation: nature.to_string(),
            code_type_local: Some(code),
            valeur_fonciere: Some(100_000.0),
            date_mutation: NaiveDate::from_ymd_opt(2021, 5, 17),
            ..Default::default()
        }
    }

    #[test]
    fn test_select_sales_requires_column() {
        let df = df!("id_mutation" => &["a"]).unwrap();
        assert!(matches!(select_sales(&df), Err(PipelineError::Schema(c)) if c == "nature_mutation"));
    }

    #[test]
    fn test_select_sales_and_residential_on_frame() {
        let df = df!(
            "nature_mutation" => &["Vente", "Echange", "Sale", "Vente"],
            "code_type_local" => &[1i64, 2, 4, 3]
        )
        .unwrap();
        let sales = select_sales(&df).unwrap();
        assert_eq!(sales.height(), 3);
        let residential = remove_non_residential(&sales).unwrap();
        assert_eq!(
            frame::f64_values(&residential, "code_type_local").unwrap(),
            vec![Some(1.0), Some(3.0)]
        );
    }

    #[test]
    fn test_from_frame_schema_error() {
        let df = df!(
            "id_mutation" => &["a"],
            "nature_mutation" => &["Vente"]
        )
        .unwrap();
        assert!(matches!(from_frame(&df), Err(PipelineError::Schema(c)) if c == "code_type_local"));
    }

    #[test]
    fn test_from_frame_reads_typed_records() {
        let df = df!(
            "id_mutation" => &["2021-1"],
            "date_mutation" => &["2021-05-17"],
            "nature_mutation" => &["Vente"],
            "valeur_fonciere" => &[250_000.0],
            "code_type_local" => &[2.0],
            "code_postal" => &["75015"],
            "dependance" => &[1.0]
        )
        .unwrap();
        let records = from_frame(&df).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.code_type_local, Some(FLAT));
        assert_eq!(r.code_postal, Some(75015.0));
        assert_eq!(r.date_mutation, NaiveDate::from_ymd_opt(2021, 5, 17));
        assert_eq!(r.latitude, None);
        assert!(r.dependance && r.is_sale() && r.is_residential());
    }

    #[test]
    fn test_deduplicate_partitions_records() {
        let records = vec![
            tx("A", "Vente", 2),
            tx("B", "Vente", 2),
            tx("B", "Vente", 1),
            tx("C", "Vente", 1),
            tx("B", "Vente", 2),
        ];
        let n = records.len();
        let dedup = deduplicate_mutations(records);
        assert_eq!(dedup.unique.len() + dedup.duplicates.len(), n);
        assert!(dedup.unique.iter().all(|r| r.id_mutation != "B"));
        assert!(dedup.duplicates.iter().all(|r| r.id_mutation == "B"));

        let kept = resolve_duplicates(dedup, &DropComplexDuplicates);
        let ids: Vec<&str> = kept.iter().map(|r| r.id_mutation.as_str()).collect();
        assert_eq!(ids, vec!["A", "C"]);
    }

    #[test]
    fn test_add_dependency_dummy_is_pure() {
        let base = vec![tx("A", "Vente", 2), tx("B", "Vente", 1)];
        let deps = vec![tx("B", "Vente", 3)];
        let flagged = add_dependency_dummy(&base, &deps);
        assert!(!flagged[0].dependance);
        assert!(flagged[1].dependance);
        assert!(!base[1].dependance);
    }

    #[test]
    fn test_build_sales() {
        let records = vec![
            tx("A", "Vente", 2),
            tx("A", "Vente", 3),
            tx("B", "Vente", 1),
            tx("C", "Vente", 2),
            tx("C", "Vente", 2),
            tx("D", "Echange", 2),
            tx("E", "Vente", 4),
        ];
        let sales = build_sales(records, &DropComplexDuplicates);
        assert_eq!(sales.flats.len(), 1);
        assert_eq!(sales.flats[0].id_mutation, "A");
        assert!(sales.flats[0].dependance);
        assert_eq!(sales.houses.len(), 1);
        assert!(!sales.houses[0].dependance);
    }

    #[test]
    fn test_to_frame_date_components() {
        let df = to_frame(&[tx("A", "Vente", 2)]).unwrap();
        assert_eq!(frame::f64_at(&df, "trimestre", 0), Some(2.0));
        assert_eq!(frame::f64_at(&df, "mois", 0), Some(5.0));
        assert_eq!(frame::f64_at(&df, "jour", 0), Some(17.0));
        assert_eq!(frame::text_at(&df, "date_mutation", 0).as_deref(), Some("2021-05-17"));
    }
}
