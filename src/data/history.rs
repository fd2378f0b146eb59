//! Transaction History Index
//!
//! Past sales around a user's address: narrowing by street, then postal
//! code, and picking the geographically closest comparable.

use polars::prelude::*;
use std::path::Path;

use super::csv_loader::read_table;
use super::frame::{f64_values, filter_rows, is_numeric_column, missing_per_row, text_values};
use super::utils::haversine_m;
use crate::error::{PipelineError, Result};
use crate::models::{PredictionRequest, PropertyType};
use crate::preprocessing::geo::extract_department_code;

/// Department whose history is narrowed to the postal code rather than
/// the whole department
const PARIS_DEPARTMENT: u32 = 75;

/// Closest comparable: its row in the candidate frame and the distance
/// to the user's address when both locations are known
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparable {
    pub row: usize,
    pub distance_m: Option<f64>,
}

impl Comparable {
    /// True when the comparable sits at the user's address
    pub fn is_same_location(&self) -> bool {
        self.distance_m == Some(0.0)
    }
}

/// Street names compare lowercased, without commas or extra blanks
pub fn normalize_street(name: &str) -> String {
    name.to_lowercase()
        .replace(',', "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn equals_mask(df: &DataFrame, column: &str, expected: &str) -> Result<Vec<bool>> {
    Ok(text_values(df, column)?
        .iter()
        .map(|v| v.as_deref() == Some(expected))
        .collect())
}

/// Sales sharing the user's street number, street name and postal code;
/// failing that, the street name and postal code; failing that, the postal
/// code alone. Errors when the postal code itself has no sale.
pub fn return_close_properties(
    history: &DataFrame,
    request: &PredictionRequest,
) -> Result<DataFrame> {
    let zip = equals_mask(history, "code_postal", &request.zip_code.to_string())?;

    let street = normalize_street(&request.street_name);
    let same_street: Vec<bool> = text_values(history, "adresse_nom_voie")?
        .iter()
        .zip(&zip)
        .map(|(name, z)| *z && name.as_deref().map(normalize_street).as_deref() == Some(street.as_str()))
        .collect();

    if let Some(number) = request.street_number {
        let same_number = equals_mask(history, "adresse_numero", &number.to_string())?;
        let exact: Vec<bool> = same_street
            .iter()
            .zip(&same_number)
            .map(|(s, n)| *s && *n)
            .collect();
        if exact.contains(&true) {
            return filter_rows(history, &exact);
        }
    }
    if same_street.contains(&true) {
        return filter_rows(history, &same_street);
    }
    if zip.contains(&true) {
        return filter_rows(history, &zip);
    }
    Err(PipelineError::NoComparableFound(request.zip_code))
}

/// Closest row to `coordinates`; ties, and every row when no distance can
/// be computed, go to the row with the fewest missing values
pub fn find_closest(candidates: &DataFrame, coordinates: Option<(f64, f64)>) -> Option<Comparable> {
    if candidates.height() == 0 {
        return None;
    }
    let located = is_numeric_column(candidates, "latitude") && is_numeric_column(candidates, "longitude");
    let distances: Vec<Option<f64>> = match (
        coordinates.filter(|_| located),
        f64_values(candidates, "latitude").ok(),
        f64_values(candidates, "longitude").ok(),
    ) {
        (Some(user), Some(lat), Some(lon)) => lat
            .iter()
            .zip(&lon)
            .map(|(la, lo)| Some(haversine_m(user, ((*la)?, (*lo)?))))
            .collect(),
        _ => vec![None; candidates.height()],
    };

    let min_distance = distances
        .iter()
        .flatten()
        .copied()
        .fold(None, |m: Option<f64>, d| Some(m.map_or(d, |m| m.min(d))));

    let missing = missing_per_row(candidates);
    (0..candidates.height())
        .filter(|i| min_distance.is_none() || distances[*i] == min_distance)
        .min_by_key(|i| missing[*i])
        .map(|row| Comparable {
            row,
            distance_m: distances[row],
        })
}

/// Sales in the user's area: the postal code in Paris, the department
/// elsewhere
pub fn local_history(history: &DataFrame, zip_code: u32) -> Result<DataFrame> {
    let department = extract_department_code(zip_code);
    let mask = if department == PARIS_DEPARTMENT {
        equals_mask(history, "code_postal", &zip_code.to_string())?
    } else {
        // department codes may be zero-padded ("01")
        text_values(history, "code_departement")?
            .iter()
            .map(|v| v.as_deref().and_then(|s| s.trim().parse::<u32>().ok()) == Some(department))
            .collect()
    };
    filter_rows(history, &mask)
}

/// `{geo_area}-{property_type}.parquet`, lower case
pub fn history_file_name(geo_area: &str, property_type: PropertyType) -> String {
    format!("{}-{}.parquet", geo_area, property_type.as_str()).to_lowercase()
}

/// Historical sales of one area and property type
#[derive(Debug, Clone)]
pub struct TransactionHistory {
    frame: DataFrame,
}

impl TransactionHistory {
    pub fn new(frame: DataFrame) -> Self {
        Self { frame }
    }

    /// Load from a CSV, parquet or `archive.zip:entry` path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(read_table(path)?))
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn len(&self) -> usize {
        self.frame.height()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.height() == 0
    }

    pub fn local(&self, zip_code: u32) -> Result<DataFrame> {
        local_history(&self.frame, zip_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> DataFrame {
        df!(
            "id_mutation" => &["a", "b", "c", "d"],
            "adresse_numero" => &[Some(11.0), Some(3.0), Some(11.0), None],
            "adresse_nom_voie" => &["RUE DES HALLES", "Rue des Halles", "Rue de Rivoli", "Rue de Rivoli"],
            "code_postal" => &[75001.0, 75001.0, 75001.0, 75004.0],
            "code_departement" => &[75.0, 75.0, 75.0, 75.0],
            "latitude" => &[Some(48.8600), Some(48.8605), None, Some(48.85)],
            "longitude" => &[Some(2.3470), Some(2.3480), None, Some(2.35)]
        )
        .unwrap()
    }

    fn request(number: Option<u32>, street: &str, zip: u32) -> PredictionRequest {
        PredictionRequest {
            property_type: PropertyType::Flats,
            street_number: number,
            street_name: street.to_string(),
            zip_code: zip,
            city: "Paris".to_string(),
            num_rooms: 2,
            surface: 30.0,
            field_surface: 0.0,
            dependance: false,
            latitude: None,
            longitude: None,
        }
    }

    fn ids(df: &DataFrame) -> Vec<String> {
        text_values(df, "id_mutation").unwrap().into_iter().flatten().collect()
    }

    #[test]
    fn test_close_properties_cascade() {
        let h = history();
        let exact = return_close_properties(&h, &request(Some(11), "rue des halles", 75001)).unwrap();
        assert_eq!(ids(&exact), vec!["a"]);

        let street = return_close_properties(&h, &request(Some(5), "Rue des, Halles", 75001)).unwrap();
        assert_eq!(ids(&street), vec!["a", "b"]);

        let zip = return_close_properties(&h, &request(None, "Rue du Louvre", 75001)).unwrap();
        assert_eq!(ids(&zip), vec!["a", "b", "c"]);

        assert!(matches!(
            return_close_properties(&h, &request(None, "Rue du Louvre", 75018)),
            Err(PipelineError::NoComparableFound(75018))
        ));
    }

    #[test]
    fn test_find_closest() {
        let h = history();
        let closest = find_closest(&h, Some((48.8605, 2.3480))).unwrap();
        assert_eq!(closest.row, 1);
        assert!(closest.is_same_location());

        // without coordinates the most complete row wins
        let closest = find_closest(&h, None).unwrap();
        assert_eq!(closest.row, 0);
        assert_eq!(closest.distance_m, None);

        assert!(find_closest(&filter_rows(&h, &[false; 4]).unwrap(), None).is_none());
    }

    #[test]
    fn test_history_file_name() {
        assert_eq!(history_file_name("Paris", PropertyType::Flats), "paris-flats.parquet");
    }

    #[test]
    fn test_local_history() {
        let h = history();
        assert_eq!(local_history(&h, 75001).unwrap().height(), 3);
        assert_eq!(local_history(&h, 69001).unwrap().height(), 0);

        let ain = df!(
            "code_departement" => &["01", "1", "10"],
            "code_postal" => &[1000.0, 1090.0, 10000.0]
        )
        .unwrap();
        assert_eq!(local_history(&ain, 1000).unwrap().height(), 2);
    }
}
