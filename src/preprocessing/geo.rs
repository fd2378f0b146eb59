//! Geographic areas, density levels and department lookups

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::data::frame::{filter_rows, has_column, left_join, set_column, text_column, text_values};
use crate::error::{PipelineError, Result};

pub const CITIES: &[&str] = &[
    "Paris",
    "Marseille",
    "Lyon",
    "Toulouse",
    "Nice",
    "Nantes",
    "Montpellier",
    "Bordeaux",
    "Lille",
    "Rennes",
];

/// Cities whose arrondissements carry the city name as density level
pub const CITIES_WITH_ARRONDISSEMENTS: &[&str] = &["Paris", "Marseille", "Lyon"];

pub const URBAN_AREAS: &[&str] = &[
    "Grands centres urbains",
    "Centres urbains intermédiaires",
    "Ceintures urbaines",
];

pub const RURAL_AREAS: &[&str] = &[
    "Petites villes",
    "Bourgs ruraux",
    "Rural à habitat dispersé",
    "Rural à habitat très dispersé",
];

pub const DENSITY_VAR: &str = "degre_densite";

/// Area a model is trained on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoArea {
    City(String),
    UrbanAreas,
    RuralAreas,
}

impl GeoArea {
    pub fn name(&self) -> String {
        match self {
            GeoArea::City(c) => c.clone(),
            GeoArea::UrbanAreas => "urban_areas".to_string(),
            GeoArea::RuralAreas => "rural_areas".to_string(),
        }
    }

    /// Rows of `df` that belong to this area
    pub fn mask(&self, df: &DataFrame) -> Result<Vec<bool>> {
        for required in [DENSITY_VAR, "nom_commune"] {
            if !has_column(df, required) {
                return Err(PipelineError::Schema(required.to_string()));
            }
        }
        let density = text_values(df, DENSITY_VAR)?;
        let communes = text_values(df, "nom_commune")?;

        let mask = density
            .iter()
            .zip(&communes)
            .map(|(d, c)| {
                let d = d.as_deref().unwrap_or("");
                let c = c.as_deref().unwrap_or("");
                match self {
                    GeoArea::City(city) if CITIES_WITH_ARRONDISSEMENTS.contains(&city.as_str()) => {
                        d == city
                    }
                    GeoArea::City(city) => c == city,
                    GeoArea::UrbanAreas => URBAN_AREAS.contains(&d) && !CITIES.contains(&c),
                    GeoArea::RuralAreas => RURAL_AREAS.contains(&d),
                }
            })
            .collect();
        Ok(mask)
    }

    pub fn select(&self, df: &DataFrame) -> Result<DataFrame> {
        filter_rows(df, &self.mask(df)?)
    }
}

impl fmt::Display for GeoArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for GeoArea {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "urban_areas" => return Ok(GeoArea::UrbanAreas),
            "rural_areas" => return Ok(GeoArea::RuralAreas),
            _ => {}
        }
        CITIES
            .iter()
            .find(|c| c.eq_ignore_ascii_case(s))
            .map(|c| GeoArea::City(c.to_string()))
            .ok_or_else(|| PipelineError::Validation(format!("unknown geographic area '{}'", s)))
    }
}

/// Every area with its rows: the ten cities, then urban and rural areas
pub fn split_by_area(df: &DataFrame) -> Result<Vec<(GeoArea, DataFrame)>> {
    let mut areas: Vec<GeoArea> = CITIES.iter().map(|c| GeoArea::City(c.to_string())).collect();
    areas.push(GeoArea::UrbanAreas);
    areas.push(GeoArea::RuralAreas);
    areas
        .into_iter()
        .map(|a| {
            let rows = a.select(df)?;
            Ok((a, rows))
        })
        .collect()
}

/// Department code of a zip code (`75001` -> `75`, `6000` -> `6`)
pub fn extract_department_code(zip_code: u32) -> u32 {
    zip_code / 1_000
}

/// Area covering a zip code when the city is not one of the modeled cities
pub fn find_area(city: &str, zip_code: u32) -> GeoArea {
    match CITIES.iter().find(|c| c.eq_ignore_ascii_case(city.trim())) {
        Some(c) => GeoArea::City(c.to_string()),
        None => {
            let dpt = extract_department_code(zip_code);
            match dpt {
                75 => GeoArea::City("Paris".to_string()),
                13 if city.to_lowercase().starts_with("marseille") => {
                    GeoArea::City("Marseille".to_string())
                }
                69 if city.to_lowercase().starts_with("lyon") => GeoArea::City("Lyon".to_string()),
                _ => GeoArea::UrbanAreas,
            }
        }
    }
}

/// Strip leading zeros from commune codes so `01001` and `1001` join
pub fn recode_commune(code: &str) -> String {
    let trimmed = code.trim().trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

fn recode_key(df: &DataFrame, key: &str) -> Result<DataFrame> {
    let codes = text_values(df, key)?
        .into_iter()
        .map(|k| k.as_deref().map(recode_commune))
        .collect();
    set_column(df.clone(), text_column(key, codes))
}

/// Left join density level and population on `code_commune`
pub fn add_density(transactions: &DataFrame, density: &DataFrame) -> Result<DataFrame> {
    let left = recode_key(transactions, "code_commune")?;
    let right = recode_key(density, "code_commune")?;
    left_join(&left, &right, &["code_commune"], &["code_commune"], "_densite")
}

/// Left join region names on `code_departement`
pub fn add_regions(transactions: &DataFrame, regions: &DataFrame) -> Result<DataFrame> {
    let left = recode_key(transactions, "code_departement")?;
    let right = recode_key(regions, "code_departement")?;
    left_join(&left, &right, &["code_departement"], &["code_departement"], "_region")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DataFrame {
        df!(
            "nom_commune" => &["Paris 15e Arrondissement", "Nantes", "Vertou", "Nantes", "Bourg"],
            "degre_densite" => &[
                "Paris",
                "Grands centres urbains",
                "Ceintures urbaines",
                "Grands centres urbains",
                "Bourgs ruraux",
            ]
        )
        .unwrap()
    }

    #[test]
    fn test_split_by_area() {
        let split = split_by_area(&sample()).unwrap();
        let count = |name: &str| {
            split
                .iter()
                .find(|(a, _)| a.name() == name)
                .map(|(_, t)| t.height())
                .unwrap()
        };
        assert_eq!(count("Paris"), 1);
        assert_eq!(count("Nantes"), 2);
        assert_eq!(count("urban_areas"), 1);
        assert_eq!(count("rural_areas"), 1);
    }

    #[test]
    fn test_area_requires_density() {
        let df = df!("nom_commune" => &["Paris"]).unwrap();
        assert!(matches!(
            GeoArea::UrbanAreas.select(&df),
            Err(PipelineError::Schema(_))
        ));
    }

    #[test]
    fn test_department_and_area() {
        assert_eq!(extract_department_code(75001), 75);
        assert_eq!(extract_department_code(6000), 6);
        assert_eq!(find_area("paris", 75001), GeoArea::City("Paris".to_string()));
        assert_eq!(find_area("Vertou", 44120), GeoArea::UrbanAreas);
        assert_eq!("rural_areas".parse::<GeoArea>().unwrap(), GeoArea::RuralAreas);
    }

    #[test]
    fn test_add_density_recodes_keys() {
        let dvf = df!("code_commune" => &["01001", "75115"]).unwrap();
        let density = df!(
            "code_commune" => &[1001.0, 75115.0],
            "degre_densite" => &["Bourgs ruraux", "Paris"]
        )
        .unwrap();
        let joined = add_density(&dvf, &density).unwrap();
        assert_eq!(
            text_values(&joined, "degre_densite").unwrap(),
            vec![Some("Bourgs ruraux".to_string()), Some("Paris".to_string())]
        );
    }
}
