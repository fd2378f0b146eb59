use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Residential property type a model is trained for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Houses,
    Flats,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::Houses => "houses",
            PropertyType::Flats => "flats",
        }
    }

    /// DVF `code_type_local` of this property type
    pub fn type_code(&self) -> i64 {
        match self {
            PropertyType::Houses => 1,
            PropertyType::Flats => 2,
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropertyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "houses" | "house" | "maison" => Ok(PropertyType::Houses),
            "flats" | "flat" | "appartement" => Ok(PropertyType::Flats),
            other => Err(format!("unknown property type '{}'", other)),
        }
    }
}

/// User-described property to price
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub property_type: PropertyType,
    #[serde(default)]
    pub street_number: Option<u32>,
    pub street_name: String,
    pub zip_code: u32,
    pub city: String,
    pub num_rooms: u32,
    /// Living surface in m²
    pub surface: f64,
    #[serde(default)]
    pub field_surface: f64,
    #[serde(default)]
    pub dependance: bool,
    /// Coordinates, when the caller already geocoded the address
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl PredictionRequest {
    pub fn address(&self) -> String {
        match self.street_number {
            Some(n) => format!("{} {} {} {}", n, self.street_name, self.zip_code, self.city),
            None => format!("{} {} {}", self.street_name, self.zip_code, self.city),
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

/// Comparable historical sale used to fill unknown attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparableSummary {
    pub id_mutation: String,
    pub date_mutation: Option<String>,
    pub valeur_fonciere: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_m: Option<f64>,
}

/// Price estimate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub price: f64,
    /// Mean absolute percentage error of the model on its test set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mape: Option<f64>,
    pub geo_area: String,
    pub property_type: PropertyType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparable: Option<ComparableSummary>,
}

/// Model served by the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub file_name: String,
    pub estimator: String,
    pub geo_area: String,
    pub property_type: PropertyType,
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mape: Option<f64>,
    /// Historical sales available for comparables and imputation
    pub history_size: usize,
}

/// Health check response; `status` is `ok` with a model, `no_model` without
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelInfo>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
