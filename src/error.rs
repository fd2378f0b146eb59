use thiserror::Error;

#[cfg(feature = "api")]
use actix_web::{http::StatusCode, HttpResponse, ResponseError};

#[cfg(feature = "api")]
use crate::models::ErrorResponse;
use crate::models::PredictionRequest;

/// Pipeline error types
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required column is absent from an ingested table
    #[error("Schema error: required column '{0}' is absent")]
    Schema(String),

    /// A column needed by a preparation step is absent
    #[error("Missing column: '{0}'")]
    MissingColumn(String),

    /// Columns of mismatched length or duplicated names
    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Column '{column}' is not {expected}")]
    ColumnType { column: String, expected: &'static str },

    #[error("Invalid range for '{column}': min ({min}) must be lower than max ({max})")]
    InvalidRange { column: String, min: f64, max: f64 },

    #[error("Multiple integers found in '{0}'")]
    MultipleIntegers(String),

    #[error("Invalid threshold: '{0}'")]
    InvalidThreshold(String),

    /// Inference could not find any comparable, even at the postal-code level
    #[error("Area not covered: no comparable property for zip code {0}")]
    NoComparableFound(u32),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Short machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Schema(_) | PipelineError::MissingColumn(_) => "schema_error",
            PipelineError::Shape(_) | PipelineError::ColumnType { .. } => "column_type_error",
            PipelineError::InvalidRange { .. } => "invalid_range",
            PipelineError::MultipleIntegers(_) => "multiple_integers",
            PipelineError::InvalidThreshold(_) => "invalid_threshold",
            PipelineError::NoComparableFound(_) => "area_not_covered",
            PipelineError::Model(_) => "model_error",
            PipelineError::Validation(_) => "validation_error",
            _ => "internal_error",
        }
    }
}

#[cfg(feature = "api")]
impl ResponseError for PipelineError {
    fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::Validation(_)
            | PipelineError::InvalidRange { .. }
            | PipelineError::InvalidThreshold(_) => StatusCode::BAD_REQUEST,
            PipelineError::NoComparableFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
        })
    }
}

/// Validation functions
pub fn validate_surface(surface: f64) -> Result<()> {
    if !surface.is_finite() || surface <= 0.0 {
        return Err(PipelineError::Validation(format!(
            "Living surface must be positive, got {}",
            surface
        )));
    }
    Ok(())
}

pub fn validate_field_surface(surface: f64) -> Result<()> {
    if !surface.is_finite() || surface < 0.0 {
        return Err(PipelineError::Validation(format!(
            "Field surface must be non-negative, got {}",
            surface
        )));
    }
    Ok(())
}

pub fn validate_zip_code(zip_code: u32) -> Result<()> {
    if !(1000..=98999).contains(&zip_code) {
        return Err(PipelineError::Validation(format!(
            "Zip code must have 5 digits, got {}",
            zip_code
        )));
    }
    Ok(())
}

pub fn validate_rooms(num_rooms: u32) -> Result<()> {
    if num_rooms == 0 {
        return Err(PipelineError::Validation(
            "Number of rooms must be at least 1".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_prediction_request(req: &PredictionRequest) -> Result<()> {
    validate_zip_code(req.zip_code)?;
    validate_rooms(req.num_rooms)?;
    validate_surface(req.surface)?;
    validate_field_surface(req.field_surface)?;
    if req.street_name.trim().is_empty() {
        return Err(PipelineError::Validation(
            "Street name must not be empty".to_string(),
        ));
    }
    Ok(())
}
