use actix_web::{web, HttpResponse};
use std::sync::Arc;

use crate::AppState;
use dvfplus::error::{validate_prediction_request, PipelineError};
use dvfplus::models::PredictionRequest;

/// Estimate the price of a described property
pub async fn predict_price(
    state: web::Data<Arc<AppState>>,
    req: web::Json<PredictionRequest>,
) -> Result<HttpResponse, PipelineError> {
    validate_prediction_request(&req)?;

    let predictor_mutex = state
        .predictor
        .as_ref()
        .ok_or_else(|| PipelineError::Model("no model loaded".to_string()))?;
    let mut predictor = predictor_mutex
        .lock()
        .map_err(|_| PipelineError::Model("predictor lock poisoned".to_string()))?;

    let response = predictor.predict(&req)?;
    Ok(HttpResponse::Ok().json(response))
}
