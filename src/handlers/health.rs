use actix_web::{web, HttpResponse, Responder};
use std::sync::Arc;
use tracing::warn;

use crate::AppState;
use dvfplus::models::{HealthResponse, ModelInfo};

/// Service status for the model currently served, if any
pub fn health_status(model: Option<ModelInfo>) -> HealthResponse {
    HealthResponse {
        status: if model.is_some() { "ok" } else { "no_model" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model,
    }
}

/// Reports whether a model is loaded and which one
pub async fn health_check(state: web::Data<Arc<AppState>>) -> impl Responder {
    let model = state.predictor.as_ref().and_then(|p| match p.lock() {
        Ok(predictor) => Some(predictor.model_info()),
        Err(_) => {
            warn!("predictor lock poisoned, reporting no model");
            None
        }
    });
    HttpResponse::Ok().json(health_status(model))
}
