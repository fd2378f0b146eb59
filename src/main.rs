use actix_web::{middleware, web, App, HttpServer};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod handlers;

use dvfplus::data::{history_file_name, TransactionHistory};
use dvfplus::geocoder::{AddressBook, GeocoderConfig, RetryingGeocoder};
use dvfplus::model::load_model;
use dvfplus::models::PropertyType;
use dvfplus::predictor::PricePredictor;
use handlers::{health, predict};

/// Application state shared across handlers
pub struct AppState {
    pub predictor: Option<Mutex<PricePredictor>>,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Model bundle plus the history file of its area and property type
fn load_predictor(model_dir: &Path, data_dir: &Path) -> dvfplus::Result<PricePredictor> {
    let estimator = env_or("ESTIMATOR", "linearregression");
    let geo_area = env_or("GEO_AREA", "paris");
    let property_type: PropertyType = env_or("PROPERTY_TYPE", "flats")
        .parse()
        .map_err(dvfplus::PipelineError::Validation)?;
    let version: u32 = env_or("MODEL_VERSION", "1")
        .parse()
        .map_err(|e| dvfplus::PipelineError::Validation(format!("MODEL_VERSION: {}", e)))?;

    let bundle = load_model(model_dir, &estimator, &geo_area, property_type, version)?;
    let history_path = data_dir.join(history_file_name(&geo_area, property_type));
    info!("Loading transaction history from {:?}", history_path);
    let history = TransactionHistory::load(&history_path)?;
    info!("{} historical sales", history.len());

    let mut predictor = PricePredictor::from_bundle(bundle, model_dir, history)?;
    if let Ok(path) = std::env::var("GEOCODE_FILE") {
        let book = AddressBook::load(&path)?;
        info!("Loaded {} geocoded addresses from {}", book.len(), path);
        predictor =
            predictor.with_geocoder(Box::new(RetryingGeocoder::new(book, GeocoderConfig::default())));
    }
    Ok(predictor)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    let host = env_or("HOST", "127.0.0.1");
    let port = env_or("PORT", "8080");
    let addr = format!("{}:{}", host, port);

    let model_dir = std::env::var("MODEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("models"));
    let data_dir = std::env::var("DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/output"));

    info!("Loading model from {:?}", model_dir);

    let predictor = match load_predictor(&model_dir, &data_dir) {
        Ok(p) => {
            info!("Model {} loaded successfully", p.bundle().file_name());
            Some(Mutex::new(p))
        }
        Err(e) => {
            warn!("Failed to load model: {}. /predict will answer with an error.", e);
            None
        }
    };

    let app_state = Arc::new(AppState { predictor });

    info!("Starting DVF+ API server at http://{}", addr);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(middleware::Logger::default())
            .route("/health", web::get().to(health::health_check))
            .route("/predict", web::post().to(predict::predict_price))
    })
    .bind(&addr)?
    .run()
    .await
}
