//! DVF+ CLI - Command-line interface for the real-estate pipeline

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use dialoguer::{theme::ColorfulTheme, Input, Select};
use indicatif::{ProgressBar, ProgressStyle};
use polars::prelude::DataFrame;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use dvfplus::data::csv_loader::read_csv_with_separator;
use dvfplus::data::frame::concat_diagonal;
use dvfplus::data::{history_file_name, read_table, write_parquet, TransactionHistory};
use dvfplus::dataset::external::{
    add_distance_to_parks, add_distance_to_transportation, add_public_facilities,
    aggregate_facilities,
};
use dvfplus::dataset::feature_selection::{compute_importances, compute_mutual_info};
use dvfplus::dataset::split::{feature_matrix, feature_names, target_vector};
use dvfplus::dataset::{
    encode_categoricals, merge_sources, modeling_table, prepare_dataset, select_above_threshold,
    summarize_dataset, temporal_train_test_split, PrepareConfig, Threshold, MAX_CATEGORY_LEVELS,
};
use dvfplus::model::{load_model, save_model, LinearRegressor, ModelBundle, ModelParams, Regressor};
use dvfplus::models::{PredictionRequest, PropertyType};
use dvfplus::predictor::PricePredictor;
use dvfplus::preprocessing::bnb::{finalize, make_dataset};
use dvfplus::preprocessing::dvf::{build_sales, from_frame, load_zip_csv, to_frame};
use dvfplus::preprocessing::geo::add_density;
use dvfplus::preprocessing::{BuildingSource, DropComplexDuplicates, GeoArea};

/// Default data directory (relative to project root)
const DEFAULT_DATA_DIR: &str = "data/output";
const DEFAULT_MODEL_DIR: &str = "models";
/// External layers are semicolon-separated open-data exports
const LAYER_SEPARATOR: u8 = b';';

#[derive(Parser)]
#[command(name = "dvfplus")]
#[command(author, version, about = "DVF+ real-estate price pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the processed data directory
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Path to the model directory
    #[arg(long, default_value = DEFAULT_MODEL_DIR)]
    model_dir: PathBuf,

    /// Log debug messages
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Clean raw DVF transactions into one file per property type
    Clean {
        /// Zip archive holding dvf/{year}.csv files
        #[arg(long)]
        dvf_zip: PathBuf,

        /// Years to load
        #[arg(long, num_args = 1.., default_values_t = vec![2021, 2022, 2023])]
        years: Vec<i32>,

        /// Commune density grid (CSV with code_commune and degre_densite)
        #[arg(long)]
        density: Option<PathBuf>,
    },

    /// Merge and clean the BDNB building sources
    Buildings {
        /// Directory holding one CSV per building source
        #[arg(long)]
        root: PathBuf,

        /// Parquet cache of the merged sources
        #[arg(long)]
        cache: Option<PathBuf>,
    },

    /// Join transactions, buildings and external layers for one area
    Build {
        #[arg(short, long)]
        area: GeoArea,

        #[arg(short = 't', long, default_value = "flats")]
        property_type: PropertyType,

        /// Public transport stations (CSV with a "Geo Point" column)
        #[arg(long)]
        stations: Option<PathBuf>,

        /// Green spaces (CSV with a "Geo Point" column)
        #[arg(long)]
        parks: Option<PathBuf>,

        /// Permanent facility database (BPE) at IRIS level
        #[arg(long)]
        bpe: Option<PathBuf>,
    },

    /// Describe the sales of one area
    Summary {
        #[arg(short, long)]
        area: GeoArea,

        #[arg(short = 't', long, default_value = "flats")]
        property_type: PropertyType,
    },

    /// Fit a linear model and save it with its preparation config
    Train {
        #[arg(short, long)]
        area: GeoArea,

        #[arg(short = 't', long, default_value = "flats")]
        property_type: PropertyType,

        /// Preparation config (JSON); defaults apply otherwise
        #[arg(long)]
        config: Option<PathBuf>,

        /// Share of the earliest sales used for training
        #[arg(long, default_value = "0.8")]
        train_prop: f64,

        #[arg(long, default_value = "1")]
        model_version: u32,
    },

    /// Score features and list those above a threshold
    Select {
        #[arg(short, long)]
        area: GeoArea,

        #[arg(short = 't', long, default_value = "flats")]
        property_type: PropertyType,

        #[arg(long)]
        config: Option<PathBuf>,

        /// Scoring: "mi" (mutual information) or "importance"
        #[arg(long, default_value = "mi")]
        method: String,

        /// "mean", a percentile such as "75%", or a value
        #[arg(long, default_value = "mean")]
        threshold: Threshold,

        /// Neighbors of the mutual information estimator
        #[arg(long, default_value = "3")]
        neighbors: usize,
    },

    /// Estimate the price of a property
    Predict {
        #[arg(short, long)]
        area: GeoArea,

        #[arg(short = 't', long, default_value = "flats")]
        property_type: PropertyType,

        #[arg(long, default_value = "linearregression")]
        estimator: String,

        #[arg(long, default_value = "1")]
        model_version: u32,

        /// Prompt for the property description
        #[arg(short, long)]
        interactive: bool,

        #[arg(long)]
        street_number: Option<u32>,

        #[arg(long)]
        street_name: Option<String>,

        #[arg(long)]
        zip_code: Option<u32>,

        #[arg(long)]
        city: Option<String>,

        #[arg(long)]
        rooms: Option<u32>,

        /// Living surface in m²
        #[arg(long)]
        surface: Option<f64>,

        /// Land surface in m²
        #[arg(long, default_value = "0")]
        field_surface: f64,

        /// The sale includes an outbuilding
        #[arg(long)]
        dependance: bool,

        #[arg(long)]
        latitude: Option<f64>,

        #[arg(long)]
        longitude: Option<f64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    println!("{}", format!("DVF+ CLI v{}", env!("CARGO_PKG_VERSION")).cyan().bold());
    println!();

    let Some(command) = cli.command else {
        println!("Use --help for usage information.");
        return Ok(());
    };

    match command {
        Commands::Clean {
            dvf_zip,
            years,
            density,
        } => run_clean(&cli.data_dir, &dvf_zip, &years, density.as_deref())?,
        Commands::Buildings { root, cache } => {
            let cache = cache.unwrap_or_else(|| cli.data_dir.join("bnb-cache.parquet"));
            run_buildings(&cli.data_dir, &root, &cache)?;
        }
        Commands::Build {
            area,
            property_type,
            stations,
            parks,
            bpe,
        } => run_build(
            &cli.data_dir,
            &area,
            property_type,
            stations.as_deref(),
            parks.as_deref(),
            bpe.as_deref(),
        )?,
        Commands::Summary {
            area,
            property_type,
        } => run_summary(&cli.data_dir, &area, property_type)?,
        Commands::Train {
            area,
            property_type,
            config,
            train_prop,
            model_version,
        } => run_train(
            &cli.data_dir,
            &cli.model_dir,
            &area,
            property_type,
            config.as_deref(),
            train_prop,
            model_version,
        )?,
        Commands::Select {
            area,
            property_type,
            config,
            method,
            threshold,
            neighbors,
        } => run_select(
            &cli.data_dir,
            &area,
            property_type,
            config.as_deref(),
            &method,
            &threshold,
            neighbors,
        )?,
        Commands::Predict {
            area,
            property_type,
            estimator,
            model_version,
            interactive,
            street_number,
            street_name,
            zip_code,
            city,
            rooms,
            surface,
            field_surface,
            dependance,
            latitude,
            longitude,
        } => {
            let request = if interactive {
                prompt_request(property_type)?
            } else {
                PredictionRequest {
                    property_type,
                    street_number,
                    street_name: street_name.context("--street-name is required")?,
                    zip_code: zip_code.context("--zip-code is required")?,
                    city: city.context("--city is required")?,
                    num_rooms: rooms.context("--rooms is required")?,
                    surface: surface.context("--surface is required")?,
                    field_surface,
                    dependance,
                    latitude,
                    longitude,
                }
            };
            run_predict(&cli.data_dir, &cli.model_dir, &area, &estimator, model_version, &request)?;
        }
    }

    Ok(())
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(message.to_string());
    Ok(pb)
}

fn load_config(path: Option<&Path>) -> Result<PrepareConfig> {
    match path {
        Some(p) => PrepareConfig::from_json_file(p)
            .with_context(|| format!("Failed to load config from {:?}", p)),
        None => Ok(PrepareConfig::default()),
    }
}

fn load_history(
    data_dir: &Path,
    area: &GeoArea,
    property_type: PropertyType,
) -> Result<DataFrame> {
    let path = data_dir.join(history_file_name(&area.name(), property_type));
    read_table(&path).with_context(|| format!("Failed to load sales from {:?}", path))
}

/// Prepared, encoded frame restricted to date, features and target
fn modeling_data(history: &DataFrame, config: &PrepareConfig) -> Result<DataFrame> {
    let dataset = prepare_dataset(history, config)?;
    let (dataset, _) = encode_categoricals(dataset, MAX_CATEGORY_LEVELS, true)?;
    Ok(modeling_table(
        dataset.frame(),
        config.target.column(),
        &config.date_var,
    )?)
}

fn run_clean(data_dir: &Path, dvf_zip: &Path, years: &[i32], density: Option<&Path>) -> Result<()> {
    let pb = spinner("Loading DVF archive...")?;
    let mut yearly = Vec::with_capacity(years.len());
    for year in years {
        pb.set_message(format!("Loading {}...", year));
        let df = load_zip_csv(dvf_zip, *year)
            .with_context(|| format!("Failed to load year {} from {:?}", year, dvf_zip))?;
        yearly.push(df);
    }
    if yearly.is_empty() {
        bail!("no year to load");
    }
    let raw = concat_diagonal(yearly)?;

    pb.set_message("Cleaning transactions...");
    let sales = build_sales(from_frame(&raw)?, &DropComplexDuplicates);
    let density = density.map(read_table).transpose()?;
    pb.finish_and_clear();

    std::fs::create_dir_all(data_dir)?;
    for (property_type, records) in [
        (PropertyType::Houses, &sales.houses),
        (PropertyType::Flats, &sales.flats),
    ] {
        let mut df = to_frame(records)?;
        if let Some(d) = &density {
            df = add_density(&df, d)?;
        }
        let path = data_dir.join(format!("dvf-{}.parquet", property_type));
        write_parquet(&df, &path)?;
        println!(
            "{} {} {} sales -> {:?}",
            "✓".green(),
            df.height(),
            property_type,
            path
        );
    }
    Ok(())
}

fn run_buildings(data_dir: &Path, root: &Path, cache: &Path) -> Result<()> {
    let pb = spinner("Merging building sources...")?;
    let merged = make_dataset(root, &BuildingSource::ALL, cache)?;
    pb.set_message("Expanding list columns and deduplicating parcels...");
    let buildings = finalize(&merged)?;
    pb.finish_and_clear();

    let path = data_dir.join("bnb.parquet");
    write_parquet(&buildings, &path)?;
    println!(
        "{} {} parcels x {} columns -> {:?}",
        "✓".green(),
        buildings.height(),
        buildings.width(),
        path
    );
    Ok(())
}

fn run_build(
    data_dir: &Path,
    area: &GeoArea,
    property_type: PropertyType,
    stations: Option<&Path>,
    parks: Option<&Path>,
    bpe: Option<&Path>,
) -> Result<()> {
    let pb = spinner("Loading transactions...")?;
    let sales_path = data_dir.join(format!("dvf-{}.parquet", property_type));
    let sales = read_table(&sales_path)
        .with_context(|| format!("Failed to load {:?}, run `clean` first", sales_path))?;
    let transactions = area.select(&sales)?;

    let buildings_path = data_dir.join("bnb.parquet");
    let buildings = if buildings_path.exists() {
        Some(read_table(&buildings_path)?)
    } else {
        None
    };

    let mut layers = Vec::new();
    if let Some(path) = stations {
        pb.set_message("Computing distance to public transport...");
        let stations = read_csv_with_separator(path, LAYER_SEPARATOR)?;
        layers.push(add_distance_to_transportation(&transactions, &stations)?);
    }
    if let Some(path) = parks {
        pb.set_message("Computing distance to green spaces...");
        let parks = read_csv_with_separator(path, LAYER_SEPARATOR)?;
        layers.push(add_distance_to_parks(&transactions, &parks)?);
    }

    pb.set_message("Merging sources...");
    let mut merged = merge_sources(&transactions, buildings.as_ref(), &layers)?;
    if let Some(path) = bpe {
        pb.set_message("Counting public facilities...");
        let facilities = aggregate_facilities(&read_csv_with_separator(path, LAYER_SEPARATOR)?)?;
        merged = add_public_facilities(&merged, &facilities)?;
    }
    pb.finish_and_clear();

    let path = data_dir.join(history_file_name(&area.name(), property_type));
    write_parquet(&merged, &path)?;
    println!(
        "{} {} {} sales in {} -> {:?}",
        "✓".green(),
        merged.height(),
        property_type,
        area,
        path
    );
    Ok(())
}

fn run_summary(data_dir: &Path, area: &GeoArea, property_type: PropertyType) -> Result<()> {
    let history = load_history(data_dir, area, property_type)?;
    let summary = summarize_dataset(&history)?;
    println!(
        "{}",
        format!("Sales of {} in {}", property_type, area).yellow().bold()
    );
    println!("{}", summary);
    Ok(())
}

fn run_train(
    data_dir: &Path,
    model_dir: &Path,
    area: &GeoArea,
    property_type: PropertyType,
    config_path: Option<&Path>,
    train_prop: f64,
    version: u32,
) -> Result<()> {
    let config = load_config(config_path)?;
    let history = load_history(data_dir, area, property_type)?;

    let pb = spinner("Preparing dataset...")?;
    let modeling = modeling_data(&history, &config)?;
    let split = temporal_train_test_split(&modeling, &config.date_var, train_prop)?;
    let target = config.target.column();
    let names = feature_names(&split.train, target);

    pb.set_message("Fitting linear model...");
    let mut model = LinearRegressor::new();
    model.fit(
        &feature_matrix(&split.train, &names)?,
        &target_vector(&split.train, target)?,
    )?;
    let metrics = model.score(
        &feature_matrix(&split.test, &names)?,
        &target_vector(&split.test, target)?,
        config.target.is_log(),
    )?;
    pb.finish_and_clear();

    println!(
        "{} {} training rows, {} test rows, {} features",
        "Trained".green(),
        split.train.height(),
        split.test.height(),
        names.len()
    );
    println!("{}", "Test metrics:".yellow().bold());
    println!("{}", metrics);

    let bundle = ModelBundle {
        estimator: model.name().to_string(),
        geo_area: area.name(),
        property_type,
        version,
        feature_names: names,
        metrics: Some(metrics),
        config,
        model: ModelParams::Linear(model),
    };
    let path = save_model(model_dir, &bundle)?;
    println!("{} saved to {:?}", "✓".green(), path);
    Ok(())
}

fn run_select(
    data_dir: &Path,
    area: &GeoArea,
    property_type: PropertyType,
    config_path: Option<&Path>,
    method: &str,
    threshold: &Threshold,
    neighbors: usize,
) -> Result<()> {
    let config = load_config(config_path)?;
    let history = load_history(data_dir, area, property_type)?;

    let pb = spinner("Preparing dataset...")?;
    let modeling = modeling_data(&history, &config)?;
    let split = temporal_train_test_split(&modeling, &config.date_var, 1.0)?;
    let target = config.target.column();
    let names = feature_names(&split.train, target);
    let x = feature_matrix(&split.train, &names)?;
    let y = target_vector(&split.train, target)?;

    pb.set_message(format!("Scoring {} features...", names.len()));
    let scores = match method {
        "mi" => compute_mutual_info(&x, &y, &names, neighbors)?,
        "importance" => compute_importances(&x, &y, &names, &mut LinearRegressor::new())?,
        other => bail!("unknown scoring method '{}', expected mi or importance", other),
    };
    pb.finish_and_clear();

    let selected = select_above_threshold(&scores, threshold);
    println!("{}", format!("Feature scores ({}):", method).yellow().bold());
    println!("{:<45} {:>10}", "Feature", "Score");
    println!("{}", "-".repeat(56));
    for (name, score) in &scores {
        let line = format!("{:<45} {:>10.4}", name, score);
        if selected.contains(name) {
            println!("{}", line.green());
        } else {
            println!("{}", line.dimmed());
        }
    }
    println!();
    println!(
        "{} {} of {} features above {}",
        "→".green(),
        selected.len(),
        scores.len(),
        threshold
    );
    Ok(())
}

fn run_predict(
    data_dir: &Path,
    model_dir: &Path,
    area: &GeoArea,
    estimator: &str,
    version: u32,
    request: &PredictionRequest,
) -> Result<()> {
    let pb = spinner("Loading model and history...")?;
    let bundle = load_model(model_dir, estimator, &area.name(), request.property_type, version)?;
    let history_path = data_dir.join(history_file_name(&area.name(), request.property_type));
    let history = TransactionHistory::load(&history_path)
        .with_context(|| format!("Failed to load sales from {:?}", history_path))?;
    let mut predictor = PricePredictor::from_bundle(bundle, model_dir, history)?;

    pb.set_message("Estimating...");
    let response = predictor.predict(request)?;
    pb.finish_and_clear();

    println!("{}", request.address().yellow().bold());
    println!(
        "{} {} m², {} rooms",
        request.property_type, request.surface, request.num_rooms
    );
    println!();
    println!(
        "{} {} €",
        "Estimated price:".green().bold(),
        format!("{:.0}", response.price).bold()
    );
    if let Some(mape) = response.mape {
        println!("{}", format!("(typical error: ±{:.1}%)", mape * 100.0).dimmed());
    }
    if let Some(c) = &response.comparable {
        let price = c
            .valeur_fonciere
            .map(|p| format!("{:.0} €", p))
            .unwrap_or_else(|| "-".to_string());
        let distance = c
            .distance_m
            .map(|d| format!(", {:.0} m away", d))
            .unwrap_or_default();
        println!(
            "Closest comparable: {} ({}, {}{})",
            c.id_mutation,
            c.date_mutation.as_deref().unwrap_or("-"),
            price,
            distance
        );
    }
    Ok(())
}

/// Interactive property description
fn prompt_request(default_type: PropertyType) -> Result<PredictionRequest> {
    let theme = ColorfulTheme::default();

    let types = [PropertyType::Flats, PropertyType::Houses];
    let property_type = types[Select::with_theme(&theme)
        .with_prompt("Property type")
        .items(&["Flat", "House"])
        .default(if default_type == PropertyType::Houses { 1 } else { 0 })
        .interact()?];

    let street_number: String = Input::with_theme(&theme)
        .with_prompt("Street number (empty if none)")
        .allow_empty(true)
        .interact_text()?;
    let street_number = if street_number.trim().is_empty() {
        None
    } else {
        Some(street_number.trim().parse().context("invalid street number")?)
    };

    let street_name: String = Input::with_theme(&theme)
        .with_prompt("Street name")
        .interact_text()?;
    let zip_code: u32 = Input::with_theme(&theme)
        .with_prompt("Zip code")
        .interact_text()?;
    let city: String = Input::with_theme(&theme)
        .with_prompt("City")
        .interact_text()?;
    let num_rooms: u32 = Input::with_theme(&theme)
        .with_prompt("Number of rooms")
        .interact_text()?;
    let surface: f64 = Input::with_theme(&theme)
        .with_prompt("Living surface (m²)")
        .interact_text()?;
    let field_surface: f64 = if property_type == PropertyType::Houses {
        Input::with_theme(&theme)
            .with_prompt("Land surface (m²)")
            .default(0.0)
            .interact_text()?
    } else {
        0.0
    };
    let dependance = Select::with_theme(&theme)
        .with_prompt("Outbuilding included?")
        .items(&["No", "Yes"])
        .default(0)
        .interact()?
        == 1;

    Ok(PredictionRequest {
        property_type,
        street_number,
        street_name,
        zip_code,
        city,
        num_rooms,
        surface,
        field_surface,
        dependance,
        latitude: None,
        longitude: None,
    })
}
