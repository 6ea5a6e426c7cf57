//! Gluco CLI - Command-line interface for Gluco Flux
//!
//! Commands:
//! - predict: Forecast glucose at +5/+10/+15 minutes
//! - dose: Compute a correction dose
//! - iob: Report insulin and carbs on board
//! - doctor: Diagnose configuration and model availability

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use env_logger::Builder;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Once;

use gluco_flux::adapters::parse_timestamp;
use gluco_flux::model::ModelPaths;
use gluco_flux::types::ActiveDose;
use gluco_flux::{
    CgmPayloadAdapter, DecayEngine, ForecastConfig, ForecastError, GlucoseForecaster,
    NightscoutAdapter, PredictionRequest, SequenceEstimator, TrendDirection, FLUX_VERSION,
};

static LOGGER: Once = Once::new();

/// Log to stderr at `warn` unless RUST_LOG says otherwise
fn init_logger() {
    LOGGER.call_once_force(|_| {
        let mut builder = Builder::new();
        builder
            .filter_level(LevelFilter::Warn)
            .format_timestamp_millis()
            .parse_default_env();
        let _ = builder.try_init();
    });
}

/// Gluco - Glucose forecasting and insulin/carb decay engine
#[derive(Parser)]
#[command(name = "gluco")]
#[command(version = FLUX_VERSION)]
#[command(about = "Forecast glucose and compute correction doses", long_about = None)]
struct Cli {
    /// Configuration file (JSON); environment overrides still apply
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding trained model artifacts
    #[arg(long, global = true)]
    models: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Forecast glucose at the configured horizons
    Predict {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Pretty-print the result
        #[arg(long)]
        pretty: bool,
    },

    /// Compute a correction dose
    Dose {
        /// Current glucose (mg/dL)
        #[arg(long)]
        current_bg: f64,

        /// Insulin sensitivity (mg/dL per unit)
        #[arg(long)]
        sensitivity: f64,

        /// Target glucose (mg/dL); defaults to the configured target
        #[arg(long)]
        target_bg: Option<f64>,

        /// Insulin on board (units)
        #[arg(long, default_value = "0")]
        iob: f64,

        /// Carbs on board (grams)
        #[arg(long, default_value = "0")]
        cob: f64,

        /// Glucose rise per gram of carbs; defaults to the configured factor
        #[arg(long)]
        carb_factor: Option<f64>,
    },

    /// Report insulin and carbs on board from a treatments file
    Iob {
        /// Nightscout treatments JSON array (use - for stdin)
        #[arg(short, long)]
        treatments: PathBuf,

        /// Reference time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<String>,
    },

    /// Diagnose configuration and model availability
    Doctor {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    init_logger();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), GlucoCliError> {
    let config = load_config(cli.config.as_deref(), cli.models)?;

    match cli.command {
        Commands::Predict { input, pretty } => cmd_predict(config, &input, pretty),
        Commands::Dose {
            current_bg,
            sensitivity,
            target_bg,
            iob,
            cob,
            carb_factor,
        } => cmd_dose(config, current_bg, sensitivity, target_bg, iob, cob, carb_factor),
        Commands::Iob { treatments, at } => cmd_iob(config, &treatments, at.as_deref()),
        Commands::Doctor { json } => cmd_doctor(config, json),
    }
}

fn load_config(
    path: Option<&Path>,
    models: Option<PathBuf>,
) -> Result<ForecastConfig, GlucoCliError> {
    let mut config = match path {
        Some(path) => ForecastConfig::from_json(&fs::read_to_string(path)?)?,
        None => ForecastConfig::default(),
    };
    config.apply_env_overrides()?;
    if models.is_some() {
        config.models_dir = models;
    }
    config.validate()?;
    Ok(config)
}

/// Body of a `predict` request
#[derive(Debug, Deserialize)]
struct PredictInput {
    current_bg: f64,
    /// Trend code; takes precedence over `direction`
    trend: Option<i8>,
    /// Nightscout direction string
    direction: Option<String>,
    iob: Option<f64>,
    /// Nightscout entries array
    #[serde(default)]
    entries: Value,
    /// Nightscout treatments array
    #[serde(default)]
    treatments: Value,
    as_of: Option<String>,
}

fn cmd_predict(config: ForecastConfig, input: &Path, pretty: bool) -> Result<(), GlucoCliError> {
    let body: PredictInput = serde_json::from_str(&read_input(input)?)?;
    let adapter = NightscoutAdapter;

    let history = match &body.entries {
        Value::Null => Vec::new(),
        entries => adapter.parse_entries(&entries.to_string())?,
    };
    let treatments = match &body.treatments {
        Value::Null => Vec::new(),
        treatments => adapter.parse_treatments(&treatments.to_string())?,
    };
    let trend = body
        .trend
        .or_else(|| body.direction.as_deref().map(|d| TrendDirection::parse(d).code()))
        .unwrap_or(0);

    let mut request = PredictionRequest::new(body.current_bg, trend)
        .with_history(history)
        .with_treatments(treatments);
    if let Some(iob) = body.iob {
        request = request.with_iob(iob);
    }
    if let Some(as_of) = body.as_of.as_deref() {
        request = request.at(parse_timestamp(as_of)?);
    }

    let forecaster = GlucoseForecaster::new(config)?;
    let result = forecaster.predict(&request);
    print_json(&result, pretty)
}

fn cmd_dose(
    config: ForecastConfig,
    current_bg: f64,
    sensitivity: f64,
    target_bg: Option<f64>,
    iob: f64,
    cob: f64,
    carb_factor: Option<f64>,
) -> Result<(), GlucoCliError> {
    let correction = decay_engine(&config).dose_correction(
        current_bg,
        target_bg.unwrap_or(config.decay.target_bg),
        sensitivity,
        iob,
        cob,
        carb_factor.unwrap_or(config.decay.carb_bg_factor),
    )?;

    let report = DoseReport {
        formula: correction.formula(),
        correction,
    };
    print_json(&report, true)
}

fn cmd_iob(
    config: ForecastConfig,
    treatments: &Path,
    at: Option<&str>,
) -> Result<(), GlucoCliError> {
    let events = NightscoutAdapter.parse_treatments(&read_input(treatments)?)?;
    let as_of = match at {
        Some(raw) => parse_timestamp(raw)?,
        None => Utc::now(),
    };

    let decay = decay_engine(&config);
    let report = OnBoardReport {
        as_of,
        iob: decay.iob(&events, as_of),
        cob: decay.cob(&events, as_of),
        active_doses: decay.active_doses(&events, as_of),
    };
    print_json(&report, true)
}

fn cmd_doctor(config: ForecastConfig, json: bool) -> Result<(), GlucoCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "flux_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Gluco Flux version {}", FLUX_VERSION),
    });

    checks.push(DoctorCheck {
        name: "config".to_string(),
        status: CheckStatus::Ok,
        message: format!(
            "insulin {}/{} min, carbs {}/{} min, target {} mg/dL, default ISF {}",
            config.decay.insulin_half_life_min,
            config.decay.insulin_duration_min,
            config.decay.carb_half_life_min,
            config.decay.carb_duration_min,
            config.decay.target_bg,
            config.sensitivity.default_isf
        ),
    });

    match &config.models_dir {
        Some(dir) if dir.is_dir() => {
            let estimator = SequenceEstimator::load(
                &ModelPaths::from_dir(dir),
                config.sensitivity.default_isf,
            );
            let status = estimator.status();
            checks.push(model_check(
                "glucose_model",
                status.glucose_available,
                "trend extrapolation only",
            ));
            checks.push(model_check(
                "sensitivity_model",
                status.sensitivity_available,
                "default sensitivity will be used",
            ));
        }
        Some(dir) => checks.push(DoctorCheck {
            name: "models".to_string(),
            status: CheckStatus::Error,
            message: format!("Models directory {} does not exist", dir.display()),
        }),
        None => checks.push(DoctorCheck {
            name: "models".to_string(),
            status: CheckStatus::Warning,
            message: "No models directory configured (use --models or MODELS_DIR)".to_string(),
        }),
    }

    let report = DoctorReport {
        version: FLUX_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Gluco Doctor Report");
        println!("===================");
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(GlucoCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Helper functions

fn decay_engine(config: &ForecastConfig) -> DecayEngine {
    DecayEngine::new(config.decay.clone()).with_low_threshold(config.thresholds.low)
}

fn model_check(name: &str, available: bool, fallback: &str) -> DoctorCheck {
    if available {
        DoctorCheck {
            name: name.to_string(),
            status: CheckStatus::Ok,
            message: "loaded".to_string(),
        }
    } else {
        DoctorCheck {
            name: name.to_string(),
            status: CheckStatus::Warning,
            message: format!("unavailable, {}", fallback),
        }
    }
}

fn read_input(input: &Path) -> Result<String, GlucoCliError> {
    if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(input)?)
    }
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<(), GlucoCliError> {
    let out = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", out);
    Ok(())
}

// Output structures

#[derive(Serialize)]
struct DoseReport {
    #[serde(flatten)]
    correction: gluco_flux::DoseCorrection,
    formula: String,
}

#[derive(Serialize)]
struct OnBoardReport {
    as_of: DateTime<Utc>,
    iob: f64,
    cob: f64,
    active_doses: Vec<ActiveDose>,
}

// Error handling

#[derive(Debug)]
enum GlucoCliError {
    Io(io::Error),
    Forecast(ForecastError),
    Json(serde_json::Error),
    DoctorFailed,
}

impl From<io::Error> for GlucoCliError {
    fn from(e: io::Error) -> Self {
        GlucoCliError::Io(e)
    }
}

impl From<ForecastError> for GlucoCliError {
    fn from(e: ForecastError) -> Self {
        GlucoCliError::Forecast(e)
    }
}

impl From<serde_json::Error> for GlucoCliError {
    fn from(e: serde_json::Error) -> Self {
        GlucoCliError::Json(e)
    }
}

#[derive(Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<GlucoCliError> for CliError {
    fn from(e: GlucoCliError) -> Self {
        match e {
            GlucoCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            GlucoCliError::Forecast(e) => {
                let (code, hint) = match &e {
                    ForecastError::InvalidConfiguration(_) => {
                        ("INVALID_CONFIGURATION", "Check the config file and environment overrides")
                    }
                    ForecastError::InvalidSensitivity { .. } => {
                        ("INVALID_SENSITIVITY", "Sensitivity must be a positive mg/dL per unit")
                    }
                    ForecastError::DateParseError(_) => ("DATE_ERROR", "Use RFC 3339 timestamps"),
                    ForecastError::JsonError(_) | ForecastError::ParseError(_) => {
                        ("PARSE_ERROR", "Ensure input is Nightscout-style JSON")
                    }
                    _ => ("FORECAST_ERROR", "Run 'gluco doctor' for details"),
                };
                CliError {
                    code: code.to_string(),
                    message: e.to_string(),
                    hint: Some(hint.to_string()),
                }
            }
            GlucoCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            GlucoCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more checks failed".to_string(),
                hint: None,
            },
        }
    }
}

#[derive(Serialize)]
struct DoctorReport {
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
