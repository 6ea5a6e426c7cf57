//! Sequence-model inference
//!
//! One generic [`SequenceModel`] adapter covers both trained networks; they
//! differ only in how the raw network output is turned into a physical value:
//! - Glucose horizons: inverse min-max scaling, then clamped to 40-400 mg/dL
//! - Insulin sensitivity: softplus (never negative), then clamped to 10-150
//!
//! Each model loads independently. A missing or malformed artifact leaves that
//! model unavailable and is logged once; it never fails the process.

use crate::error::{ForecastError, Result};
use crate::features::{verify_columns, FeatureSequence, FEATURE_COUNT};
use crate::model::lstm::LstmRegressor;
use crate::model::scaler::MinMaxScaler;
use crate::types::{clamp_forecast, Horizons};
use log::{info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Lower clamp for predicted sensitivity (mg/dL per unit)
pub const MIN_SENSITIVITY: f64 = 10.0;
/// Upper clamp for predicted sensitivity (mg/dL per unit)
pub const MAX_SENSITIVITY: f64 = 150.0;

pub const GLUCOSE_WEIGHTS_FILE: &str = "bg_predictor.weights.json";
pub const GLUCOSE_FEATURE_SCALER_FILE: &str = "bg_features_scaler.json";
pub const GLUCOSE_TARGET_SCALER_FILE: &str = "bg_targets_scaler.json";
pub const GLUCOSE_FEATURE_LIST_FILE: &str = "bg_feature_list.json";
pub const SENSITIVITY_WEIGHTS_FILE: &str = "isf_net.weights.json";
pub const SENSITIVITY_FEATURE_SCALER_FILE: &str = "isf_features_scaler.json";
pub const SENSITIVITY_FEATURE_LIST_FILE: &str = "isf_feature_list.json";

/// How raw network outputs become model predictions
#[derive(Debug, Clone)]
pub enum OutputTransform {
    /// Undo the target scaling applied at training time
    InverseScale(MinMaxScaler),
    /// `ln(1 + e^x)`, strictly positive
    Softplus,
}

impl OutputTransform {
    fn apply(&self, mut raw: Vec<f64>) -> Result<Vec<f64>> {
        match self {
            OutputTransform::InverseScale(scaler) => {
                scaler.inverse_transform_row(&mut raw)?;
                Ok(raw)
            }
            OutputTransform::Softplus => Ok(raw.into_iter().map(softplus).collect()),
        }
    }
}

fn softplus(x: f64) -> f64 {
    if x > 20.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

/// A trained network with its input and output transforms
#[derive(Debug, Clone)]
pub struct SequenceModel {
    network: LstmRegressor,
    feature_scaler: Option<MinMaxScaler>,
    output: OutputTransform,
}

impl SequenceModel {
    /// Assemble a model, checking that every part agrees on shape
    pub fn new(
        network: LstmRegressor,
        feature_scaler: Option<MinMaxScaler>,
        output: OutputTransform,
    ) -> Result<Self> {
        if network.input_size() != FEATURE_COUNT {
            return Err(ForecastError::ShapeMismatch(format!(
                "network expects {} features per step, engine produces {}",
                network.input_size(),
                FEATURE_COUNT
            )));
        }
        if let Some(scaler) = &feature_scaler {
            if scaler.width() != FEATURE_COUNT {
                return Err(ForecastError::ShapeMismatch(format!(
                    "feature scaler covers {} columns, expected {}",
                    scaler.width(),
                    FEATURE_COUNT
                )));
            }
        }
        if let OutputTransform::InverseScale(scaler) = &output {
            if scaler.width() != network.output_size() {
                return Err(ForecastError::ShapeMismatch(format!(
                    "target scaler covers {} outputs, network emits {}",
                    scaler.width(),
                    network.output_size()
                )));
            }
        }
        Ok(Self {
            network,
            feature_scaler,
            output,
        })
    }

    /// Number of values one prediction yields
    pub fn output_size(&self) -> usize {
        self.network.output_size()
    }

    /// Scale the sequence, run the network and transform its outputs
    pub fn run(&self, sequence: &FeatureSequence) -> Result<Vec<f64>> {
        let mut rows: Vec<Vec<f64>> = sequence.rows().iter().map(|r| r.to_vec()).collect();
        if let Some(scaler) = &self.feature_scaler {
            for row in rows.iter_mut() {
                scaler.transform_row(row)?;
            }
        }
        let raw = self.network.forward(&rows)?;
        self.output.apply(raw)
    }
}

/// Locations of every model artifact
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPaths {
    pub glucose_weights: PathBuf,
    pub glucose_feature_scaler: PathBuf,
    pub glucose_target_scaler: PathBuf,
    pub glucose_features: PathBuf,
    pub sensitivity_weights: PathBuf,
    pub sensitivity_feature_scaler: PathBuf,
    pub sensitivity_features: PathBuf,
}

impl ModelPaths {
    /// Default file names inside one directory
    pub fn from_dir(dir: &Path) -> Self {
        Self {
            glucose_weights: dir.join(GLUCOSE_WEIGHTS_FILE),
            glucose_feature_scaler: dir.join(GLUCOSE_FEATURE_SCALER_FILE),
            glucose_target_scaler: dir.join(GLUCOSE_TARGET_SCALER_FILE),
            glucose_features: dir.join(GLUCOSE_FEATURE_LIST_FILE),
            sensitivity_weights: dir.join(SENSITIVITY_WEIGHTS_FILE),
            sensitivity_feature_scaler: dir.join(SENSITIVITY_FEATURE_SCALER_FILE),
            sensitivity_features: dir.join(SENSITIVITY_FEATURE_LIST_FILE),
        }
    }
}

/// Availability of each model, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelStatus {
    pub glucose_available: bool,
    pub sensitivity_available: bool,
}

/// Glucose-horizon and sensitivity estimators, each optional
#[derive(Debug, Clone)]
pub struct SequenceEstimator {
    glucose: Option<SequenceModel>,
    sensitivity: Option<SequenceModel>,
    default_isf: f64,
}

impl SequenceEstimator {
    /// An estimator with no models; sensitivity always falls back to `default_isf`
    pub fn new(default_isf: f64) -> Self {
        Self {
            glucose: None,
            sensitivity: None,
            default_isf,
        }
    }

    /// Create an estimator and try to load both models
    pub fn load(paths: &ModelPaths, default_isf: f64) -> Self {
        let mut estimator = Self::new(default_isf);
        estimator.load_models(paths);
        estimator
    }

    /// Try to load both models; returns whether at least one is available.
    ///
    /// Failures are logged and leave the affected model unavailable.
    pub fn load_models(&mut self, paths: &ModelPaths) -> bool {
        self.glucose = match load_glucose_model(paths) {
            Ok(model) => {
                info!("glucose model loaded from {}", paths.glucose_weights.display());
                Some(model)
            }
            Err(e) => {
                warn!("glucose model unavailable: {e}");
                None
            }
        };

        self.sensitivity = match load_sensitivity_model(paths) {
            Ok(model) => {
                info!(
                    "sensitivity model loaded from {}",
                    paths.sensitivity_weights.display()
                );
                Some(model)
            }
            Err(e) => {
                warn!(
                    "sensitivity model unavailable, using default {}: {e}",
                    self.default_isf
                );
                None
            }
        };

        self.glucose.is_some() || self.sensitivity.is_some()
    }

    pub fn with_glucose_model(mut self, model: SequenceModel) -> Self {
        self.glucose = Some(model);
        self
    }

    pub fn with_sensitivity_model(mut self, model: SequenceModel) -> Self {
        self.sensitivity = Some(model);
        self
    }

    pub fn glucose_available(&self) -> bool {
        self.glucose.is_some()
    }

    pub fn sensitivity_available(&self) -> bool {
        self.sensitivity.is_some()
    }

    pub fn status(&self) -> ModelStatus {
        ModelStatus {
            glucose_available: self.glucose_available(),
            sensitivity_available: self.sensitivity_available(),
        }
    }

    pub fn default_isf(&self) -> f64 {
        self.default_isf
    }

    /// Predict glucose at the three horizons, clamped to 40-400 mg/dL
    pub fn predict_glucose(&self, sequence: &FeatureSequence) -> Result<Horizons> {
        let model = self
            .glucose
            .as_ref()
            .ok_or_else(|| {
                ForecastError::ModelUnavailable("glucose model not loaded".to_string())
            })?;

        let out = model.run(sequence)?;
        match out.as_slice() {
            [a, b, c, ..] => Ok([clamp_forecast(*a), clamp_forecast(*b), clamp_forecast(*c)]),
            _ => Err(ForecastError::ShapeMismatch(format!(
                "glucose model emitted {} values, expected 3",
                out.len()
            ))),
        }
    }

    /// Predict insulin sensitivity (mg/dL per unit).
    ///
    /// Never fails: without a model, a sequence, or on any inference error the
    /// default is returned. Model output is clamped to 10-150.
    pub fn predict_sensitivity(&self, sequence: Option<&FeatureSequence>) -> f64 {
        let (Some(model), Some(sequence)) = (&self.sensitivity, sequence) else {
            return self.default_isf;
        };

        match model.run(sequence) {
            Ok(out) => match out.first() {
                Some(value) => value.clamp(MIN_SENSITIVITY, MAX_SENSITIVITY),
                None => self.default_isf,
            },
            Err(e) => {
                warn!("sensitivity inference failed, using default: {e}");
                self.default_isf
            }
        }
    }
}

fn require(path: &Path, what: &str) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(ForecastError::ModelUnavailable(format!(
            "{what} not found at {}",
            path.display()
        )))
    }
}

/// Check a feature-list artifact if one was shipped
fn check_feature_list(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let raw = fs::read_to_string(path)?;
    let columns: Vec<String> = serde_json::from_str(&raw)?;
    verify_columns(&columns)
}

fn load_glucose_model(paths: &ModelPaths) -> Result<SequenceModel> {
    require(&paths.glucose_weights, "glucose weights")?;
    require(&paths.glucose_feature_scaler, "glucose feature scaler")?;
    require(&paths.glucose_target_scaler, "glucose target scaler")?;
    check_feature_list(&paths.glucose_features)?;

    let network = LstmRegressor::load(&paths.glucose_weights)?;
    let features = MinMaxScaler::load(&paths.glucose_feature_scaler)?;
    let targets = MinMaxScaler::load(&paths.glucose_target_scaler)?;
    if network.output_size() != 3 {
        return Err(ForecastError::ShapeMismatch(format!(
            "glucose network emits {} values, expected 3",
            network.output_size()
        )));
    }
    SequenceModel::new(network, Some(features), OutputTransform::InverseScale(targets))
}

fn load_sensitivity_model(paths: &ModelPaths) -> Result<SequenceModel> {
    require(&paths.sensitivity_weights, "sensitivity weights")?;
    check_feature_list(&paths.sensitivity_features)?;

    let network = LstmRegressor::load(&paths.sensitivity_weights)?;
    let scaler = if paths.sensitivity_feature_scaler.exists() {
        Some(MinMaxScaler::load(&paths.sensitivity_feature_scaler)?)
    } else {
        warn!("sensitivity feature scaler missing, inputs will not be scaled");
        None
    };
    SequenceModel::new(network, scaler, OutputTransform::Softplus)
}
