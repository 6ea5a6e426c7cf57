//! Engine configuration
//!
//! All tunables live in [`ForecastConfig`], which serializes to JSON so a
//! deployment can ship one file, and can be overridden from the environment.

use crate::error::{ForecastError, Result};
use crate::types::DEFAULT_HORIZONS_MINUTES;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Insulin and carbohydrate decay parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    /// Total insulin action window (minutes)
    pub insulin_duration_min: f64,
    /// Insulin half-life (minutes)
    pub insulin_half_life_min: f64,
    /// Total carbohydrate absorption window (minutes)
    pub carb_duration_min: f64,
    /// Carbohydrate half-life (minutes)
    pub carb_half_life_min: f64,
    /// Glucose rise per gram of carbohydrate (mg/dL)
    pub carb_bg_factor: f64,
    /// Correction target (mg/dL)
    pub target_bg: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            insulin_duration_min: 180.0,
            insulin_half_life_min: 81.0,
            carb_duration_min: 180.0,
            carb_half_life_min: 45.0,
            carb_bg_factor: 4.0,
            target_bg: 100.0,
        }
    }
}

/// Feature-window parameters; must match what the sequence models were trained on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Rolling history retained by the feature buffer (minutes)
    pub history_window_min: u32,
    /// CGM cadence (minutes)
    pub sampling_interval_min: u32,
    /// Time steps fed to the sequence models
    pub seq_len: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            history_window_min: 180,
            sampling_interval_min: 5,
            seq_len: 24,
        }
    }
}

impl FeatureConfig {
    /// Maximum number of glucose samples the buffer keeps
    pub fn max_samples(&self) -> usize {
        (self.history_window_min / self.sampling_interval_min.max(1)) as usize
    }
}

/// Trend extrapolation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    /// Most recent points used for the line fit
    pub history_points: usize,
    /// Forecast offsets (minutes)
    pub horizons_min: [u32; 3],
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            history_points: 6,
            horizons_min: DEFAULT_HORIZONS_MINUTES,
        }
    }
}

/// Insulin sensitivity fallback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensitivityConfig {
    /// Used when the sensitivity model is unavailable or fails (mg/dL per unit)
    pub default_isf: f64,
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        Self { default_isf: 50.0 }
    }
}

/// Glucose alert thresholds (mg/dL)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub critical_low: f64,
    pub low: f64,
    pub high: f64,
    pub critical_high: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            critical_low: 54.0,
            low: 70.0,
            high: 180.0,
            critical_high: 250.0,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub decay: DecayConfig,
    pub features: FeatureConfig,
    pub trend: TrendConfig,
    pub sensitivity: SensitivityConfig,
    pub thresholds: AlertThresholds,
    /// Directory holding trained model artifacts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models_dir: Option<PathBuf>,
}

impl ForecastConfig {
    /// Load configuration from JSON; missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize configuration to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Apply overrides from process environment variables
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str| -> Result<Option<f64>> {
            match lookup(key) {
                Some(raw) => raw.trim().parse::<f64>().map(Some).map_err(|_| {
                    ForecastError::InvalidConfiguration(format!("{key}={raw} is not a number"))
                }),
                None => Ok(None),
            }
        };

        if let Some(v) = number("INSULIN_ACTION_DURATION")? {
            self.decay.insulin_duration_min = v;
        }
        if let Some(v) = number("INSULIN_HALF_LIFE")? {
            self.decay.insulin_half_life_min = v;
        }
        if let Some(v) = number("CARB_ABSORPTION_DURATION")? {
            self.decay.carb_duration_min = v;
        }
        if let Some(v) = number("CARB_HALF_LIFE")? {
            self.decay.carb_half_life_min = v;
        }
        if let Some(v) = number("CARB_BG_FACTOR")? {
            self.decay.carb_bg_factor = v;
        }
        if let Some(v) = number("TARGET_BG")? {
            self.decay.target_bg = v;
        }
        if let Some(v) = number("DEFAULT_ISF")? {
            self.sensitivity.default_isf = v;
        }
        if let Some(dir) = lookup("MODELS_DIR") {
            self.models_dir = Some(PathBuf::from(dir));
        }

        Ok(())
    }

    /// Reject configurations the engine cannot compute with
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("insulin_duration_min", self.decay.insulin_duration_min),
            ("insulin_half_life_min", self.decay.insulin_half_life_min),
            ("carb_duration_min", self.decay.carb_duration_min),
            ("carb_half_life_min", self.decay.carb_half_life_min),
            ("default_isf", self.sensitivity.default_isf),
            ("target_bg", self.decay.target_bg),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(ForecastError::InvalidConfiguration(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }

        if !self.decay.carb_bg_factor.is_finite() || self.decay.carb_bg_factor < 0.0 {
            return Err(ForecastError::InvalidConfiguration(
                "carb_bg_factor must be non-negative".to_string(),
            ));
        }

        let features = &self.features;
        if features.sampling_interval_min == 0 {
            return Err(ForecastError::InvalidConfiguration(
                "sampling_interval_min must be positive".to_string(),
            ));
        }
        if features.seq_len == 0 || features.max_samples() < features.seq_len {
            return Err(ForecastError::InvalidConfiguration(format!(
                "history window of {} samples cannot hold a sequence of {}",
                features.max_samples(),
                features.seq_len
            )));
        }

        if self.trend.history_points < 2 {
            return Err(ForecastError::InvalidConfiguration(
                "trend history_points must be at least 2".to_string(),
            ));
        }

        let t = &self.thresholds;
        if !(t.critical_low < t.low && t.low < t.high && t.high < t.critical_high) {
            return Err(ForecastError::InvalidConfiguration(
                "alert thresholds must be strictly increasing".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = ForecastConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.features.max_samples(), 36);
        assert_eq!(config.decay.insulin_half_life_min, 81.0);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = ForecastConfig::from_json(r#"{"decay": {"target_bg": 110}}"#).unwrap();
        assert_eq!(config.decay.target_bg, 110.0);
        assert_eq!(config.decay.carb_half_life_min, 45.0);
        assert_eq!(config.features, FeatureConfig::default());
    }

    #[test]
    fn test_json_round_trip() {
        let mut config = ForecastConfig::default();
        config.models_dir = Some(PathBuf::from("/opt/models"));
        let loaded = ForecastConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("INSULIN_HALF_LIFE", "75"),
            ("TARGET_BG", "110"),
            ("MODELS_DIR", "/srv/models"),
        ]
        .into_iter()
        .collect();

        let mut config = ForecastConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.decay.insulin_half_life_min, 75.0);
        assert_eq!(config.decay.target_bg, 110.0);
        assert_eq!(config.models_dir, Some(PathBuf::from("/srv/models")));
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = ForecastConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "CARB_BG_FACTOR").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(ForecastError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = ForecastConfig::default();
        config.sensitivity.default_isf = 0.0;
        assert!(config.validate().is_err());

        let mut config = ForecastConfig::default();
        config.features.history_window_min = 60;
        assert!(config.validate().is_err());

        let mut config = ForecastConfig::default();
        config.thresholds.low = 200.0;
        assert!(config.validate().is_err());
    }
}
