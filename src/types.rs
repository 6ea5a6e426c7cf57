//! Core types for the Gluco Flux engine
//!
//! This module defines the data structures that flow between the components:
//! validated glucose samples and treatment events on the way in, prediction and
//! dose-advice results on the way out.

use crate::config::AlertThresholds;
use crate::error::{ForecastError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lowest glucose value a CGM sample may carry (mg/dL)
pub const MIN_SAMPLE_MG_DL: i32 = 20;
/// Highest glucose value a CGM sample may carry (mg/dL)
pub const MAX_SAMPLE_MG_DL: i32 = 600;

/// Lower clamp for every glucose forecast (mg/dL)
pub const FORECAST_FLOOR_MG_DL: f64 = 40.0;
/// Upper clamp for every glucose forecast (mg/dL)
pub const FORECAST_CEILING_MG_DL: f64 = 400.0;

/// Forecast offsets in minutes
pub const DEFAULT_HORIZONS_MINUTES: [u32; 3] = [5, 10, 15];

/// One glucose value per forecast horizon, ordered like the horizons
pub type Horizons = [f64; 3];

/// Clamp a forecast into the physiologically plausible band
pub fn clamp_forecast(value: f64) -> f64 {
    value.clamp(FORECAST_FLOOR_MG_DL, FORECAST_CEILING_MG_DL)
}

/// CGM trend arrow, as reported by Nightscout-compatible sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    DoubleDown,
    SingleDown,
    FortyFiveDown,
    Flat,
    FortyFiveUp,
    SingleUp,
    DoubleUp,
    NotComputable,
    RateOutOfRange,
}

impl TrendDirection {
    /// Parse a direction string; unknown strings are treated as flat
    pub fn parse(direction: &str) -> Self {
        match direction {
            "DoubleDown" => TrendDirection::DoubleDown,
            "SingleDown" => TrendDirection::SingleDown,
            "FortyFiveDown" => TrendDirection::FortyFiveDown,
            "FortyFiveUp" => TrendDirection::FortyFiveUp,
            "SingleUp" => TrendDirection::SingleUp,
            "DoubleUp" => TrendDirection::DoubleUp,
            "NotComputable" => TrendDirection::NotComputable,
            "RateOutOfRange" => TrendDirection::RateOutOfRange,
            _ => TrendDirection::Flat,
        }
    }

    /// Discrete trend code (-3 rapid fall .. +3 rapid rise)
    pub fn code(&self) -> i8 {
        match self {
            TrendDirection::DoubleDown => -3,
            TrendDirection::SingleDown => -2,
            TrendDirection::FortyFiveDown => -1,
            TrendDirection::FortyFiveUp => 1,
            TrendDirection::SingleUp => 2,
            TrendDirection::DoubleUp => 3,
            TrendDirection::Flat
            | TrendDirection::NotComputable
            | TrendDirection::RateOutOfRange => 0,
        }
    }

    /// Direction for a trend code; codes outside -3..=3 are not computable
    pub fn from_code(code: i8) -> Self {
        match code {
            -3 => TrendDirection::DoubleDown,
            -2 => TrendDirection::SingleDown,
            -1 => TrendDirection::FortyFiveDown,
            0 => TrendDirection::Flat,
            1 => TrendDirection::FortyFiveUp,
            2 => TrendDirection::SingleUp,
            3 => TrendDirection::DoubleUp,
            _ => TrendDirection::NotComputable,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::DoubleDown => "DoubleDown",
            TrendDirection::SingleDown => "SingleDown",
            TrendDirection::FortyFiveDown => "FortyFiveDown",
            TrendDirection::Flat => "Flat",
            TrendDirection::FortyFiveUp => "FortyFiveUp",
            TrendDirection::SingleUp => "SingleUp",
            TrendDirection::DoubleUp => "DoubleUp",
            TrendDirection::NotComputable => "NotComputable",
            TrendDirection::RateOutOfRange => "RateOutOfRange",
        }
    }
}

/// A single CGM reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlucoseSample {
    /// Reading timestamp (UTC)
    pub timestamp: DateTime<Utc>,
    /// Glucose value (mg/dL, 20-600)
    pub value: i32,
    /// Trend code (-3..=3)
    pub trend: i8,
}

impl GlucoseSample {
    /// Create a validated sample
    pub fn new(timestamp: DateTime<Utc>, value: i32, trend: i8) -> Result<Self> {
        let sample = Self {
            timestamp,
            value,
            trend,
        };
        sample.validate()?;
        Ok(sample)
    }

    /// Check value and trend ranges
    pub fn validate(&self) -> Result<()> {
        if !(MIN_SAMPLE_MG_DL..=MAX_SAMPLE_MG_DL).contains(&self.value) {
            return Err(ForecastError::InvalidSample(format!(
                "value {} outside {}-{} mg/dL",
                self.value, MIN_SAMPLE_MG_DL, MAX_SAMPLE_MG_DL
            )));
        }
        if !(-3..=3).contains(&self.trend) {
            return Err(ForecastError::InvalidSample(format!(
                "trend code {} outside -3..=3",
                self.trend
            )));
        }
        Ok(())
    }

    pub fn direction(&self) -> TrendDirection {
        TrendDirection::from_code(self.trend)
    }
}

/// An insulin and/or carbohydrate treatment
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TreatmentEvent {
    /// Treatment timestamp (UTC)
    pub timestamp: DateTime<Utc>,
    /// Insulin delivered (units)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_units: Option<f64>,
    /// Carbohydrate eaten (grams)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carb_grams: Option<f64>,
    /// Protein eaten (grams)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protein_grams: Option<f64>,
    /// Fat eaten (grams)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fat_grams: Option<f64>,
}

impl TreatmentEvent {
    /// An insulin bolus
    pub fn insulin(timestamp: DateTime<Utc>, units: f64) -> Self {
        Self {
            timestamp,
            insulin_units: Some(units),
            ..Default::default()
        }
    }

    /// A carbohydrate entry
    pub fn carbs(timestamp: DateTime<Utc>, grams: f64) -> Self {
        Self {
            timestamp,
            carb_grams: Some(grams),
            ..Default::default()
        }
    }

    /// Attach protein and fat to a meal entry
    pub fn with_macros(mut self, protein_grams: f64, fat_grams: f64) -> Self {
        self.protein_grams = Some(protein_grams);
        self.fat_grams = Some(fat_grams);
        self
    }

    /// Attach a bolus to a meal entry
    pub fn with_insulin(mut self, units: f64) -> Self {
        self.insulin_units = Some(units);
        self
    }

    /// Check that every present amount is finite and non-negative
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("insulin_units", self.insulin_units),
            ("carb_grams", self.carb_grams),
            ("protein_grams", self.protein_grams),
            ("fat_grams", self.fat_grams),
        ];
        for (name, value) in fields {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(ForecastError::InvalidTreatment(format!(
                        "{name} must be a non-negative number, got {v}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Insulin units, zero when absent
    pub fn insulin_amount(&self) -> f64 {
        self.insulin_units.unwrap_or(0.0)
    }

    /// Carb grams, zero when absent
    pub fn carb_amount(&self) -> f64 {
        self.carb_grams.unwrap_or(0.0)
    }

    pub fn protein_amount(&self) -> f64 {
        self.protein_grams.unwrap_or(0.0)
    }

    pub fn fat_amount(&self) -> f64 {
        self.fat_grams.unwrap_or(0.0)
    }

    pub fn has_insulin(&self) -> bool {
        self.insulin_amount() > 0.0
    }

    pub fn has_carbs(&self) -> bool {
        self.carb_amount() > 0.0
    }
}

/// Glucose range classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlucoseRange {
    CriticalLow,
    Low,
    InRange,
    High,
    CriticalHigh,
}

impl GlucoseRange {
    /// Classify a glucose value against alert thresholds
    pub fn classify(value: f64, thresholds: &AlertThresholds) -> Self {
        if value < thresholds.critical_low {
            GlucoseRange::CriticalLow
        } else if value < thresholds.low {
            GlucoseRange::Low
        } else if value <= thresholds.high {
            GlucoseRange::InRange
        } else if value <= thresholds.critical_high {
            GlucoseRange::High
        } else {
            GlucoseRange::CriticalHigh
        }
    }
}

/// Strategy that produced a glucose forecast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionMethod {
    Linear,
    Sequence,
}

impl PredictionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionMethod::Linear => "linear",
            PredictionMethod::Sequence => "sequence",
        }
    }
}

/// Unified prediction for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    /// Trend-extrapolation forecast, always present
    pub linear: Horizons,
    /// Sequence-model forecast, present only when that path succeeded
    pub sequence: Option<Horizons>,
    /// Forecast offsets in minutes
    pub horizons_minutes: [u32; 3],
    /// Reference time of the prediction
    pub timestamp: DateTime<Utc>,
    pub current_bg: f64,
    pub trend: i8,
    /// Insulin sensitivity (mg/dL per unit), predicted or default
    pub sensitivity_factor: f64,
    /// Which strategy produced the reported forecast
    pub method: PredictionMethod,
    /// Range of the furthest-horizon forecast
    pub predicted_range: GlucoseRange,
}

impl PredictionResult {
    /// The forecast produced by the reported method
    pub fn forecast(&self) -> &Horizons {
        match (self.method, &self.sequence) {
            (PredictionMethod::Sequence, Some(sequence)) => sequence,
            _ => &self.linear,
        }
    }
}

/// Advisory attached to a dose correction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DoseWarning {
    /// Active insulin is expected to push glucose below target
    ExpectedLow { drop_mg_dl: f64 },
    /// Current glucose is already below the low threshold
    CurrentLow,
    /// More than 5 U of insulin still active
    HighInsulinOnBoard,
}

/// Correction-dose advice with the intermediate quantities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseCorrection {
    pub current_bg: f64,
    pub target_bg: f64,
    /// Glucose after pending insulin and carbs act (mg/dL)
    pub effective_bg: f64,
    pub iob: f64,
    pub cob: f64,
    pub sensitivity: f64,
    /// Expected drop from active insulin (mg/dL)
    pub iob_effect_mg_dl: f64,
    /// Expected rise from unabsorbed carbs (mg/dL)
    pub cob_effect_mg_dl: f64,
    /// Unclamped correction; negative means a low is expected
    pub raw_correction: f64,
    /// Correction floored at zero
    pub recommended_dose: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<DoseWarning>,
}

impl DoseCorrection {
    /// Human-readable formula for display
    pub fn formula(&self) -> String {
        format!(
            "({:.0} - {:.0}) / {:.0} = {:.2}U",
            self.effective_bg, self.target_bg, self.sensitivity, self.raw_correction
        )
    }
}

/// Remaining activity of one insulin dose
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveDose {
    pub timestamp: DateTime<Utc>,
    pub original_units: f64,
    pub remaining_units: f64,
    pub minutes_ago: f64,
    pub percent_remaining: f64,
}

/// Snapshot of the current physiological state and dose advice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentMetrics {
    pub iob: f64,
    pub cob: f64,
    pub sensitivity: f64,
    pub dose: DoseCorrection,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_sample_validation() {
        assert!(GlucoseSample::new(ts(), 120, 0).is_ok());
        assert!(GlucoseSample::new(ts(), 19, 0).is_err());
        assert!(GlucoseSample::new(ts(), 601, 0).is_err());
        assert!(GlucoseSample::new(ts(), 120, 4).is_err());
    }

    #[test]
    fn test_trend_direction_codes() {
        for code in -3..=3 {
            assert_eq!(TrendDirection::from_code(code).code(), code);
        }
        assert_eq!(TrendDirection::parse("SingleUp").code(), 2);
        assert_eq!(TrendDirection::parse("NotComputable").code(), 0);
        assert_eq!(TrendDirection::parse("garbage"), TrendDirection::Flat);
    }

    #[test]
    fn test_treatment_validation() {
        assert!(TreatmentEvent::insulin(ts(), 2.0).validate().is_ok());
        assert!(TreatmentEvent::carbs(ts(), -5.0).validate().is_err());
        assert!(TreatmentEvent::carbs(ts(), f64::NAN).validate().is_err());

        let meal = TreatmentEvent::carbs(ts(), 45.0)
            .with_macros(10.0, 8.0)
            .with_insulin(4.5);
        assert!(meal.has_insulin());
        assert!(meal.has_carbs());
        assert_eq!(meal.fat_amount(), 8.0);
    }

    #[test]
    fn test_glucose_range_classification() {
        let thresholds = AlertThresholds::default();
        assert_eq!(GlucoseRange::classify(50.0, &thresholds), GlucoseRange::CriticalLow);
        assert_eq!(GlucoseRange::classify(65.0, &thresholds), GlucoseRange::Low);
        assert_eq!(GlucoseRange::classify(70.0, &thresholds), GlucoseRange::InRange);
        assert_eq!(GlucoseRange::classify(180.0, &thresholds), GlucoseRange::InRange);
        assert_eq!(GlucoseRange::classify(200.0, &thresholds), GlucoseRange::High);
        assert_eq!(GlucoseRange::classify(300.0, &thresholds), GlucoseRange::CriticalHigh);
    }

    #[test]
    fn test_forecast_follows_method() {
        let mut result = PredictionResult {
            linear: [120.0, 121.0, 122.0],
            sequence: Some([130.0, 131.0, 132.0]),
            horizons_minutes: DEFAULT_HORIZONS_MINUTES,
            timestamp: ts(),
            current_bg: 120.0,
            trend: 0,
            sensitivity_factor: 50.0,
            method: PredictionMethod::Sequence,
            predicted_range: GlucoseRange::InRange,
        };
        assert_eq!(result.forecast(), &[130.0, 131.0, 132.0]);

        result.method = PredictionMethod::Linear;
        assert_eq!(result.forecast(), &[120.0, 121.0, 122.0]);
    }
}
