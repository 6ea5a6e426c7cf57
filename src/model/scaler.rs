//! Min-max feature scaling
//!
//! A fitted scaler stores, per feature, `scale = (hi - lo) / (max - min)` and
//! `min = lo - data_min * scale`, so that `transform(x) = x * scale + min`.
//! Only the fitted parameters are persisted; fitting happens at training time.

use crate::error::{ForecastError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Fitted per-feature min-max scaler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    #[serde(alias = "min_")]
    min: Vec<f64>,
    #[serde(alias = "scale_")]
    scale: Vec<f64>,
}

impl MinMaxScaler {
    /// Build a scaler from fitted parameters
    pub fn new(min: Vec<f64>, scale: Vec<f64>) -> Result<Self> {
        let scaler = Self { min, scale };
        scaler.validate()?;
        Ok(scaler)
    }

    /// Load fitted parameters from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let scaler: Self = serde_json::from_str(json)?;
        scaler.validate()?;
        Ok(scaler)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn validate(&self) -> Result<()> {
        if self.min.is_empty() || self.min.len() != self.scale.len() {
            return Err(ForecastError::ModelFormat(format!(
                "scaler has {} offsets and {} scales",
                self.min.len(),
                self.scale.len()
            )));
        }
        if self
            .min
            .iter()
            .chain(&self.scale)
            .any(|v| !v.is_finite())
            || self.scale.iter().any(|s| *s == 0.0)
        {
            return Err(ForecastError::ModelFormat(
                "scaler parameters must be finite with non-zero scale".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of features this scaler was fitted on
    pub fn width(&self) -> usize {
        self.scale.len()
    }

    /// Scale one row in place
    pub fn transform_row(&self, row: &mut [f64]) -> Result<()> {
        self.check_width(row.len())?;
        for ((v, m), s) in row.iter_mut().zip(&self.min).zip(&self.scale) {
            *v = *v * s + m;
        }
        Ok(())
    }

    /// Undo scaling of one row in place
    pub fn inverse_transform_row(&self, row: &mut [f64]) -> Result<()> {
        self.check_width(row.len())?;
        for ((v, m), s) in row.iter_mut().zip(&self.min).zip(&self.scale) {
            *v = (*v - m) / s;
        }
        Ok(())
    }

    fn check_width(&self, found: usize) -> Result<()> {
        if found != self.width() {
            return Err(ForecastError::ShapeMismatch(format!(
                "scaler expects {} features, got {}",
                self.width(),
                found
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_and_inverse() {
        // columns fitted on [0, 10] and [100, 300]
        let scaler = MinMaxScaler::new(vec![0.0, -0.5], vec![0.1, 0.005]).unwrap();

        let mut row = vec![5.0, 300.0];
        scaler.transform_row(&mut row).unwrap();
        assert!((row[0] - 0.5).abs() < 1e-12);
        assert!((row[1] - 1.0).abs() < 1e-12);

        scaler.inverse_transform_row(&mut row).unwrap();
        assert!((row[0] - 5.0).abs() < 1e-9);
        assert!((row[1] - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_new_validates_parameters() {
        assert!(MinMaxScaler::new(vec![], vec![]).is_err());
        assert!(MinMaxScaler::new(vec![0.0], vec![f64::NAN]).is_err());
        assert!(MinMaxScaler::new(vec![0.0, 1.0], vec![1.0]).is_err());
    }

    #[test]
    fn test_accepts_fitted_attribute_names() {
        let scaler = MinMaxScaler::from_json(r#"{"min_": [-1.0], "scale_": [0.01]}"#).unwrap();
        let mut row = vec![150.0];
        scaler.transform_row(&mut row).unwrap();
        assert!((row[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(MinMaxScaler::from_json(r#"{"min": [0.0, 1.0], "scale": [1.0]}"#).is_err());
        assert!(MinMaxScaler::from_json(r#"{"min": [0.0], "scale": [0.0]}"#).is_err());
        assert!(MinMaxScaler::from_json("not json").is_err());
    }

    #[test]
    fn test_width_mismatch() {
        let scaler = MinMaxScaler::new(vec![0.0, 0.0], vec![1.0, 1.0]).unwrap();
        assert!(matches!(
            scaler.transform_row(&mut [1.0]),
            Err(ForecastError::ShapeMismatch(_))
        ));
    }
}
