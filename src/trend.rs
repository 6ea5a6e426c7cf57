//! Trend extrapolation
//!
//! Deterministic forecaster used as the guaranteed baseline. It never fails:
//! - With two or more recent values, a least-squares line is extrapolated
//! - With fewer, the last known value is held
//! - With no series at all, the CGM trend code is turned into a rate

use crate::config::TrendConfig;
use crate::types::{clamp_forecast, Horizons};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

/// Value assumed when no reading is available at all (mg/dL)
pub const FALLBACK_GLUCOSE_MG_DL: f64 = 100.0;

/// Cadence assumed when no timestamps are supplied (minutes)
pub const ASSUMED_INTERVAL_MIN: f64 = 5.0;

/// Readings used to derive a trend code from values
const TREND_WINDOW: usize = 3;

/// Result of a line fit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    /// Clamped forecasts at each horizon
    pub predictions: Horizons,
    /// mg/dL per minute
    pub slope: f64,
    /// Fitted value at the oldest point used (mg/dL)
    pub intercept: f64,
}

/// Approximate rate of change for a trend code (mg/dL per minute)
pub fn trend_rate(trend_code: i8) -> f64 {
    match trend_code {
        -3..=3 => trend_code as f64,
        _ => 0.0,
    }
}

/// Linear and trend-arrow forecaster
#[derive(Debug, Clone, Default)]
pub struct TrendExtrapolator {
    config: TrendConfig,
}

impl TrendExtrapolator {
    pub fn new(config: TrendConfig) -> Self {
        Self { config }
    }

    pub fn horizons(&self) -> [u32; 3] {
        self.config.horizons_min
    }

    /// Fit a line through the most recent values (newest last) and extrapolate.
    ///
    /// Real timestamps are used for the x axis when at least as many are given
    /// as values used; otherwise a fixed 5-minute cadence is assumed.
    pub fn fit_and_predict(
        &self,
        values: &[f64],
        timestamps: Option<&[DateTime<Utc>]>,
    ) -> LinearFit {
        if values.len() < 2 {
            let last = values.last().copied().unwrap_or(FALLBACK_GLUCOSE_MG_DL);
            debug!("{} values available, holding {}", values.len(), last);
            return LinearFit {
                predictions: [last; 3],
                slope: 0.0,
                intercept: last,
            };
        }

        let n = values.len().min(self.config.history_points.max(2));
        let recent = &values[values.len() - n..];

        let x: Vec<f64> = match timestamps {
            Some(ts) if ts.len() >= n => {
                let recent_ts = &ts[ts.len() - n..];
                let base = recent_ts[0];
                recent_ts
                    .iter()
                    .map(|t| (*t - base).num_milliseconds() as f64 / 60_000.0)
                    .collect()
            }
            _ => (0..n).map(|i| i as f64 * ASSUMED_INTERVAL_MIN).collect(),
        };

        let (slope, intercept) = least_squares(&x, recent);
        let current_x = x[n - 1];
        let predictions = self
            .config
            .horizons_min
            .map(|h| clamp_forecast(slope * (current_x + h as f64) + intercept));

        LinearFit {
            predictions,
            slope,
            intercept,
        }
    }

    /// Extrapolate from the current value using the trend code's rate
    pub fn predict_from_trend_code(&self, current_bg: f64, trend_code: i8) -> Horizons {
        let rate = trend_rate(trend_code);
        self.config
            .horizons_min
            .map(|h| clamp_forecast(current_bg + rate * h as f64))
    }

    /// Derive a trend code and rate (mg/dL per minute) from the last few readings
    pub fn trend_from_values(&self, values: &[f64], interval_min: f64) -> (i8, f64) {
        if values.len() < 2 {
            return (0, 0.0);
        }
        let recent = &values[values.len().saturating_sub(TREND_WINDOW)..];
        let total_time = (recent.len() - 1) as f64 * interval_min;
        let rate = if total_time > 0.0 {
            (recent[recent.len() - 1] - recent[0]) / total_time
        } else {
            0.0
        };

        let code = if rate <= -3.0 {
            -3
        } else if rate <= -2.0 {
            -2
        } else if rate <= -1.0 {
            -1
        } else if rate < 1.0 {
            0
        } else if rate < 2.0 {
            1
        } else if rate < 3.0 {
            2
        } else {
            3
        };
        (code, rate)
    }
}

/// Ordinary least-squares line; a degenerate x axis yields slope 0 through the mean
fn least_squares(x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let sxx: f64 = x.iter().map(|xi| (xi - mean_x).powi(2)).sum();
    if sxx <= f64::EPSILON {
        return (0.0, mean_y);
    }
    let sxy: f64 = x.iter().zip(y).map(|(xi, yi)| (xi - mean_x) * (yi - mean_y)).sum();

    let slope = sxy / sxx;
    (slope, mean_y - slope * mean_x)
}
