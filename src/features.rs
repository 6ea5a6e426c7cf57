//! Feature derivation
//!
//! This module turns the aligned glucose/treatment series into the 26-column
//! feature matrix the sequence models were trained on:
//! - Raw value, trend and treatment load
//! - A linearly decaying IOB proxy (optionally replaced by a caller value)
//! - Short and long rolling mean/std
//! - Cyclical time-of-day / calendar encodings
//! - Local degree-2 polynomial trend coefficients
//!
//! Column order is part of the model contract. [`FEATURE_COLUMNS`] is the single
//! source of truth and any artifact listing different columns is rejected.

use crate::error::{ForecastError, Result};
use crate::normalizer::AlignedStep;
use chrono::{Datelike, Timelike};
use std::f64::consts::PI;

/// Number of features per time step
pub const FEATURE_COUNT: usize = 26;

/// Feature columns, in the order the models consume them
pub const FEATURE_COLUMNS: [&str; FEATURE_COUNT] = [
    "value",
    "trend",
    "carbs",
    "protein",
    "fat",
    "iob",
    "roll30_mean",
    "roll30_std",
    "roll90_mean",
    "roll90_std",
    "secs_since_start",
    "min5_sin",
    "min5_cos",
    "min15_sin",
    "min15_cos",
    "hour_sin",
    "hour_cos",
    "dow_sin",
    "dow_cos",
    "mon_sin",
    "mon_cos",
    "doy_sin",
    "doy_cos",
    "poly0",
    "poly1",
    "poly2",
];

/// Short rolling window (minutes)
pub const ROLL_SHORT_MIN: u32 = 30;
/// Long rolling window (minutes)
pub const ROLL_LONG_MIN: u32 = 90;
/// Local polynomial fit window (minutes)
pub const POLY_WINDOW_MIN: u32 = 120;
/// Degree of the local polynomial fit
pub const POLY_DEGREE: usize = 2;

/// Features for one time step
pub type FeatureVector = [f64; FEATURE_COUNT];

/// Position of a named column in [`FEATURE_COLUMNS`]
pub fn column_index(name: &str) -> Option<usize> {
    FEATURE_COLUMNS.iter().position(|c| *c == name)
}

/// Check that an artifact's feature list matches the column contract exactly
pub fn verify_columns<S: AsRef<str>>(columns: &[S]) -> Result<()> {
    let matches = columns.len() == FEATURE_COUNT
        && columns
            .iter()
            .zip(FEATURE_COLUMNS.iter())
            .all(|(found, expected)| found.as_ref() == *expected);

    if matches {
        Ok(())
    } else {
        Err(ForecastError::FeatureMismatch {
            expected: FEATURE_COLUMNS.join(","),
            found: columns
                .iter()
                .map(|c| c.as_ref())
                .collect::<Vec<_>>()
                .join(","),
        })
    }
}

/// Fixed-length window of feature vectors, newest last
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSequence {
    rows: Vec<FeatureVector>,
}

impl FeatureSequence {
    /// Wrap rows, refusing any length other than `seq_len`
    pub fn new(rows: Vec<FeatureVector>, seq_len: usize) -> Result<Self> {
        if rows.len() != seq_len {
            return Err(ForecastError::ShapeMismatch(format!(
                "feature sequence has {} steps, expected {}",
                rows.len(),
                seq_len
            )));
        }
        Ok(Self { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[FeatureVector] {
        &self.rows
    }

    /// Row-major flattening: `len() * FEATURE_COUNT` values
    pub fn to_flat(&self) -> Vec<f64> {
        self.rows.iter().flat_map(|row| row.iter().copied()).collect()
    }

    /// All values of one named column, oldest first
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = column_index(name)?;
        Some(self.rows.iter().map(|row| row[idx]).collect())
    }
}

/// Number of grid steps covering `minutes` at the given cadence (at least 1)
fn steps_for(minutes: u32, sampling_interval_min: u32) -> usize {
    (minutes / sampling_interval_min.max(1)).max(1) as usize
}

/// Feature deriver for computing the model input matrix
pub struct FeatureDeriver {
    sampling_interval_min: u32,
    insulin_duration_min: f64,
}

impl FeatureDeriver {
    pub fn new(sampling_interval_min: u32, insulin_duration_min: f64) -> Self {
        Self {
            sampling_interval_min,
            insulin_duration_min,
        }
    }

    /// Derive one feature vector per aligned step.
    ///
    /// The `iob` column holds the linear-decay proxy unless `iob_override` is
    /// given, in which case every row carries the override value.
    pub fn derive(&self, steps: &[AlignedStep], iob_override: Option<f64>) -> Vec<FeatureVector> {
        let Some(first) = steps.first() else {
            return Vec::new();
        };
        let start = first.timestamp;

        let values: Vec<f64> = steps.iter().map(|s| s.value).collect();
        let insulin: Vec<f64> = steps.iter().map(|s| s.insulin).collect();

        let iob = match iob_override {
            Some(value) => vec![value; steps.len()],
            None => linear_iob_series(
                &insulin,
                self.insulin_duration_min,
                self.sampling_interval_min,
            ),
        };

        let short = rolling_mean_std(
            &values,
            steps_for(ROLL_SHORT_MIN, self.sampling_interval_min),
        );
        let long = rolling_mean_std(&values, steps_for(ROLL_LONG_MIN, self.sampling_interval_min));
        let poly = poly_features(&values, steps_for(POLY_WINDOW_MIN, self.sampling_interval_min));

        steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let ts = step.timestamp;
                let minute = ts.minute() as f64;
                let (min5_sin, min5_cos) = sincos(minute % 5.0, 5.0);
                let (min15_sin, min15_cos) = sincos(minute % 15.0, 15.0);
                let (hour_sin, hour_cos) = sincos(ts.hour() as f64, 24.0);
                let (dow_sin, dow_cos) = sincos(ts.weekday().num_days_from_monday() as f64, 7.0);
                let (mon_sin, mon_cos) = sincos(ts.month() as f64, 12.0);
                let (doy_sin, doy_cos) = sincos(ts.ordinal() as f64, 365.0);
                let secs_since_start = (ts - start).num_milliseconds() as f64 / 1000.0;

                [
                    step.value,
                    step.trend,
                    step.carbs,
                    step.protein,
                    step.fat,
                    iob[i],
                    short[i].0,
                    short[i].1,
                    long[i].0,
                    long[i].1,
                    secs_since_start,
                    min5_sin,
                    min5_cos,
                    min15_sin,
                    min15_cos,
                    hour_sin,
                    hour_cos,
                    dow_sin,
                    dow_cos,
                    mon_sin,
                    mon_cos,
                    doy_sin,
                    doy_cos,
                    poly[i][0],
                    poly[i][1],
                    poly[i][2],
                ]
            })
            .collect()
    }
}

/// Cyclical encoding of `value` with the given period
fn sincos(value: f64, period: f64) -> (f64, f64) {
    let theta = 2.0 * PI * value / period;
    (theta.sin(), theta.cos())
}

/// IOB proxy: each bolus decays linearly to zero over the action window
pub fn linear_iob_series(
    insulin: &[f64],
    duration_min: f64,
    sampling_interval_min: u32,
) -> Vec<f64> {
    let mut iob = vec![0.0; insulin.len()];
    if sampling_interval_min == 0 {
        return iob;
    }
    let decay_steps = (duration_min / sampling_interval_min as f64).floor() as usize;
    if decay_steps == 0 {
        return iob;
    }

    for (idx, &amount) in insulin.iter().enumerate() {
        if amount <= 0.0 {
            continue;
        }
        for (offset, slot) in iob.iter_mut().skip(idx).take(decay_steps).enumerate() {
            let factor = (1.0 - offset as f64 / decay_steps as f64).max(0.0);
            *slot += amount * factor;
        }
    }

    iob
}

/// Trailing mean and sample standard deviation; leading rows use partial windows
fn rolling_mean_std(values: &[f64], window: usize) -> Vec<(f64, f64)> {
    (0..values.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(window);
            let slice = &values[start..=i];
            let n = slice.len() as f64;
            let mean = slice.iter().sum::<f64>() / n;
            let std = if slice.len() > 1 {
                let var = slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
                var.sqrt()
            } else {
                0.0
            };
            (mean, std)
        })
        .collect()
}

/// Per-step quadratic coefficients over a trailing window.
///
/// Steps whose window is too short to fit take the nearest fitted value
/// (forward fill, then backward fill); with no fit anywhere all are zero.
fn poly_features(values: &[f64], window: usize) -> Vec<[f64; 3]> {
    let window = window.min(values.len());
    if window < POLY_DEGREE + 1 {
        return vec![[0.0; 3]; values.len()];
    }

    let fitted: Vec<Option<[f64; 3]>> = (0..values.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(window);
            let slice = &values[start..=i];
            if slice.len() >= POLY_DEGREE + 1 {
                polyfit2(slice)
            } else {
                None
            }
        })
        .collect();

    let mut filled = fitted.clone();
    let mut last = None;
    for slot in filled.iter_mut() {
        match slot {
            Some(coeffs) => last = Some(*coeffs),
            None => *slot = last,
        }
    }
    let mut next = None;
    for slot in filled.iter_mut().rev() {
        match slot {
            Some(coeffs) => next = Some(*coeffs),
            None => *slot = next,
        }
    }

    filled.into_iter().map(|c| c.unwrap_or([0.0; 3])).collect()
}

/// Least-squares quadratic through `y` at x = 0, 1, 2, ...
///
/// Returns coefficients highest degree first: `[a, b, c]` for `a*x^2 + b*x + c`.
pub fn polyfit2(y: &[f64]) -> Option<[f64; 3]> {
    if y.len() < POLY_DEGREE + 1 {
        return None;
    }

    let mut s = [0.0_f64; 5];
    let mut t = [0.0_f64; 3];
    for (i, &yi) in y.iter().enumerate() {
        let x = i as f64;
        let mut xp = 1.0;
        for (k, sk) in s.iter_mut().enumerate() {
            *sk += xp;
            if k < 3 {
                t[k] += xp * yi;
            }
            xp *= x;
        }
    }

    let mut m = [
        [s[4], s[3], s[2], t[2]],
        [s[3], s[2], s[1], t[1]],
        [s[2], s[1], s[0], t[0]],
    ];

    for col in 0..3 {
        let pivot = (col..3).max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))?;
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        for row in 0..3 {
            if row != col {
                let factor = m[row][col] / m[col][col];
                for k in col..4 {
                    m[row][k] -= factor * m[col][k];
                }
            }
        }
    }

    let coeffs = [m[0][3] / m[0][0], m[1][3] / m[1][1], m[2][3] / m[2][2]];
    coeffs.iter().all(|c| c.is_finite()).then_some(coeffs)
}
