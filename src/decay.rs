//! Insulin and carbohydrate decay
//!
//! This module implements the physiological decay model behind insulin-on-board
//! (IOB), carbs-on-board (COB) and correction-dose advice.
//!
//! Each qualifying treatment contributes `amount * 0.5^(elapsed / half_life)`
//! while `0 <= elapsed <= duration`. Outside that window the contribution is
//! exactly zero: the curve is cut off, not extended asymptotically.

use crate::config::DecayConfig;
use crate::error::{ForecastError, Result};
use crate::types::{ActiveDose, DoseCorrection, DoseWarning, TreatmentEvent};
use chrono::{DateTime, Utc};
use log::debug;

/// Active insulin above which a dose correction carries a caution (units)
pub const HIGH_IOB_UNITS: f64 = 5.0;

/// Raw correction below which a low is flagged (units)
pub const EXPECTED_LOW_UNITS: f64 = -1.0;

/// Remainders smaller than this are not listed as active doses (units)
const ACTIVE_DOSE_EPSILON: f64 = 0.01;

/// Fraction of an amount remaining after `elapsed_min` for a given half-life
pub fn remaining_fraction(elapsed_min: f64, half_life_min: f64) -> f64 {
    0.5_f64.powf(elapsed_min / half_life_min)
}

/// Minutes between a treatment and the reference time (negative if in the future)
fn elapsed_minutes(event_time: DateTime<Utc>, as_of: DateTime<Utc>) -> f64 {
    (as_of - event_time).num_milliseconds() as f64 / 60_000.0
}

/// Decayed contribution of one amount, zero outside the action window
fn decayed_amount(amount: f64, elapsed_min: f64, half_life_min: f64, duration_min: f64) -> f64 {
    if amount <= 0.0 || !(0.0..=duration_min).contains(&elapsed_min) {
        return 0.0;
    }
    amount * remaining_fraction(elapsed_min, half_life_min)
}

/// Pure decay and dose calculator
#[derive(Debug, Clone)]
pub struct DecayEngine {
    config: DecayConfig,
    low_threshold: f64,
}

impl Default for DecayEngine {
    fn default() -> Self {
        Self::new(DecayConfig::default())
    }
}

impl DecayEngine {
    /// Create an engine with the given decay parameters
    pub fn new(config: DecayConfig) -> Self {
        Self {
            config,
            low_threshold: 70.0,
        }
    }

    /// Set the glucose level below which dose advice warns about a current low
    pub fn with_low_threshold(mut self, low_threshold: f64) -> Self {
        self.low_threshold = low_threshold;
        self
    }

    pub fn config(&self) -> &DecayConfig {
        &self.config
    }

    /// Insulin on board (units) at `as_of`
    pub fn iob(&self, events: &[TreatmentEvent], as_of: DateTime<Utc>) -> f64 {
        events
            .iter()
            .map(|event| {
                decayed_amount(
                    event.insulin_amount(),
                    elapsed_minutes(event.timestamp, as_of),
                    self.config.insulin_half_life_min,
                    self.config.insulin_duration_min,
                )
            })
            .sum()
    }

    /// Carbs on board (grams) at `as_of`
    pub fn cob(&self, events: &[TreatmentEvent], as_of: DateTime<Utc>) -> f64 {
        events
            .iter()
            .map(|event| {
                decayed_amount(
                    event.carb_amount(),
                    elapsed_minutes(event.timestamp, as_of),
                    self.config.carb_half_life_min,
                    self.config.carb_duration_min,
                )
            })
            .sum()
    }

    /// Per-dose breakdown of the insulin still active at `as_of`, newest first
    pub fn active_doses(&self, events: &[TreatmentEvent], as_of: DateTime<Utc>) -> Vec<ActiveDose> {
        let mut doses: Vec<ActiveDose> = events
            .iter()
            .filter(|event| event.has_insulin())
            .filter_map(|event| {
                let original = event.insulin_amount();
                let minutes_ago = elapsed_minutes(event.timestamp, as_of);
                let remaining = decayed_amount(
                    original,
                    minutes_ago,
                    self.config.insulin_half_life_min,
                    self.config.insulin_duration_min,
                );
                (remaining >= ACTIVE_DOSE_EPSILON).then(|| ActiveDose {
                    timestamp: event.timestamp,
                    original_units: original,
                    remaining_units: remaining,
                    minutes_ago,
                    percent_remaining: remaining / original * 100.0,
                })
            })
            .collect();

        doses.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        doses
    }

    /// Correction dose accounting for pending insulin and carbs.
    ///
    /// `effective = current + cob * carb_factor - iob * sensitivity` and
    /// `raw = (effective - target) / sensitivity`. The raw value is kept even
    /// when negative; only `recommended_dose` is floored at zero.
    ///
    /// # Errors
    /// `InvalidSensitivity` when `sensitivity <= 0` (or is not finite).
    pub fn dose_correction(
        &self,
        current_bg: f64,
        target_bg: f64,
        sensitivity: f64,
        iob: f64,
        cob: f64,
        carb_factor: f64,
    ) -> Result<DoseCorrection> {
        if !sensitivity.is_finite() || sensitivity <= 0.0 {
            return Err(ForecastError::InvalidSensitivity {
                sensitivity,
                current_bg,
            });
        }

        let cob_effect = cob * carb_factor;
        let iob_effect = iob * sensitivity;
        let effective_bg = current_bg + cob_effect - iob_effect;
        let raw_correction = (effective_bg - target_bg) / sensitivity;
        let recommended_dose = raw_correction.max(0.0);

        let warning = if raw_correction < EXPECTED_LOW_UNITS {
            Some(DoseWarning::ExpectedLow {
                drop_mg_dl: (raw_correction * sensitivity).abs(),
            })
        } else if current_bg < self.low_threshold {
            Some(DoseWarning::CurrentLow)
        } else if iob > HIGH_IOB_UNITS {
            Some(DoseWarning::HighInsulinOnBoard)
        } else {
            None
        };

        debug!(
            "Dose calc: BG={current_bg}, COB={cob:.1}g (+{cob_effect:.0}), \
             IOB={iob:.2}U (-{iob_effect:.0}), EffBG={effective_bg:.0}, Raw={raw_correction:.2}U"
        );

        Ok(DoseCorrection {
            current_bg,
            target_bg,
            effective_bg,
            iob,
            cob,
            sensitivity,
            iob_effect_mg_dl: iob_effect,
            cob_effect_mg_dl: cob_effect,
            raw_correction,
            recommended_dose,
            warning,
        })
    }

    /// Dose correction against the configured target and carb factor
    pub fn correction_to_target(
        &self,
        current_bg: f64,
        sensitivity: f64,
        iob: f64,
        cob: f64,
    ) -> Result<DoseCorrection> {
        self.dose_correction(
            current_bg,
            self.config.target_bg,
            sensitivity,
            iob,
            cob,
            self.config.carb_bg_factor,
        )
    }
}
