//! Sample normalization and grid alignment
//!
//! This module turns the raw glucose and treatment series into one row per CGM
//! sample, which is the grid the feature matrix is built on:
//! - Samples ordered by timestamp
//! - Treatment amounts coerced to finite, non-negative numbers (missing = 0)
//! - Each treatment attributed to the sample closest to it in time

use crate::types::{GlucoseSample, TreatmentEvent};
use chrono::{DateTime, Utc};

/// One time step of the aligned series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignedStep {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub trend: f64,
    pub insulin: f64,
    pub carbs: f64,
    pub protein: f64,
    pub fat: f64,
}

impl AlignedStep {
    fn from_sample(sample: &GlucoseSample) -> Self {
        Self {
            timestamp: sample.timestamp,
            value: sample.value as f64,
            trend: sample.trend as f64,
            insulin: 0.0,
            carbs: 0.0,
            protein: 0.0,
            fat: 0.0,
        }
    }
}

/// Normalizer for building the aligned per-sample series
pub struct Normalizer;

impl Normalizer {
    /// Align treatments onto the glucose grid
    pub fn align(samples: &[GlucoseSample], treatments: &[TreatmentEvent]) -> Vec<AlignedStep> {
        let mut ordered: Vec<&GlucoseSample> = samples.iter().collect();
        ordered.sort_by_key(|s| s.timestamp);

        let mut steps: Vec<AlignedStep> =
            ordered.into_iter().map(AlignedStep::from_sample).collect();
        if steps.is_empty() {
            return steps;
        }

        for treatment in treatments {
            let Some(idx) = nearest_step(&steps, treatment.timestamp) else {
                continue;
            };
            let step = &mut steps[idx];
            step.insulin += coerce(treatment.insulin_units);
            step.carbs += coerce(treatment.carb_grams);
            step.protein += coerce(treatment.protein_grams);
            step.fat += coerce(treatment.fat_grams);
        }

        steps
    }
}

/// Coerce an optional amount to a usable number
fn coerce(value: Option<f64>) -> f64 {
    value.filter(|v| v.is_finite() && *v >= 0.0).unwrap_or(0.0)
}

/// Index of the step closest in time; earliest wins on ties
fn nearest_step(steps: &[AlignedStep], at: DateTime<Utc>) -> Option<usize> {
    steps
        .iter()
        .enumerate()
        .min_by_key(|(idx, step)| ((step.timestamp - at).num_milliseconds().abs(), *idx))
        .map(|(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 7, 0, 0).unwrap()
    }

    fn samples(n: i64) -> Vec<GlucoseSample> {
        (0..n)
            .map(|i| GlucoseSample {
                timestamp: t0() + Duration::minutes(5 * i),
                value: 100 + i as i32,
                trend: 0,
            })
            .collect()
    }

    #[test]
    fn test_align_sorts_samples() {
        let mut input = samples(4);
        input.reverse();
        let steps = Normalizer::align(&input, &[]);
        assert_eq!(steps.len(), 4);
        assert!(steps.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(steps[0].value, 100.0);
    }

    #[test]
    fn test_treatments_attach_to_nearest_sample() {
        let treatments = [
            TreatmentEvent::insulin(t0() + Duration::minutes(6), 2.0),
            TreatmentEvent::carbs(t0() + Duration::minutes(14), 40.0).with_macros(5.0, 3.0),
        ];
        let steps = Normalizer::align(&samples(4), &treatments);
        assert_eq!(steps[1].insulin, 2.0);
        assert_eq!(steps[3].carbs, 40.0);
        assert_eq!(steps[3].protein, 5.0);
        assert_eq!(steps[3].fat, 3.0);
    }

    #[test]
    fn test_tie_goes_to_earlier_sample() {
        let treatments = [TreatmentEvent::insulin(t0() + Duration::seconds(150), 1.0)];
        let steps = Normalizer::align(&samples(2), &treatments);
        assert_eq!(steps[0].insulin, 1.0);
        assert_eq!(steps[1].insulin, 0.0);
    }

    #[test]
    fn test_mixed_entry_keeps_both_payloads() {
        let treatments = [TreatmentEvent::carbs(t0(), 30.0).with_insulin(3.0)];
        let steps = Normalizer::align(&samples(1), &treatments);
        assert_eq!(steps[0].insulin, 3.0);
        assert_eq!(steps[0].carbs, 30.0);
    }

    #[test]
    fn test_invalid_amounts_coerced_to_zero() {
        let mut bad = TreatmentEvent::carbs(t0(), f64::NAN);
        bad.insulin_units = Some(-1.0);
        let steps = Normalizer::align(&samples(1), &[bad]);
        assert_eq!(steps[0].carbs, 0.0);
        assert_eq!(steps[0].insulin, 0.0);
    }

    #[test]
    fn test_no_samples_drops_treatments() {
        let steps = Normalizer::align(&[], &[TreatmentEvent::insulin(t0(), 1.0)]);
        assert!(steps.is_empty());
    }
}
