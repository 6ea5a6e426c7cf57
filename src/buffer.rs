//! Rolling feature buffer
//!
//! This module keeps the recent glucose and treatment history that the feature
//! matrix is built from. The glucose window holds at most
//! `history_window / sampling_interval` samples (oldest evicted first);
//! treatments are pruned by age when new ones arrive.

use crate::config::{FeatureConfig, ForecastConfig};
use crate::error::Result;
use crate::features::{FeatureDeriver, FeatureSequence};
use crate::normalizer::Normalizer;
use crate::types::{GlucoseSample, TreatmentEvent};
use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Rolling window of glucose samples and treatments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureBuffer {
    /// Glucose samples, oldest first
    samples: VecDeque<GlucoseSample>,
    /// Treatments inside the history window
    treatments: Vec<TreatmentEvent>,
    config: FeatureConfig,
    /// Action window of the linear IOB feature (minutes)
    insulin_duration_min: f64,
}

impl Default for FeatureBuffer {
    fn default() -> Self {
        Self::from_config(&ForecastConfig::default())
    }
}

impl FeatureBuffer {
    /// Create an empty buffer with the given window parameters
    pub fn new(config: FeatureConfig, insulin_duration_min: f64) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.max_samples()),
            treatments: Vec::new(),
            config,
            insulin_duration_min,
        }
    }

    /// Create an empty buffer from the engine configuration
    pub fn from_config(config: &ForecastConfig) -> Self {
        Self::new(config.features.clone(), config.decay.insulin_duration_min)
    }

    /// Add a glucose sample, keeping timestamp order and the capacity bound
    pub fn push_glucose(&mut self, sample: GlucoseSample) -> Result<()> {
        sample.validate()?;

        match self.samples.back() {
            Some(last) if last.timestamp > sample.timestamp => {
                let idx = self
                    .samples
                    .partition_point(|s| s.timestamp <= sample.timestamp);
                self.samples.insert(idx, sample);
            }
            _ => self.samples.push_back(sample),
        }

        while self.samples.len() > self.config.max_samples() {
            self.samples.pop_front();
        }
        Ok(())
    }

    /// Add a treatment, pruning treatments older than the history window
    /// relative to the current wall clock
    pub fn push_treatment(&mut self, event: TreatmentEvent) -> Result<()> {
        self.push_treatment_at(event, Utc::now())
    }

    /// Add a treatment, pruning relative to an explicit reference time
    pub fn push_treatment_at(&mut self, event: TreatmentEvent, now: DateTime<Utc>) -> Result<()> {
        event.validate()?;
        self.treatments.push(event);

        let cutoff = now - Duration::minutes(self.config.history_window_min as i64);
        let before = self.treatments.len();
        self.treatments.retain(|t| t.timestamp > cutoff);
        if self.treatments.len() < before {
            debug!(
                "pruned {} treatments older than {}",
                before - self.treatments.len(),
                cutoff
            );
        }
        Ok(())
    }

    /// Build the newest `seq_len` feature rows.
    ///
    /// Returns `None` while fewer than `seq_len` samples are buffered. Rolling
    /// statistics are computed over the whole buffer before the tail is taken.
    pub fn build_sequence(
        &self,
        iob_override: Option<f64>,
        seq_len: usize,
    ) -> Option<FeatureSequence> {
        if seq_len == 0 || self.samples.len() < seq_len {
            debug!(
                "feature buffer holds {} samples, {} needed",
                self.samples.len(),
                seq_len
            );
            return None;
        }

        let samples: Vec<GlucoseSample> = self.samples.iter().copied().collect();
        let steps = Normalizer::align(&samples, &self.treatments);
        let deriver =
            FeatureDeriver::new(self.config.sampling_interval_min, self.insulin_duration_min);
        let rows = deriver.derive(&steps, iob_override);

        let tail = rows[rows.len() - seq_len..].to_vec();
        FeatureSequence::new(tail, seq_len).ok()
    }

    /// Build a sequence of the configured length
    pub fn build_default_sequence(&self, iob_override: Option<f64>) -> Option<FeatureSequence> {
        self.build_sequence(iob_override, self.config.seq_len)
    }

    /// Number of buffered glucose samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of retained treatments
    pub fn treatment_count(&self) -> usize {
        self.treatments.len()
    }

    /// Most recent glucose sample
    pub fn latest(&self) -> Option<&GlucoseSample> {
        self.samples.back()
    }

    /// Drop all buffered data
    pub fn clear(&mut self) {
        self.samples.clear();
        self.treatments.clear();
    }

    /// Load a buffer from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize the buffer to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{column_index, FEATURE_COUNT};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 6, 0, 0).unwrap()
    }

    fn filled(n: usize) -> FeatureBuffer {
        let mut buffer = FeatureBuffer::default();
        for i in 0..n {
            let sample = GlucoseSample::new(
                t0() + Duration::minutes(5 * i as i64),
                100 + i as i32,
                0,
            )
            .unwrap();
            buffer.push_glucose(sample).unwrap();
        }
        buffer
    }

    #[test]
    fn test_insufficient_data_returns_none() {
        let buffer = filled(23);
        assert!(buffer.build_sequence(None, 24).is_none());
        assert!(FeatureBuffer::default().build_sequence(None, 24).is_none());
    }

    #[test]
    fn test_sequence_shape() {
        let buffer = filled(30);
        let sequence = buffer.build_sequence(None, 24).unwrap();
        assert_eq!(sequence.len(), 24);
        assert_eq!(sequence.to_flat().len(), 24 * FEATURE_COUNT);

        // newest last
        let values = sequence.column("value").unwrap();
        assert_eq!(values[23], 129.0);
        assert_eq!(values[0], 106.0);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let buffer = filled(50);
        assert_eq!(buffer.len(), 36);
        assert_eq!(buffer.latest().unwrap().value, 149);
    }

    #[test]
    fn test_out_of_order_insert() {
        let mut buffer = filled(3);
        let late = GlucoseSample::new(t0() + Duration::minutes(7), 180, 0).unwrap();
        buffer.push_glucose(late).unwrap();
        assert_eq!(buffer.latest().unwrap().value, 102);
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn test_treatment_pruning() {
        let mut buffer = FeatureBuffer::default();
        let now = t0() + Duration::hours(4);
        buffer
            .push_treatment_at(TreatmentEvent::insulin(t0(), 2.0), now)
            .unwrap();
        assert_eq!(buffer.treatment_count(), 0);

        buffer
            .push_treatment_at(TreatmentEvent::insulin(now - Duration::minutes(30), 2.0), now)
            .unwrap();
        assert_eq!(buffer.treatment_count(), 1);

        assert!(buffer
            .push_treatment_at(TreatmentEvent::carbs(now, -1.0), now)
            .is_err());
    }

    #[test]
    fn test_iob_override_applied() {
        let mut buffer = filled(24);
        let at = t0() + Duration::minutes(100);
        buffer
            .push_treatment_at(TreatmentEvent::insulin(at, 3.0), at)
            .unwrap();

        let iob = column_index("iob").unwrap();
        let linear = buffer.build_sequence(None, 24).unwrap();
        assert!(linear.rows()[20][iob] > 0.0);

        let overridden = buffer.build_sequence(Some(1.5), 24).unwrap();
        assert!(overridden.rows().iter().all(|row| row[iob] == 1.5));
    }

    #[test]
    fn test_serialization() {
        let buffer = filled(5);
        let loaded = FeatureBuffer::from_json(&buffer.to_json().unwrap()).unwrap();
        assert_eq!(loaded.len(), 5);
        assert_eq!(loaded.latest(), buffer.latest());
    }
}
