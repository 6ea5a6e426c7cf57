//! Prediction orchestration
//!
//! [`GlucoseForecaster`] is the context object built once at startup and
//! shared by request handlers. It owns the immutable model state and the
//! accuracy ledger; everything request-specific (feature buffer, IOB) is
//! built fresh from the request itself.
//!
//! Per request:
//! 1. Trend extrapolation always runs and is the baseline forecast
//! 2. A feature sequence is built from the request's own history
//! 3. Sensitivity comes from the sensitivity model, or the default
//! 4. The glucose model runs when available and the sequence exists; any
//!    failure degrades to the baseline
//! 5. The result is tagged with the method that produced the forecast

use crate::accuracy::AccuracyLedger;
use crate::buffer::FeatureBuffer;
use crate::config::ForecastConfig;
use crate::decay::DecayEngine;
use crate::error::Result;
use crate::features::FeatureSequence;
use crate::model::{ModelPaths, SequenceEstimator};
use crate::trend::TrendExtrapolator;
use crate::types::{
    ActiveDose, CurrentMetrics, DoseCorrection, GlucoseRange, GlucoseSample, PredictionMethod,
    PredictionResult, TreatmentEvent,
};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Inputs for one prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    /// Current glucose (mg/dL)
    pub current_bg: f64,
    /// Current trend code (-3..=3)
    pub trend: i8,
    /// Insulin on board; derived from `treatments` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iob: Option<f64>,
    /// Recent glucose samples
    #[serde(default)]
    pub history: Vec<GlucoseSample>,
    /// Recent treatments
    #[serde(default)]
    pub treatments: Vec<TreatmentEvent>,
    /// Reference time; defaults to the newest sample, else now
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_of: Option<DateTime<Utc>>,
}

impl PredictionRequest {
    pub fn new(current_bg: f64, trend: i8) -> Self {
        Self {
            current_bg,
            trend,
            iob: None,
            history: Vec::new(),
            treatments: Vec::new(),
            as_of: None,
        }
    }

    pub fn with_iob(mut self, iob: f64) -> Self {
        self.iob = Some(iob);
        self
    }

    pub fn with_history(mut self, history: Vec<GlucoseSample>) -> Self {
        self.history = history;
        self
    }

    pub fn with_treatments(mut self, treatments: Vec<TreatmentEvent>) -> Self {
        self.treatments = treatments;
        self
    }

    pub fn at(mut self, as_of: DateTime<Utc>) -> Self {
        self.as_of = Some(as_of);
        self
    }

    /// Reference time for decay and treatment pruning
    pub fn reference_time(&self) -> DateTime<Utc> {
        self.as_of
            .or_else(|| self.history.iter().map(|s| s.timestamp).max())
            .unwrap_or_else(Utc::now)
    }
}

/// Explicit forecasting context shared across requests
#[derive(Debug)]
pub struct GlucoseForecaster {
    config: ForecastConfig,
    decay: DecayEngine,
    trend: TrendExtrapolator,
    estimator: SequenceEstimator,
    ledger: AccuracyLedger,
}

impl GlucoseForecaster {
    /// Validate the configuration and load models from `models_dir` if set
    pub fn new(config: ForecastConfig) -> Result<Self> {
        let estimator = match &config.models_dir {
            Some(dir) => SequenceEstimator::load(
                &ModelPaths::from_dir(dir),
                config.sensitivity.default_isf,
            ),
            None => {
                debug!("no models directory configured, linear forecasts only");
                SequenceEstimator::new(config.sensitivity.default_isf)
            }
        };
        Self::with_estimator(config, estimator)
    }

    /// Build a forecaster around already loaded models
    pub fn with_estimator(config: ForecastConfig, estimator: SequenceEstimator) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            decay: DecayEngine::new(config.decay.clone()).with_low_threshold(config.thresholds.low),
            trend: TrendExtrapolator::new(config.trend.clone()),
            estimator,
            ledger: AccuracyLedger::new(),
            config,
        })
    }

    /// Default configuration with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = ForecastConfig::default();
        config.apply_env_overrides()?;
        Self::new(config)
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    pub fn decay(&self) -> &DecayEngine {
        &self.decay
    }

    pub fn trend(&self) -> &TrendExtrapolator {
        &self.trend
    }

    pub fn estimator(&self) -> &SequenceEstimator {
        &self.estimator
    }

    pub fn ledger(&self) -> &AccuracyLedger {
        &self.ledger
    }

    /// Produce a forecast; never fails, degrading to trend extrapolation
    pub fn predict(&self, request: &PredictionRequest) -> PredictionResult {
        let as_of = request.reference_time();

        let mut history = request.history.clone();
        history.sort_by_key(|s| s.timestamp);

        let linear = if history.len() >= 2 {
            let values: Vec<f64> = history.iter().map(|s| s.value as f64).collect();
            let timestamps: Vec<DateTime<Utc>> = history.iter().map(|s| s.timestamp).collect();
            self.trend.fit_and_predict(&values, Some(timestamps.as_slice())).predictions
        } else {
            self.trend.predict_from_trend_code(request.current_bg, request.trend)
        };

        let iob = request
            .iob
            .unwrap_or_else(|| self.decay.iob(&request.treatments, as_of));
        let sequence = self.build_sequence(&history, &request.treatments, iob, as_of);

        let sensitivity_factor = self.estimator.predict_sensitivity(sequence.as_ref());
        let sequence_forecast = self.sequence_forecast(sequence.as_ref());

        let method = if sequence_forecast.is_some() {
            PredictionMethod::Sequence
        } else {
            PredictionMethod::Linear
        };
        let forecast = sequence_forecast.unwrap_or(linear);
        let predicted_range = GlucoseRange::classify(forecast[2], &self.config.thresholds);

        debug!(
            "forecast via {}: {:?} (iob {:.2}U, isf {:.1})",
            method.as_str(),
            forecast,
            iob,
            sensitivity_factor
        );

        PredictionResult {
            linear,
            sequence: sequence_forecast,
            horizons_minutes: self.trend.horizons(),
            timestamp: as_of,
            current_bg: request.current_bg,
            trend: request.trend,
            sensitivity_factor,
            method,
            predicted_range,
        }
    }

    /// Predict and log the prediction in the accuracy ledger
    pub fn predict_and_record(&self, request: &PredictionRequest) -> PredictionResult {
        let result = self.predict(request);
        self.ledger
            .record_prediction(result.timestamp, result.current_bg, result.linear, result.sequence);
        result
    }

    /// Feed an observed reading to the accuracy ledger
    pub fn observe(&self, sample: &GlucoseSample) -> usize {
        self.ledger.record_actual(sample.timestamp, sample.value as f64)
    }

    /// Request-scoped feature sequence; `None` when history is too short
    fn build_sequence(
        &self,
        history: &[GlucoseSample],
        treatments: &[TreatmentEvent],
        iob: f64,
        as_of: DateTime<Utc>,
    ) -> Option<FeatureSequence> {
        if history.len() < self.config.features.seq_len {
            return None;
        }

        let mut buffer = FeatureBuffer::from_config(&self.config);
        for sample in history {
            if let Err(e) = buffer.push_glucose(*sample) {
                debug!("skipping sample at {}: {e}", sample.timestamp);
            }
        }
        for event in treatments {
            if let Err(e) = buffer.push_treatment_at(*event, as_of) {
                debug!("skipping treatment at {}: {e}", event.timestamp);
            }
        }
        buffer.build_default_sequence(Some(iob))
    }

    fn sequence_forecast(&self, sequence: Option<&FeatureSequence>) -> Option<[f64; 3]> {
        if !self.estimator.glucose_available() {
            return None;
        }
        let sequence = sequence?;
        match self.estimator.predict_glucose(sequence) {
            Ok(forecast) => Some(forecast),
            Err(e) => {
                warn!("sequence forecast failed, using trend extrapolation: {e}");
                None
            }
        }
    }

    /// Dose correction against the configured target
    ///
    /// # Errors
    /// `InvalidSensitivity` when `sensitivity <= 0`.
    pub fn dose_correction(
        &self,
        current_bg: f64,
        sensitivity: f64,
        iob: f64,
        cob: f64,
    ) -> Result<DoseCorrection> {
        self.decay.correction_to_target(current_bg, sensitivity, iob, cob)
    }

    /// Per-dose breakdown of active insulin
    pub fn active_doses(
        &self,
        treatments: &[TreatmentEvent],
        as_of: DateTime<Utc>,
    ) -> Vec<ActiveDose> {
        self.decay.active_doses(treatments, as_of)
    }

    /// IOB, COB, sensitivity and dose advice at `as_of`
    pub fn current_metrics(
        &self,
        current_bg: f64,
        history: &[GlucoseSample],
        treatments: &[TreatmentEvent],
        as_of: DateTime<Utc>,
    ) -> Result<CurrentMetrics> {
        let iob = self.decay.iob(treatments, as_of);
        let cob = self.decay.cob(treatments, as_of);

        let mut history = history.to_vec();
        history.sort_by_key(|s| s.timestamp);
        let sequence = self.build_sequence(&history, treatments, iob, as_of);
        let sensitivity = self.estimator.predict_sensitivity(sequence.as_ref());

        let dose = self.dose_correction(current_bg, sensitivity, iob, cob)?;
        Ok(CurrentMetrics {
            iob,
            cob,
            sensitivity,
            dose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForecastError;
    use crate::model::estimator::fixtures::{
        constant_glucose_model, constant_sensitivity_model, failing_glucose_model,
        failing_sensitivity_model,
    };
    use crate::types::DoseWarning;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap()
    }

    fn rising(n: usize) -> Vec<GlucoseSample> {
        (0..n)
            .map(|i| {
                GlucoseSample::new(t0() + Duration::minutes(5 * i as i64), 100 + i as i32, 0)
                    .unwrap()
            })
            .collect()
    }

    fn linear_only() -> GlucoseForecaster {
        GlucoseForecaster::new(ForecastConfig::default()).unwrap()
    }

    fn with_models() -> GlucoseForecaster {
        let estimator = SequenceEstimator::new(50.0)
            .with_glucose_model(constant_glucose_model([150.0, 160.0, 170.0]))
            .with_sensitivity_model(constant_sensitivity_model(42.0));
        GlucoseForecaster::with_estimator(ForecastConfig::default(), estimator).unwrap()
    }

    #[test]
    fn test_trend_code_without_history() {
        let result = linear_only().predict(&PredictionRequest::new(120.0, 1).at(t0()));
        assert_eq!(result.linear, [125.0, 130.0, 135.0]);
        assert_eq!(result.sequence, None);
        assert_eq!(result.method, PredictionMethod::Linear);
        assert_eq!(result.sensitivity_factor, 50.0);
        assert_eq!(result.horizons_minutes, [5, 10, 15]);
        assert_eq!(result.timestamp, t0());
    }

    #[test]
    fn test_history_line_fit() {
        let history = rising(6);
        let result = linear_only().predict(&PredictionRequest::new(105.0, 0).with_history(history));
        // 1 mg/dL per 5 minutes
        assert!((result.linear[0] - 106.0).abs() < 1e-9);
        assert!((result.linear[2] - 108.0).abs() < 1e-9);
        assert_eq!(result.timestamp, t0() + Duration::minutes(25));
    }

    #[test]
    fn test_sequence_path_with_enough_history() {
        let request = PredictionRequest::new(123.0, 0).with_history(rising(24));
        let result = with_models().predict(&request);

        assert_eq!(result.method, PredictionMethod::Sequence);
        assert_eq!(result.sequence, Some([150.0, 160.0, 170.0]));
        assert_eq!(result.forecast(), &[150.0, 160.0, 170.0]);
        assert!((result.sensitivity_factor - 42.0).abs() < 1e-9);
        assert_eq!(result.predicted_range, GlucoseRange::InRange);
    }

    #[test]
    fn test_short_history_stays_linear() {
        let request = PredictionRequest::new(110.0, 0).with_history(rising(23));
        let result = with_models().predict(&request);
        assert_eq!(result.method, PredictionMethod::Linear);
        assert_eq!(result.sequence, None);
        // no sequence, so sensitivity falls back too
        assert_eq!(result.sensitivity_factor, 50.0);
    }

    #[test]
    fn test_sequence_never_claimed_without_model() {
        let estimator =
            SequenceEstimator::new(50.0).with_sensitivity_model(constant_sensitivity_model(42.0));
        let forecaster =
            GlucoseForecaster::with_estimator(ForecastConfig::default(), estimator).unwrap();
        let result = forecaster.predict(&PredictionRequest::new(123.0, 0).with_history(rising(30)));

        assert_eq!(result.method, PredictionMethod::Linear);
        assert!((result.sensitivity_factor - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_failed_inference_falls_back_to_linear() {
        let estimator = SequenceEstimator::new(50.0)
            .with_glucose_model(failing_glucose_model())
            .with_sensitivity_model(failing_sensitivity_model());
        let forecaster =
            GlucoseForecaster::with_estimator(ForecastConfig::default(), estimator).unwrap();
        let result = forecaster.predict(&PredictionRequest::new(129.0, 0).with_history(rising(30)));

        assert_eq!(result.method, PredictionMethod::Linear);
        assert_eq!(result.sequence, None);
        assert_eq!(result.forecast(), &result.linear);
        // last six readings 124..=129 rise 1 mg/dL per 5 minutes
        assert!((result.linear[0] - 130.0).abs() < 1e-9);
        assert!((result.linear[2] - 132.0).abs() < 1e-9);
        assert_eq!(result.sensitivity_factor, 50.0);
    }

    #[test]
    fn test_iob_derived_from_treatments() {
        let treatments = vec![TreatmentEvent::insulin(t0(), 4.0)];
        let request = PredictionRequest::new(120.0, 0)
            .with_treatments(treatments.clone())
            .at(t0() + Duration::minutes(81));
        assert_eq!(request.reference_time(), t0() + Duration::minutes(81));

        let forecaster = linear_only();
        let iob = forecaster.decay().iob(&treatments, request.reference_time());
        assert!((iob - 2.0).abs() < 0.02);
    }

    #[test]
    fn test_predicted_range_from_last_horizon() {
        let result = linear_only().predict(&PredictionRequest::new(75.0, -2).at(t0()));
        assert_eq!(result.linear, [65.0, 55.0, 45.0]);
        assert_eq!(result.predicted_range, GlucoseRange::CriticalLow);
    }

    #[test]
    fn test_predict_and_record_feeds_ledger() {
        let forecaster = linear_only();
        let sample = GlucoseSample::new(t0(), 120, 0).unwrap();
        forecaster.predict_and_record(&PredictionRequest::new(120.0, 0).with_history(vec![sample]));
        assert_eq!(forecaster.ledger().len(), 1);

        for (minutes, value) in [(5, 121), (10, 122), (15, 123)] {
            let observed = GlucoseSample::new(t0() + Duration::minutes(minutes), value, 0).unwrap();
            forecaster.observe(&observed);
        }
        let accuracy = forecaster.ledger().accuracy();
        assert_eq!(accuracy.linear.sample_count, 1);
        assert!((accuracy.linear.mae_overall - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_current_metrics() {
        let treatments = vec![
            TreatmentEvent::insulin(t0(), 6.0),
            TreatmentEvent::carbs(t0(), 30.0),
        ];
        let metrics = linear_only()
            .current_metrics(180.0, &[], &treatments, t0())
            .unwrap();

        assert_eq!(metrics.iob, 6.0);
        assert_eq!(metrics.cob, 30.0);
        assert_eq!(metrics.sensitivity, 50.0);
        // 180 + 120 - 300 = 0 -> (0 - 100) / 50
        assert!((metrics.dose.raw_correction + 2.0).abs() < 1e-9);
        assert_eq!(metrics.dose.recommended_dose, 0.0);
        assert!(matches!(metrics.dose.warning, Some(DoseWarning::ExpectedLow { .. })));
    }

    #[test]
    fn test_invalid_sensitivity_propagates() {
        let result = linear_only().dose_correction(150.0, 0.0, 0.0, 0.0);
        assert!(matches!(
            result,
            Err(ForecastError::InvalidSensitivity { current_bg, .. }) if current_bg == 150.0
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ForecastConfig::default();
        config.features.seq_len = 0;
        assert!(matches!(
            GlucoseForecaster::new(config),
            Err(ForecastError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_missing_models_dir_degrades() {
        let mut config = ForecastConfig::default();
        config.models_dir = Some(std::env::temp_dir().join("gluco-flux-no-such-models"));
        let forecaster = GlucoseForecaster::new(config).unwrap();
        assert!(!forecaster.estimator().glucose_available());
        assert!(!forecaster.estimator().sensitivity_available());
    }

    #[test]
    fn test_request_json() {
        let request: PredictionRequest =
            serde_json::from_str(r#"{"current_bg": 140, "trend": -1}"#).unwrap();
        assert_eq!(request, PredictionRequest::new(140.0, -1));
    }
}
