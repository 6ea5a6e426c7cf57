//! Prediction accuracy tracking
//!
//! Predictions are recorded when made and matched against glucose readings
//! as they arrive. A reading fills a horizon slot of an open record when its
//! age falls in that slot's tolerance band:
//!
//! | slot | age (minutes) |
//! |------|---------------|
//! | +5   | 4-6           |
//! | +10  | 9-11          |
//! | +15  | 14-16         |
//!
//! Once all three slots are filled the record is evaluated: its absolute
//! errors join the per-method error pools and, when it carried a sequence
//! forecast, the method with the lower mean error wins the record.
//!
//! The ledger is shared across requests; all state sits behind one mutex.

use crate::types::{Horizons, PredictionMethod};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Prediction records retained (oldest evicted first)
pub const DEFAULT_RECORD_CAPACITY: usize = 1000;

/// Evaluated error triples retained per method
pub const DEFAULT_ERROR_CAPACITY: usize = 500;

/// Age bands (minutes, inclusive) matching readings to horizon slots
pub const MATCH_BANDS: [(f64, f64); 3] = [(4.0, 6.0), (9.0, 11.0), (14.0, 16.0)];

/// A prediction awaiting or past evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub current_bg: f64,
    pub linear: Horizons,
    pub sequence: Option<Horizons>,
    /// Observed values per horizon slot
    pub actual: [Option<f64>; 3],
    pub evaluated: bool,
}

impl PredictionRecord {
    fn is_complete(&self) -> bool {
        self.actual.iter().all(Option::is_some)
    }

    fn actuals(&self) -> Option<Horizons> {
        match self.actual {
            [Some(a), Some(b), Some(c)] => Some([a, b, c]),
            _ => None,
        }
    }
}

/// Error statistics for one prediction method (mg/dL, percentages 0-100)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccuracyMetrics {
    pub mae_5: f64,
    pub mae_10: f64,
    pub mae_15: f64,
    pub mae_overall: f64,
    pub rmse_5: f64,
    pub rmse_10: f64,
    pub rmse_15: f64,
    pub rmse_overall: f64,
    /// Evaluated records contributing
    pub sample_count: usize,
    pub within_10_pct: f64,
    pub within_20_pct: f64,
}

impl AccuracyMetrics {
    fn from_errors(errors: &VecDeque<[f64; 3]>) -> Self {
        if errors.is_empty() {
            return Self::default();
        }

        let n = errors.len() as f64;
        let column = |k: usize| errors.iter().map(move |e| e[k]);
        let mae = |k: usize| column(k).sum::<f64>() / n;
        let rmse = |k: usize| (column(k).map(|e| e * e).sum::<f64>() / n).sqrt();

        let all: Vec<f64> = errors.iter().flatten().copied().collect();
        let total = all.len() as f64;
        let within =
            |limit: f64| all.iter().filter(|e| **e <= limit).count() as f64 / total * 100.0;

        Self {
            mae_5: mae(0),
            mae_10: mae(1),
            mae_15: mae(2),
            mae_overall: all.iter().sum::<f64>() / total,
            rmse_5: rmse(0),
            rmse_10: rmse(1),
            rmse_15: rmse(2),
            rmse_overall: (all.iter().map(|e| e * e).sum::<f64>() / total).sqrt(),
            sample_count: errors.len(),
            within_10_pct: within(10.0),
            within_20_pct: within(20.0),
        }
    }
}

/// Side-by-side accuracy of both methods
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyComparison {
    pub linear: AccuracyMetrics,
    /// Absent until a record carrying a sequence forecast has been evaluated
    pub sequence: Option<AccuracyMetrics>,
    /// Method with the lower overall MAE; linear on ties
    pub winner: PredictionMethod,
    pub linear_wins: u64,
    pub sequence_wins: u64,
    pub total_comparisons: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LedgerState {
    records: VecDeque<PredictionRecord>,
    linear_errors: VecDeque<[f64; 3]>,
    sequence_errors: VecDeque<[f64; 3]>,
    linear_wins: u64,
    sequence_wins: u64,
}

/// Thread-safe store of predictions and their observed outcomes
#[derive(Debug)]
pub struct AccuracyLedger {
    state: Mutex<LedgerState>,
    record_capacity: usize,
    error_capacity: usize,
}

impl Default for AccuracyLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl AccuracyLedger {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RECORD_CAPACITY, DEFAULT_ERROR_CAPACITY)
    }

    pub fn with_capacity(record_capacity: usize, error_capacity: usize) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            record_capacity: record_capacity.max(1),
            error_capacity: error_capacity.max(1),
        }
    }

    // A panic elsewhere never leaves the collections half-updated, so a
    // poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a prediction made at `at`; returns its id
    pub fn record_prediction(
        &self,
        at: DateTime<Utc>,
        current_bg: f64,
        linear: Horizons,
        sequence: Option<Horizons>,
    ) -> Uuid {
        let record = PredictionRecord {
            id: Uuid::new_v4(),
            timestamp: at,
            current_bg,
            linear,
            sequence,
            actual: [None; 3],
            evaluated: false,
        };
        let id = record.id;

        let mut state = self.lock();
        state.records.push_back(record);
        while state.records.len() > self.record_capacity {
            state.records.pop_front();
        }
        id
    }

    /// Match an observed reading against open records.
    ///
    /// Each open record takes the reading into at most one empty slot.
    /// Returns how many records became evaluated.
    pub fn record_actual(&self, at: DateTime<Utc>, value: f64) -> usize {
        let mut state = self.lock();
        let mut completed = Vec::new();

        for record in state.records.iter_mut().filter(|r| !r.evaluated) {
            let age_min = (at - record.timestamp).num_milliseconds() as f64 / 60_000.0;
            let slot = MATCH_BANDS
                .iter()
                .enumerate()
                .find(|(k, (lo, hi))| (*lo..=*hi).contains(&age_min) && record.actual[*k].is_none())
                .map(|(k, _)| k);

            if let Some(k) = slot {
                record.actual[k] = Some(value);
            }
            if record.is_complete() {
                record.evaluated = true;
                completed.push(record.clone());
            }
        }

        for record in &completed {
            Self::evaluate(&mut state, record, self.error_capacity);
        }
        if !completed.is_empty() {
            debug!("{} predictions evaluated at {}", completed.len(), at);
        }
        completed.len()
    }

    fn evaluate(state: &mut LedgerState, record: &PredictionRecord, error_capacity: usize) {
        let Some(actual) = record.actuals() else {
            return;
        };
        let errors = |forecast: &Horizons| -> [f64; 3] {
            [
                (forecast[0] - actual[0]).abs(),
                (forecast[1] - actual[1]).abs(),
                (forecast[2] - actual[2]).abs(),
            ]
        };
        let mean = |e: &[f64; 3]| e.iter().sum::<f64>() / 3.0;

        let linear = errors(&record.linear);
        push_bounded(&mut state.linear_errors, linear, error_capacity);

        if let Some(sequence) = &record.sequence {
            let seq = errors(sequence);
            push_bounded(&mut state.sequence_errors, seq, error_capacity);
            if mean(&seq) < mean(&linear) {
                state.sequence_wins += 1;
            } else {
                state.linear_wins += 1;
            }
        }
    }

    /// Current comparison of both methods
    pub fn accuracy(&self) -> AccuracyComparison {
        let state = self.lock();
        let linear = AccuracyMetrics::from_errors(&state.linear_errors);
        let sequence = (!state.sequence_errors.is_empty())
            .then(|| AccuracyMetrics::from_errors(&state.sequence_errors));

        let winner = match &sequence {
            Some(seq) if seq.mae_overall < linear.mae_overall => PredictionMethod::Sequence,
            _ => PredictionMethod::Linear,
        };

        AccuracyComparison {
            linear,
            sequence,
            winner,
            linear_wins: state.linear_wins,
            sequence_wins: state.sequence_wins,
            total_comparisons: state.linear_wins + state.sequence_wins,
            timestamp: Utc::now(),
        }
    }

    /// The newest `limit` records, oldest first
    pub fn recent_predictions(&self, limit: usize) -> Vec<PredictionRecord> {
        let state = self.lock();
        let skip = state.records.len().saturating_sub(limit);
        state.records.iter().skip(skip).cloned().collect()
    }

    /// Number of retained records
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn push_bounded(pool: &mut VecDeque<[f64; 3]>, errors: [f64; 3], capacity: usize) {
    pool.push_back(errors);
    while pool.len() > capacity {
        pool.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;
    use std::thread;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap()
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        t0() + Duration::minutes(minutes)
    }

    fn fill(ledger: &AccuracyLedger, values: [f64; 3]) -> usize {
        ledger.record_actual(at(5), values[0])
            + ledger.record_actual(at(10), values[1])
            + ledger.record_actual(at(15), values[2])
    }

    #[test]
    fn test_full_match_evaluates() {
        let ledger = AccuracyLedger::new();
        ledger.record_prediction(t0(), 120.0, [125.0, 130.0, 135.0], None);

        assert_eq!(ledger.record_actual(at(5), 124.0), 0);
        assert_eq!(ledger.record_actual(at(10), 132.0), 0);
        assert_eq!(ledger.record_actual(at(15), 141.0), 1);

        let records = ledger.recent_predictions(10);
        assert!(records[0].evaluated);
        assert_eq!(records[0].actual, [Some(124.0), Some(132.0), Some(141.0)]);

        let accuracy = ledger.accuracy();
        assert_eq!(accuracy.linear.sample_count, 1);
        assert!((accuracy.linear.mae_5 - 1.0).abs() < 1e-9);
        assert!((accuracy.linear.mae_overall - 3.0).abs() < 1e-9);
        assert_eq!(accuracy.linear.within_10_pct, 100.0);
        assert!(accuracy.sequence.is_none());
        // no sequence forecast, no head-to-head
        assert_eq!(accuracy.total_comparisons, 0);
    }

    #[test]
    fn test_unfilled_record_never_contributes() {
        let ledger = AccuracyLedger::new();
        ledger.record_prediction(t0(), 120.0, [125.0, 130.0, 135.0], None);

        ledger.record_actual(at(5), 124.0);
        for minute in [1, 2, 3, 7, 8, 12, 13, 17, 30, 60] {
            ledger.record_actual(at(minute), 300.0);
        }

        let accuracy = ledger.accuracy();
        assert_eq!(accuracy.linear.sample_count, 0);
        assert_eq!(accuracy.linear.mae_overall, 0.0);
        assert!(!ledger.recent_predictions(1)[0].evaluated);
    }

    #[test]
    fn test_band_edges_and_first_fill_wins() {
        let ledger = AccuracyLedger::new();
        ledger.record_prediction(t0(), 100.0, [100.0; 3], None);

        ledger.record_actual(at(4), 101.0);
        ledger.record_actual(at(6), 199.0);
        ledger.record_actual(at(11), 102.0);
        ledger.record_actual(at(16), 103.0);

        let record = &ledger.recent_predictions(1)[0];
        assert_eq!(record.actual, [Some(101.0), Some(102.0), Some(103.0)]);
    }

    #[test]
    fn test_winner_by_mean_error() {
        let ledger = AccuracyLedger::new();
        ledger.record_prediction(t0(), 120.0, [130.0, 140.0, 150.0], Some([121.0, 122.0, 123.0]));
        assert_eq!(fill(&ledger, [120.0, 120.0, 120.0]), 1);

        let accuracy = ledger.accuracy();
        assert_eq!(accuracy.sequence_wins, 1);
        assert_eq!(accuracy.linear_wins, 0);
        assert_eq!(accuracy.winner, PredictionMethod::Sequence);
        assert_eq!(accuracy.sequence.as_ref().map(|m| m.sample_count), Some(1));
    }

    #[test]
    fn test_tie_goes_to_linear() {
        let ledger = AccuracyLedger::new();
        ledger.record_prediction(t0(), 120.0, [125.0; 3], Some([115.0; 3]));
        fill(&ledger, [120.0; 3]);

        let accuracy = ledger.accuracy();
        assert_eq!(accuracy.linear_wins, 1);
        assert_eq!(accuracy.winner, PredictionMethod::Linear);
    }

    #[test]
    fn test_capacity_bounds() {
        let ledger = AccuracyLedger::with_capacity(3, 2);
        for i in 0..5 {
            ledger.record_prediction(t0(), 100.0 + i as f64, [100.0; 3], None);
        }
        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.recent_predictions(10)[0].current_bg, 102.0);

        fill(&ledger, [110.0, 110.0, 110.0]);
        assert_eq!(ledger.accuracy().linear.sample_count, 2);
    }

    #[test]
    fn test_recent_predictions_limit() {
        let ledger = AccuracyLedger::new();
        let ids: Vec<Uuid> = (0..4)
            .map(|i| ledger.record_prediction(at(i), 100.0, [100.0; 3], None))
            .collect();
        let recent = ledger.recent_predictions(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].id, ids[3]);
    }

    #[test]
    fn test_concurrent_recording() {
        let ledger = Arc::new(AccuracyLedger::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    for _ in 0..50 {
                        ledger.record_prediction(t0(), 100.0, [100.0; 3], None);
                        ledger.record_actual(at(5), 100.0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ledger.len(), 200);
    }
}
