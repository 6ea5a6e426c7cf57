//! CGM payload adapters
//!
//! This module provides adapters that parse raw CGM backend JSON payloads and
//! map them to validated samples and treatment events.

mod nightscout;

pub use nightscout::{parse_timestamp, NightscoutAdapter};

use crate::error::Result;
use crate::types::{GlucoseSample, TreatmentEvent};

/// Trait for CGM backend payload adapters
pub trait CgmPayloadAdapter {
    /// Parse raw glucose entries, oldest first; unusable entries are skipped
    fn parse_entries(&self, raw_json: &str) -> Result<Vec<GlucoseSample>>;

    /// Parse raw treatments, oldest first; entries without insulin or carbs are skipped
    fn parse_treatments(&self, raw_json: &str) -> Result<Vec<TreatmentEvent>>;
}
