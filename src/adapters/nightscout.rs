//! Nightscout-compatible adapter
//!
//! Parses the `entries` and `treatments` JSON arrays served by Nightscout-style
//! CGM backends into validated samples and treatment events.

use crate::error::{ForecastError, Result};
use crate::types::{
    GlucoseSample, TreatmentEvent, TrendDirection, MAX_SAMPLE_MG_DL, MIN_SAMPLE_MG_DL,
};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use super::CgmPayloadAdapter;

/// Nightscout payload adapter
pub struct NightscoutAdapter;

impl CgmPayloadAdapter for NightscoutAdapter {
    fn parse_entries(&self, raw_json: &str) -> Result<Vec<GlucoseSample>> {
        let entries: Vec<NightscoutEntry> = parse_array(raw_json, "entries")?;
        let mut samples: Vec<GlucoseSample> = entries.iter().filter_map(convert_entry).collect();
        samples.sort_by_key(|s| s.timestamp);
        Ok(samples)
    }

    fn parse_treatments(&self, raw_json: &str) -> Result<Vec<TreatmentEvent>> {
        let entries: Vec<NightscoutTreatment> = parse_array(raw_json, "treatments")?;
        let mut events: Vec<TreatmentEvent> =
            entries.iter().filter_map(convert_treatment).collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}

/// Both endpoints serve a top-level array; anything else is a wrong payload
fn parse_array<T: DeserializeOwned>(raw_json: &str, what: &str) -> Result<Vec<T>> {
    let value: Value = serde_json::from_str(raw_json)?;
    let found = match &value {
        Value::Array(_) => return Ok(serde_json::from_value(value)?),
        Value::Object(_) => "an object",
        Value::String(_) => "a string",
        Value::Number(_) => "a number",
        Value::Bool(_) => "a boolean",
        Value::Null => "null",
    };
    Err(ForecastError::ParseError(format!(
        "expected a JSON array of {what}, found {found}"
    )))
}

fn convert_entry(entry: &NightscoutEntry) -> Option<GlucoseSample> {
    let sgv = entry.sgv.as_ref().and_then(as_number)?;

    let timestamp = match (&entry.date, &entry.date_string) {
        (Some(ms), _) if as_number(ms).is_some() => as_number(ms).and_then(from_millis),
        (_, Some(s)) => parse_timestamp(s).ok(),
        _ => None,
    };
    let Some(timestamp) = timestamp else {
        debug!("skipping entry without a usable timestamp");
        return None;
    };

    let value = sgv.round() as i32;
    if !(MIN_SAMPLE_MG_DL..=MAX_SAMPLE_MG_DL).contains(&value) {
        warn!("skipping entry at {timestamp}: {value} mg/dL out of range");
        return None;
    }

    let trend = entry
        .direction
        .as_deref()
        .map(TrendDirection::parse)
        .unwrap_or(TrendDirection::Flat)
        .code();

    GlucoseSample::new(timestamp, value, trend).ok()
}

fn convert_treatment(entry: &NightscoutTreatment) -> Option<TreatmentEvent> {
    let positive = |v: &Option<Value>| v.as_ref().and_then(as_number).filter(|x| *x > 0.0);

    let insulin = positive(&entry.insulin);
    let carbs = positive(&entry.carbs);
    if insulin.is_none() && carbs.is_none() {
        return None;
    }

    let timestamp = match (&entry.created_at, &entry.mills) {
        (Some(s), _) if parse_timestamp(s).is_ok() => parse_timestamp(s).ok(),
        (_, Some(ms)) => as_number(ms).and_then(from_millis),
        _ => None,
    };
    let Some(timestamp) = timestamp else {
        debug!("skipping treatment without a usable timestamp");
        return None;
    };

    let event = TreatmentEvent {
        timestamp,
        insulin_units: insulin,
        carb_grams: carbs,
        protein_grams: positive(&entry.protein),
        fat_grams: positive(&entry.fat),
    };
    event.validate().ok().map(|_| event)
}

/// Numbers may arrive as JSON numbers or numeric strings
fn as_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|v| v.is_finite())
}

fn from_millis(ms: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms as i64)
}

/// Parse an RFC 3339 timestamp into UTC
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ForecastError::DateParseError(format!("{raw}: {e}")))
}

// Nightscout API structures

#[derive(Debug, Deserialize)]
struct NightscoutEntry {
    sgv: Option<Value>,
    date: Option<Value>,
    #[serde(rename = "dateString")]
    date_string: Option<String>,
    direction: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NightscoutTreatment {
    created_at: Option<String>,
    mills: Option<Value>,
    insulin: Option<Value>,
    carbs: Option<Value>,
    protein: Option<Value>,
    fat: Option<Value>,
}
